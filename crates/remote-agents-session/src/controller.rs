//! Session controller actor.
//!
//! One task owns every piece of mutable state: connection lifecycle, retry
//! queue, text buffer, watchdog and timers. The public handle, the dial task
//! and the per-connection reader/writer tasks only talk to it through
//! channels, and everything coming from a connection is tagged with the epoch
//! it was opened under so late reports from a superseded connection are
//! dropped.

use std::sync::Arc;

use bytes::Bytes;
use remote_agents_core::{
    ClientStatus, ConnectionState, Connector, ErrorKind, EventHub, Frame, FrameSink, FrameSource,
    Link, MessageId, MessageRequest, ModelSelection, SessionEvent, SessionId, SettingsProvider,
    TransportError,
};
use remote_agents_transport::{
    CommandOptions, DecodeError, OutboundEnvelope, ServerEvent,
    claude::{ClaudeResponse, ContentBlock, Delta, MessageContent, tool_result_text},
    decode,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, info, warn};

use crate::{
    assembler::TextAssembler,
    client::ClientError,
    config::Timing,
    reconnect::ReconnectPolicy,
    retry::{FailureOutcome, PendingMessage, RetryQueue},
    timers::{TimerKind, Timers},
    watchdog::Watchdog,
};

/// Payload of the liveness probe.
const PROBE_PAYLOAD: &[u8] = b"alive";

/// Lower-cased fragments of remote errors that mean the session is gone.
const SESSION_ERROR_PATTERNS: &[&str] = &[
    "session",
    "failed to resume",
    "no conversation found",
    "conversation not found",
];

/// Request from the public handle.
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<(), ClientError>>),
    Disconnect,
    Send {
        id: MessageId,
        request: MessageRequest,
    },
    Abort,
    Attach(SessionId),
    SwitchModel(ModelSelection),
    Shutdown,
}

/// Report from a task spawned by the controller.
pub(crate) enum Internal {
    Dialed {
        epoch: u64,
        result: Result<Link, TransportError>,
    },
    Inbound {
        epoch: u64,
        frame: InboundFrame,
    },
    Closed {
        epoch: u64,
        error: Option<TransportError>,
    },
    SendCompleted {
        epoch: u64,
        message_id: MessageId,
        result: Result<(), TransportError>,
    },
}

/// Inbound frame after decoding in the reader task.
pub(crate) enum InboundFrame {
    Event(Result<ServerEvent, DecodeError>),
    /// Control frame (ping or pong). Only proves the link is alive.
    Alive,
}

enum Outgoing {
    Frame {
        /// Set for queued messages; the writer reports completion for it.
        ticket: Option<MessageId>,
        frame: Frame,
    },
    Close,
}

struct LinkHandles {
    tx: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    confirmed: bool,
}

pub(crate) struct Controller {
    settings: Arc<dyn SettingsProvider>,
    connector: Arc<dyn Connector>,
    events: Arc<EventHub>,
    status_tx: watch::Sender<ClientStatus>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    timing: Timing,
    policy: ReconnectPolicy,

    connection: ConnectionState,
    epoch: u64,
    link: Option<LinkHandles>,
    dial: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    manual_disconnect: bool,
    connect_waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,

    session_id: Option<SessionId>,
    queue: RetryQueue,
    assembler: TextAssembler,
    watchdog: Watchdog,
    processing: bool,
    aborting: bool,
    model: Option<ModelSelection>,
    pending_model: Option<ModelSelection>,
    timers: Timers,
}

impl Controller {
    pub(crate) fn new(
        settings: Arc<dyn SettingsProvider>,
        connector: Arc<dyn Connector>,
        timing: Timing,
        events: Arc<EventHub>,
        status_tx: watch::Sender<ClientStatus>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        Self {
            settings,
            connector,
            events,
            status_tx,
            internal_tx,
            policy: ReconnectPolicy::from_timing(&timing),
            queue: RetryQueue::from_timing(&timing),
            timing,
            connection: ConnectionState::Disconnected,
            epoch: 0,
            link: None,
            dial: None,
            reconnect_attempts: 0,
            manual_disconnect: false,
            connect_waiters: Vec::new(),
            session_id: None,
            assembler: TextAssembler::new(),
            watchdog: Watchdog::new(),
            processing: false,
            aborting: false,
            model: None,
            pending_model: None,
            timers: Timers::default(),
        }
    }

    /// Actor loop. Returns once the handle is dropped or asks for shutdown.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                () = wait_for(deadline) => self.fire_due_timers(Instant::now()),
            }
            self.publish_status();
        }

        self.disconnect();
        self.publish_status();
        debug!("Session controller stopped");
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(waiter) => self.connect(Some(waiter)),
            Command::Disconnect => self.disconnect(),
            Command::Send { id, request } => self.send_message(id, request),
            Command::Abort => self.abort(),
            Command::Attach(session_id) => self.attach(session_id),
            Command::SwitchModel(selection) => self.switch_model(selection),
            Command::Shutdown => self.disconnect(),
        }
    }

    pub(crate) fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Dialed { epoch, result } => self.on_dialed(epoch, result),
            Internal::Inbound { epoch, frame } => self.on_inbound(epoch, frame),
            Internal::Closed { epoch, error } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "Ignoring close of stale connection");
                    return;
                }
                self.on_connection_lost(error.unwrap_or(TransportError::Closed));
            }
            Internal::SendCompleted {
                epoch,
                message_id,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(epoch, %message_id, "Ignoring send report of stale connection");
                    return;
                }
                match result {
                    Ok(()) => self.on_delivered(message_id),
                    Err(e) => self.on_send_failed(message_id, &e.to_string()),
                }
            }
        }
    }

    pub(crate) fn publish_status(&self) {
        let status = ClientStatus {
            connection: self.connection,
            session_id: self.session_id.clone(),
            processing: self.processing,
            aborting: self.aborting,
            queued: self.queue.len(),
            model: self.model.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.events.publish(event);
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        info!(from = %self.connection, to = %state, epoch = self.epoch, "Connection state changed");
        self.connection = state;
        self.emit(SessionEvent::ConnectionChanged(state));
    }

    // Connection lifecycle

    fn connect(&mut self, waiter: Option<oneshot::Sender<Result<(), ClientError>>>) {
        self.manual_disconnect = false;
        if self.connection == ConnectionState::Connected {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        if let Some(waiter) = waiter {
            self.connect_waiters.push(waiter);
        }
        if self.attempt_in_progress() {
            return;
        }
        self.start_connect();
    }

    fn attempt_in_progress(&self) -> bool {
        self.dial.is_some() || self.link.as_ref().is_some_and(|link| !link.confirmed)
    }

    fn start_connect(&mut self) {
        self.timers.cancel(TimerKind::Reconnect);
        self.epoch += 1;
        self.teardown_link();
        self.abort_dial();
        if self.connection == ConnectionState::Disconnected {
            self.set_connection(ConnectionState::Connecting);
        }

        let endpoint = match self.settings.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Cannot resolve endpoint");
                self.on_connection_lost(TransportError::Connect(e.to_string()));
                return;
            }
        };

        let epoch = self.epoch;
        info!(epoch, %endpoint, "Connecting");
        let connector = Arc::clone(&self.connector);
        let bearer = self.settings.auth_token();
        let internal = self.internal_tx.clone();
        self.dial = Some(tokio::spawn(async move {
            let result = connector.connect(&endpoint, bearer.as_deref()).await;
            let _ = internal.send(Internal::Dialed { epoch, result });
        }));
        self.timers.arm(
            TimerKind::ConnectProbe,
            Instant::now() + self.timing.connect_timeout,
        );
    }

    fn on_dialed(&mut self, epoch: u64, result: Result<Link, TransportError>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Dropping link from superseded dial");
            return;
        }
        self.dial = None;
        match result {
            Ok((sink, source)) => {
                debug!(epoch, "Transport open, probing");
                self.attach_link(sink, source);
                self.write(None, Frame::Ping(Bytes::from_static(PROBE_PAYLOAD)));
                self.pump();
            }
            Err(e) => self.on_connection_lost(e),
        }
    }

    fn attach_link(&mut self, sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(self.epoch, source, self.internal_tx.clone()));
        let writer = tokio::spawn(write_loop(self.epoch, sink, rx, self.internal_tx.clone()));
        self.link = Some(LinkHandles {
            tx,
            reader,
            writer,
            confirmed: false,
        });
    }

    fn on_confirmed(&mut self) {
        self.reconnect_attempts = 0;
        self.timers.cancel(TimerKind::ConnectProbe);
        self.set_connection(ConnectionState::Connected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.pump();
    }

    fn on_connection_lost(&mut self, error: TransportError) {
        if self.manual_disconnect {
            return;
        }
        let reason = error.to_string();
        warn!(epoch = self.epoch, error = %reason, "Connection lost");

        self.epoch += 1;
        self.timers.cancel(TimerKind::ConnectProbe);
        self.teardown_link();
        self.abort_dial();

        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.set_connection(ConnectionState::Reconnecting {
            attempt: self.reconnect_attempts,
        });
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectFailed(reason.clone())));
        }
        self.schedule_reconnect();

        // An undelivered head is retried, so its request has not ended.
        match self.queue.head().filter(|_| self.queue.is_in_flight()).map(|m| m.id) {
            Some(id) => {
                self.finish_request();
                self.on_send_failed(id, &reason);
            }
            None if self.processing => self.end_request(SessionEvent::Interrupted),
            None => {}
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.manual_disconnect || self.timers.is_armed(TimerKind::Reconnect) {
            return;
        }
        let attempt = self.reconnect_attempts.max(1);
        let delay = self.policy.delay(attempt);
        info!(attempt, ?delay, "Scheduling reconnect");
        self.timers.arm(TimerKind::Reconnect, Instant::now() + delay);
    }

    fn ensure_reconnect(&mut self) {
        if matches!(self.connection, ConnectionState::Reconnecting { .. })
            && !self.attempt_in_progress()
        {
            self.schedule_reconnect();
        }
    }

    fn disconnect(&mut self) {
        self.manual_disconnect = true;
        self.epoch += 1;
        if let Some(link) = self.link.take() {
            let _ = link.tx.send(Outgoing::Close);
            link.reader.abort();
        }
        self.abort_dial();
        self.timers.cancel_all();

        let dropped = self.queue.clear();
        if dropped > 0 {
            info!(dropped, "Discarded queued messages");
        }
        let interrupted = self.processing;
        self.finish_request();
        self.pending_model = None;
        self.reconnect_attempts = 0;
        self.set_connection(ConnectionState::Disconnected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Disconnected));
        }
        if interrupted {
            self.publish_status();
            self.emit(SessionEvent::Interrupted);
        }
    }

    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.reader.abort();
            link.writer.abort();
        }
    }

    fn abort_dial(&mut self) {
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
    }

    fn write(&self, ticket: Option<MessageId>, frame: Frame) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.tx.send(Outgoing::Frame { ticket, frame }).is_ok())
    }

    // Outbound queue

    fn send_message(&mut self, id: MessageId, request: MessageRequest) {
        let message = PendingMessage::new(id, request, Instant::now());
        self.queue.enqueue(message);
        debug!(message_id = %id, queued = self.queue.len(), "Message queued");
        if self.connection == ConnectionState::Disconnected {
            self.connect(None);
        }
        self.pump();
    }

    /// Hand the queue head to the transport if nothing blocks it.
    fn pump(&mut self) {
        if self.queue.is_in_flight() || self.processing || self.timers.is_armed(TimerKind::Retry)
        {
            return;
        }
        let Some(head) = self.queue.head() else {
            return;
        };
        if self.link.is_none() || !self.connection.accepts_writes() {
            if !self.timers.is_armed(TimerKind::DeferredSend) {
                debug!(message_id = %head.id, state = %self.connection, "Deferring send");
                self.timers.arm(
                    TimerKind::DeferredSend,
                    Instant::now() + self.timing.deferred_send,
                );
            }
            return;
        }

        let id = head.id;
        let attempt = head.attempts + 1;
        let target = target_session(head, self.session_id.as_ref());
        let envelope = command_envelope(head, target.clone(), self.model.as_ref());
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(message_id = %id, error = %e, "Dropping unencodable message");
                self.queue.discard_head();
                self.emit(SessionEvent::SendFailed {
                    message_id: id,
                    error: e.to_string(),
                });
                self.pump();
                return;
            }
        };

        self.retarget(target);
        debug!(message_id = %id, attempt, "Sending message");
        self.queue.begin_send();
        if !self.write(Some(id), Frame::Text(text)) {
            self.on_send_failed(id, &TransportError::Closed.to_string());
            return;
        }
        let now = Instant::now();
        self.processing = true;
        self.watchdog.arm(now);
        self.timers
            .arm(TimerKind::WatchdogPoll, now + self.timing.watchdog_poll);
    }

    fn on_delivered(&mut self, id: MessageId) {
        if self.queue.complete(id).is_none() {
            return;
        }
        debug!(message_id = %id, "Message delivered");
        self.emit(SessionEvent::MessageDelivered(id));
        self.pump();
    }

    fn on_send_failed(&mut self, id: MessageId, error: &str) {
        let Some(outcome) = self.queue.record_failure(id) else {
            return;
        };
        self.processing = false;
        self.watchdog.disarm();
        self.timers.cancel(TimerKind::WatchdogPoll);

        match outcome {
            FailureOutcome::Retry { attempt, delay } => {
                warn!(message_id = %id, attempt, ?delay, error, "Send failed, will retry");
                self.timers.arm(TimerKind::Retry, Instant::now() + delay);
                self.ensure_reconnect();
            }
            FailureOutcome::GaveUp(message) => {
                error!(message_id = %id, attempts = message.attempts, error, "Giving up on message");
                self.publish_status();
                self.emit(SessionEvent::SendFailed {
                    message_id: message.id,
                    error: error.to_owned(),
                });
                self.pump();
            }
        }
    }

    // Request lifecycle

    /// Reset per-request state. Buffered text is discarded.
    fn finish_request(&mut self) {
        self.processing = false;
        self.aborting = false;
        self.assembler.clear();
        self.watchdog.disarm();
        self.timers.cancel(TimerKind::Debounce);
        self.timers.cancel(TimerKind::WatchdogPoll);
        self.timers.cancel(TimerKind::AbortFallback);
    }

    /// Finish the outstanding request, then report `event`.
    fn end_request(&mut self, event: SessionEvent) {
        self.finish_request();
        self.publish_status();
        self.emit(event);
        self.settle_model();
        self.pump();
    }

    fn commit_text(&mut self) {
        self.timers.cancel(TimerKind::Debounce);
        if let Some(text) = self.assembler.commit() {
            self.emit(SessionEvent::TextCommitted(text));
        }
    }

    fn append_text(&mut self, fragment: &str) {
        if self.assembler.append(fragment) {
            self.timers
                .arm(TimerKind::Debounce, Instant::now() + self.timing.debounce);
        }
    }

    /// Emit a non-text event after flushing buffered prose.
    fn emit_after_text(&mut self, event: SessionEvent) {
        self.commit_text();
        self.emit(event);
    }

    fn abort(&mut self) {
        if !self.processing || self.aborting {
            debug!(
                processing = self.processing,
                aborting = self.aborting,
                "Nothing to abort"
            );
            return;
        }
        let Some(session_id) = self.session_id.clone() else {
            debug!("No session to abort");
            return;
        };
        match OutboundEnvelope::abort(session_id.clone()).encode() {
            Ok(text) => {
                info!(%session_id, "Aborting request");
                self.write(None, Frame::Text(text));
            }
            Err(e) => warn!(error = %e, "Failed to encode abort"),
        }
        self.aborting = true;
        self.timers.arm(
            TimerKind::AbortFallback,
            Instant::now() + self.timing.abort_timeout,
        );
    }

    fn attach(&mut self, session_id: SessionId) {
        info!(%session_id, "Attaching to session");
        self.finish_request();
        self.session_id = Some(session_id.clone());
        self.publish_status();
        self.emit(SessionEvent::SessionAttached(session_id));
        self.settle_model();
        self.pump();
    }

    fn switch_model(&mut self, selection: ModelSelection) {
        if self.processing || self.queue.is_in_flight() {
            debug!(model = %selection.name, "Deferring model switch");
            self.pending_model = Some(selection);
            self.timers.arm(
                TimerKind::ModelSwitch,
                Instant::now() + self.timing.model_switch_timeout,
            );
        } else {
            self.pending_model = None;
            self.timers.cancel(TimerKind::ModelSwitch);
            self.apply_model(selection);
        }
    }

    fn settle_model(&mut self) {
        if let Some(selection) = self.pending_model.take() {
            self.timers.cancel(TimerKind::ModelSwitch);
            self.apply_model(selection);
        }
    }

    fn apply_model(&mut self, selection: ModelSelection) {
        info!(model = %selection.name, model_id = %selection.model_id, "Model changed");
        self.emit(SessionEvent::ModelChanged {
            model: selection.name.clone(),
            model_id: selection.model_id.clone(),
        });
        self.model = Some(selection);
    }

    /// Make `target` the current session before a command addressed to it
    /// goes out, so its replies pass the session filter and abort reaches it.
    fn retarget(&mut self, target: Option<SessionId>) {
        if target == self.session_id {
            return;
        }
        match target {
            Some(session_id) => {
                info!(%session_id, "Switching to session of outgoing message");
                self.session_id = Some(session_id.clone());
                self.publish_status();
                self.emit(SessionEvent::SessionAttached(session_id));
            }
            None => {
                info!("Outgoing message starts a new session");
                self.session_id = None;
            }
        }
    }

    fn adopt_session(&mut self, raw: Option<&str>) {
        if self.session_id.is_some() {
            return;
        }
        let Some(raw) = raw else {
            return;
        };
        match SessionId::parse(raw) {
            Some(session_id) => {
                info!(%session_id, "Session created");
                self.session_id = Some(session_id.clone());
                self.emit(SessionEvent::SessionCreated(session_id));
            }
            None => warn!(session_id = raw, "Ignoring malformed session id"),
        }
    }

    // Inbound

    fn on_inbound(&mut self, epoch: u64, frame: InboundFrame) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Ignoring frame of stale connection");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.confirmed {
            link.confirmed = true;
            self.on_confirmed();
        }

        match frame {
            InboundFrame::Alive => {}
            InboundFrame::Event(Ok(event)) => self.on_server_event(event),
            InboundFrame::Event(Err(e)) => {
                warn!(error = %e, "Undecodable frame");
                self.emit(SessionEvent::Error {
                    kind: ErrorKind::Protocol,
                    message: e.to_string(),
                });
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        if let ServerEvent::SessionCreated { session_id } = &event {
            self.on_session_created(session_id.as_deref());
            return;
        }
        if let (Some(current), Some(tagged)) = (&self.session_id, event.session_id()) {
            if current.as_str() != tagged {
                debug!(current = %current, tagged, "Ignoring frame for another session");
                return;
            }
        }

        match event {
            ServerEvent::SessionAborted { .. } => {
                if self.aborting {
                    info!("Abort acknowledged");
                    self.end_request(SessionEvent::Aborted);
                } else {
                    debug!("Ignoring late abort acknowledgment");
                }
            }
            ServerEvent::ProjectsUpdated => {}
            ServerEvent::Unknown(kind) => debug!(%kind, "Ignoring unknown envelope"),
            event if !self.processing => {
                debug!(?event, "Ignoring content while idle");
            }
            event => {
                self.watchdog.touch(Instant::now());
                self.on_content(event);
            }
        }
    }

    fn on_session_created(&mut self, raw: Option<&str>) {
        let Some(session_id) = raw.and_then(SessionId::parse) else {
            warn!(session_id = ?raw, "Ignoring malformed session-created");
            return;
        };
        if self.session_id.as_ref() == Some(&session_id) {
            return;
        }
        info!(%session_id, "Session created");
        self.session_id = Some(session_id.clone());
        self.emit(SessionEvent::SessionCreated(session_id));
    }

    fn on_content(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ClaudeResponse { response, .. } => self.on_response(response),
            ServerEvent::TokenBudget { used, total, .. } => {
                self.emit(SessionEvent::TokenBudget { used, total });
            }
            ServerEvent::ClaudeComplete {
                session_id,
                exit_code,
                ..
            } => {
                debug!(?exit_code, "Request complete");
                self.commit_text();
                self.adopt_session(session_id.as_deref());
                let session_id = self.session_id.clone();
                self.end_request(SessionEvent::Completed { session_id });
            }
            ServerEvent::ClaudeError { error, .. } => self.on_remote_error(error),
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionAborted { .. }
            | ServerEvent::ProjectsUpdated
            | ServerEvent::Unknown(_) => {}
        }
    }

    fn on_response(&mut self, response: ClaudeResponse) {
        match response {
            ClaudeResponse::System {
                session_id, model, ..
            } => {
                if let Some(model) = model {
                    info!(%model, "Remote agent model");
                }
                self.adopt_session(session_id.as_deref());
            }
            ClaudeResponse::Assistant { message } => match message.content {
                MessageContent::Text(text) => self.append_text(&text),
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        self.on_block(block);
                    }
                }
            },
            ClaudeResponse::User { message } => {
                if let MessageContent::Blocks(blocks) = message.content {
                    for block in blocks {
                        if matches!(block, ContentBlock::ToolResult { .. }) {
                            self.on_block(block);
                        }
                    }
                }
            }
            ClaudeResponse::Result {
                session_id,
                is_error,
                ..
            } => {
                debug!(is_error, "Run summary");
                self.adopt_session(session_id.as_deref());
            }
            ClaudeResponse::ContentBlockDelta { delta } => match delta {
                Delta::TextDelta { text } => self.append_text(&text),
                Delta::ThinkingDelta { thinking } => {
                    self.emit_after_text(SessionEvent::Thinking(thinking));
                }
                Delta::Other => {}
            },
            ClaudeResponse::Other => {}
        }
    }

    fn on_block(&mut self, block: ContentBlock) {
        match block {
            ContentBlock::Text { text } => self.append_text(&text),
            ContentBlock::Thinking { thinking } => {
                self.emit_after_text(SessionEvent::Thinking(thinking));
            }
            ContentBlock::ToolUse { id, name, input } => {
                debug!(tool = %name, "Tool invoked");
                self.emit_after_text(SessionEvent::ToolInvoked {
                    id,
                    name,
                    args: input.to_string(),
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                self.emit_after_text(SessionEvent::ToolResult {
                    tool_use_id,
                    text: tool_result_text(&content),
                    is_error,
                });
            }
            ContentBlock::Unknown => {}
        }
    }

    fn on_remote_error(&mut self, message: String) {
        let lowered = message.to_lowercase();
        let stale_session = SESSION_ERROR_PATTERNS.iter().any(|p| lowered.contains(p));
        if stale_session {
            if let Some(previous) = self.session_id.take() {
                warn!(%previous, error = %message, "Session invalid, starting fresh");
                self.end_request(SessionEvent::SessionRecovered { previous });
                return;
            }
        }
        warn!(error = %message, "Remote error");
        self.end_request(SessionEvent::Error {
            kind: ErrorKind::Remote,
            message,
        });
    }

    // Timers

    fn fire_due_timers(&mut self, now: Instant) {
        for kind in self.timers.due(now) {
            // An earlier handler in the batch may have cancelled or re-armed it.
            if self.timers.take_if_due(kind, now) {
                self.on_timer(kind, now);
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Reconnect => {
                if !self.manual_disconnect {
                    self.start_connect();
                }
            }
            TimerKind::ConnectProbe => {
                if self.attempt_in_progress() {
                    self.on_connection_lost(TransportError::Connect(
                        "liveness probe timed out".into(),
                    ));
                }
            }
            TimerKind::Retry | TimerKind::DeferredSend => self.pump(),
            TimerKind::WatchdogPoll => self.check_watchdog(now),
            TimerKind::Debounce => {
                if let Some(snapshot) = self.assembler.snapshot() {
                    self.emit(SessionEvent::TextDelta(snapshot));
                }
            }
            TimerKind::AbortFallback => {
                if self.aborting {
                    info!("No abort acknowledgment, resolving locally");
                    self.end_request(SessionEvent::Aborted);
                }
            }
            TimerKind::ModelSwitch => self.settle_model(),
        }
    }

    fn check_watchdog(&mut self, now: Instant) {
        if !self.processing || !self.watchdog.is_armed() {
            return;
        }
        let timeout = self.settings.processing_timeout();
        if self.watchdog.is_expired(now, timeout) {
            warn!(?timeout, "Request timed out");
            self.end_request(SessionEvent::Error {
                kind: ErrorKind::Timeout,
                message: format!("No response for {}s", timeout.as_secs()),
            });
        } else {
            self.timers
                .arm(TimerKind::WatchdogPoll, now + self.timing.watchdog_poll);
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Session a message is addressed to: its own override when present, the
/// current session otherwise. A malformed override addresses a new session.
fn target_session(message: &PendingMessage, current: Option<&SessionId>) -> Option<SessionId> {
    match message.session_id.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let parsed = SessionId::parse(raw);
            if parsed.is_none() {
                warn!(message_id = %message.id, session_id = raw, "Dropping malformed session id");
            }
            parsed
        }
        None => current.cloned(),
    }
}

fn command_envelope(
    message: &PendingMessage,
    session_id: Option<SessionId>,
    model: Option<&ModelSelection>,
) -> OutboundEnvelope {
    let model_hint = message
        .model_hint
        .clone()
        .or_else(|| model.map(|m| m.model_id.clone()));
    let attachments = (!message.attachments.is_empty()).then(|| message.attachments.clone());

    OutboundEnvelope::command(
        message.payload.clone(),
        CommandOptions {
            context: message.context.clone(),
            session_id,
            model_hint,
            mode: message.mode.clone(),
            attachments,
        },
    )
}

async fn read_loop(
    epoch: u64,
    mut source: Box<dyn FrameSource>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let error = loop {
        let frame = match source.next().await {
            Some(Ok(Frame::Text(text))) => InboundFrame::Event(decode(&text)),
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => InboundFrame::Alive,
            Some(Ok(Frame::Close)) | None => break None,
            Some(Err(e)) => break Some(e),
        };
        if internal.send(Internal::Inbound { epoch, frame }).is_err() {
            return;
        }
    };
    let _ = internal.send(Internal::Closed { epoch, error });
}

async fn write_loop(
    epoch: u64,
    mut sink: Box<dyn FrameSink>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame { ticket, frame } => {
                let result = sink.send(frame).await;
                if let Some(message_id) = ticket {
                    let _ = internal.send(Internal::SendCompleted {
                        epoch,
                        message_id,
                        result: result.clone(),
                    });
                }
                if let Err(error) = result {
                    let _ = internal.send(Internal::Closed {
                        epoch,
                        error: Some(error),
                    });
                    return;
                }
            }
            Outgoing::Close => {
                sink.close().await;
                return;
            }
        }
    }
}

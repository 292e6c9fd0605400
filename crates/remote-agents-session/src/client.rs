//! Public handle to the session controller.

use std::sync::Arc;

use remote_agents_core::{
    ClientStatus, Connector, EventHub, MessageId, MessageRequest, ModelSelection, SessionId,
    SettingsProvider, Subscription,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::{ClientSettings, Timing},
    controller::{Command, Controller},
};

/// Session client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Session controller has stopped")]
    ActorGone,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Disconnected")]
    Disconnected,
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Handle to a running session controller.
///
/// Dropping the handle stops the controller and closes the connection.
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventHub>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Spawn a controller on the current tokio runtime.
    #[must_use]
    pub fn spawn<C: Connector>(
        settings: Arc<dyn SettingsProvider>,
        connector: C,
        timing: Timing,
    ) -> Self {
        let events = Arc::new(EventHub::new());
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let controller = Controller::new(
            settings,
            Arc::new(connector),
            timing,
            Arc::clone(&events),
            status_tx,
            internal_tx,
        );
        let task = tokio::spawn(controller.run(commands_rx, internal_rx));

        Self {
            commands,
            events,
            status,
            task,
        }
    }

    /// Spawn a controller using the timing table from `settings`.
    #[must_use]
    pub fn from_settings<C: Connector>(settings: ClientSettings, connector: C) -> Self {
        let timing = settings.timing.clone();
        Self::spawn(Arc::new(settings), connector, timing)
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ActorGone)
    }

    /// Connect and wait for the transport to be confirmed.
    ///
    /// # Errors
    /// Returns error if this attempt fails (reconnection continues in the
    /// background) or `disconnect` intervenes.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Close the connection, cancel all timers and drop queued messages.
    ///
    /// # Errors
    /// Returns error if the controller has stopped.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Queue a message. Connects first if disconnected.
    ///
    /// # Errors
    /// Returns error if the controller has stopped.
    pub fn send_message(&self, request: MessageRequest) -> Result<MessageId, ClientError> {
        let id = MessageId::new();
        self.command(Command::Send { id, request })?;
        Ok(id)
    }

    /// Abort the outstanding request. Ignored when there is none.
    ///
    /// # Errors
    /// Returns error if the controller has stopped.
    pub fn abort(&self) -> Result<(), ClientError> {
        self.command(Command::Abort)
    }

    /// Resume an existing remote session.
    ///
    /// # Errors
    /// Returns error if `session_id` is not a canonical UUID or the controller
    /// has stopped.
    pub fn attach_to_session(&self, session_id: &str) -> Result<(), ClientError> {
        let session_id = SessionId::parse(session_id)
            .ok_or_else(|| ClientError::InvalidSessionId(session_id.to_owned()))?;
        self.command(Command::Attach(session_id))
    }

    /// Change the model, deferred while a request is outstanding.
    ///
    /// # Errors
    /// Returns error if the controller has stopped.
    pub fn switch_model(&self, selection: ModelSelection) -> Result<(), ClientError> {
        self.command(Command::SwitchModel(selection))
    }

    /// Start receiving events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// The event hub, for history replay.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Stop the controller and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Session controller task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remote_agents_core::{ConnectionState, ErrorKind, SessionEvent};
    use remote_agents_transport::{MemoryConnector, RemotePeer};
    use serde_json::{Value, json};
    use tokio::time::{sleep, timeout};

    use super::*;

    const SESSION: &str = "11111111-1111-1111-1111-111111111111";
    const OTHER_SESSION: &str = "22222222-2222-2222-2222-222222222222";

    fn client_with(connector: &MemoryConnector, settings: ClientSettings) -> SessionClient {
        SessionClient::from_settings(settings, connector.clone())
    }

    fn client(connector: &MemoryConnector) -> SessionClient {
        client_with(connector, ClientSettings::new("http://memory"))
    }

    async fn connected(connector: &MemoryConnector, client: &SessionClient) -> RemotePeer {
        let (result, peer) = tokio::join!(client.connect(), connector.accept());
        result.unwrap();
        peer.unwrap()
    }

    async fn next_event(events: &mut Subscription) -> SessionEvent {
        timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event hub closed")
    }

    /// Wait for the first event matching `pred`, skipping others.
    async fn wait_for(
        events: &mut Subscription,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = next_event(events).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn recv_command(peer: &mut RemotePeer) -> Value {
        timeout(Duration::from_secs(600), peer.recv_json())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed")
    }

    fn assistant_text(text: &str) -> Value {
        json!({
            "type": "claude-response",
            "data": {"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}}
        })
    }

    fn delta(text: &str) -> Value {
        json!({
            "type": "claude-response",
            "data": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}}
        })
    }

    fn complete() -> Value {
        json!({"type": "claude-complete", "sessionId": SESSION, "exitCode": 0})
    }

    /// Keep every accepted peer alive so links stay open.
    fn hold_peers(connector: &MemoryConnector) -> JoinHandle<()> {
        let connector = connector.clone();
        tokio::spawn(async move {
            let mut peers = Vec::new();
            while let Some(peer) = connector.accept().await {
                peers.push(peer);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_creates_and_reuses_session() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();

        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("hi", "/srv/app")).unwrap();

        let command = recv_command(&mut peer).await;
        assert_eq!(command["type"], "command");
        assert_eq!(command["payload"], "hi");
        assert_eq!(command["options"]["sessionId"], Value::Null);

        peer.send_json(&json!({"type": "session-created", "sessionId": SESSION}));
        peer.send_json(&assistant_text("Hello"));
        peer.send_json(&complete());

        let mut observed = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = matches!(event, SessionEvent::Completed { .. });
            if matches!(
                event,
                SessionEvent::ConnectionChanged(ConnectionState::Connected)
                    | SessionEvent::TextCommitted(_)
                    | SessionEvent::Completed { .. }
            ) {
                observed.push(event);
            }
            if done {
                break;
            }
        }
        assert_eq!(
            observed,
            vec![
                SessionEvent::ConnectionChanged(ConnectionState::Connected),
                SessionEvent::TextCommitted("Hello".into()),
                SessionEvent::Completed {
                    session_id: SessionId::parse(SESSION)
                },
            ]
        );

        client.send_message(MessageRequest::new("again", "/srv/app")).unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["sessionId"], SESSION);
        assert_eq!(client.status().session_id, SessionId::parse(SESSION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_one_request_at_a_time() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;

        for payload in ["one", "two", "three"] {
            client.send_message(MessageRequest::new(payload, "/p")).unwrap();
        }

        for payload in ["one", "two", "three"] {
            let command = recv_command(&mut peer).await;
            assert_eq!(command["payload"], payload);

            wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;
            sleep(Duration::from_secs(1)).await;
            assert!(
                peer.try_recv_json().is_none(),
                "next message sent before {payload} finished"
            );

            peer.send_json(&complete());
            wait_for(&mut events, |e| matches!(e, SessionEvent::Completed { .. })).await;
        }
        assert_eq!(client.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_gives_up_after_max_retries() {
        let connector = MemoryConnector::new();
        let _peers = hold_peers(&connector);
        let client = client(&connector);
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        connector.fail_text_sends(usize::MAX);
        let id = client.send_message(MessageRequest::new("doomed", "/p")).unwrap();

        let event = wait_for(&mut events, |e| matches!(e, SessionEvent::SendFailed { .. })).await;
        assert!(matches!(event, SessionEvent::SendFailed { message_id, .. } if message_id == id));
        assert_eq!(connector.text_send_count(), 3);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.text_send_count(), 3);
        assert_eq!(client.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_one_failure() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let _first = connected(&connector, &client).await;

        connector.fail_text_sends(1);
        let id = client.send_message(MessageRequest::new("hi", "/p")).unwrap();

        // The failed write takes the link down; the retry goes out on the next one.
        let mut second = timeout(Duration::from_secs(60), connector.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recv_command(&mut second).await["payload"], "hi");
        let event = wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;
        assert_eq!(event, SessionEvent::MessageDelivered(id));
        assert_eq!(connector.text_send_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_is_committed_before_tool_event() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("hi", "/p")).unwrap();
        recv_command(&mut peer).await;

        peer.send_json(&delta("Hello "));
        peer.send_json(&delta("world"));
        peer.send_json(&json!({
            "type": "claude-response",
            "data": {"type": "assistant", "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "src/main.rs"}}
            ]}}
        }));

        let committed = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::TextCommitted(_) | SessionEvent::ToolInvoked { .. })
        })
        .await;
        assert_eq!(committed, SessionEvent::TextCommitted("Hello world".into()));
        let tool = wait_for(&mut events, |e| matches!(e, SessionEvent::ToolInvoked { .. })).await;
        assert_eq!(
            tool,
            SessionEvent::ToolInvoked {
                id: Some("t1".into()),
                name: "Read".into(),
                args: r#"{"path":"src/main.rs"}"#.into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_fragments_collapse_into_one_delta() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("hi", "/p")).unwrap();
        recv_command(&mut peer).await;

        let expected: String = ('a'..='t').collect();
        for c in expected.chars() {
            peer.send_json(&delta(&c.to_string()));
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(200)).await;
        peer.send_json(&complete());
        wait_for(&mut events, |e| matches!(e, SessionEvent::Completed { .. })).await;

        let deltas: Vec<SessionEvent> = client
            .events()
            .history()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::TextDelta(_)))
            .collect();
        assert_eq!(deltas, vec![SessionEvent::TextDelta(expected)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_session_id_is_never_sent() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;

        client
            .send_message(MessageRequest::new("a", "/p").with_session("not-a-uuid"))
            .unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["sessionId"], Value::Null);
        peer.send_json(&json!({"type": "claude-complete"}));
        wait_for(&mut events, |e| matches!(e, SessionEvent::Completed { .. })).await;

        client
            .send_message(MessageRequest::new("b", "/p").with_session(OTHER_SESSION))
            .unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["sessionId"], OTHER_SESSION);

        assert_eq!(
            client.attach_to_session("not-a-uuid"),
            Err(ClientError::InvalidSessionId("not-a-uuid".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_session_created_is_ignored() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("a", "/p")).unwrap();
        recv_command(&mut peer).await;

        peer.send_json(&json!({"type": "session-created", "sessionId": "not-a-uuid"}));
        peer.send_json(&json!({"type": "claude-complete"}));
        wait_for(&mut events, |e| matches!(e, SessionEvent::Completed { .. })).await;
        assert!(client.status().session_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expires_once() {
        let connector = MemoryConnector::new();
        let settings =
            ClientSettings::new("http://memory").with_processing_timeout(Duration::from_secs(30));
        let client = client_with(&connector, settings);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;

        client.send_message(MessageRequest::new("slow", "/p")).unwrap();
        recv_command(&mut peer).await;

        // Intermediate frames keep the request alive.
        sleep(Duration::from_secs(20)).await;
        peer.send_json(&delta("still working"));
        sleep(Duration::from_secs(20)).await;
        assert!(client.status().processing);

        let error = wait_for(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
        assert!(matches!(error, SessionEvent::Error { kind: ErrorKind::Timeout, .. }));
        assert!(!client.status().processing);

        peer.send_json(&complete());
        sleep(Duration::from_secs(60)).await;
        let history = client.events().history();
        let timeouts = history
            .iter()
            .filter(|e| matches!(e, SessionEvent::Error { kind: ErrorKind::Timeout, .. }))
            .count();
        assert_eq!(timeouts, 1);
        assert!(!history.iter().any(|e| matches!(e, SessionEvent::Completed { .. })));
        assert!(!client.status().processing);
    }

    async fn start_request_in_session(
        connector: &MemoryConnector,
        client: &SessionClient,
    ) -> RemotePeer {
        let mut peer = connected(connector, client).await;
        client.attach_to_session(SESSION).unwrap();
        client.send_message(MessageRequest::new("long task", "/p")).unwrap();
        recv_command(&mut peer).await;
        peer
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_twice_sends_one_envelope() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = start_request_in_session(&connector, &client).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;

        client.abort().unwrap();
        client.abort().unwrap();

        let abort = recv_command(&mut peer).await;
        assert_eq!(
            abort,
            json!({"type": "abort-session", "sessionId": SESSION, "provider": "claude"})
        );
        peer.send_json(&json!({"type": "session-aborted", "sessionId": SESSION}));
        wait_for(&mut events, |e| matches!(e, SessionEvent::Aborted)).await;

        sleep(Duration::from_secs(10)).await;
        assert!(peer.try_recv_json().is_none());
        let aborted = client
            .events()
            .history()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Aborted))
            .count();
        assert_eq!(aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_resolves_locally_and_ignores_late_ack() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let peer = start_request_in_session(&connector, &client).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;

        client.abort().unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(client.status().aborting);

        wait_for(&mut events, |e| matches!(e, SessionEvent::Aborted)).await;
        let status = client.status();
        assert!(!status.aborting && !status.processing);

        peer.send_json(&json!({"type": "session-aborted", "sessionId": SESSION}));
        sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_without_request_is_ignored() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut peer = connected(&connector, &client).await;
        client.attach_to_session(SESSION).unwrap();
        client.abort().unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(peer.try_recv_json().is_none());
        assert!(!client.status().aborting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_mid_request_discards_it() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = start_request_in_session(&connector, &client).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;

        peer.send_json(&delta("half"));
        client.abort().unwrap();
        assert_eq!(recv_command(&mut peer).await["type"], "abort-session");
        assert!(client.status().aborting);

        client.attach_to_session(OTHER_SESSION).unwrap();
        let other = SessionId::parse(OTHER_SESSION).unwrap();
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, SessionEvent::SessionAttached(_))).await,
            SessionEvent::SessionAttached(other.clone())
        );
        let status = client.status();
        assert!(!status.processing && !status.aborting);
        assert_eq!(status.session_id.as_ref(), Some(&other));

        // Late traffic for the discarded request changes nothing.
        peer.send_json(&json!({"type": "session-aborted", "sessionId": SESSION}));
        peer.send_json(&json!({"type": "session-aborted", "sessionId": OTHER_SESSION}));
        peer.send_json(&assistant_text("late"));
        peer.send_json(&complete());
        sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_none());
        assert_eq!(client.status(), status);

        client.send_message(MessageRequest::new("next", "/p")).unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["payload"], "next");
        assert_eq!(command["options"]["sessionId"], OTHER_SESSION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_override_switches_current_session() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.attach_to_session(SESSION).unwrap();

        client
            .send_message(MessageRequest::new("resume", "/p").with_session(OTHER_SESSION))
            .unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["sessionId"], OTHER_SESSION);
        let other = SessionId::parse(OTHER_SESSION).unwrap();
        assert_eq!(client.status().session_id.as_ref(), Some(&other));

        peer.send_json(&json!({
            "type": "claude-response",
            "sessionId": OTHER_SESSION,
            "data": {"type": "assistant", "message": {"content": [{"type": "text", "text": "Resumed"}]}}
        }));
        peer.send_json(&json!({"type": "claude-complete", "sessionId": OTHER_SESSION, "exitCode": 0}));

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::Completed {
                session_id: Some(other.clone())
            })
        );
        assert!(seen.contains(&SessionEvent::SessionAttached(other)));
        assert!(seen.contains(&SessionEvent::TextCommitted("Resumed".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_reaches_overridden_session() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.attach_to_session(SESSION).unwrap();

        client
            .send_message(MessageRequest::new("resume", "/p").with_session(OTHER_SESSION))
            .unwrap();
        recv_command(&mut peer).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;

        client.abort().unwrap();
        assert_eq!(
            recv_command(&mut peer).await,
            json!({"type": "abort-session", "sessionId": OTHER_SESSION, "provider": "claude"})
        );
        peer.send_json(&json!({"type": "session-aborted", "sessionId": OTHER_SESSION}));
        wait_for(&mut events, |e| matches!(e, SessionEvent::Aborted)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_error_recovers() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = start_request_in_session(&connector, &client).await;

        peer.send_json(&json!({
            "type": "claude-error",
            "sessionId": SESSION,
            "error": "No conversation found with session ID"
        }));
        let event = wait_for(&mut events, SessionEvent::is_terminal).await;
        assert_eq!(
            event,
            SessionEvent::SessionRecovered {
                previous: SessionId::parse(SESSION).unwrap()
            }
        );
        assert!(client.status().session_id.is_none());

        client.send_message(MessageRequest::new("fresh", "/p")).unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["sessionId"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_hard_failures() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let peer = start_request_in_session(&connector, &client).await;

        peer.send_json(&delta("partial"));
        peer.send_json(&json!({"type": "claude-error", "error": {"message": "rate limited"}}));
        let event = wait_for(&mut events, SessionEvent::is_terminal).await;
        assert_eq!(
            event,
            SessionEvent::Error {
                kind: ErrorKind::Remote,
                message: "rate limited".into()
            }
        );
        let status = client.status();
        assert!(!status.processing);
        assert_eq!(status.session_id, SessionId::parse(SESSION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_for_other_sessions_are_ignored() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let peer = start_request_in_session(&connector, &client).await;

        peer.send_json(&json!({"type": "claude-complete", "sessionId": OTHER_SESSION}));
        peer.send_json(&json!({"type": "token-budget", "sessionId": SESSION, "data": {"used": 10, "total": 100}}));
        let event = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::Completed { .. } | SessionEvent::TokenBudget { .. })
        })
        .await;
        assert_eq!(event, SessionEvent::TokenBudget { used: 10, total: 100 });
        assert!(client.status().processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_are_not_fatal() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let peer = connected(&connector, &client).await;

        peer.send_text("{not json");
        let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
        assert!(matches!(event, SessionEvent::Error { kind: ErrorKind::Protocol, .. }));
        assert_eq!(client.status().connection, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_interrupts_and_reconnects() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("hi", "/p")).unwrap();
        recv_command(&mut peer).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::MessageDelivered(_))).await;
        peer.send_json(&delta("half an ans"));

        drop(peer);
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, SessionEvent::ConnectionChanged(_))).await,
            SessionEvent::ConnectionChanged(ConnectionState::Reconnecting { attempt: 1 })
        );
        wait_for(&mut events, |e| matches!(e, SessionEvent::Interrupted)).await;
        assert!(!client.status().processing);

        let _second = connector.accept().await.unwrap();
        assert_eq!(
            wait_for(&mut events, |e| matches!(e, SessionEvent::ConnectionChanged(_))).await,
            SessionEvent::ConnectionChanged(ConnectionState::Connected)
        );
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_before_send_report_retries_without_interrupting() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut first = connected(&connector, &client).await;

        connector.stall_text_sends(1);
        let id = client.send_message(MessageRequest::new("hi", "/p")).unwrap();
        assert_eq!(recv_command(&mut first).await["payload"], "hi");
        assert!(client.status().processing);
        drop(first);

        let mut second = connector.accept().await.unwrap();
        assert_eq!(recv_command(&mut second).await["payload"], "hi");
        second.send_json(&complete());

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen.last(), Some(SessionEvent::Completed { .. })), "{seen:?}");
        assert!(!seen.contains(&SessionEvent::Interrupted));
        let delivered: Vec<_> = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::MessageDelivered(_)))
            .collect();
        assert_eq!(delivered, vec![&SessionEvent::MessageDelivered(id)]);
        assert_eq!(connector.text_send_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnects_count_up() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let peer = connected(&connector, &client).await;
        let mut events = client.subscribe();

        connector.fail_next_connects(2);
        drop(peer);
        for attempt in 1..=3 {
            assert_eq!(
                wait_for(&mut events, |e| matches!(e, SessionEvent::ConnectionChanged(_))).await,
                SessionEvent::ConnectionChanged(ConnectionState::Reconnecting { attempt })
            );
        }
        let _peer = connector.accept().await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::ConnectionChanged(ConnectionState::Connected))
        })
        .await;
        assert_eq!(connector.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_counts_as_failure() {
        let connector = MemoryConnector::new();
        connector.set_auto_pong(false);
        let client = client(&connector);
        let mut events = client.subscribe();

        let (result, _peer) = tokio::join!(client.connect(), connector.accept());
        assert!(matches!(result, Err(ClientError::ConnectFailed(_))));
        assert_eq!(
            client.status().connection,
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert!(
            events
                .try_recv()
                .is_some_and(|e| e == SessionEvent::ConnectionChanged(ConnectionState::Connecting))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_connects() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        client.send_message(MessageRequest::new("wake up", "/p")).unwrap();
        let mut peer = connector.accept().await.unwrap();
        assert_eq!(recv_command(&mut peer).await["payload"], "wake up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnecting() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("queued", "/p")).unwrap();
        client.send_message(MessageRequest::new("queued too", "/p")).unwrap();

        client.disconnect().unwrap();
        drop(peer);
        sleep(Duration::from_secs(120)).await;

        let status = client.status();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert_eq!(status.queued, 0);
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_switch_is_deferred_while_processing() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;

        client.switch_model(ModelSelection::new("sonnet", "sonnet-id")).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::ModelChanged { .. })).await;

        client.send_message(MessageRequest::new("a", "/p")).unwrap();
        let command = recv_command(&mut peer).await;
        assert_eq!(command["options"]["modelHint"], "sonnet-id");

        client.switch_model(ModelSelection::new("opus", "opus-id")).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(client.status().model.unwrap().name, "sonnet");

        peer.send_json(&complete());
        let event = wait_for(&mut events, |e| matches!(e, SessionEvent::ModelChanged { .. })).await;
        assert_eq!(
            event,
            SessionEvent::ModelChanged {
                model: "opus".into(),
                model_id: "opus-id".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_switch_fallback_applies_late() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut events = client.subscribe();
        let mut peer = connected(&connector, &client).await;
        client.send_message(MessageRequest::new("a", "/p")).unwrap();
        recv_command(&mut peer).await;

        client.switch_model(ModelSelection::new("haiku", "haiku-id")).unwrap();
        wait_for(&mut events, |e| matches!(e, SessionEvent::ModelChanged { .. })).await;
        assert!(client.status().processing);
        assert_eq!(client.status().model.unwrap().model_id, "haiku-id");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_each_see_every_event() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut first = client.subscribe();
        let mut second = client.subscribe();
        let _peer = connected(&connector, &client).await;

        for events in [&mut first, &mut second] {
            assert_eq!(
                next_event(events).await,
                SessionEvent::ConnectionChanged(ConnectionState::Connecting)
            );
            assert_eq!(
                next_event(events).await,
                SessionEvent::ConnectionChanged(ConnectionState::Connected)
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_link() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let mut peer = connected(&connector, &client).await;
        client.shutdown().await;
        assert_eq!(peer.recv().await, Some(remote_agents_core::Frame::Close));
    }
}

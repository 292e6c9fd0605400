//! Outbound retry queue with head-of-line blocking.

use std::{collections::VecDeque, time::Duration};

use remote_agents_core::{Attachment, MessageId, MessageRequest};
use tokio::time::Instant;

use crate::config::Timing;

/// Fallback when the configured delay list is empty.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A message owned by the queue until it is sent or given up on.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: MessageId,
    pub payload: String,
    pub context: String,
    /// Raw override; validated when the envelope is built.
    pub session_id: Option<String>,
    pub mode: Option<String>,
    pub attachments: Vec<Attachment>,
    pub model_hint: Option<String>,
    /// Failed send attempts so far.
    pub attempts: u32,
    pub created_at: Instant,
}

impl PendingMessage {
    #[must_use]
    pub fn new(id: MessageId, request: MessageRequest, created_at: Instant) -> Self {
        let MessageRequest {
            payload,
            context,
            session_id,
            mode,
            attachments,
            model_hint,
        } = request;
        Self {
            id,
            payload,
            context,
            session_id,
            mode,
            attachments,
            model_hint,
            attempts: 0,
            created_at,
        }
    }
}

/// What to do after a failed send.
#[derive(Debug)]
pub enum FailureOutcome {
    /// Try the same message again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Retries exhausted; the message has been removed.
    GaveUp(PendingMessage),
}

/// FIFO of outbound messages.
///
/// Only the head is ever sent, and the next item waits until the head is
/// acknowledged by the transport or dropped after `max_retries` failures.
#[derive(Debug)]
pub struct RetryQueue {
    items: VecDeque<PendingMessage>,
    in_flight: bool,
    max_retries: u32,
    retry_delays: Vec<Duration>,
}

impl RetryQueue {
    #[must_use]
    pub fn new(max_retries: u32, retry_delays: Vec<Duration>) -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: false,
            max_retries: max_retries.max(1),
            retry_delays,
        }
    }

    #[must_use]
    pub fn from_timing(timing: &Timing) -> Self {
        Self::new(timing.max_retries, timing.retry_delays.clone())
    }

    /// Append a message. Returns `true` if it is now the only item.
    pub fn enqueue(&mut self, message: PendingMessage) -> bool {
        self.items.push_back(message);
        self.items.len() == 1
    }

    #[must_use]
    pub fn head(&self) -> Option<&PendingMessage> {
        self.items.front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the head has been handed to the transport and not yet resolved.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Mark the head as handed to the transport.
    ///
    /// Returns `None` if the queue is empty or the head is already in flight.
    pub fn begin_send(&mut self) -> Option<&PendingMessage> {
        if self.in_flight {
            return None;
        }
        let head = self.items.front()?;
        self.in_flight = true;
        Some(head)
    }

    /// The transport accepted the head. Removes and returns it.
    pub fn complete(&mut self, id: MessageId) -> Option<PendingMessage> {
        if !self.in_flight || self.items.front().map(|m| m.id) != Some(id) {
            return None;
        }
        self.in_flight = false;
        self.items.pop_front()
    }

    /// The transport rejected the head (or lost it).
    pub fn record_failure(&mut self, id: MessageId) -> Option<FailureOutcome> {
        if self.items.front().map(|m| m.id) != Some(id) {
            return None;
        }
        self.in_flight = false;
        let head = self.items.front_mut()?;
        head.attempts += 1;
        let attempt = head.attempts;

        if attempt >= self.max_retries {
            return self.items.pop_front().map(FailureOutcome::GaveUp);
        }
        Some(FailureOutcome::Retry {
            attempt,
            delay: self.delay_for(attempt),
        })
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.retry_delays
            .get(index)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or(DEFAULT_RETRY_DELAY)
    }

    /// Remove the head without counting an attempt.
    pub fn discard_head(&mut self) -> Option<PendingMessage> {
        self.in_flight = false;
        self.items.pop_front()
    }

    /// Drop everything. Returns how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        self.in_flight = false;
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}

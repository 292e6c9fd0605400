//! Broadcast + history fan-out of session events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionEvent;

/// Live channel capacity before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 10_000;

/// Maximum number of events kept for late subscribers.
const HISTORY_EVENTS: usize = 512;

/// Maximum history payload (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Event fan-out with bounded history.
///
/// Every subscriber gets its own receiver, so observers never replace each
/// other. Dropping a [`Subscription`] (or calling
/// [`Subscription::unsubscribe`]) detaches it.
pub struct EventHub {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Publish an event to live subscribers and history.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone());
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.history.len() >= HISTORY_EVENTS
            || inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES
        {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Register a new subscriber for live events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let rx = self.sender.subscribe();
        let history = self.history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

/// Handle for one subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the hub is gone.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the oldest events.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream of live events.
    #[must_use]
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.rx)
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Detach from the hub.
    pub fn unsubscribe(self) {}
}

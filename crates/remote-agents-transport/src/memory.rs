//! In-process loopback connector.
//!
//! Useful for development and tests: every successful dial hands the far end
//! of the link to whoever calls [`MemoryConnector::accept`], which then plays
//! the remote service.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use remote_agents_core::{Connector, Frame, FrameSink, FrameSource, Link, TransportError};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use url::Url;

struct Inner {
    fail_connects: AtomicUsize,
    fail_text_sends: AtomicUsize,
    stall_text_sends: AtomicUsize,
    dials: AtomicUsize,
    text_sends: AtomicUsize,
    auto_pong: AtomicBool,
    peers_tx: mpsc::UnboundedSender<RemotePeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<RemotePeer>>,
}

/// Loopback connector. Clones share state.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Create a connector that accepts every dial and answers pings.
    #[must_use]
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                fail_connects: AtomicUsize::new(0),
                fail_text_sends: AtomicUsize::new(0),
                stall_text_sends: AtomicUsize::new(0),
                dials: AtomicUsize::new(0),
                text_sends: AtomicUsize::new(0),
                auto_pong: AtomicBool::new(true),
                peers_tx,
                peers_rx: Mutex::new(peers_rx),
            }),
        }
    }

    /// Wait for the next successful dial and take the remote end.
    pub async fn accept(&self) -> Option<RemotePeer> {
        self.inner.peers_rx.lock().await.recv().await
    }

    /// Refuse the next `n` dials.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` text sends on any link.
    pub fn fail_text_sends(&self, n: usize) {
        self.inner.fail_text_sends.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` text sends but never report them as complete,
    /// leaving the writer stuck mid-send until the link is torn down.
    pub fn stall_text_sends(&self, n: usize) {
        self.inner.stall_text_sends.store(n, Ordering::SeqCst);
    }

    /// Answer pings automatically (default) or leave the link unconfirmed.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Number of dial attempts, failed ones included.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Number of text frames the client tried to send, failed ones included.
    #[must_use]
    pub fn text_send_count(&self) -> usize {
        self.inner.text_sends.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Url, _bearer: Option<&str>) -> Result<Link, TransportError> {
        let index = self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.inner.fail_connects) {
            return Err(TransportError::Connect(format!("{endpoint} refused")));
        }

        let (to_peer, inbox) = mpsc::unbounded_channel();
        let (outbox, from_peer) = mpsc::unbounded_channel();

        let sink = MemorySink {
            to_peer,
            loopback: outbox.downgrade(),
            inner: Arc::clone(&self.inner),
        };
        let source = MemorySource { rx: from_peer };
        let peer = RemotePeer {
            index,
            inbox,
            outbox,
        };

        self.inner
            .peers_tx
            .send(peer)
            .map_err(|_| TransportError::Connect("listener gone".into()))?;

        Ok((Box::new(sink), Box::new(source)))
    }
}

struct MemorySink {
    to_peer: mpsc::UnboundedSender<Frame>,
    loopback: mpsc::WeakUnboundedSender<Result<Frame, TransportError>>,
    inner: Arc<Inner>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::Ping(data) => {
                if self.inner.auto_pong.load(Ordering::SeqCst) {
                    if let Some(loopback) = self.loopback.upgrade() {
                        let _ = loopback.send(Ok(Frame::Pong(data)));
                    }
                }
                Ok(())
            }
            Frame::Text(text) => {
                self.inner.text_sends.fetch_add(1, Ordering::SeqCst);
                if take_one(&self.inner.fail_text_sends) {
                    return Err(TransportError::Send("injected failure".into()));
                }
                let sent = self
                    .to_peer
                    .send(Frame::Text(text))
                    .map_err(|_| TransportError::Closed);
                if sent.is_ok() && take_one(&self.inner.stall_text_sends) {
                    std::future::pending::<()>().await;
                }
                sent
            }
            other => self.to_peer.send(other).map_err(|_| TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        let _ = self.to_peer.send(Frame::Close);
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

/// The remote end of one memory link.
///
/// Dropping it looks like the service vanishing.
pub struct RemotePeer {
    /// Zero-based dial index this link was created by.
    pub index: usize,
    inbox: mpsc::UnboundedReceiver<Frame>,
    outbox: mpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl RemotePeer {
    /// Next frame sent by the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }

    /// Next text frame sent by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            if let Frame::Text(text) = self.inbox.recv().await? {
                return serde_json::from_str(&text).ok();
            }
        }
    }

    /// Next already-sent text frame, parsed as JSON.
    pub fn try_recv_json(&mut self) -> Option<Value> {
        while let Ok(frame) = self.inbox.try_recv() {
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Deliver a JSON envelope to the client.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Deliver a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbox.send(Ok(Frame::Text(text.into()))).is_ok()
    }

    /// Break the link with a receive error.
    pub fn fail(self, error: TransportError) {
        let _ = self.outbox.send(Err(error));
    }
}

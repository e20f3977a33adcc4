//! In-memory transport and connector for engine and pool tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::Event;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::abort::{AbortSignal, abortable};
use crate::error::{ClientError, Result};
use crate::message::{Frame, decode_frame};
use crate::pool::Connector;
use crate::relay::RelayConnection;
use crate::transport::{ConnectionState, FrameStream, Observers, Transport};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn event(id: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "pk".to_string(),
        created_at: 1,
        kind: 1,
        tags: vec![],
        content: String::new(),
        sig: "sig".to_string(),
    }
}

pub(crate) fn event_json(id: &str) -> Value {
    json!({
        "id": id,
        "pubkey": "pk",
        "created_at": 1,
        "kind": 1,
        "tags": [],
        "content": "",
        "sig": "sig"
    })
}

/// Client side of an in-memory connection.
pub(crate) struct MockTransport {
    url: String,
    inbound: Arc<Observers<Frame>>,
    sent: mpsc::UnboundedSender<Value>,
    closed: Arc<AtomicBool>,
}

/// Relay side of an in-memory connection: pushes frames, reads what was sent.
pub(crate) struct MockRelay {
    url: String,
    inbound: Arc<Observers<Frame>>,
    sent: mpsc::UnboundedReceiver<Value>,
    closed: Arc<AtomicBool>,
}

pub(crate) fn mock_pair(url: &str) -> (MockTransport, MockRelay) {
    let inbound = Arc::new(Observers::new());
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport {
            url: url.to_string(),
            inbound: Arc::clone(&inbound),
            sent: sent_tx,
            closed: Arc::clone(&closed),
        },
        MockRelay {
            url: url.to_string(),
            inbound,
            sent: sent_rx,
            closed,
        },
    )
}

/// Engine over a fresh in-memory connection.
pub(crate) fn mock_connection(url: &str) -> (RelayConnection, MockRelay) {
    let (transport, relay) = mock_pair(url);
    (RelayConnection::new(Arc::new(transport)), relay)
}

impl MockRelay {
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn push(&self, frame: Value) {
        self.push_text(&frame.to_string());
    }

    /// Deliver a raw text payload the way the socket reader does.
    pub(crate) fn push_text(&self, text: &str) {
        if let Some(frame) = decode_frame(text) {
            self.inbound.publish(&frame);
        }
    }

    /// Frame observers still attached on the client side.
    pub(crate) fn observers(&self) -> usize {
        self.inbound.count()
    }

    pub(crate) async fn next_sent(&mut self) -> Option<Value> {
        timeout(RECV_TIMEOUT, self.sent.recv()).await.ok().flatten()
    }

    pub(crate) fn try_next_sent(&mut self) -> Option<Value> {
        self.sent.try_recv().ok()
    }

    /// Drop the connection from the relay side; frame streams complete.
    pub(crate) fn disconnect(&self) {
        self.inbound.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn frames(&self) -> FrameStream {
        self.inbound.subscribe()
    }

    async fn send(&self, frame: &Value) -> Result<()> {
        if !self.is_open().await {
            return Err(ClientError::NotConnected);
        }
        self.sent
            .send(frame.clone())
            .map_err(|_| ClientError::NotConnected)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
    }

    async fn state(&self) -> ConnectionState {
        if !self.inbound.is_closed() && !self.closed.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Connector handing out in-memory connections. The relay side of each
/// dial is delivered on the receiver returned by [`MockConnector::new`].
pub(crate) struct MockConnector {
    remotes: mpsc::UnboundedSender<MockRelay>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    dials: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockRelay>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes,
                failing: HashSet::new(),
                delays: HashMap::new(),
                dials: AtomicUsize::new(0),
            },
            remotes_rx,
        )
    }

    pub(crate) fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub(crate) fn delayed(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str, signal: Option<&AbortSignal>) -> Result<RelayConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(url).copied() {
            abortable(signal, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
        if self.failing.contains(url) {
            return Err(ClientError::Connection(format!("{} refused", url)));
        }

        let (transport, relay) = mock_pair(url);
        let _ = self.remotes.send(relay);
        Ok(RelayConnection::new(Arc::new(transport)))
    }
}

/// Collect the relay sides of the next `count` dials, keyed by URL.
pub(crate) async fn relays_by_url(
    remotes: &mut mpsc::UnboundedReceiver<MockRelay>,
    count: usize,
) -> Result<HashMap<String, MockRelay>> {
    let mut relays = HashMap::new();
    while relays.len() < count {
        let relay = timeout(RECV_TIMEOUT, remotes.recv())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| ClientError::Internal("expected another dial".to_string()))?;
        relays.insert(relay.url.clone(), relay);
    }
    Ok(relays)
}

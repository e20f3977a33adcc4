//! WebSocket transports.
//!
//! A transport owns one physical connection and exposes it as a multicast
//! stream of decoded frames plus an async send. Two variants:
//! - [`WebSocketTransport`] dials eagerly and completes its frame stream when
//!   the socket closes.
//! - [`AutoConnectTransport`] dials on first send and redials when the held
//!   socket is no longer open; its frame stream spans reconnects.

use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::abort::{AbortController, AbortSignal, abortable};
use crate::error::{ClientError, Result};
use crate::message::{Frame, decode_frame};
use crate::relay::RelayConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Inbound frames as seen by one observer.
pub type FrameStream = BoxStream<'static, Frame>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One physical relay connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn url(&self) -> &str;

    /// New observer of inbound frames. Frames that arrived before the call
    /// are not replayed.
    fn frames(&self) -> FrameStream;

    async fn send(&self, frame: &Value) -> Result<()>;

    /// Terminate the connection. Idempotent.
    async fn close(&self);

    async fn state(&self) -> ConnectionState;

    async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }
}

/// Parse and check a relay URL.
pub fn validate_relay_url(url: &str) -> Result<Url> {
    let parsed_url = Url::parse(url.trim())?;
    if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed_url.scheme()
        )));
    }
    Ok(parsed_url)
}

/// Registry of live observers. Every published item is queued for every
/// observer, each on its own unbounded channel, so a slow observer never
/// misses items. Observers whose stream was dropped are pruned on publish.
pub(crate) struct Observers<T> {
    // `None` once closed.
    senders: SyncMutex<Option<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone + Send + 'static> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: SyncMutex::new(Some(Vec::new())),
        }
    }

    /// Register an observer. After [`Observers::close`] the stream is
    /// already complete.
    pub(crate) fn subscribe(&self) -> BoxStream<'static, T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(senders) = self.lock().as_mut() {
            senders.push(sender);
        }
        UnboundedReceiverStream::new(receiver).boxed()
    }

    pub(crate) fn publish(&self, item: &T) {
        if let Some(senders) = self.lock().as_mut() {
            senders.retain(|sender| sender.send(item.clone()).is_ok());
        }
    }

    /// Complete every observer stream. Idempotent.
    pub(crate) fn close(&self) {
        self.lock().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Observers whose stream is still alive.
    pub(crate) fn count(&self) -> usize {
        match self.lock().as_mut() {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<mpsc::UnboundedSender<T>>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Eagerly connected WebSocket transport.
pub struct WebSocketTransport {
    url: Url,
    state: Arc<RwLock<ConnectionState>>,
    writer: Mutex<Option<WsWriter>>,
    frames: Arc<Observers<Frame>>,
    recv_task: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Dial `url` and resolve once the WebSocket handshake completes.
    pub async fn connect(
        url: &str,
        config: &RelayConfig,
        signal: Option<&AbortSignal>,
    ) -> Result<Self> {
        let url = validate_relay_url(url)?;
        debug!("connecting to relay {}", url);

        let dial = async {
            timeout(config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    ClientError::Timeout(format!(
                        "connection timeout after {:?}",
                        config.connect_timeout
                    ))
                })?
                .map_err(|error| ClientError::WebSocket(error.to_string()))
        };
        let (stream, _response) = abortable(signal, dial).await?;

        let (writer, reader) = stream.split();
        let frames = Arc::new(Observers::new());
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let recv_task = tokio::spawn(read_frames(
            reader,
            Arc::clone(&frames),
            Arc::clone(&state),
            url.to_string(),
        ));

        debug!("connected to relay {}", url);
        Ok(Self {
            url,
            state,
            writer: Mutex::new(Some(writer)),
            frames,
            recv_task,
        })
    }
}

async fn read_frames(
    mut reader: WsReader,
    frames: Arc<Observers<Frame>>,
    state: Arc<RwLock<ConnectionState>>,
    relay_url: String,
) {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Some(frame) => frames.publish(&frame),
                None => debug!("dropping non-array payload from {}", relay_url),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!("websocket read error on {}: {}", relay_url, error);
                break;
            }
        }
    }

    *state.write().await = ConnectionState::Disconnected;
    frames.close();
    debug!("relay {} reader stopped", relay_url);
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    fn frames(&self) -> FrameStream {
        self.frames.subscribe()
    }

    async fn send(&self, frame: &Value) -> Result<()> {
        if !self.is_open().await {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(frame)?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::text(text))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!("close frame to {} failed: {}", self.url, error);
        }
        self.recv_task.abort();
        *self.state.write().await = ConnectionState::Disconnected;
        self.frames.close();
    }

    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.frames.close();
    }
}

struct LiveConnection {
    transport: Arc<WebSocketTransport>,
    forward_task: JoinHandle<()>,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}

/// Lazily connected WebSocket transport that redials on send.
///
/// Dials are serialized; `state()` and `close()` never wait for one.
/// `close()` cancels a dial in flight, failing its `send()` with
/// [`ClientError::Aborted`].
pub struct AutoConnectTransport {
    url: Url,
    config: RelayConfig,
    frames: Arc<Observers<Frame>>,
    dial_lock: Mutex<()>,
    dialing: SyncMutex<Option<AbortController>>,
    current: SyncMutex<Option<LiveConnection>>,
}

impl AutoConnectTransport {
    /// Create the transport without dialing.
    pub fn new(url: &str, config: RelayConfig) -> Result<Self> {
        let url = validate_relay_url(url)?;
        Ok(Self {
            url,
            config,
            frames: Arc::new(Observers::new()),
            dial_lock: Mutex::new(()),
            dialing: SyncMutex::new(None),
            current: SyncMutex::new(None),
        })
    }

    fn live(&self) -> Option<Arc<WebSocketTransport>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|live| Arc::clone(&live.transport))
    }

    fn take_live(&self) -> Option<LiveConnection> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_dialing(&self, controller: Option<AbortController>) {
        *self.dialing.lock().unwrap_or_else(PoisonError::into_inner) = controller;
    }

    /// Reuse the held connection if open, otherwise replace it with a fresh one.
    async fn connected(&self) -> Result<Arc<WebSocketTransport>> {
        let _dial = self.dial_lock.lock().await;
        if let Some(transport) = self.live()
            && transport.is_open().await
        {
            return Ok(transport);
        }

        // A failed redial leaves no handle behind; the next send dials again.
        if let Some(stale) = self.take_live() {
            debug!("discarding stale connection to {}", self.url);
            stale.transport.close().await;
        }

        let controller = AbortController::new();
        let signal = controller.signal();
        self.set_dialing(Some(controller));
        let dialed =
            WebSocketTransport::connect(self.url.as_str(), &self.config, Some(&signal)).await;
        self.set_dialing(None);
        let transport = Arc::new(dialed?);

        let mut frames = transport.frames();
        let observers = Arc::clone(&self.frames);
        let forward_task = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                observers.publish(&frame);
            }
        });
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveConnection {
            transport: Arc::clone(&transport),
            forward_task,
        });
        Ok(transport)
    }
}

#[async_trait]
impl Transport for AutoConnectTransport {
    fn url(&self) -> &str {
        self.url.as_str()
    }

    fn frames(&self) -> FrameStream {
        self.frames.subscribe()
    }

    async fn send(&self, frame: &Value) -> Result<()> {
        let transport = self.connected().await?;
        transport.send(frame).await
    }

    async fn close(&self) {
        let dialing = self
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(controller) = dialing {
            controller.abort("transport closed");
        }
        if let Some(live) = self.take_live() {
            live.transport.close().await;
        }
    }

    async fn state(&self) -> ConnectionState {
        let dialing = self
            .dialing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if dialing {
            return ConnectionState::Connecting;
        }
        match self.live() {
            Some(transport) => transport.state().await,
            None => ConnectionState::Disconnected,
        }
    }
}

impl Drop for AutoConnectTransport {
    fn drop(&mut self) {
        self.frames.close();
    }
}

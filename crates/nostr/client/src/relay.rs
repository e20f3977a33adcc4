//! Single relay connection: publish, subscribe and notices over one transport.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use nostr::{Event, Filter};
use serde_json::Value;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::abort::{AbortSignal, abortable};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::subscription::{
    RandomSubscriptionId, Subscription, SubscriptionHandle, SubscriptionIdGenerator,
    SubscriptionItem,
};
use crate::transport::{
    AutoConnectTransport, ConnectionState, FrameStream, Transport, WebSocketTransport,
};

const MAX_ID_ATTEMPTS: usize = 16;

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// What a publish waits for after sending the event.
#[derive(Debug, Clone, Default)]
pub enum Ack {
    /// Return as soon as the frame is sent.
    #[default]
    Skip,
    /// Wait for the relay's `OK`, however long it takes.
    Wait,
    /// Wait for `OK` at most this long, then fail with [`ClientError::AckTimeout`].
    Timeout(Duration),
    /// Wait for `OK` until the signal fires, then fail with [`ClientError::Aborted`].
    Until(AbortSignal),
}

impl From<bool> for Ack {
    fn from(wait: bool) -> Self {
        if wait { Self::Wait } else { Self::Skip }
    }
}

impl From<Duration> for Ack {
    fn from(duration: Duration) -> Self {
        Self::Timeout(duration)
    }
}

impl From<AbortSignal> for Ack {
    fn from(signal: AbortSignal) -> Self {
        Self::Until(signal)
    }
}

impl From<&AbortSignal> for Ack {
    fn from(signal: &AbortSignal) -> Self {
        Self::Until(signal.clone())
    }
}

/// Publish confirmation from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Operations shared by a single relay connection and a relay pool.
#[async_trait]
pub trait Relay: Send + Sync {
    type Subscription: RelaySubscription;

    /// Multicast stream of `NOTICE` texts.
    fn notices(&self) -> BoxStream<'static, String>;

    /// Publish `event`. Returns `None` for [`Ack::Skip`].
    async fn event(&self, event: &Event, ack: Ack) -> Result<Option<PublishConfirmation>>;

    /// Open a subscription; a random id is used when none is given.
    async fn req(&self, subscription_id: Option<String>) -> Result<Self::Subscription>;

    async fn close(&self);
}

/// A subscription stream that can be re-filtered and closed.
#[async_trait]
pub trait RelaySubscription: Stream<Item = SubscriptionItem> + Send + Sync + Unpin {
    fn id(&self) -> &str;

    async fn set_filters(&self, filters: &[Filter]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Protocol engine over one transport.
pub struct RelayConnection {
    transport: Arc<dyn Transport>,
    ids: Arc<dyn SubscriptionIdGenerator>,
    open_subscriptions: Arc<Mutex<HashSet<String>>>,
}

impl RelayConnection {
    /// Wrap an existing transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_id_generator(transport, Arc::new(RandomSubscriptionId))
    }

    pub fn with_id_generator(
        transport: Arc<dyn Transport>,
        ids: Arc<dyn SubscriptionIdGenerator>,
    ) -> Self {
        Self {
            transport,
            ids,
            open_subscriptions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Dial `url` now and resolve once the connection is open.
    pub async fn connect(url: &str, signal: Option<&AbortSignal>) -> Result<Self> {
        Self::connect_with_config(url, &RelayConfig::default(), signal).await
    }

    pub async fn connect_with_config(
        url: &str,
        config: &RelayConfig,
        signal: Option<&AbortSignal>,
    ) -> Result<Self> {
        let transport = WebSocketTransport::connect(url, config, signal).await?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Connection that dials on first send and redials after a drop.
    pub fn auto_connect(url: &str) -> Result<Self> {
        Self::auto_connect_with_config(url, RelayConfig::default())
    }

    pub fn auto_connect_with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let transport = AutoConnectTransport::new(url, config)?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.transport.url()
    }

    pub async fn state(&self) -> ConnectionState {
        self.transport.state().await
    }

    pub fn notices(&self) -> BoxStream<'static, String> {
        self.transport
            .frames()
            .filter_map(|frame| {
                ready(match frame_kind(&frame) {
                    Some("NOTICE") => match RelayMessage::from_frame(&frame) {
                        Some(RelayMessage::Notice(text)) => Some(text),
                        _ => None,
                    },
                    _ => None,
                })
            })
            .boxed()
    }

    /// Send `event` and wait for the relay's `OK` as `ack` says.
    ///
    /// The frame is always sent, even when `ack` carries a signal that has
    /// already fired; only the wait is cut short. An [`Ack::Timeout`] counts
    /// from the call, so time spent dialing or sending is included.
    pub async fn event(
        &self,
        event: &Event,
        ack: impl Into<Ack>,
    ) -> Result<Option<PublishConfirmation>> {
        let ack = ack.into();
        let started = Instant::now();
        let frames = match ack {
            Ack::Skip => None,
            _ => Some(self.transport.frames()),
        };

        self.transport
            .send(&ClientMessage::Event(event).to_value()?)
            .await?;

        let Some(frames) = frames else {
            return Ok(None);
        };
        let wait = wait_for_ok(frames, event.id.clone(), self.url().to_string());
        let confirmation = match ack {
            Ack::Skip => return Ok(None),
            Ack::Wait => wait.await?,
            Ack::Timeout(duration) => timeout_at(started + duration, wait)
                .await
                .map_err(|_| ClientError::AckTimeout(duration))??,
            Ack::Until(signal) => abortable(Some(&signal), wait).await?,
        };

        if !confirmation.accepted {
            debug!(
                "relay {} rejected event {}: {}",
                confirmation.relay_url, confirmation.event_id, confirmation.message
            );
        }
        Ok(Some(confirmation))
    }

    /// Open a subscription. Nothing is sent until
    /// [`Subscription::set_filters`] is called.
    pub async fn req(&self, subscription_id: Option<String>) -> Result<Subscription> {
        let id = {
            let mut open = self
                .open_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let id = match subscription_id {
                Some(id) if open.contains(&id) => {
                    return Err(ClientError::Subscription(format!(
                        "subscription id {} is already open",
                        id
                    )));
                }
                Some(id) => id,
                None => self.fresh_id(&open)?,
            };
            open.insert(id.clone());
            id
        };

        let handle = SubscriptionHandle::new(
            id,
            Arc::clone(&self.transport),
            Arc::clone(&self.open_subscriptions),
        );
        Ok(Subscription::new(handle, self.transport.frames()))
    }

    fn fresh_id(&self, open: &HashSet<String>) -> Result<String> {
        (0..MAX_ID_ATTEMPTS)
            .map(|_| self.ids.next_id())
            .find(|candidate| !open.contains(candidate))
            .ok_or_else(|| {
                ClientError::Subscription("could not generate an unused subscription id".to_string())
            })
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

fn frame_kind(frame: &[Value]) -> Option<&str> {
    frame.first().and_then(Value::as_str)
}

async fn wait_for_ok(
    mut frames: FrameStream,
    event_id: String,
    relay_url: String,
) -> Result<PublishConfirmation> {
    while let Some(frame) = frames.next().await {
        if frame_kind(&frame) != Some("OK") {
            continue;
        }
        if let Some(RelayMessage::Ok(id, accepted, message)) = RelayMessage::from_frame(&frame)
            && id == event_id
        {
            return Ok(PublishConfirmation {
                relay_url,
                event_id: id,
                accepted,
                message,
            });
        }
    }
    Err(ClientError::Connection(format!(
        "connection to {} closed before acknowledgment",
        relay_url
    )))
}

#[async_trait]
impl Relay for RelayConnection {
    type Subscription = Subscription;

    fn notices(&self) -> BoxStream<'static, String> {
        RelayConnection::notices(self)
    }

    async fn event(&self, event: &Event, ack: Ack) -> Result<Option<PublishConfirmation>> {
        RelayConnection::event(self, event, ack).await
    }

    async fn req(&self, subscription_id: Option<String>) -> Result<Subscription> {
        RelayConnection::req(self, subscription_id).await
    }

    async fn close(&self) {
        RelayConnection::close(self).await;
    }
}

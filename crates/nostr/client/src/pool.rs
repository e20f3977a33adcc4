//! Relay pool for multi-relay fanout.
//!
//! The pool holds a set of relay URLs. Subscriptions run on cached
//! connections, one per URL, dialed on first use and evicted when their
//! notice stream ends. Publishing dials a fresh connection per URL and
//! settles with the first relay to finish.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared, join_all, select_all};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use nostr::{Event, Filter, RelayUsage, Signer};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::abort::{AbortController, AbortSignal};
use crate::error::{ClientError, Result};
use crate::relay::{Ack, PublishConfirmation, Relay, RelayConfig, RelayConnection, RelaySubscription};
use crate::subscription::{
    RandomSubscriptionId, SubscriptionHandle, SubscriptionIdGenerator, SubscriptionItem,
};
use crate::transport::{Observers, validate_relay_url};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
        }
    }
}

/// Opens relay connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, signal: Option<&AbortSignal>) -> Result<RelayConnection>;
}

/// Dials eager WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: RelayConfig,
}

impl WebSocketConnector {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, signal: Option<&AbortSignal>) -> Result<RelayConnection> {
        RelayConnection::connect_with_config(url, &self.config, signal).await
    }
}

type SharedConnect =
    Shared<BoxFuture<'static, std::result::Result<Arc<RelayConnection>, Arc<ClientError>>>>;

struct CacheEntry {
    generation: u64,
    connect: SharedConnect,
}

/// One connection per URL, shared by every pool subscription.
///
/// An entry is the in-flight (or finished) dial, so concurrent callers
/// share a single connection attempt.
struct ConnectionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_generation: AtomicU64,
    notices: Arc<Observers<String>>,
}

impl ConnectionCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            notices: Arc::new(Observers::new()),
        }
    }

    async fn get_or_connect(
        self: &Arc<Self>,
        url: &str,
        connector: &Arc<dyn Connector>,
    ) -> SharedConnect {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(url) {
            return entry.connect.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let dial_connector = Arc::clone(connector);
        let dial_url = url.to_string();
        let connect = async move {
            dial_connector
                .connect(&dial_url, None)
                .await
                .map(Arc::new)
                .map_err(Arc::new)
        }
        .boxed()
        .shared();

        entries.insert(
            url.to_string(),
            CacheEntry {
                generation,
                connect: connect.clone(),
            },
        );
        drop(entries);

        tokio::spawn(watch_connection(
            Arc::downgrade(self),
            url.to_string(),
            generation,
            connect.clone(),
            Arc::clone(&self.notices),
        ));
        connect
    }

    async fn evict(&self, url: &str, generation: u64) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(url)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(url);
            debug!("evicted cached connection to {}", url);
        }
    }

    async fn drain(&self) -> Vec<SharedConnect> {
        self.entries
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry.connect)
            .collect()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Forward a cached connection's notices into the pool and evict the entry
/// once the connection fails or its notice stream ends.
async fn watch_connection(
    cache: Weak<ConnectionCache>,
    url: String,
    generation: u64,
    connect: SharedConnect,
    pool_notices: Arc<Observers<String>>,
) {
    match connect.await {
        Ok(relay) => {
            let mut notices = relay.notices();
            drop(relay);
            while let Some(notice) = notices.next().await {
                pool_notices.publish(&notice);
            }
            debug!("connection to {} ended", url);
        }
        Err(error) => debug!("connecting to {} failed: {}", url, error),
    }

    if let Some(cache) = cache.upgrade() {
        cache.evict(&url, generation).await;
    }
}

/// Multi-relay pool.
pub struct RelayPool {
    urls: RwLock<BTreeSet<String>>,
    cache: Arc<ConnectionCache>,
    connector: Arc<dyn Connector>,
    ids: Arc<dyn SubscriptionIdGenerator>,
    config: PoolConfig,
}

impl RelayPool {
    /// Create new relay pool dialing WebSocket connections.
    pub fn new(config: PoolConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.relay_config.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            urls: RwLock::new(BTreeSet::new()),
            cache: Arc::new(ConnectionCache::new()),
            connector,
            ids: Arc::new(RandomSubscriptionId),
            config,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn SubscriptionIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Add relay URL to pool. Returns `false` if it was already present.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        validate_relay_url(url)?;
        let url = url.trim();
        let mut urls = self.urls.write().await;
        if urls.contains(url) {
            return Ok(false);
        }
        if urls.len() >= self.config.max_relays {
            return Err(ClientError::InvalidRequest(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        urls.insert(url.to_string());
        Ok(true)
    }

    /// Remove relay URL from pool. Open subscriptions keep their connections.
    pub async fn remove_relay(&self, url: &str) -> bool {
        self.urls.write().await.remove(url.trim())
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.urls.read().await.iter().cloned().collect()
    }

    /// Add the signer's relays allowed for `usage`. Returns how many were new.
    pub async fn add_signer_relays(&self, signer: &dyn Signer, usage: RelayUsage) -> Result<usize> {
        let relays = signer.relays().await?;
        let mut added = 0;
        for (url, policy) in relays {
            if !policy.allows(usage) {
                continue;
            }
            match self.add_relay(&url).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(error) => warn!("skipping signer relay {}: {}", url, error),
            }
        }
        Ok(added)
    }

    /// Number of cached subscription connections.
    pub async fn connection_count(&self) -> usize {
        self.cache.len().await
    }

    /// Multicast stream of `NOTICE` texts from every cached connection.
    pub fn notices(&self) -> BoxStream<'static, String> {
        self.cache.notices.subscribe()
    }

    /// Publish `event` to every relay and settle with the first to finish.
    ///
    /// Each relay gets its own fresh connection. Once one attempt settles,
    /// the others are cancelled (for acknowledged modes) and their
    /// connections closed.
    pub async fn event(
        &self,
        event: &Event,
        ack: impl Into<Ack>,
    ) -> Result<Option<PublishConfirmation>> {
        let ack = ack.into();
        let urls = self.relay_urls().await;
        if urls.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let controller = match &ack {
            Ack::Until(signal) => {
                signal.check()?;
                AbortController::child_of(signal)
            }
            _ => AbortController::new(),
        };
        let deadline = match &ack {
            Ack::Timeout(duration) => Some(*duration),
            _ => None,
        };
        let (relay_ack, signal) = match ack {
            Ack::Skip => (Ack::Skip, None),
            _ => (Ack::Until(controller.signal()), Some(controller.signal())),
        };

        let attempts = urls.into_iter().map(|url| {
            let connector = Arc::clone(&self.connector);
            let event = event.clone();
            let ack = relay_ack.clone();
            let signal = signal.clone();
            tokio::spawn(async move {
                let relay = connector.connect(&url, signal.as_ref()).await?;
                let result = relay.event(&event, ack).await;
                relay.close().await;
                result
            })
        });

        let race = async {
            let (settled, _, _) = select_all(attempts).await;
            settled.unwrap_or_else(|error| {
                Err(ClientError::Internal(format!("publish task failed: {}", error)))
            })
        };
        let result = match deadline {
            Some(duration) => match timeout(duration, race).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::AckTimeout(duration)),
            },
            None => race.await,
        };

        controller.abort("publish settled");
        result
    }

    /// Open one subscription id on every relay and merge their items.
    ///
    /// Relays that fail to connect are left out; the merged stream never
    /// fails because of one of them.
    pub async fn req(&self, subscription_id: Option<String>) -> Result<PoolSubscription> {
        let id = subscription_id.unwrap_or_else(|| self.ids.next_id());
        let urls = self.relay_urls().await;

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let mut members = Vec::with_capacity(urls.len());
        for url in urls {
            let connect = self.cache.get_or_connect(&url, &self.connector).await;
            let (handle_tx, handle_rx) = oneshot::channel();
            tokio::spawn(forward_subscription(
                url,
                connect,
                id.clone(),
                handle_tx,
                items_tx.clone(),
            ));
            members.push(handle_rx.shared());
        }

        Ok(PoolSubscription {
            id,
            members,
            items: UnboundedReceiverStream::new(items_rx),
        })
    }

    /// Close every cached connection.
    pub async fn close(&self) {
        let connections = self.cache.drain().await;
        join_all(connections.into_iter().map(|connect| async move {
            if let Ok(relay) = connect.await {
                relay.close().await;
            }
        }))
        .await;
    }
}

async fn forward_subscription(
    url: String,
    connect: SharedConnect,
    subscription_id: String,
    handle_tx: oneshot::Sender<SubscriptionHandle>,
    items: mpsc::UnboundedSender<SubscriptionItem>,
) {
    let relay = match connect.await {
        Ok(relay) => relay,
        Err(error) => {
            debug!("relay {} left out of {}: {}", url, subscription_id, error);
            return;
        }
    };
    let mut subscription = match relay.req(Some(subscription_id.clone())).await {
        Ok(subscription) => subscription,
        Err(error) => {
            debug!("relay {} left out of {}: {}", url, subscription_id, error);
            return;
        }
    };
    drop(relay);

    if handle_tx.send(subscription.handle()).is_err() {
        return;
    }
    loop {
        tokio::select! {
            () = items.closed() => {
                debug!("pool subscription {} dropped, leaving {}", subscription_id, url);
                break;
            }
            item = subscription.next() => match item {
                Some(item) => {
                    if items.send(item).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Merged subscription over every relay in a pool.
///
/// Dropping it stops the per-relay forwarding and frees the id on each
/// connection. Relays only stop sending after [`PoolSubscription::close`].
pub struct PoolSubscription {
    id: String,
    members: Vec<Shared<oneshot::Receiver<SubscriptionHandle>>>,
    items: UnboundedReceiverStream<SubscriptionItem>,
}

impl PoolSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handles of the relays that joined, waiting for pending connects.
    async fn handles(&self) -> Vec<SubscriptionHandle> {
        join_all(self.members.iter().cloned())
            .await
            .into_iter()
            .filter_map(|handle| handle.ok())
            .collect()
    }

    /// Send `REQ` to every joined relay. Reports the first failure after all sends finish.
    pub async fn set_filters(&self, filters: &[Filter]) -> Result<()> {
        let handles = self.handles().await;
        join_all(handles.iter().map(|handle| handle.set_filters(filters)))
            .await
            .into_iter()
            .collect()
    }

    /// Send `CLOSE` to every joined relay.
    pub async fn close(&self) -> Result<()> {
        let handles = self.handles().await;
        join_all(handles.iter().map(SubscriptionHandle::close))
            .await
            .into_iter()
            .collect()
    }
}

impl Stream for PoolSubscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_next_unpin(cx)
    }
}

#[async_trait]
impl RelaySubscription for PoolSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_filters(&self, filters: &[Filter]) -> Result<()> {
        PoolSubscription::set_filters(self, filters).await
    }

    async fn close(&self) -> Result<()> {
        PoolSubscription::close(self).await
    }
}

#[async_trait]
impl Relay for RelayPool {
    type Subscription = PoolSubscription;

    fn notices(&self) -> BoxStream<'static, String> {
        RelayPool::notices(self)
    }

    async fn event(&self, event: &Event, ack: Ack) -> Result<Option<PublishConfirmation>> {
        RelayPool::event(self, event, ack).await
    }

    async fn req(&self, subscription_id: Option<String>) -> Result<PoolSubscription> {
        RelayPool::req(self, subscription_id).await
    }

    async fn close(&self) {
        RelayPool::close(self).await;
    }
}

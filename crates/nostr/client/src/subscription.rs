//! Subscriptions on a single relay connection.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use nostr::{Event, Filter};
use serde_json::Value;

use crate::error::Result;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::RelaySubscription;
use crate::transport::{FrameStream, Transport};

/// Item of a subscription stream: a delivered event or the end-of-stored-events marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event(Event),
    Eose,
}

impl SubscriptionItem {
    /// Map a frame addressed to `subscription_id`; other frames yield `None`.
    pub(crate) fn from_frame(subscription_id: &str, frame: &[Value]) -> Option<Self> {
        if frame.get(1).and_then(Value::as_str) != Some(subscription_id) {
            return None;
        }
        match RelayMessage::from_frame(frame)? {
            RelayMessage::Event(_, event) => Some(Self::Event(event)),
            RelayMessage::Eose(_) => Some(Self::Eose),
            _ => None,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Eose => None,
        }
    }
}

/// Source of subscription ids for `req` calls that do not name one.
pub trait SubscriptionIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random decimal ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSubscriptionId;

impl SubscriptionIdGenerator for RandomSubscriptionId {
    fn next_id(&self) -> String {
        rand::random::<u64>().to_string()
    }
}

/// `prefix0`, `prefix1`, ... in call order.
#[derive(Debug)]
pub struct SequentialSubscriptionId {
    prefix: String,
    next: AtomicU64,
}

impl SequentialSubscriptionId {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }
}

impl SubscriptionIdGenerator for SequentialSubscriptionId {
    fn next_id(&self) -> String {
        format!("{}{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Control side of a subscription: change filters or close it.
///
/// Cheap to clone; every clone addresses the same relay-side subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    transport: Arc<dyn Transport>,
    open_subscriptions: Arc<SyncMutex<HashSet<String>>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: String,
        transport: Arc<dyn Transport>,
        open_subscriptions: Arc<SyncMutex<HashSet<String>>>,
    ) -> Self {
        Self {
            id,
            transport,
            open_subscriptions,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send `REQ` with a new filter set. Does not wait for EOSE.
    pub async fn set_filters(&self, filters: &[Filter]) -> Result<()> {
        let frame = ClientMessage::Req {
            subscription_id: &self.id,
            filters,
        }
        .to_value()?;
        self.transport.send(&frame).await
    }

    /// Send `CLOSE` and release the id. The local stream is left running;
    /// the relay may still deliver frames sent before it saw the close.
    pub async fn close(&self) -> Result<()> {
        let result = self
            .transport
            .send(&ClientMessage::Close(&self.id).to_value()?)
            .await;
        self.release();
        result
    }

    fn release(&self) {
        self.open_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A subscription on one relay: a stream of [`SubscriptionItem`]s plus its handle.
///
/// Frames are buffered from the moment the subscription is created, so
/// `set_filters` may be awaited before the stream is polled.
///
/// Dropping it frees the id for reuse on this connection but sends no
/// `CLOSE`; call [`Subscription::close`] first to stop the relay side.
pub struct Subscription {
    handle: SubscriptionHandle,
    // Never locked: only reached through `&mut self`. Keeps the type `Sync`.
    items: SyncMutex<BoxStream<'static, SubscriptionItem>>,
}

impl Subscription {
    pub(crate) fn new(handle: SubscriptionHandle, frames: FrameStream) -> Self {
        let subscription_id = handle.id.clone();
        let items = frames
            .filter_map(move |frame| ready(SubscriptionItem::from_frame(&subscription_id, &frame)))
            .boxed();
        Self {
            handle,
            items: SyncMutex::new(items),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub async fn set_filters(&self, filters: &[Filter]) -> Result<()> {
        self.handle.set_filters(filters).await
    }

    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_next_unpin(cx)
    }
}

#[async_trait]
impl RelaySubscription for Subscription {
    fn id(&self) -> &str {
        self.handle.id()
    }

    async fn set_filters(&self, filters: &[Filter]) -> Result<()> {
        self.handle.set_filters(filters).await
    }

    async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items,
            other => vec![other],
        }
    }

    fn event_json(id: &str) -> Value {
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

    #[test]
    fn from_frame_keeps_only_frames_for_this_id() {
        let event = frame(json!(["EVENT", "sub1", event_json("abc")]));
        let other = frame(json!(["EVENT", "sub2", event_json("abc")]));
        let eose = frame(json!(["EOSE", "sub1"]));
        let notice = frame(json!(["NOTICE", "sub1"]));
        let ok = frame(json!(["OK", "sub1", true, ""]));

        assert!(matches!(
            SubscriptionItem::from_frame("sub1", &event),
            Some(SubscriptionItem::Event(event)) if event.id == "abc"
        ));
        assert_eq!(SubscriptionItem::from_frame("sub1", &other), None);
        assert_eq!(
            SubscriptionItem::from_frame("sub1", &eose),
            Some(SubscriptionItem::Eose)
        );
        assert_eq!(SubscriptionItem::from_frame("sub1", &notice), None);
        assert_eq!(SubscriptionItem::from_frame("sub1", &ok), None);
    }

    #[test]
    fn from_frame_drops_malformed_events() {
        let truncated = frame(json!(["EVENT", "sub1"]));
        let bad_payload = frame(json!(["EVENT", "sub1", {"id": "abc"}]));
        assert_eq!(SubscriptionItem::from_frame("sub1", &truncated), None);
        assert_eq!(SubscriptionItem::from_frame("sub1", &bad_payload), None);
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialSubscriptionId::new("sub-");
        assert_eq!(ids.next_id(), "sub-0");
        assert_eq!(ids.next_id(), "sub-1");
    }

    #[test]
    fn random_ids_are_decimal() {
        let id = RandomSubscriptionId.next_id();
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }
}

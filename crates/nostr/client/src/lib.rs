//! Nostr relay client.
//!
//! This crate exposes a small surface:
//! - WebSocket transports, eager and auto-reconnecting
//! - the NIP-01 protocol engine for one relay: publish with acknowledgment
//!   modes, subscriptions, notices
//! - EOSE and filter stream operators
//! - a multi-relay pool with connection caching and publish races
//!
//! Cancellation throughout is expressed with [`AbortSignal`].

pub mod abort;
pub mod error;
pub mod message;
pub mod pool;
pub mod query;
pub mod relay;
pub mod stream;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use abort::{AbortController, AbortSignal, abortable};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Frame, RelayMessage};
pub use pool::{Connector, PoolConfig, PoolSubscription, RelayPool, WebSocketConnector};
pub use query::{fetch_event, publish_signed};
pub use relay::{Ack, PublishConfirmation, Relay, RelayConfig, RelayConnection, RelaySubscription};
pub use stream::{after_eose, before_eose, matching_filters};
pub use subscription::{
    RandomSubscriptionId, SequentialSubscriptionId, Subscription, SubscriptionHandle,
    SubscriptionIdGenerator, SubscriptionItem,
};
pub use transport::{
    AutoConnectTransport, ConnectionState, FrameStream, Transport, WebSocketTransport,
    validate_relay_url,
};

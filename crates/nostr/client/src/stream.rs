//! Operators that split a subscription stream around its EOSE marker.
//!
//! ```text
//! stored events ... EOSE  live events ...
//! |-- before_eose --|     |-- after_eose --|
//! ```

use futures_util::future::ready;
use futures_util::{Stream, StreamExt};
use nostr::{Event, Filter, match_filters};

use crate::subscription::SubscriptionItem;

/// Stored events only: yields events until EOSE, then completes.
///
/// The source is not polled again after EOSE.
pub fn before_eose<S>(stream: S) -> impl Stream<Item = Event>
where
    S: Stream<Item = SubscriptionItem>,
{
    stream
        .take_while(|item| ready(!matches!(item, SubscriptionItem::Eose)))
        .filter_map(|item| ready(item.into_event()))
}

/// Live events only: drops everything up to and including EOSE.
pub fn after_eose<S>(stream: S) -> impl Stream<Item = Event>
where
    S: Stream<Item = SubscriptionItem>,
{
    stream
        .skip_while(|item| ready(!matches!(item, SubscriptionItem::Eose)))
        .filter_map(|item| ready(item.into_event()))
}

/// Drops events that match none of `filters`.
pub fn matching_filters<S>(stream: S, filters: Vec<Filter>) -> impl Stream<Item = Event>
where
    S: Stream<Item = Event>,
{
    stream.filter(move |event| ready(match_filters(&filters, event)))
}

//! One-shot helpers built on [`Relay`]: fetch a stored event, publish a
//! signer-produced event.

use std::pin::pin;

use futures_util::StreamExt;
use nostr::{Event, EventTemplate, Filter, Signer};
use tracing::debug;

use crate::error::Result;
use crate::relay::{Ack, PublishConfirmation, Relay, RelaySubscription};
use crate::stream::before_eose;

/// Look up one event by id among the relay's stored events.
///
/// Resolves at EOSE; relays that never send EOSE keep this pending, so
/// callers usually wrap it in a timeout.
pub async fn fetch_event<R: Relay>(relay: &R, event_id: &str) -> Result<Option<Event>> {
    let mut subscription = relay.req(None).await?;

    let found: Result<Option<Event>> = async {
        subscription
            .set_filters(&[Filter::new().ids([event_id])])
            .await?;
        let mut stored = pin!(before_eose(&mut subscription));
        while let Some(event) = stored.next().await {
            if event.id == event_id {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
    .await;

    if let Err(error) = subscription.close().await {
        debug!("closing lookup {} failed: {}", subscription.id(), error);
    }
    found
}

/// Sign `template` with `signer` and publish the result.
pub async fn publish_signed<R: Relay>(
    relay: &R,
    signer: &dyn Signer,
    template: EventTemplate,
    ack: Ack,
) -> Result<(Event, Option<PublishConfirmation>)> {
    let event = signer.sign_event(template).await?;
    let confirmation = relay.event(&event, ack).await?;
    Ok((event, confirmation))
}

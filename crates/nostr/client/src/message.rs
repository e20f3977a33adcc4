//! Relay protocol wire frames (NIP-01).
//!
//! Inbound payloads are decoded in two steps: [`decode_frame`] turns text into
//! a JSON array, then [`RelayMessage::parse`] dispatches on the leading tag.
//! Anything that fails either step is dropped by the caller.

use nostr::{Event, Filter};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ClientError, Result};

/// A decoded inbound frame: the JSON array sent by the relay.
pub type Frame = Vec<Value>;

/// Decode a text payload. Returns `None` for invalid JSON and for JSON that
/// is not an array.
pub fn decode_frame(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => Some(items),
        Ok(_) => None,
        Err(_) => None,
    }
}

/// Message sent from client to relay.
#[derive(Debug, Clone, Copy)]
pub enum ClientMessage<'a> {
    /// `["EVENT", event]`
    Event(&'a Event),
    /// `["REQ", subscription_id, filter...]`
    Req {
        subscription_id: &'a str,
        filters: &'a [Filter],
    },
    /// `["CLOSE", subscription_id]`
    Close(&'a str),
}

impl ClientMessage<'_> {
    pub fn to_value(&self) -> Result<Value> {
        match self {
            Self::Event(event) => Ok(json!(["EVENT", event])),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                for filter in *filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Ok(Value::Array(frame))
            }
            Self::Close(subscription_id) => Ok(json!(["CLOSE", subscription_id])),
        }
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event(String, Event),
    /// `["OK", event_id, accepted, message]`
    Ok(String, bool, String),
    /// `["EOSE", subscription_id]`
    Eose(String),
    /// `["NOTICE", message]`
    Notice(String),
    /// `["AUTH", challenge]`
    Auth(String),
}

impl RelayMessage {
    /// Parse a decoded frame. Unknown tags and empty frames yield `Ok(None)`.
    pub fn parse(frame: &[Value]) -> Result<Option<Self>> {
        let Some(first) = frame.first() else {
            return Ok(None);
        };
        let kind = first
            .as_str()
            .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

        match kind {
            "EVENT" => {
                if frame.len() < 3 {
                    return Err(ClientError::Protocol("invalid EVENT message".to_string()));
                }
                let subscription_id = string_field(frame, 1, "invalid EVENT subscription id")?;
                let event: Event = serde_json::from_value(frame[2].clone()).map_err(|error| {
                    ClientError::Protocol(format!("invalid EVENT payload: {}", error))
                })?;
                Ok(Some(Self::Event(subscription_id, event)))
            }
            "OK" => {
                if frame.len() < 3 {
                    return Err(ClientError::Protocol("invalid OK message".to_string()));
                }
                let event_id = string_field(frame, 1, "invalid OK event id")?;
                let accepted = frame[2]
                    .as_bool()
                    .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
                // Older relays omit the reason entirely.
                let message = match frame.get(3) {
                    None => String::new(),
                    Some(_) => string_field(frame, 3, "invalid OK message text")?,
                };
                Ok(Some(Self::Ok(event_id, accepted, message)))
            }
            "EOSE" => {
                if frame.len() < 2 {
                    return Err(ClientError::Protocol("invalid EOSE message".to_string()));
                }
                let subscription_id = string_field(frame, 1, "invalid EOSE subscription id")?;
                Ok(Some(Self::Eose(subscription_id)))
            }
            "NOTICE" => {
                if frame.len() < 2 {
                    return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
                }
                let message = string_field(frame, 1, "invalid NOTICE message text")?;
                Ok(Some(Self::Notice(message)))
            }
            "AUTH" => {
                if frame.len() < 2 {
                    return Err(ClientError::Protocol("invalid AUTH message".to_string()));
                }
                let challenge = string_field(frame, 1, "invalid AUTH challenge")?;
                Ok(Some(Self::Auth(challenge)))
            }
            _ => Ok(None),
        }
    }

    /// Like [`RelayMessage::parse`], but malformed frames are logged and dropped.
    pub fn from_frame(frame: &[Value]) -> Option<Self> {
        match Self::parse(frame) {
            Ok(message) => message,
            Err(error) => {
                debug!("dropping malformed relay frame: {}", error);
                None
            }
        }
    }
}

fn string_field(frame: &[Value], index: usize, error: &str) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(error.to_string()))
}

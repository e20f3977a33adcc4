//! NIP-01: Basic protocol flow description.
//!
//! Event structures exchanged with relays. Signing and verification live with
//! the `Signer` collaborator; this module only carries the data.

use serde::{Deserialize, Serialize};

use crate::tag_parsing::tag_values;

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name` (second tag element).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        tag_values(&self.tags, name)
    }
}

/// A template for creating events (without pubkey, which comes from the signing key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_deserializes_from_wire_shape() -> Result<(), serde_json::Error> {
        let event: Event = serde_json::from_value(json!({
            "id": "abc",
            "pubkey": "pk",
            "created_at": 1_700_000_000,
            "kind": 1,
            "tags": [["e", "parent"], ["p", "someone"], ["e", "root", "wss://relay"]],
            "content": "hello",
            "sig": "sig"
        }))?;

        assert_eq!(event.id, "abc");
        assert_eq!(event.kind, 1);
        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["parent", "root"]);
        assert_eq!(event.tag_values("t").count(), 0);
        Ok(())
    }

    #[test]
    fn event_missing_fields_is_rejected() {
        let result = serde_json::from_value::<Event>(json!({"id": "abc"}));
        assert!(result.is_err());
    }
}

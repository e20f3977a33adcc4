//! Signer capability (NIP-07 style) provided by the embedding application.
//!
//! Keys never reach the relay client; it only asks the signer for a public
//! key, its relay list, or a signature over an event template.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::{Event, EventTemplate};

/// Errors reported by a signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable")]
    Unavailable,

    #[error("signer rejected request: {0}")]
    Rejected(String),

    #[error("signer error: {0}")]
    Other(String),
}

/// Read/write markers for a relay advertised by a signer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPolicy {
    pub read: bool,
    pub write: bool,
}

/// Which side of a [`RelayPolicy`] a caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayUsage {
    Read,
    Write,
}

impl RelayPolicy {
    pub fn allows(&self, usage: RelayUsage) -> bool {
        match usage {
            RelayUsage::Read => self.read,
            RelayUsage::Write => self.write,
        }
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the signing identity.
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Relay URLs the identity reads from and writes to.
    async fn relays(&self) -> Result<BTreeMap<String, RelayPolicy>, SignerError>;

    /// Sign a template, returning the finished event.
    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError>;
}

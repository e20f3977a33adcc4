mod filter;
pub mod nip01;
mod signer;
mod tag_parsing;

pub use filter::{Filter, match_filters};
pub use nip01::{Event, EventTemplate};
pub use signer::{RelayPolicy, RelayUsage, Signer, SignerError};

//! cairn-core — endpoint identifiers, the bundle model, wire codec, and config.
//! All other cairn crates depend on this one.

pub mod bundle;
pub mod config;
pub mod eid;
pub mod wire;

pub use bundle::{Bundle, BundleId, CanonicalBlock, CreationTimestamp, PrimaryBlock};
pub use eid::EndpointId;

//! Core data model definitions shared across Tether crates.

pub mod fingerprint;
pub mod ids;
pub mod metadata;
pub mod spec;

pub use fingerprint::Fingerprint;
pub use ids::{ContextId, StreamId};
pub use metadata::FileMetadata;
pub use spec::{ConnectionSpec, Stack};

//! Multiplexer-side service core.
//!
//! A controller process forks one or more multiplexer processes; worker
//! processes consult the services in this crate to obtain handles to remote
//! contexts reachable via a chain of transports (SSH, sudo, SSH-within-SSH),
//! and to stream files of arbitrary size to those contexts over the same
//! transports.
//!
//! Two cooperating services share one multiplexer process:
//!
//! - [`ContextService`] — a deduplicating, reference-counted, bounded-LRU
//!   cache of live remote connections with single-flight establishment and
//!   disconnect-driven invalidation.
//! - [`FileService`] — a registration-gated streaming file server that shares
//!   physical streams fairly, bounds per-stream in-flight bytes, and shuts
//!   down without orphaning remote readers.

pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod router;

pub use config::{ContextConfig, TransferConfig};
pub use context::{ContextResponse, ContextService};
pub use error::{Error, Result};
pub use file::FileService;

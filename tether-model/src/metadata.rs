//! File metadata captured at registration time.

use serde::{Deserialize, Serialize};

/// Stat-derived description of a registered file, captured once when the
/// path is registered and returned verbatim to every fetch.
///
/// The receiving end compares `size` against the byte count it actually
/// observed to detect truncated transfers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes.
    pub size: u64,
    /// Unix permission and file type bits.
    pub mode: u32,
    /// Owning account name, when the uid resolves to one.
    pub owner: Option<String>,
    /// Owning group name, when the gid resolves to one.
    pub group: Option<String>,
    /// Modification time as fractional seconds since the epoch.
    pub mtime: f64,
    /// Access time as fractional seconds since the epoch.
    pub atime: f64,
}

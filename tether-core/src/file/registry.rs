use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tether_model::FileMetadata;
use tracing::debug;

use crate::error::{Error, Result};

/// Path → metadata table gating which files may be served.
///
/// Paths must be explicitly registered by a trusted context before they are
/// served to anyone else. Registration is idempotent and keeps the metadata
/// captured by the first call.
#[derive(Debug, Default)]
pub struct FileRegistry {
    metadata_by_path: DashMap<PathBuf, FileMetadata>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize a path for fetching. Calling this repeatedly with the same
    /// path is harmless.
    pub async fn register(&self, path: &Path) -> Result<()> {
        if self.metadata_by_path.contains_key(path) {
            return Ok(());
        }

        let stat = tokio::fs::metadata(path).await?;
        if !stat.is_file() {
            return Err(Error::NotRegularFile(path.to_owned()));
        }

        debug!(path = %path.display(), "registering");
        self.metadata_by_path
            .insert(path.to_owned(), metadata_from_stat(&stat));
        Ok(())
    }

    /// Metadata for a registered path.
    pub fn lookup(&self, path: &Path) -> Option<FileMetadata> {
        self.metadata_by_path
            .get(path)
            .map(|entry| entry.value().clone())
    }

    /// Number of registered paths.
    pub fn registered_count(&self) -> usize {
        self.metadata_by_path.len()
    }
}

fn metadata_from_stat(stat: &std::fs::Metadata) -> FileMetadata {
    use std::os::unix::fs::MetadataExt;

    FileMetadata {
        size: stat.len(),
        mode: stat.mode(),
        owner: user_name(stat.uid()),
        group: group_name(stat.gid()),
        mtime: stat.mtime() as f64 + stat.mtime_nsec() as f64 * 1e-9,
        atime: stat.atime() as f64 + stat.atime_nsec() as f64 * 1e-9,
    }
}

/// Account name for a uid; lookup failures degrade to `None`.
fn user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// Group name for a gid; lookup failures degrade to `None`.
fn group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

//! Tuning knobs for the two services.
//!
//! All fields carry defaults so deployments can adopt individual settings
//! without supplying a full configuration payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the context cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Upper bound on cached child interpreters per via-chain parent. When a
    /// parent's list is full and an idle entry exists, the newest idle entry
    /// is recycled to make room.
    pub max_interpreters: usize,
    /// Ask each newly established context to dump its thread stacks to its
    /// logger, for debugging hung establishments.
    pub dump_thread_stacks: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_interpreters: 20,
            dump_thread_stacks: false,
        }
    }
}

impl ContextConfig {
    /// Environment override for `max_interpreters`.
    pub const MAX_INTERPRETERS_ENV: &'static str = "TETHER_MAX_INTERPRETERS";
    /// Any non-empty value enables `dump_thread_stacks`.
    pub const DUMP_THREAD_STACKS_ENV: &'static str = "TETHER_DUMP_THREAD_STACKS";

    /// Build from the environment, falling back to defaults for unset or
    /// unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_interpreters = std::env::var(Self::MAX_INTERPRETERS_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.max_interpreters);
        let dump_thread_stacks = std::env::var(Self::DUMP_THREAD_STACKS_ENV)
            .map(|raw| !raw.is_empty())
            .unwrap_or(defaults.dump_thread_stacks);
        Self {
            max_interpreters,
            dump_thread_stacks,
        }
    }
}

/// Knobs for the file transfer scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes read from the source file per pump iteration.
    pub chunk_size: usize,
    /// Maximum bytes a stream may have queued before pumping pauses for it.
    /// The queue may overspill by up to `chunk_size - 1` bytes.
    pub max_queue_bytes: usize,
    /// Scheduler wake cadence while transfers are active, in milliseconds.
    /// With the default 1 MiB queue bound and a 10 ms tick, the per-stream
    /// throughput ceiling is roughly 100 MiB/s.
    pub tick_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128 * 1024,
            max_queue_bytes: 1024 * 1024,
            tick_ms: 10,
        }
    }
}

impl TransferConfig {
    /// Scheduler wake cadence as a [`Duration`].
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

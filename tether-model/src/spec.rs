//! Connection descriptions submitted by workers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single transport hop: the router method to invoke and its options.
///
/// `kwargs` values may be scalars, sequences, or nested mappings; the spec is
/// immutable once submitted and is only ever inspected for routing and
/// fingerprinting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Transport name, e.g. `ssh`, `sudo`, `local`.
    pub method: String,
    /// Options passed through to the transport method.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl ConnectionSpec {
    /// Convenience constructor for a hop with no options.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kwargs: Map::new(),
        }
    }

    /// Convenience constructor from an options iterator.
    pub fn with_kwargs<K, V, I>(method: impl Into<String>, kwargs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            method: method.into(),
            kwargs: kwargs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Ordered transport hops. Element `k` is established through the context
/// produced by element `k - 1`; element 0 connects directly from the
/// multiplexer.
pub type Stack = Vec<ConnectionSpec>;

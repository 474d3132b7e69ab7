//! Canonical deduplication keys for connection requests.

use std::fmt;
use std::fmt::Write;

use serde_json::Value;

use crate::ids::ContextId;
use crate::spec::ConnectionSpec;

/// Canonical key over a `(via, spec)` pair.
///
/// Two requests produce equal fingerprints exactly when they describe the
/// same connection: mapping entries are folded in sorted key order, sequence
/// order is preserved, and every node carries a type tag and delimiter so
/// differently shaped values can never collide. Strings are length-prefixed
/// for the same reason.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for establishing `spec` through `via`
    /// (`None` meaning a direct connection from the multiplexer).
    pub fn of(via: Option<ContextId>, spec: &ConnectionSpec) -> Self {
        let mut out = String::new();
        match via {
            Some(id) => {
                let _ = write!(out, "via={};", id.0);
            }
            None => out.push_str("via=direct;"),
        }
        let _ = write!(out, "method={};kwargs=", spec.method);
        encode_value(&Value::Object(spec.kwargs.clone()), &mut out);
        Fingerprint(out)
    }

    /// The canonical textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fingerprint").field(&self.0).finish()
    }
}

fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push('~'),
        Value::Bool(b) => {
            let _ = write!(out, "b:{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "n:{n}");
        }
        Value::String(s) => {
            let _ = write!(out, "s:{}:{}", s.len(), s);
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                encode_value(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Mapping iteration order is never trusted; sort explicitly.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for key in keys {
                let _ = write!(out, "s:{}:{}=", key.len(), key);
                encode_value(&map[key.as_str()], out);
                out.push(',');
            }
            out.push('}');
        }
    }
}

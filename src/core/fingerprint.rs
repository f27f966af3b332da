//! Request fingerprints: deterministic cache and single-flight keys.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic key derived from an operation identity and its normalized
/// parameters. Two requests with the same operation and semantically equal
/// parameters (object key order does not matter) share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Compute the fingerprint of `operation` applied to `params`.
    #[must_use]
    pub fn compute(operation: &str, params: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize(params).to_string().as_bytes());
        let digest = hasher.finalize();
        Self(format!("{operation}:{digest:x}").into())
    }

    /// Wrap an already computed key, e.g. one carried in an outbox event.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// Operation prefix of the key.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.0.rsplit_once(':').map_or(&self.0, |(op, _)| op)
    }

    /// Key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a parameter document: object keys sorted, nulls in
/// objects dropped so an absent field and an explicit null match.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

//! Correlation keys

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Value used for the synthetic key of records that carry no identifier
pub const UNKEYED_VALUE: &str = "unkeyed";

/// Type of a correlation identifier
///
/// Declaration order is the priority rank: explicit trace identifiers first,
/// then business identifiers, then the synthetic unkeyed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    TraceId,
    SpanId,
    ResourceId,
    CircuitId,
    ProductId,
    Unkeyed,
}

impl KeyKind {
    /// Priority rank (0 = highest)
    pub fn rank(self) -> u8 {
        match self {
            KeyKind::TraceId => 0,
            KeyKind::SpanId => 1,
            KeyKind::ResourceId => 2,
            KeyKind::CircuitId => 3,
            KeyKind::ProductId => 4,
            KeyKind::Unkeyed => 5,
        }
    }

    /// Explicit trace/span identifiers, as opposed to business identifiers
    pub fn is_explicit(self) -> bool {
        matches!(self, KeyKind::TraceId | KeyKind::SpanId)
    }

    /// Business identifiers (resource, circuit, product)
    pub fn is_business(self) -> bool {
        matches!(
            self,
            KeyKind::ResourceId | KeyKind::CircuitId | KeyKind::ProductId
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::TraceId => "trace_id",
            KeyKind::SpanId => "span_id",
            KeyKind::ResourceId => "resource_id",
            KeyKind::CircuitId => "circuit_id",
            KeyKind::ProductId => "product_id",
            KeyKind::Unkeyed => "unkeyed",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace_id" => Ok(KeyKind::TraceId),
            "span_id" => Ok(KeyKind::SpanId),
            "resource_id" => Ok(KeyKind::ResourceId),
            "circuit_id" => Ok(KeyKind::CircuitId),
            "product_id" => Ok(KeyKind::ProductId),
            "unkeyed" => Ok(KeyKind::Unkeyed),
            other => Err(format!("unknown key kind: {}", other)),
        }
    }
}

/// A typed correlation identifier
///
/// Ordering follows [`KeyKind`] rank first, so the minimum of an event's keys
/// is its highest-priority key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub kind: KeyKind,
    pub value: String,
}

impl CorrelationKey {
    pub fn new(kind: KeyKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn trace(value: impl Into<String>) -> Self {
        Self::new(KeyKind::TraceId, value)
    }

    pub fn span(value: impl Into<String>) -> Self {
        Self::new(KeyKind::SpanId, value)
    }

    /// The synthetic key given to records with no extractable identifier
    pub fn unkeyed() -> Self {
        Self::new(KeyKind::Unkeyed, UNKEYED_VALUE)
    }

    pub fn is_unkeyed(&self) -> bool {
        self.kind == KeyKind::Unkeyed
    }

    /// Stable correlation id derived from the key
    ///
    /// The same key yields the same id in every window and on every engine
    /// instance, which is what lets the state manager stitch correlations.
    pub fn correlation_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(self.value.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..32].to_string()
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order_matches_ord() {
        let mut keys = vec![
            CorrelationKey::unkeyed(),
            CorrelationKey::new(KeyKind::ProductId, "p-1"),
            CorrelationKey::trace("t-1"),
            CorrelationKey::new(KeyKind::ResourceId, "r-1"),
        ];
        keys.sort();
        assert_eq!(keys[0].kind, KeyKind::TraceId);
        assert_eq!(keys[1].kind, KeyKind::ResourceId);
        assert_eq!(keys[3].kind, KeyKind::Unkeyed);
        assert!(KeyKind::TraceId.rank() < KeyKind::SpanId.rank());
    }

    #[test]
    fn test_correlation_id_is_stable_and_typed() {
        let a = CorrelationKey::trace("trace-42");
        let b = CorrelationKey::trace("trace-42");
        let c = CorrelationKey::span("trace-42");
        assert_eq!(a.correlation_id(), b.correlation_id());
        assert_ne!(a.correlation_id(), c.correlation_id());
        assert_eq!(a.correlation_id().len(), 32);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Circuit_Id".parse::<KeyKind>().unwrap(), KeyKind::CircuitId);
        assert!("order".parse::<KeyKind>().is_err());
        assert_eq!(CorrelationKey::trace("x").to_string(), "trace_id:x");
    }
}

//! Identifier definitions.

use crate::{define_local_id, IdError};

// =============================================================================
// Local identifiers
// =============================================================================

define_local_id!(
    /// Identifies a single reconciliation pass (one `apply` or `destroy`).
    ReconcileId,
    "rec"
);

// =============================================================================
// Remote identifiers
// =============================================================================

/// Maximum accepted length of a remote cluster identifier.
pub const MAX_CLUSTER_ID_LEN: usize = 256;

/// Opaque cluster identifier issued by the remote cluster service.
///
/// The only structure we rely on is that it is non-empty, bounded, and free
/// of whitespace and control characters so it can be logged and used as a
/// storage key verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(String);

impl ClusterId {
    /// Parses and validates a remote cluster identifier.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_CLUSTER_ID_LEN {
            return Err(IdError::InvalidFormat {
                message: format!("cluster id longer than {MAX_CLUSTER_ID_LEN} bytes"),
            });
        }
        if let Some(c) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdError::InvalidFormat {
                message: format!("cluster id contains invalid character {c:?}"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the identifier as issued by the remote service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ClusterId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for ClusterId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ClusterId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

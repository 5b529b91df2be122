//! Object identity: node ids, clone ids and the `(id, clone)` pair used in paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("malformed node id: {0:?}")]
    MalformedId(String),
    #[error("malformed compound key {0:?}: expected \"<id>_<clone>\"")]
    MalformedReference(String),
}

/// Newtype wrapper for flow object ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The null id. Never assigned to a real object.
    pub const NULL: NodeId = NodeId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    /// Accepts `0x`-prefixed hex or plain decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed
            .map(NodeId)
            .map_err(|_| IdError::MalformedId(s.to_string()))
    }
}

/// Clone index of an object. Clone 0 is the canonical original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloneId(pub i32);

impl CloneId {
    pub const ORIGINAL: CloneId = CloneId(0);
    /// Requests the lowest unused non-negative clone id.
    pub const AUTO: CloneId = CloneId(-1);

    pub fn is_auto(&self) -> bool {
        self.0 < 0
    }
}

impl Default for CloneId {
    fn default() -> Self {
        Self::ORIGINAL
    }
}

impl fmt::Display for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to one clone of one object. Paths are made of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowRef {
    pub id: NodeId,
    #[serde(default)]
    pub clone: CloneId,
}

impl FlowRef {
    pub fn new(id: NodeId, clone: CloneId) -> Self {
        Self { id, clone }
    }

    /// The canonical clone of `id`.
    pub fn original(id: NodeId) -> Self {
        Self {
            id,
            clone: CloneId::ORIGINAL,
        }
    }

    /// Renders the `"<id>_<clone>"` compound key scripts use for object values.
    pub fn compound_key(&self) -> String {
        format!("{}_{}", self.id.0, self.clone.0)
    }

    /// Parses a compound key. The id half may be decimal or `0x` hex.
    pub fn from_compound_key(key: &str) -> Result<Self, IdError> {
        let malformed = || IdError::MalformedReference(key.to_string());
        let mut parts = key.split('_');
        let (Some(id), Some(clone), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed());
        };
        let id = id.parse::<NodeId>().map_err(|_| malformed())?;
        let clone = clone.trim().parse::<i32>().map_err(|_| malformed())?;
        Ok(Self::new(id, CloneId(clone)))
    }
}

impl fmt::Display for FlowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clone == CloneId::ORIGINAL {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}#{}", self.id, self.clone)
        }
    }
}

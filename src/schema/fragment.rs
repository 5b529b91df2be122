//! Stable ids for script fragments, derived from their source text.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies a condition or instruction fragment.
///
/// Two fragments whose source differs only in whitespace share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub u64);

impl FragmentId {
    pub fn from_source(source: &str) -> Self {
        let mut hasher = FxHasher::default();
        for token in source.split_whitespace() {
            token.hash(&mut hasher);
        }
        FragmentId(hasher.finish())
    }

    /// The id of the empty fragment: always-true condition, no-op instruction.
    pub fn empty() -> Self {
        Self::from_source("")
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

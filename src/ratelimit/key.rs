//! Counter key generation.

use std::fmt;

use super::identifier::Identifier;

/// Scope of every counter kept for one quota class and one caller.
///
/// Each strategy derives its storage key from this scope, so counters of
/// different classes or identifiers never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    scope: String,
}

impl CounterKey {
    /// Create a key scope for `quota_class` and `identifier`.
    pub fn new(quota_class: &str, identifier: &Identifier) -> Self {
        Self {
            scope: format!("{}:{}", quota_class, identifier),
        }
    }

    /// Fixed-window counter for the window starting at `window_start`.
    pub fn fixed_window(&self, window_start: u64) -> String {
        format!("{}:{}", self.scope, window_start)
    }

    /// Sliding-window timestamp list.
    pub fn timestamps(&self) -> String {
        format!("{}:timestamps", self.scope)
    }

    /// Token-bucket state.
    pub fn bucket(&self) -> String {
        format!("{}:bucket", self.scope)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope)
    }
}

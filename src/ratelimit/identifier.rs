//! Caller identifiers.

use std::fmt;

/// The caller a quota is counted against.
///
/// Rendered as `user:<uid>` or `ip:<address>`; the prefix keeps a user id
/// from ever colliding with an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// An authenticated user
    User(String),
    /// A network address, or `unknown` when none could be determined
    Ip(String),
}

impl Identifier {
    /// Identifier for an authenticated user id.
    pub fn user(uid: impl Into<String>) -> Self {
        Identifier::User(uid.into())
    }

    /// Identifier for a client address.
    pub fn ip(addr: impl Into<String>) -> Self {
        Identifier::Ip(addr.into())
    }

    /// Identifier used when neither a user nor an address is known.
    pub fn unknown() -> Self {
        Identifier::Ip("unknown".to_string())
    }

    /// Parse the rendered `user:` / `ip:` form.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(uid) = s.strip_prefix("user:") {
            return (!uid.is_empty()).then(|| Identifier::user(uid));
        }
        if let Some(addr) = s.strip_prefix("ip:") {
            return (!addr.is_empty()).then(|| Identifier::ip(addr));
        }
        None
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::User(uid) => write!(f, "user:{}", uid),
            Identifier::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

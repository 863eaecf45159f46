//! Perspective identity.
//!
//! Identity format: `scheme:payload`
//!
//! Schemes in use:
//! - `anonymous:` - No authentication took place
//! - `user:name` - Authenticated through a realm login

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The identity a connection, or a single export, acts on behalf of.
///
/// Objects use it to decide what state to reveal, and viewpoints are keyed by
/// it so two users reaching the same object get distinct references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    scheme: String,
    payload: String,
}

impl Identity {
    /// Create a new identity.
    pub fn new(scheme: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            payload: payload.into(),
        }
    }

    /// The identity of an unauthenticated peer.
    pub fn anonymous() -> Self {
        Self::new("anonymous", "")
    }

    /// An identity vouched for by a realm login.
    pub fn user(name: impl Into<String>) -> Self {
        Self::new("user", name)
    }

    /// The scheme (e.g., "anonymous", "user").
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The payload (for `user`, the account name).
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Whether this identity came out of a successful login.
    pub fn is_authenticated(&self) -> bool {
        self.scheme == "user"
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.payload)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, payload) = s
            .split_once(':')
            .ok_or_else(|| IdentityParseError::MissingColon(s.to_string()))?;

        if scheme.is_empty() {
            return Err(IdentityParseError::EmptyScheme);
        }
        if scheme == "user" && payload.is_empty() {
            return Err(IdentityParseError::EmptyUser);
        }

        Ok(Self::new(scheme, payload))
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.to_string()
    }
}

/// Error parsing an identity string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityParseError {
    #[error("identity must contain ':' separator, got: {0}")]
    MissingColon(String),
    #[error("identity scheme cannot be empty")]
    EmptyScheme,
    #[error("user identity needs a name")]
    EmptyUser,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_user() {
        let id: Identity = "user:alice".parse().unwrap();
        assert_eq!(id.scheme(), "user");
        assert_eq!(id.payload(), "alice");
        assert!(id.is_authenticated());
    }

    #[test]
    fn anonymous_is_not_authenticated() {
        let id: Identity = "anonymous:".parse().unwrap();
        assert_eq!(id, Identity::anonymous());
        assert!(!id.is_authenticated());
    }

    #[test]
    fn reject_nameless_user() {
        assert!(matches!(
            "user:".parse::<Identity>(),
            Err(IdentityParseError::EmptyUser)
        ));
        assert!(matches!(
            "alice".parse::<Identity>(),
            Err(IdentityParseError::MissingColon(_))
        ));
    }

    #[test]
    fn serde_as_string() {
        let id = Identity::user("bob");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"user:bob\"");
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

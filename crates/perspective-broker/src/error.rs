//! Error types.

use crate::config::ConfigError;
use crate::value::ValueError;
use perspective_core::{Clid, FailureKind, WireFailure};
use std::fmt;
use std::time::Duration;

/// Error produced by a method handler on the side that owns the object.
///
/// Application handlers normally build it with [`RemoteError::new`]; the
/// broker builds the other kinds when dispatch itself fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    kind: FailureKind,
    tag: Option<String>,
    message: String,
}

impl RemoteError {
    /// An application error the caller can trap by `tag`.
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            tag: Some(tag.into()),
            message: message.into(),
        }
    }

    /// An application error without a tag.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            tag: None,
            message: message.into(),
        }
    }

    pub fn no_such_method(method: &str) -> Self {
        Self::of_kind(
            FailureKind::NoSuchMethod,
            format!("no remote method {method:?}"),
        )
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::of_kind(FailureKind::BadArguments, message)
    }

    pub fn invalid_object(clid: Clid) -> Self {
        Self::of_kind(
            FailureKind::InvalidObject,
            format!("no object exported as {clid}"),
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::of_kind(FailureKind::Protocol, message)
    }

    pub(crate) fn security(tag: &str) -> Self {
        Self {
            kind: FailureKind::Security,
            tag: Some(tag.to_string()),
            message: format!("type tag {tag:?} is not registered"),
        }
    }

    fn of_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            tag: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn into_wire(self) -> WireFailure {
        WireFailure {
            kind: self.kind,
            tag: self.tag,
            message: self.message,
        }
    }
}

impl From<ValueError> for RemoteError {
    fn from(err: ValueError) -> Self {
        RemoteError::bad_arguments(err.to_string())
    }
}

/// A failure reported by the peer for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    kind: FailureKind,
    tag: Option<String>,
    reported_tag: Option<String>,
    message: String,
}

impl RemoteFailure {
    /// `known` is whether the reported tag is registered locally.
    pub(crate) fn new(failure: WireFailure, known: bool) -> Self {
        Self {
            kind: failure.kind,
            tag: failure.tag.clone().filter(|_| known),
            reported_tag: failure.tag,
            message: failure.message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The error tag, if the peer sent one that is registered here.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The error tag exactly as the peer sent it.
    pub fn reported_tag(&self) -> Option<&str> {
        self.reported_tag.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is the registered application error `tag`.
    pub fn is(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    /// An application error whose type this side does not know.
    pub fn is_unknown(&self) -> bool {
        self.kind == FailureKind::Application && self.tag.is_none()
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tag, &self.reported_tag) {
            (Some(tag), _) => write!(f, "[{tag}] {}", self.message),
            (None, Some(raw)) => write!(f, "[unknown remote error {raw}] {}", self.message),
            (None, None) => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// Outcome of a failed call, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The reference was released or its connection is gone; nothing was sent.
    #[error("reference is dead")]
    DeadReference,
    /// The connection dropped while the call was outstanding.
    #[error("connection lost before the call was answered")]
    ConnectionLost,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// A value named a type that is not registered.
    #[error("insecure value: type tag {tag:?} is not registered")]
    Security { tag: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// An argument could not be serialized; nothing was sent.
    #[error("value cannot be sent: {0}")]
    Unserializable(String),
    #[error("remote error: {0}")]
    Remote(RemoteFailure),
}

impl CallError {
    pub fn remote(&self) -> Option<&RemoteFailure> {
        match self {
            CallError::Remote(failure) => Some(failure),
            _ => None,
        }
    }

    /// Whether this is the registered remote application error `tag`.
    pub fn is_remote(&self, tag: &str) -> bool {
        self.remote().is_some_and(|failure| failure.is(tag))
    }
}

/// Connection-level failure.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("protocol version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: u32, peer: u32 },
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

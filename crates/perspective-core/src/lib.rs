//! Wire vocabulary for the Perspective object broker.
//!
//! This crate defines what crosses the connection: the serialized value form
//! ([`Jelly`]), the protocol frames ([`Frame`]), and the identity a connection
//! acts on behalf of. It has no runtime; the broker crate drives it.

mod identity;
mod jelly;
mod message;

pub use identity::{Identity, IdentityParseError};
pub use jelly::Jelly;
pub use message::{FailureKind, Frame, Request, WireFailure};

/// Connection-local identifier of an exported object.
///
/// References and cacheables share one id space per connection.
pub type Clid = u64;

/// Identifier correlating a request with its answer.
pub type RequestId = u64;

/// Protocol dialect spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// The root object is always exported under this id.
pub const ROOT_CLID: Clid = 0;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the peer's version frame.
    Handshaking,
    /// Normal operation.
    Live,
    /// Transport lost or closed; every handle on this connection is dead.
    Closed,
}

impl ConnectionState {
    /// Whether calls can still be issued.
    pub fn is_open(self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }
}

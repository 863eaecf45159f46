//! Connection broker for the Perspective distributed object protocol.
//!
//! Two processes exchange object handles over a WebSocket and invoke methods
//! on each other's objects. Every value crossing the wire takes one of four
//! shapes:
//!
//! - [`Referenceable`] objects travel as references; the peer gets a
//!   [`RemoteReference`] whose calls come back as RPCs.
//! - [`Copyable`] objects travel as fresh snapshots, rebuilt on the peer by
//!   the [`RemoteCopy`] type registered for their tag.
//! - [`Cacheable`] objects travel as one full snapshot per connection, then
//!   push deltas through a [`CacheObserver`] to the peer's [`RemoteCache`].
//! - [`Viewable`] objects travel as references bound to the perspective that
//!   sent them, so their handlers know who is calling.
//!
//! Nothing is ever constructed from wire data unless its tag is in the
//! [`TypeRegistry`].

mod broker;
mod cache;
mod call_table;
mod codec;
mod config;
mod error;
mod flavor;
mod identity_table;
mod login;
mod reference;
mod registry;
mod transport;
mod value;

pub use broker::{Broker, BrokerStats};
pub use cache::{CacheObserver, RemoteCacheHandle};
pub use call_table::Reply;
pub use config::{BrokerConfig, BrokerOptions, ConfigError, MAX_DEPTH};
pub use error::{BrokerError, CallError, RemoteError, RemoteFailure};
pub use flavor::{
    AsAny, Cacheable, Copyable, HandlerFuture, Invocation, MethodTable, ObserverTable, Prefix,
    Referenceable, RemoteCache, RemoteCopy, Viewable,
};
pub use login::{
    LoggedIn, Portal, Realm, UNAUTHORIZED, UsernameHashedPassword, challenge, login, respond,
    unauthorized,
};
pub use reference::RemoteReference;
pub use registry::{CacheFactory, CopyFactory, RegistryError, TypeRegistry};
pub use transport::{Root, Server, SharedRoot, client, connect, listen, serve};
pub use value::{Args, FromValue, Value, ValueError};

pub use perspective_core::{Clid, ConnectionState, FailureKind, Identity, RequestId};

/// Build an [`Args`] from positional values.
///
/// ```ignore
/// root.call_remote("echo", args!["hi", 3]);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::from(vec![$($crate::Value::from($value)),+])
    };
}

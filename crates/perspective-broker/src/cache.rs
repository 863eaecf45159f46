//! Cache observers and mirrors.

use crate::broker::{Broker, Command, Target};
use crate::call_table::Reply;
use crate::error::CallError;
use crate::flavor::{AsAny, ObjectKey, RemoteCache};
use crate::value::Args;
use parking_lot::RwLock;
use perspective_core::{Clid, Identity};
use std::fmt;
use std::sync::Arc;

pub(crate) type MirrorCell = RwLock<Box<dyn RemoteCache>>;

/// Lets a [`Cacheable`](crate::Cacheable) push updates to one peer's mirror.
///
/// Handed to [`Cacheable::state_to_cache`](crate::Cacheable::state_to_cache)
/// once per connection. Observers compare equal when they address the same
/// mirror.
#[derive(Clone)]
pub struct CacheObserver {
    broker: Broker,
    key: ObjectKey,
    perspective: Option<Identity>,
}

impl CacheObserver {
    pub(crate) fn new(broker: Broker, key: ObjectKey, perspective: Option<Identity>) -> Self {
        Self {
            broker,
            key,
            perspective,
        }
    }

    /// Invoke `observe_<method>` on the peer's mirror.
    pub fn call_remote(&self, method: &str, args: impl Into<Args>) -> Reply {
        self.broker.call(
            Target::Cache(self.key.clone()),
            method,
            args.into(),
            self.perspective.clone(),
        )
    }

    /// Same as [`call_remote`](Self::call_remote) without an answer.
    pub fn notify(&self, method: &str, args: impl Into<Args>) -> Result<(), CallError> {
        self.broker.send_oneway(
            Target::Cache(self.key.clone()),
            method,
            args.into(),
            self.perspective.clone(),
        )
    }

    /// The identity the cacheable was sent under.
    pub fn perspective(&self) -> Option<&Identity> {
        self.perspective.as_ref()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }
}

impl PartialEq for CacheObserver {
    fn eq(&self, other: &Self) -> bool {
        self.broker.id() == other.broker.id() && self.key == other.key
    }
}

impl Eq for CacheObserver {}

impl fmt::Debug for CacheObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheObserver")
            .field("broker", &self.broker.id())
            .field("perspective", &self.perspective)
            .finish()
    }
}

/// Keeps a mirror referenced; the last drop tells the owner.
pub(crate) struct CacheToken {
    broker: Broker,
    luid: Clid,
    generation: u64,
    cell: Arc<MirrorCell>,
}

impl Drop for CacheToken {
    fn drop(&mut self) {
        self.broker.post(Command::ReleaseMirror {
            luid: self.luid,
            generation: self.generation,
        });
    }
}

/// A local mirror of a peer's [`Cacheable`](crate::Cacheable).
///
/// Receiving the same cacheable again on the same connection yields a handle
/// to the same mirror.
#[derive(Clone)]
pub struct RemoteCacheHandle {
    token: Arc<CacheToken>,
}

impl RemoteCacheHandle {
    pub(crate) fn new(broker: Broker, luid: Clid, generation: u64, cell: Arc<MirrorCell>) -> Self {
        Self {
            token: Arc::new(CacheToken {
                broker,
                luid,
                generation,
                cell,
            }),
        }
    }

    pub(crate) fn from_token(token: Arc<CacheToken>) -> Self {
        Self { token }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<CacheToken> {
        Arc::downgrade(&self.token)
    }

    pub(crate) fn cell(&self) -> &Arc<MirrorCell> {
        &self.token.cell
    }

    /// Id of the cacheable in the owner's export table.
    pub fn luid(&self) -> Clid {
        self.token.luid
    }

    pub fn broker(&self) -> &Broker {
        &self.token.broker
    }

    /// Read the mirror as `T`; `None` if it is some other type.
    pub fn read<T: RemoteCache, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.token.cell.read();
        <dyn RemoteCache as AsAny>::as_any(&**guard)
            .downcast_ref::<T>()
            .map(f)
    }

    /// Whether both handles share one mirror.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.token.cell, &other.token.cell)
    }
}

impl PartialEq for RemoteCacheHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for RemoteCacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<cache {} on broker {}>", self.token.luid, self.token.broker.id())
    }
}

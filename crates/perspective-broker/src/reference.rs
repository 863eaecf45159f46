//! Proxies for objects owned by the peer.

use crate::broker::{Broker, Command, Target};
use crate::call_table::Reply;
use crate::error::CallError;
use crate::value::Args;
use perspective_core::{Clid, ROOT_CLID};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared state behind every clone of one proxy.
pub(crate) struct ImportHandle {
    broker: Broker,
    clid: Clid,
    interfaces: Vec<String>,
    generation: u64,
    /// The root is not reference counted.
    counted: bool,
    released: AtomicBool,
}

impl ImportHandle {
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) && self.counted {
            self.broker.post(Command::ReleaseImport {
                clid: self.clid,
                generation: self.generation,
            });
        }
    }
}

impl Drop for ImportHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A handle to an object living on the other side of a connection.
///
/// Clones share one proxy. Receiving the same object again yields a handle
/// to the same proxy. When the last clone is dropped (or
/// [`release`](Self::release) is called) the owner is told it may forget
/// the object.
#[derive(Clone)]
pub struct RemoteReference {
    handle: Arc<ImportHandle>,
}

impl RemoteReference {
    pub(crate) fn root(broker: Broker) -> Self {
        Self::new(broker, ROOT_CLID, Vec::new(), 0, false)
    }

    pub(crate) fn imported(
        broker: Broker,
        clid: Clid,
        interfaces: Vec<String>,
        generation: u64,
    ) -> Self {
        Self::new(broker, clid, interfaces, generation, true)
    }

    fn new(
        broker: Broker,
        clid: Clid,
        interfaces: Vec<String>,
        generation: u64,
        counted: bool,
    ) -> Self {
        Self {
            handle: Arc::new(ImportHandle {
                broker,
                clid,
                interfaces,
                generation,
                counted,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ImportHandle> {
        Arc::downgrade(&self.handle)
    }

    pub(crate) fn from_handle(handle: Arc<ImportHandle>) -> Self {
        Self { handle }
    }

    /// Id of the object in the owner's export table.
    pub fn clid(&self) -> Clid {
        self.handle.clid
    }

    /// Interfaces the owner advertised when it first sent the object.
    pub fn interfaces(&self) -> &[String] {
        &self.handle.interfaces
    }

    pub fn broker(&self) -> &Broker {
        &self.handle.broker
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    /// Whether calls can still reach the object.
    pub fn is_alive(&self) -> bool {
        !self.is_released() && self.handle.broker.is_connected()
    }

    /// Call `method` on the remote object.
    ///
    /// The request is sent before this returns; await the [`Reply`] for the
    /// result. A released reference or a closed connection fails with
    /// [`CallError::DeadReference`] without sending anything.
    pub fn call_remote(&self, method: &str, args: impl Into<Args>) -> Reply {
        if self.is_released() {
            return Reply::failed(CallError::DeadReference);
        }
        self.handle
            .broker
            .call(Target::Reference(self.clid()), method, args.into(), None)
    }

    /// Call `method` without asking for an answer.
    pub fn send_oneway(&self, method: &str, args: impl Into<Args>) -> Result<(), CallError> {
        if self.is_released() {
            return Err(CallError::DeadReference);
        }
        self.handle
            .broker
            .send_oneway(Target::Reference(self.clid()), method, args.into(), None)
    }

    /// Give up this proxy for every clone at once.
    ///
    /// Later calls through any clone fail with [`CallError::DeadReference`].
    pub fn release(&self) {
        self.handle.release();
    }

    /// Whether both handles are the same proxy.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Run `callback` once when this reference's connection closes.
    pub fn notify_on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        self.handle.broker.notify_on_disconnect(callback);
    }
}

impl PartialEq for RemoteReference {
    fn eq(&self, other: &Self) -> bool {
        self.handle.broker.id() == other.handle.broker.id() && self.clid() == other.clid()
    }
}

impl Eq for RemoteReference {}

impl Hash for RemoteReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.broker.id().hash(state);
        self.clid().hash(state);
    }
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<remote {} on broker {}>",
            self.handle.clid,
            self.handle.broker.id()
        )
    }
}

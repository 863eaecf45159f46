//! Per-connection object tables.
//!
//! Exports are local objects the peer holds references to, keyed by a
//! connection-local id (CLID) and counted by how many times they were sent.
//! Imports are the proxies for the peer's exports; mirrors are local copies
//! of the peer's cacheables. Ids are allocated from one counter and never
//! reused within a connection.

use crate::broker::Broker;
use crate::cache::{CacheObserver, CacheToken, MirrorCell, RemoteCacheHandle};
use crate::codec::DecodeError;
use crate::flavor::{Cacheable, ObjectKey, Referenceable, RemoteCache, Viewable};
use crate::reference::{ImportHandle, RemoteReference};
use crate::value::Value;
use parking_lot::RwLock;
use perspective_core::{Clid, Identity, ROOT_CLID};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// What an export id resolves to.
#[derive(Clone)]
pub(crate) enum Exported {
    Reference(Arc<dyn Referenceable>),
    View(Arc<dyn Viewable>),
    Cache {
        object: Arc<dyn Cacheable>,
        observer: CacheObserver,
    },
}

impl Exported {
    /// The local object, as a back-reference resolves to it.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Exported::Reference(object) => Value::Referenceable(object.clone()),
            Exported::View(object) => Value::Viewable(object.clone()),
            Exported::Cache { object, .. } => Value::Cacheable(object.clone()),
        }
    }

    pub(crate) fn stop_observing(&self) {
        if let Exported::Cache { object, observer } = self {
            object.stopped_observing(observer);
        }
    }

    pub(crate) fn is_cache(&self) -> bool {
        matches!(self, Exported::Cache { .. })
    }
}

pub(crate) struct Export {
    key: Option<ObjectKey>,
    pub(crate) object: Exported,
    /// Identity the object was sent under; handlers and answers use it.
    pub(crate) perspective: Option<Identity>,
    refcount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TableError {
    #[error("release notice for unknown export {0}")]
    UnknownExport(Clid),
    #[error("second full snapshot for cache {0}")]
    DuplicateMirror(Clid),
}

struct Import {
    handle: Weak<ImportHandle>,
    generation: u64,
    /// Times the peer sent this reference since the last release notice.
    count: u32,
    interfaces: Vec<String>,
}

struct Mirror {
    cell: Arc<MirrorCell>,
    token: Weak<CacheToken>,
    generation: u64,
    count: u32,
}

/// A cacheable we refused to mirror. Kept until the owner uncaches it so
/// later `cached` sends fail the same way and their receipts are returned.
struct Rejected {
    error: DecodeError,
    /// Receipts not yet returned in a `decache`.
    count: u32,
}

pub(crate) struct IdentityTable {
    next_clid: Clid,
    next_generation: u64,
    exports: HashMap<Clid, Export>,
    by_key: HashMap<ObjectKey, Clid>,
    imports: HashMap<Clid, Import>,
    mirrors: HashMap<Clid, Mirror>,
    rejected: HashMap<Clid, Rejected>,
}

impl IdentityTable {
    pub(crate) fn new() -> Self {
        Self {
            next_clid: ROOT_CLID + 1,
            next_generation: 1,
            exports: HashMap::new(),
            by_key: HashMap::new(),
            imports: HashMap::new(),
            mirrors: HashMap::new(),
            rejected: HashMap::new(),
        }
    }

    /// Pin `root` at the well-known id. Release notices for it are ignored.
    pub(crate) fn set_root(&mut self, root: Arc<dyn Referenceable>) {
        self.exports.insert(
            ROOT_CLID,
            Export {
                key: None,
                object: Exported::Reference(root),
                perspective: None,
                refcount: 0,
            },
        );
    }

    /// Id for `key`, counting one more send. `make` runs only for new exports.
    ///
    /// Returns whether this is the first send over the connection.
    pub(crate) fn export_for(
        &mut self,
        key: ObjectKey,
        perspective: Option<Identity>,
        make: impl FnOnce() -> Exported,
    ) -> (Clid, bool) {
        if let Some(&clid) = self.by_key.get(&key) {
            if let Some(export) = self.exports.get_mut(&clid) {
                export.refcount += 1;
                return (clid, false);
            }
        }
        let clid = self.next_clid;
        self.next_clid += 1;
        self.by_key.insert(key.clone(), clid);
        self.exports.insert(
            clid,
            Export {
                key: Some(key),
                object: make(),
                perspective,
                refcount: 1,
            },
        );
        (clid, true)
    }

    /// Id of an exported object without counting a send.
    pub(crate) fn exported_clid(&self, key: &ObjectKey) -> Option<Clid> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn export(&self, clid: Clid) -> Option<&Export> {
        self.exports.get(&clid)
    }

    /// Apply a release notice for `count` sends. Returns the export if it
    /// was removed.
    pub(crate) fn release_export(
        &mut self,
        clid: Clid,
        count: u32,
    ) -> Result<Option<Export>, TableError> {
        if clid == ROOT_CLID {
            return Ok(None);
        }
        let export = self
            .exports
            .get_mut(&clid)
            .ok_or(TableError::UnknownExport(clid))?;
        if count < export.refcount {
            export.refcount -= count;
            return Ok(None);
        }
        if count > export.refcount {
            tracing::warn!(
                "release of {} by {} exceeds its count of {}",
                clid,
                count,
                export.refcount
            );
        }
        Ok(self.remove_export(clid))
    }

    fn remove_export(&mut self, clid: Clid) -> Option<Export> {
        let export = self.exports.remove(&clid)?;
        if let Some(key) = &export.key {
            self.by_key.remove(key);
        }
        Some(export)
    }

    pub(crate) fn drain_exports(&mut self) -> Vec<Export> {
        self.by_key.clear();
        self.exports.drain().map(|(_, export)| export).collect()
    }

    /// The proxy for the peer's `clid`, counting one more receipt.
    ///
    /// While a live, unreleased proxy exists it is reused, so a received
    /// object is always the same proxy. `interfaces` arrive only on the
    /// first send and are kept for later proxies.
    pub(crate) fn import_reference(
        &mut self,
        clid: Clid,
        interfaces: Option<Vec<String>>,
        broker: &Broker,
    ) -> RemoteReference {
        let generation = self.next_generation;
        match self.imports.get_mut(&clid) {
            Some(import) => {
                import.count += 1;
                if let Some(handle) = import.handle.upgrade().filter(|h| !h.is_released()) {
                    return RemoteReference::from_handle(handle);
                }
                // Previous proxy is gone but its release has not gone out;
                // the next release notice covers both.
                if let Some(interfaces) = interfaces {
                    import.interfaces = interfaces;
                }
                let reference = RemoteReference::imported(
                    broker.clone(),
                    clid,
                    import.interfaces.clone(),
                    generation,
                );
                import.handle = reference.downgrade();
                import.generation = generation;
                self.next_generation += 1;
                reference
            }
            None => {
                let interfaces = interfaces.unwrap_or_default();
                let reference =
                    RemoteReference::imported(broker.clone(), clid, interfaces.clone(), generation);
                self.imports.insert(
                    clid,
                    Import {
                        handle: reference.downgrade(),
                        generation,
                        count: 1,
                        interfaces,
                    },
                );
                self.next_generation += 1;
                reference
            }
        }
    }

    /// Forget the import if `generation` is still current. Returns the count
    /// to put in the release notice.
    pub(crate) fn release_import(&mut self, clid: Clid, generation: u64) -> Option<u32> {
        match self.imports.get(&clid) {
            Some(import) if import.generation == generation => {
                self.imports.remove(&clid).map(|import| import.count)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_mirror(&self, luid: Clid) -> bool {
        self.mirrors.contains_key(&luid)
    }

    /// Install a new mirror for the peer's cacheable `luid`.
    pub(crate) fn cache_locally(
        &mut self,
        luid: Clid,
        mirror: Box<dyn RemoteCache>,
        broker: &Broker,
    ) -> Result<RemoteCacheHandle, TableError> {
        if self.mirrors.contains_key(&luid) {
            return Err(TableError::DuplicateMirror(luid));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let cell = Arc::new(RwLock::new(mirror));
        let handle = RemoteCacheHandle::new(broker.clone(), luid, generation, cell.clone());
        self.mirrors.insert(
            luid,
            Mirror {
                cell,
                token: handle.downgrade(),
                generation,
                count: 1,
            },
        );
        Ok(handle)
    }

    /// Handle to an existing mirror, counting one more receipt.
    pub(crate) fn cached_locally(
        &mut self,
        luid: Clid,
        broker: &Broker,
    ) -> Option<RemoteCacheHandle> {
        let generation = self.next_generation;
        let mirror = self.mirrors.get_mut(&luid)?;
        mirror.count += 1;
        if let Some(token) = mirror.token.upgrade() {
            return Some(RemoteCacheHandle::from_token(token));
        }
        let handle = RemoteCacheHandle::new(broker.clone(), luid, generation, mirror.cell.clone());
        mirror.token = handle.downgrade();
        mirror.generation = generation;
        self.next_generation += 1;
        Some(handle)
    }

    pub(crate) fn mirror(&self, luid: Clid) -> Option<Arc<MirrorCell>> {
        self.mirrors.get(&luid).map(|mirror| mirror.cell.clone())
    }

    /// The last handle for a mirror went away. Returns the count for the
    /// release notice; the mirror itself stays until the owner uncaches it.
    pub(crate) fn release_mirror(&mut self, luid: Clid, generation: u64) -> Option<u32> {
        let mirror = self.mirrors.get_mut(&luid)?;
        if mirror.generation != generation || mirror.token.strong_count() > 0 {
            return None;
        }
        let count = std::mem::take(&mut mirror.count);
        (count > 0).then_some(count)
    }

    /// The owner uncached `luid`.
    pub(crate) fn forget_mirror(&mut self, luid: Clid) -> bool {
        let rejected = self.rejected.remove(&luid).is_some();
        self.mirrors.remove(&luid).is_some() || rejected
    }

    /// Refuse the peer's cacheable `luid`, dropping any half-built mirror.
    /// Receipts already counted on the mirror carry over to the tombstone.
    pub(crate) fn reject_cache(&mut self, luid: Clid, error: DecodeError) {
        let count = self.mirrors.remove(&luid).map_or(1, |mirror| mirror.count);
        self.rejected
            .entry(luid)
            .and_modify(|rejected| rejected.count += count)
            .or_insert(Rejected { error, count });
    }

    /// A later `cached` for a refused cacheable: count the receipt and fail
    /// the way the first send did.
    pub(crate) fn rejected_again(&mut self, luid: Clid) -> Option<DecodeError> {
        let rejected = self.rejected.get_mut(&luid)?;
        rejected.count += 1;
        Some(rejected.error.clone())
    }

    /// Receipts of refused cacheables to hand back, clearing the counts.
    pub(crate) fn take_rejected(&mut self) -> Vec<(Clid, u32)> {
        self.rejected
            .iter_mut()
            .filter(|(_, rejected)| rejected.count > 0)
            .map(|(&luid, rejected)| (luid, std::mem::take(&mut rejected.count)))
            .collect()
    }

    /// Exports other than the root.
    pub(crate) fn export_count(&self) -> usize {
        self.exports.len() - usize::from(self.exports.contains_key(&ROOT_CLID))
    }

    pub(crate) fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub(crate) fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::flavor::{HandlerFuture, Invocation};
    use crate::value::{Args, ValueError};

    struct Thing;

    impl Referenceable for Thing {
        fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
            Box::pin(async move { Err(RemoteError::no_such_method(&invocation.method)) })
        }
    }

    #[derive(Debug, Default)]
    struct Mirrored;

    impl RemoteCache for Mirrored {
        fn set_state(&mut self, _: Value) -> Result<(), ValueError> {
            Ok(())
        }

        fn observe(&mut self, method: &str, _: Args) -> Result<Value, RemoteError> {
            Err(RemoteError::no_such_method(method))
        }
    }

    fn export(table: &mut IdentityTable, object: &Arc<dyn Referenceable>) -> (Clid, bool) {
        table.export_for(ObjectKey::reference(object), None, || {
            Exported::Reference(object.clone())
        })
    }

    #[test]
    fn same_object_same_clid() {
        let mut table = IdentityTable::new();
        let thing: Arc<dyn Referenceable> = Arc::new(Thing);
        let other: Arc<dyn Referenceable> = Arc::new(Thing);

        let (a, first) = export(&mut table, &thing);
        assert!(first);
        assert_eq!(export(&mut table, &thing), (a, false));
        let (b, _) = export(&mut table, &other);
        assert_ne!(a, b);
        assert_ne!(a, ROOT_CLID);
    }

    #[test]
    fn release_counts_down_then_removes() {
        let mut table = IdentityTable::new();
        let thing: Arc<dyn Referenceable> = Arc::new(Thing);
        let (clid, _) = export(&mut table, &thing);
        export(&mut table, &thing);
        export(&mut table, &thing);

        assert!(table.release_export(clid, 2).unwrap().is_none());
        assert_eq!(table.export_count(), 1);
        assert!(table.release_export(clid, 1).unwrap().is_some());
        assert_eq!(table.export_count(), 0);
        assert_eq!(
            table.release_export(clid, 1).err(),
            Some(TableError::UnknownExport(clid))
        );
    }

    #[test]
    fn clids_are_not_reused() {
        let mut table = IdentityTable::new();
        let thing: Arc<dyn Referenceable> = Arc::new(Thing);
        let (first, _) = export(&mut table, &thing);
        table.release_export(first, 1).unwrap();
        let (second, new) = export(&mut table, &thing);
        assert!(new);
        assert_ne!(first, second);
    }

    #[test]
    fn root_is_pinned() {
        let mut table = IdentityTable::new();
        table.set_root(Arc::new(Thing));
        assert!(table.release_export(ROOT_CLID, 5).unwrap().is_none());
        assert!(table.export(ROOT_CLID).is_some());
        assert_eq!(table.export_count(), 0);
    }

    #[test]
    fn import_reuses_live_proxy() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();

        let first = table.import_reference(4, Some(vec!["demo.Thing".into()]), &broker);
        let again = table.import_reference(4, None, &broker);
        assert!(first.ptr_eq(&again));
        assert_eq!(again.interfaces(), ["demo.Thing".to_string()]);

        let generation = 1;
        assert_eq!(table.release_import(4, generation + 1), None);
        assert_eq!(table.release_import(4, generation), Some(2));
        assert_eq!(table.import_count(), 0);
    }

    #[test]
    fn released_proxy_is_replaced() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();

        let first = table.import_reference(4, Some(vec!["demo.Thing".into()]), &broker);
        first.release();
        let second = table.import_reference(4, None, &broker);
        assert!(!first.ptr_eq(&second));
        assert!(!second.is_released());
        assert_eq!(second.interfaces(), ["demo.Thing".to_string()]);
        // The stale generation's notice is ignored; the new one carries both receipts.
        assert_eq!(table.release_import(4, 1), None);
        assert_eq!(table.release_import(4, 2), Some(2));
    }

    #[test]
    fn mirror_survives_until_uncached() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();

        let handle = table
            .cache_locally(9, Box::new(Mirrored), &broker)
            .unwrap();
        assert_eq!(
            table.cache_locally(9, Box::new(Mirrored), &broker).err(),
            Some(TableError::DuplicateMirror(9))
        );
        let again = table.cached_locally(9, &broker).unwrap();
        assert!(handle.ptr_eq(&again));

        drop(handle);
        drop(again);
        assert_eq!(table.release_mirror(9, 1), Some(2));
        assert_eq!(table.release_mirror(9, 1), None);
        assert!(table.has_mirror(9));
        assert!(table.forget_mirror(9));
        assert!(table.cached_locally(9, &broker).is_none());
    }

    #[test]
    fn rejected_cache_returns_every_receipt() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let refused = DecodeError::Security {
            tag: "demo.Evil".into(),
        };

        // A half-built mirror already counted a self-reference.
        let handle = table
            .cache_locally(5, Box::new(Mirrored), &broker)
            .unwrap();
        let _self_ref = table.cached_locally(5, &broker).unwrap();
        table.reject_cache(5, refused.clone());
        assert!(!table.has_mirror(5));
        drop(handle);
        assert_eq!(table.release_mirror(5, 1), None);

        assert_eq!(table.rejected_again(5), Some(refused));
        assert_eq!(table.take_rejected(), vec![(5, 3)]);
        assert!(table.take_rejected().is_empty());
        assert_eq!(table.rejected_again(6), None);

        assert!(table.forget_mirror(5));
        assert_eq!(table.rejected_again(5), None);
    }
}

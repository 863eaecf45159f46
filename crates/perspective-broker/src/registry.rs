//! Allow-list of types that may be built from wire data.
//!
//! Decoding a copy or cache whose tag is missing here fails with a security
//! rejection before anything is constructed. Error tags registered here are
//! the ones callers can trap by name.

use crate::flavor::{Cacheable, Copyable, RemoteCache, RemoteCopy};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

/// Builds an empty [`RemoteCopy`] for a registered tag.
pub type CopyFactory = fn() -> Box<dyn RemoteCopy>;
/// Builds an empty [`RemoteCache`] for a registered tag.
pub type CacheFactory = fn() -> Box<dyn RemoteCache>;

#[derive(Clone, Copy)]
enum Registration {
    Copy(CopyFactory),
    Cache(CacheFactory),
}

#[derive(Default)]
struct Inner {
    types: HashMap<String, Registration>,
    errors: HashSet<String>,
    sealed: bool,
}

/// Error registering a tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("type tag {0:?} is already registered")]
    Duplicate(String),
    #[error("registry is sealed; cannot register {0:?}")]
    Sealed(String),
}

static GLOBAL: LazyLock<Arc<TypeRegistry>> = LazyLock::new(|| Arc::new(TypeRegistry::new()));

/// Type tag to constructor mapping, shared by every broker that uses it.
///
/// Populate it during startup, then [`seal`](Self::seal) it.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<Inner>,
}

fn build_copy<T: RemoteCopy + Default>() -> Box<dyn RemoteCopy> {
    Box::new(T::default())
}

fn build_cache<T: RemoteCache + Default>() -> Box<dyn RemoteCache> {
    Box::new(T::default())
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`BrokerOptions::default`](crate::BrokerOptions).
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    /// Accept copies tagged `tag`, rebuilt as `T`.
    pub fn register_copy<T: RemoteCopy + Default>(
        &self,
        tag: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.insert(tag.into(), Registration::Copy(build_copy::<T>))
    }

    pub fn register_copy_factory(
        &self,
        tag: impl Into<String>,
        factory: CopyFactory,
    ) -> Result<(), RegistryError> {
        self.insert(tag.into(), Registration::Copy(factory))
    }

    /// Accept copies of `Local` (under its default tag), rebuilt as `T`.
    pub fn register_copy_for<Local: Copyable, T: RemoteCopy + Default>(
        &self,
    ) -> Result<(), RegistryError> {
        self.register_copy::<T>(std::any::type_name::<Local>())
    }

    /// Accept caches tagged `tag`, mirrored as `T`.
    pub fn register_cache<T: RemoteCache + Default>(
        &self,
        tag: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.insert(tag.into(), Registration::Cache(build_cache::<T>))
    }

    pub fn register_cache_factory(
        &self,
        tag: impl Into<String>,
        factory: CacheFactory,
    ) -> Result<(), RegistryError> {
        self.insert(tag.into(), Registration::Cache(factory))
    }

    /// Accept caches of `Local` (under its default tag), mirrored as `T`.
    pub fn register_cache_for<Local: Cacheable, T: RemoteCache + Default>(
        &self,
    ) -> Result<(), RegistryError> {
        self.register_cache::<T>(std::any::type_name::<Local>())
    }

    /// Make remote application errors tagged `tag` trappable by name.
    pub fn register_error(&self, tag: impl Into<String>) -> Result<(), RegistryError> {
        let tag = tag.into();
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(RegistryError::Sealed(tag));
        }
        inner.errors.insert(tag);
        Ok(())
    }

    /// Refuse further registrations.
    pub fn seal(&self) {
        self.inner.write().sealed = true;
        tracing::debug!("type registry sealed");
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.inner.read().types.contains_key(tag)
    }

    pub fn is_error_registered(&self, tag: &str) -> bool {
        self.inner.read().errors.contains(tag)
    }

    pub(crate) fn copy_factory(&self, tag: &str) -> Option<CopyFactory> {
        match self.inner.read().types.get(tag) {
            Some(Registration::Copy(factory)) => Some(*factory),
            _ => None,
        }
    }

    pub(crate) fn cache_factory(&self, tag: &str) -> Option<CacheFactory> {
        match self.inner.read().types.get(tag) {
            Some(Registration::Cache(factory)) => Some(*factory),
            _ => None,
        }
    }

    fn insert(&self, tag: String, registration: Registration) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(RegistryError::Sealed(tag));
        }
        if inner.types.contains_key(&tag) {
            return Err(RegistryError::Duplicate(tag));
        }
        tracing::debug!("registered type {}", tag);
        inner.types.insert(tag, registration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::value::{Args, Value, ValueError};

    #[derive(Debug, Default)]
    struct Point;

    impl RemoteCopy for Point {
        fn set_state(&mut self, _: Value) -> Result<(), ValueError> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Board;

    impl RemoteCache for Board {
        fn set_state(&mut self, _: Value) -> Result<(), ValueError> {
            Ok(())
        }

        fn observe(&mut self, method: &str, _: Args) -> Result<Value, RemoteError> {
            Err(RemoteError::no_such_method(method))
        }
    }

    #[test]
    fn lookups_respect_flavor() {
        let registry = TypeRegistry::new();
        registry.register_copy::<Point>("demo.Point").unwrap();
        registry.register_cache::<Board>("demo.Board").unwrap();

        assert!(registry.copy_factory("demo.Point").is_some());
        assert!(registry.cache_factory("demo.Point").is_none());
        assert!(registry.cache_factory("demo.Board").is_some());
        assert!(registry.copy_factory("demo.Evil").is_none());
    }

    #[test]
    fn duplicate_tag_is_refused() {
        let registry = TypeRegistry::new();
        registry.register_copy::<Point>("demo.Point").unwrap();
        assert_eq!(
            registry.register_cache::<Board>("demo.Point"),
            Err(RegistryError::Duplicate("demo.Point".into()))
        );
    }

    #[test]
    fn sealed_registry_refuses_additions() {
        let registry = TypeRegistry::new();
        registry.register_error("demo.Oops").unwrap();
        registry.seal();
        assert!(registry.is_sealed());
        assert!(matches!(
            registry.register_copy::<Point>("demo.Point"),
            Err(RegistryError::Sealed(_))
        ));
        assert!(registry.register_error("demo.Late").is_err());
        assert!(registry.is_error_registered("demo.Oops"));
    }
}

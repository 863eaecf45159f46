//! Conversion between [`Value`] and wire [`Jelly`].
//!
//! Encoding registers exports as it goes; decoding resolves references
//! against the identity table and builds copies and mirrors only for
//! registered tags.

use crate::broker::Broker;
use crate::cache::CacheObserver;
use crate::flavor::{Cacheable, Copyable, ObjectKey};
use crate::identity_table::{Export, Exported, IdentityTable, TableError};
use crate::registry::TypeRegistry;
use crate::value::{Args, Value};
use perspective_core::{Clid, Identity, Jelly};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum EncodeError {
    #[error("{0} belongs to another connection")]
    ForeignObject(&'static str),
    #[error("reference {0} was released")]
    Released(Clid),
    #[error("viewable sent without a perspective")]
    NoPerspective,
    #[error("received copy {0} cannot be passed on")]
    OpaqueCopy(String),
    #[error("value nested deeper than {0}")]
    TooDeep(usize),
    #[error("float {0} has no wire form")]
    NonFiniteFloat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("type tag {tag:?} is not registered")]
    Security { tag: String },
    #[error("{0}")]
    Protocol(String),
}

impl From<TableError> for DecodeError {
    fn from(err: TableError) -> Self {
        DecodeError::Protocol(err.to_string())
    }
}

/// Encodes values sent under one perspective.
///
/// Exports registered by a failed encode are rolled back, so a value that
/// cannot be sent leaves no trace in the table.
pub(crate) struct Jellier<'a> {
    table: &'a mut IdentityTable,
    broker: &'a Broker,
    perspective: Option<Identity>,
    max_depth: usize,
    sent: Vec<Clid>,
}

impl<'a> Jellier<'a> {
    pub(crate) fn new(
        table: &'a mut IdentityTable,
        broker: &'a Broker,
        perspective: Option<Identity>,
        max_depth: usize,
    ) -> Self {
        Self {
            table,
            broker,
            perspective,
            max_depth,
            sent: Vec::new(),
        }
    }

    pub(crate) fn encode(mut self, value: &Value) -> Result<Jelly, EncodeError> {
        let result = self.jelly(value, 0);
        if result.is_err() {
            self.rollback();
        }
        result
    }

    pub(crate) fn encode_args(
        mut self,
        args: Args,
    ) -> Result<(Vec<Jelly>, BTreeMap<String, Jelly>), EncodeError> {
        let (positional, keywords) = args.into_parts();
        let result = positional
            .iter()
            .map(|value| self.jelly(value, 0))
            .collect::<Result<Vec<_>, _>>()
            .and_then(|positional| {
                let keywords = keywords
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), self.jelly(value, 0)?)))
                    .collect::<Result<BTreeMap<_, _>, EncodeError>>()?;
                Ok((positional, keywords))
            });
        if result.is_err() {
            self.rollback();
        }
        result
    }

    fn rollback(&mut self) {
        for clid in self.sent.drain(..) {
            if let Ok(Some(export)) = self.table.release_export(clid, 1) {
                export.object.stop_observing();
            }
        }
    }

    fn jelly(&mut self, value: &Value, depth: usize) -> Result<Jelly, EncodeError> {
        if depth > self.max_depth {
            return Err(EncodeError::TooDeep(self.max_depth));
        }
        Ok(match value {
            Value::None => Jelly::None,
            Value::Bool(b) => Jelly::Bool(*b),
            Value::Int(n) => Jelly::Int(*n),
            Value::Float(x) if !x.is_finite() => {
                return Err(EncodeError::NonFiniteFloat(x.to_string()));
            }
            Value::Float(x) => Jelly::Float(*x),
            Value::Str(s) => Jelly::Str(s.clone()),
            Value::Bytes(bytes) => Jelly::Bytes(bytes.clone()),
            Value::List(items) => Jelly::List(
                items
                    .iter()
                    .map(|item| self.jelly(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dict(fields) => Jelly::Dict(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.jelly(v, depth + 1)?)))
                    .collect::<Result<_, EncodeError>>()?,
            ),
            Value::Referenceable(object) => {
                let (clid, first) = self.table.export_for(
                    ObjectKey::reference(object),
                    self.perspective.clone(),
                    || Exported::Reference(object.clone()),
                );
                self.sent.push(clid);
                Jelly::Remote {
                    clid,
                    interfaces: first.then(|| object.interfaces()),
                }
            }
            Value::Viewable(object) => {
                let perspective = self.perspective.clone().ok_or(EncodeError::NoPerspective)?;
                let (clid, first) = self.table.export_for(
                    ObjectKey::view(&perspective, object),
                    Some(perspective),
                    || Exported::View(object.clone()),
                );
                self.sent.push(clid);
                Jelly::Remote {
                    clid,
                    interfaces: first.then(Vec::new),
                }
            }
            Value::Copyable(object) => self.copy(&**object, depth)?,
            Value::Cacheable(object) => self.cache(object, depth)?,
            Value::Remote(reference) => {
                if reference.broker().id() != self.broker.id() {
                    return Err(EncodeError::ForeignObject("remote reference"));
                }
                if reference.is_released() {
                    return Err(EncodeError::Released(reference.clid()));
                }
                Jelly::Local {
                    clid: reference.clid(),
                }
            }
            Value::RemoteCopy(copy) => match copy.as_copyable() {
                Some(copyable) => self.copy(copyable, depth)?,
                None => return Err(EncodeError::OpaqueCopy(format!("{copy:?}"))),
            },
            Value::RemoteCache(handle) => {
                if handle.broker().id() != self.broker.id() {
                    return Err(EncodeError::ForeignObject("cache mirror"));
                }
                Jelly::LocalCache { luid: handle.luid() }
            }
            Value::AsPerspective(identity, inner) => {
                let outer = self.perspective.replace(identity.clone());
                let result = self.jelly(inner, depth);
                self.perspective = outer;
                result?
            }
        })
    }

    fn copy(&mut self, object: &dyn Copyable, depth: usize) -> Result<Jelly, EncodeError> {
        let state = object.state_for(self.perspective.as_ref());
        Ok(Jelly::Copy {
            tag: object.type_tag(),
            state: Box::new(self.jelly(&state, depth + 1)?),
        })
    }

    fn cache(&mut self, object: &Arc<dyn Cacheable>, depth: usize) -> Result<Jelly, EncodeError> {
        let key = ObjectKey::cache(object);
        let observer = CacheObserver::new(self.broker.clone(), key.clone(), self.perspective.clone());
        let (luid, first) = self.table.export_for(key, self.perspective.clone(), || {
            Exported::Cache {
                object: object.clone(),
                observer: observer.clone(),
            }
        });
        self.sent.push(luid);
        if !first {
            return Ok(Jelly::Cached { luid });
        }
        // Registered before the state is taken, so the state may refer back
        // to the object itself.
        let state = object.state_to_cache(self.perspective.as_ref(), observer);
        Ok(Jelly::Cache {
            luid,
            tag: object.type_tag(),
            state: Box::new(self.jelly(&state, depth + 1)?),
        })
    }
}

/// Decodes values received on one connection.
pub(crate) struct Unjellier<'a> {
    table: &'a mut IdentityTable,
    broker: &'a Broker,
    registry: &'a TypeRegistry,
    max_depth: usize,
}

impl<'a> Unjellier<'a> {
    pub(crate) fn new(
        table: &'a mut IdentityTable,
        broker: &'a Broker,
        registry: &'a TypeRegistry,
        max_depth: usize,
    ) -> Self {
        Self {
            table,
            broker,
            registry,
            max_depth,
        }
    }

    pub(crate) fn decode(&mut self, jelly: Jelly) -> Result<Value, DecodeError> {
        self.unjelly(jelly, 0)
    }

    pub(crate) fn decode_args(
        &mut self,
        args: Vec<Jelly>,
        kwargs: BTreeMap<String, Jelly>,
    ) -> Result<Args, DecodeError> {
        let positional = args
            .into_iter()
            .map(|jelly| self.unjelly(jelly, 0))
            .collect::<Result<_, _>>()?;
        let keywords = kwargs
            .into_iter()
            .map(|(name, jelly)| Ok((name, self.unjelly(jelly, 0)?)))
            .collect::<Result<_, DecodeError>>()?;
        Ok(Args::from_parts(positional, keywords))
    }

    /// Decode and drop the state of a refused object, so the references it
    /// carries are released like any other dropped proxy.
    fn discard(&mut self, state: Jelly, depth: usize) {
        if let Err(err) = self.unjelly(state, depth) {
            tracing::debug!("state of refused object did not decode: {}", err);
        }
    }

    fn unjelly(&mut self, jelly: Jelly, depth: usize) -> Result<Value, DecodeError> {
        if depth > self.max_depth {
            return Err(DecodeError::Protocol(format!(
                "value nested deeper than {}",
                self.max_depth
            )));
        }
        Ok(match jelly {
            Jelly::None => Value::None,
            Jelly::Bool(b) => Value::Bool(b),
            Jelly::Int(n) => Value::Int(n),
            Jelly::Float(x) => Value::Float(x),
            Jelly::Str(s) => Value::Str(s),
            Jelly::Bytes(bytes) => Value::Bytes(bytes),
            Jelly::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.unjelly(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Jelly::Dict(fields) => Value::Dict(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.unjelly(v, depth + 1)?)))
                    .collect::<Result<_, DecodeError>>()?,
            ),
            Jelly::Remote { clid, interfaces } => {
                Value::Remote(self.table.import_reference(clid, interfaces, self.broker))
            }
            Jelly::Local { clid } => self
                .table
                .export(clid)
                .map(|export| export.object.to_value())
                .ok_or_else(|| {
                    DecodeError::Protocol(format!("back-reference to unknown object {clid}"))
                })?,
            Jelly::Copy { tag, state } => {
                let Some(factory) = self.registry.copy_factory(&tag) else {
                    self.discard(*state, depth + 1);
                    return Err(DecodeError::Security { tag });
                };
                let state = self.unjelly(*state, depth + 1)?;
                let mut copy = factory();
                copy.set_state(state)
                    .map_err(|err| DecodeError::Protocol(format!("state of {tag}: {err}")))?;
                Value::RemoteCopy(Arc::from(copy))
            }
            Jelly::Cache { luid, tag, state } => {
                let Some(factory) = self.registry.cache_factory(&tag) else {
                    let err = DecodeError::Security { tag };
                    self.table.reject_cache(luid, err.clone());
                    self.discard(*state, depth + 1);
                    return Err(err);
                };
                // The mirror exists before its state is decoded so the state
                // can contain `cached` references to it.
                let handle = self.table.cache_locally(luid, factory(), self.broker)?;
                let state = match self.unjelly(*state, depth + 1) {
                    Ok(state) => state,
                    Err(err) => {
                        self.table.reject_cache(luid, err.clone());
                        return Err(err);
                    }
                };
                if let Err(err) = handle.cell().write().set_state(state) {
                    let err = DecodeError::Protocol(format!("state of {tag}: {err}"));
                    self.table.reject_cache(luid, err.clone());
                    return Err(err);
                }
                Value::RemoteCache(handle)
            }
            Jelly::Cached { luid } => {
                if let Some(err) = self.table.rejected_again(luid) {
                    return Err(err);
                }
                self.table
                    .cached_locally(luid, self.broker)
                    .map(Value::RemoteCache)
                    .ok_or_else(|| DecodeError::Protocol(format!("no cache mirror {luid}")))?
            }
            Jelly::LocalCache { luid } => match self.table.export(luid) {
                Some(Export {
                    object: object @ Exported::Cache { .. },
                    ..
                }) => object.to_value(),
                _ => {
                    return Err(DecodeError::Protocol(format!(
                        "back-reference to unknown cacheable {luid}"
                    )));
                }
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Command;
    use crate::error::RemoteError;
    use crate::flavor::{
        HandlerFuture, Invocation, Referenceable, RemoteCache, RemoteCopy, Viewable,
    };
    use crate::value::ValueError;
    use parking_lot::Mutex;

    struct Thing;

    impl Referenceable for Thing {
        fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
            Box::pin(async move { Err(RemoteError::no_such_method(&invocation.method)) })
        }

        fn interfaces(&self) -> Vec<String> {
            vec!["demo.Thing".into()]
        }
    }

    struct Seat;

    impl Viewable for Seat {
        fn view_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
            Box::pin(async move { Err(RemoteError::no_such_method(&invocation.method)) })
        }
    }

    struct Point {
        x: i64,
    }

    impl Copyable for Point {
        fn type_tag(&self) -> String {
            "demo.Point".into()
        }

        fn state_for(&self, _: Option<&Identity>) -> Value {
            Value::from(BTreeMap::from([("x".to_string(), self.x)]))
        }
    }

    #[derive(Debug, Default)]
    struct RemotePoint {
        x: i64,
    }

    impl RemoteCopy for RemotePoint {
        fn set_state(&mut self, state: Value) -> Result<(), ValueError> {
            self.x = state.field("x")?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Board {
        observers: Mutex<Vec<CacheObserver>>,
    }

    impl Cacheable for Board {
        fn type_tag(&self) -> String {
            "demo.Board".into()
        }

        fn state_to_cache(&self, _: Option<&Identity>, observer: CacheObserver) -> Value {
            self.observers.lock().push(observer);
            Value::Int(0)
        }

        fn stopped_observing(&self, observer: &CacheObserver) {
            self.observers.lock().retain(|o| o != observer);
        }
    }

    #[derive(Debug, Default)]
    struct RemoteBoard {
        score: i64,
    }

    impl RemoteCache for RemoteBoard {
        fn set_state(&mut self, state: Value) -> Result<(), ValueError> {
            self.score = crate::value::FromValue::from_value(state)?;
            Ok(())
        }

        fn observe(&mut self, method: &str, _: Args) -> Result<Value, RemoteError> {
            Err(RemoteError::no_such_method(method))
        }
    }

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry.register_copy::<RemotePoint>("demo.Point").unwrap();
        registry.register_cache::<RemoteBoard>("demo.Board").unwrap();
        registry
    }

    #[test]
    fn reference_interfaces_only_first_time() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let thing = Value::reference(Arc::new(Thing));

        let first = Jellier::new(&mut table, &broker, None, 8).encode(&thing).unwrap();
        let second = Jellier::new(&mut table, &broker, None, 8).encode(&thing).unwrap();
        assert_eq!(
            first,
            Jelly::Remote {
                clid: 1,
                interfaces: Some(vec!["demo.Thing".into()])
            }
        );
        assert_eq!(
            second,
            Jelly::Remote {
                clid: 1,
                interfaces: None
            }
        );
    }

    #[test]
    fn failed_encode_rolls_back_exports() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let value = Value::List(vec![
            Value::reference(Arc::new(Thing)),
            Value::viewable(Arc::new(Seat)),
        ]);

        let err = Jellier::new(&mut table, &broker, None, 8)
            .encode(&value)
            .unwrap_err();
        assert_eq!(err, EncodeError::NoPerspective);
        assert_eq!(table.export_count(), 0);
    }

    #[test]
    fn depth_limit_applies() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let mut value = Value::None;
        for _ in 0..5 {
            value = Value::List(vec![value]);
        }
        assert!(Jellier::new(&mut table, &broker, None, 8).encode(&value).is_ok());
        assert_eq!(
            Jellier::new(&mut table, &broker, None, 3).encode(&value),
            Err(EncodeError::TooDeep(3))
        );
    }

    #[test]
    fn non_finite_floats_are_not_sent() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let thing = Value::reference(Arc::new(Thing));

        for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let value = Value::List(vec![thing.clone(), Value::Float(x)]);
            assert!(matches!(
                Jellier::new(&mut table, &broker, None, 8).encode(&value),
                Err(EncodeError::NonFiniteFloat(_))
            ));
        }
        assert_eq!(table.export_count(), 0);
        assert_eq!(
            Jellier::new(&mut table, &broker, None, 8).encode(&Value::Float(-0.5)),
            Ok(Jelly::Float(-0.5))
        );
    }

    #[test]
    fn copy_round_trip_through_registry() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();

        let jelly = Jellier::new(&mut table, &broker, None, 8)
            .encode(&Value::copyable(Arc::new(Point { x: 7 })))
            .unwrap();
        let value = Unjellier::new(&mut table, &broker, &registry, 8)
            .decode(jelly)
            .unwrap();
        assert_eq!(value.downcast_copy::<RemotePoint>().unwrap().x, 7);
    }

    #[test]
    fn unregistered_tag_constructs_nothing() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();

        let evil = Jelly::Cache {
            luid: 3,
            tag: "demo.Evil".into(),
            state: Box::new(Jelly::None),
        };
        assert_eq!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(evil),
            Err(DecodeError::Security {
                tag: "demo.Evil".into()
            })
        );
        assert_eq!(table.mirror_count(), 0);

        // A copy tag is not accepted as a cache.
        let wrong_flavor = Jelly::Cache {
            luid: 3,
            tag: "demo.Point".into(),
            state: Box::new(Jelly::None),
        };
        assert!(matches!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(wrong_flavor),
            Err(DecodeError::Security { .. })
        ));
    }

    #[test]
    fn refused_cache_stays_refused() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();
        let refused = DecodeError::Security {
            tag: "demo.Evil".into(),
        };

        let snapshot = Jelly::Cache {
            luid: 4,
            tag: "demo.Evil".into(),
            state: Box::new(Jelly::Cached { luid: 4 }),
        };
        assert_eq!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(snapshot),
            Err(refused.clone())
        );
        assert_eq!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(Jelly::Cached { luid: 4 }),
            Err(refused)
        );
        // The snapshot, its self-reference and the later send.
        assert_eq!(table.take_rejected(), vec![(4, 3)]);
    }

    #[test]
    fn bad_cache_state_is_refused_too() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();

        let snapshot = Jelly::Cache {
            luid: 6,
            tag: "demo.Board".into(),
            state: Box::new(Jelly::Str("not a score".into())),
        };
        let err = Unjellier::new(&mut table, &broker, &registry, 8)
            .decode(snapshot)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Protocol(_)));
        assert_eq!(table.mirror_count(), 0);
        assert_eq!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(Jelly::Cached { luid: 6 }),
            Err(err)
        );
        assert_eq!(table.take_rejected(), vec![(6, 2)]);
    }

    #[test]
    fn refused_copy_releases_what_it_carried() {
        let (broker, mut commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();

        let evil = Jelly::Copy {
            tag: "demo.Evil".into(),
            state: Box::new(Jelly::Remote {
                clid: 12,
                interfaces: None,
            }),
        };
        assert!(matches!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(evil),
            Err(DecodeError::Security { .. })
        ));
        assert!(matches!(
            commands.try_recv(),
            Ok(Command::ReleaseImport { clid: 12, .. })
        ));
    }

    #[test]
    fn cacheable_sent_once_per_connection() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let board = Arc::new(Board::default());
        let value = Value::cacheable(board.clone());

        let first = Jellier::new(&mut table, &broker, None, 8).encode(&value).unwrap();
        let second = Jellier::new(&mut table, &broker, None, 8).encode(&value).unwrap();
        assert!(matches!(first, Jelly::Cache { luid: 1, .. }));
        assert_eq!(second, Jelly::Cached { luid: 1 });
        assert_eq!(board.observers.lock().len(), 1);
    }

    #[test]
    fn second_snapshot_is_a_protocol_error() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();
        let snapshot = Jelly::Cache {
            luid: 2,
            tag: "demo.Board".into(),
            state: Box::new(Jelly::Int(10)),
        };

        let mirror = Unjellier::new(&mut table, &broker, &registry, 8)
            .decode(snapshot.clone())
            .unwrap();
        let Value::RemoteCache(handle) = &mirror else {
            panic!("expected a cache mirror, got {mirror:?}");
        };
        assert_eq!(handle.read(|board: &RemoteBoard| board.score), Some(10));
        assert!(matches!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(snapshot),
            Err(DecodeError::Protocol(_))
        ));
    }

    #[test]
    fn back_reference_resolves_to_original() {
        let (broker, _commands) = Broker::detached();
        let mut table = IdentityTable::new();
        let registry = registry();
        let thing: Arc<dyn Referenceable> = Arc::new(Thing);

        let Jelly::Remote { clid, .. } = Jellier::new(&mut table, &broker, None, 8)
            .encode(&Value::Referenceable(thing.clone()))
            .unwrap()
        else {
            panic!("expected a reference");
        };
        let back = Unjellier::new(&mut table, &broker, &registry, 8)
            .decode(Jelly::Local { clid })
            .unwrap();
        assert_eq!(back, Value::Referenceable(thing));

        assert!(matches!(
            Unjellier::new(&mut table, &broker, &registry, 8).decode(Jelly::Local { clid: 99 }),
            Err(DecodeError::Protocol(_))
        ));
    }
}

//! Object flavors and method dispatch.
//!
//! A type opts into a flavor by implementing one of the traits below. The
//! flavor decides how the object is serialized when it appears in a
//! [`Value`]; it does not change how it is used locally.

use crate::broker::Broker;
use crate::cache::CacheObserver;
use crate::error::RemoteError;
use crate::value::{Args, Value, ValueError};
use futures_util::future::{BoxFuture, ready};
use perspective_core::Identity;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a method handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// One inbound method call.
pub struct Invocation {
    pub method: String,
    pub args: Args,
    /// Identity the target was exported under. Always set for view calls.
    pub perspective: Option<Identity>,
    /// The connection the call arrived on.
    pub broker: Broker,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("perspective", &self.perspective)
            .finish_non_exhaustive()
    }
}

/// An object passed by reference.
///
/// The peer receives a [`RemoteReference`](crate::RemoteReference); calls on
/// it arrive here.
pub trait Referenceable: Send + Sync + 'static {
    fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture;

    /// Interface names sent with the first reference over each connection.
    fn interfaces(&self) -> Vec<String> {
        Vec::new()
    }
}

/// An object passed by reference, with one reference per perspective.
///
/// Handlers receive the identity that sent the reference as
/// [`Invocation::perspective`].
pub trait Viewable: Send + Sync + 'static {
    fn view_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture;
}

/// An object passed by value.
pub trait Copyable: Send + Sync + 'static {
    /// Tag the receiver looks up in its registry.
    fn type_tag(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// State to send. Called on every send, so it may differ by perspective.
    fn state_for(&self, perspective: Option<&Identity>) -> Value;
}

/// An object mirrored on the peer and kept current with updates.
pub trait Cacheable: Send + Sync + 'static {
    fn type_tag(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Full state for a new mirror. Called once per connection.
    ///
    /// Keep `observer` to push updates to that mirror.
    fn state_to_cache(&self, perspective: Option<&Identity>, observer: CacheObserver) -> Value;

    /// The peer dropped its mirror or the connection closed.
    fn stopped_observing(&self, _observer: &CacheObserver) {}
}

/// Upcast to [`Any`] so received objects can be downcast to their type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Receiving side of a [`Copyable`].
///
/// Built with `Default` (or a registered factory), then given the received
/// state once.
pub trait RemoteCopy: AsAny + Send + Sync + fmt::Debug {
    fn set_state(&mut self, state: Value) -> Result<(), ValueError>;

    /// A copy that can itself be passed on by value.
    fn as_copyable(&self) -> Option<&dyn Copyable> {
        None
    }
}

/// Receiving side of a [`Cacheable`].
pub trait RemoteCache: AsAny + Send + Sync + fmt::Debug {
    fn set_state(&mut self, state: Value) -> Result<(), ValueError>;

    /// Apply an update pushed by the original.
    fn observe(&mut self, method: &str, args: Args) -> Result<Value, RemoteError>;
}

/// Handler name prefix for each dispatch style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Remote,
    View,
    Observe,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::Remote => "remote_",
            Prefix::View => "view_",
            Prefix::Observe => "observe_",
        }
    }

    pub fn handler_name(self, method: &str) -> String {
        format!("{}{method}", self.as_str())
    }
}

type Handler<T> = Box<dyn Fn(Arc<T>, Invocation) -> HandlerFuture + Send + Sync>;

/// Method name to handler table for one type.
///
/// Only methods added here are reachable from the peer. Build it once in a
/// `static` and dispatch into it from [`Referenceable::remote_message`]:
///
/// ```ignore
/// static METHODS: LazyLock<MethodTable<Counter>> = LazyLock::new(|| {
///     MethodTable::<Counter>::remote().sync("bump", |counter, _| Ok(counter.bump().into()))
/// });
///
/// impl Referenceable for Counter {
///     fn remote_message(self: Arc<Self>, invocation: Invocation) -> HandlerFuture {
///         METHODS.dispatch(self, invocation)
///     }
/// }
/// ```
pub struct MethodTable<T> {
    prefix: Prefix,
    handlers: HashMap<String, Handler<T>>,
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    /// Table for [`Referenceable`] handlers.
    pub fn remote() -> Self {
        Self::with_prefix(Prefix::Remote)
    }

    /// Table for [`Viewable`] handlers.
    pub fn view() -> Self {
        Self::with_prefix(Prefix::View)
    }

    fn with_prefix(prefix: Prefix) -> Self {
        Self {
            prefix,
            handlers: HashMap::new(),
        }
    }

    /// Add an async handler.
    pub fn on<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let name = self.prefix.handler_name(method);
        let handler: Handler<T> = Box::new(move |this, invocation| Box::pin(handler(this, invocation)));
        if self.handlers.insert(name, handler).is_some() {
            tracing::warn!("handler for {method:?} registered twice; keeping the last");
        }
        self
    }

    /// Add a handler that completes without awaiting.
    pub fn sync<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&T, Invocation) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.on(method, move |this, invocation| {
            ready(handler(&this, invocation))
        })
    }

    /// Remote-callable method names, without prefix.
    pub fn methods(&self) -> Vec<String> {
        let prefix = self.prefix.as_str();
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .filter_map(|name| name.strip_prefix(prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    pub fn dispatch(&self, this: Arc<T>, invocation: Invocation) -> HandlerFuture {
        match self.handlers.get(&self.prefix.handler_name(&invocation.method)) {
            Some(handler) => handler(this, invocation),
            None => Box::pin(ready(Err(RemoteError::no_such_method(&invocation.method)))),
        }
    }
}

type Observer<T> = fn(&mut T, Args) -> Result<Value, RemoteError>;

/// Update handlers for a [`RemoteCache`] type.
pub struct ObserverTable<T> {
    handlers: HashMap<String, Observer<T>>,
}

impl<T> ObserverTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, method: &str, handler: Observer<T>) -> Self {
        self.handlers
            .insert(Prefix::Observe.handler_name(method), handler);
        self
    }

    pub fn dispatch(&self, this: &mut T, method: &str, args: Args) -> Result<Value, RemoteError> {
        match self.handlers.get(&Prefix::Observe.handler_name(method)) {
            Some(handler) => handler(this, args),
            None => Err(RemoteError::no_such_method(method)),
        }
    }
}

impl<T> Default for ObserverTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a local object in the export table.
///
/// Flavors are keyed apart so one object exported two ways gets two ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ObjectKey {
    Reference(usize),
    Cache(usize),
    View(Identity, usize),
}

fn address<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

impl ObjectKey {
    pub(crate) fn reference(object: &Arc<dyn Referenceable>) -> Self {
        ObjectKey::Reference(address(object))
    }

    pub(crate) fn cache(object: &Arc<dyn Cacheable>) -> Self {
        ObjectKey::Cache(address(object))
    }

    pub(crate) fn view(perspective: &Identity, object: &Arc<dyn Viewable>) -> Self {
        ObjectKey::View(perspective.clone(), address(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perspective_core::FailureKind;

    struct Counter(std::sync::atomic::AtomicI64);

    fn table() -> MethodTable<Counter> {
        MethodTable::<Counter>::remote()
            .sync("bump", |counter, _| {
                let n = counter.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(Value::Int(n))
            })
            .on("add", |counter, invocation| async move {
                let n: i64 = invocation.args.get(0)?;
                let total = counter.0.fetch_add(n, std::sync::atomic::Ordering::SeqCst) + n;
                Ok(Value::Int(total))
            })
    }

    #[test]
    fn methods_are_listed_without_prefix() {
        assert_eq!(table().methods(), vec!["add", "bump"]);
        assert_eq!(Prefix::View.handler_name("look"), "view_look");
    }

    #[test]
    fn default_tag_is_type_name() {
        struct Point;
        impl Copyable for Point {
            fn state_for(&self, _: Option<&Identity>) -> Value {
                Value::None
            }
        }
        assert!(Point.type_tag().ends_with("Point"));
    }

    #[derive(Debug, Default)]
    struct Tally {
        total: i64,
    }

    #[test]
    fn observer_table_dispatch() {
        let observers = ObserverTable::<Tally>::new().on("add", |tally, args| {
            tally.total += args.get::<i64>(0)?;
            Ok(Value::None)
        });
        let mut tally = Tally::default();
        observers
            .dispatch(&mut tally, "add", crate::args![5])
            .unwrap();
        assert_eq!(tally.total, 5);
        let err = observers
            .dispatch(&mut tally, "remove", Args::new())
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoSuchMethod);
    }
}

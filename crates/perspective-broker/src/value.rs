//! Values passed to and returned from remote methods.

use crate::cache::RemoteCacheHandle;
use crate::error::RemoteError;
use crate::flavor::{AsAny, Cacheable, Copyable, Referenceable, RemoteCopy, Viewable};
use crate::reference::RemoteReference;
use perspective_core::Identity;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value that can cross a connection.
///
/// Values form a tree: plain data nests, and object variants are leaves that
/// the broker serializes according to their flavor.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// Sent as a reference.
    Referenceable(Arc<dyn Referenceable>),
    /// Sent as a reference bound to the sending perspective.
    Viewable(Arc<dyn Viewable>),
    /// Sent as a fresh snapshot.
    Copyable(Arc<dyn Copyable>),
    /// Sent as a snapshot once, then as updates.
    Cacheable(Arc<dyn Cacheable>),
    /// A proxy for an object the peer owns.
    Remote(RemoteReference),
    /// A received snapshot.
    RemoteCopy(Arc<dyn RemoteCopy>),
    /// A mirror of a peer's cacheable.
    RemoteCache(RemoteCacheHandle),
    /// Serialize the inner value as if sent by `Identity`.
    AsPerspective(Identity, Box<Value>),
}

impl Value {
    pub fn reference<T: Referenceable>(object: Arc<T>) -> Self {
        Value::Referenceable(object)
    }

    pub fn viewable<T: Viewable>(object: Arc<T>) -> Self {
        Value::Viewable(object)
    }

    pub fn copyable<T: Copyable>(object: Arc<T>) -> Self {
        Value::Copyable(object)
    }

    pub fn cacheable<T: Cacheable>(object: Arc<T>) -> Self {
        Value::Cacheable(object)
    }

    /// Export whatever `value` contains on behalf of `identity`.
    ///
    /// Login uses this so the avatar's handlers see the logged-in identity.
    pub fn under_perspective(identity: Identity, value: impl Into<Value>) -> Self {
        Value::AsPerspective(identity, Box::new(value.into()))
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Referenceable(_) => "referenceable",
            Value::Viewable(_) => "viewable",
            Value::Copyable(_) => "copyable",
            Value::Cacheable(_) => "cacheable",
            Value::Remote(_) => "remote reference",
            Value::RemoteCopy(_) => "remote copy",
            Value::RemoteCache(_) => "remote cache",
            Value::AsPerspective(_, inner) => inner.kind(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteReference> {
        match self {
            Value::Remote(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, ValueError> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(ValueError::mismatch("bytes", &other)),
        }
    }

    /// The received snapshot, if this is one of type `T`.
    pub fn downcast_copy<T: RemoteCopy>(&self) -> Option<&T> {
        match self {
            Value::RemoteCopy(copy) => <dyn RemoteCopy as AsAny>::as_any(&**copy).downcast_ref(),
            _ => None,
        }
    }

    /// Field `key` of a dict value.
    pub fn field<T: FromValue>(&self, key: &str) -> Result<T, ValueError> {
        match self {
            Value::Dict(fields) => fields
                .get(key)
                .cloned()
                .ok_or_else(|| ValueError::MissingField(key.to_string()))
                .and_then(T::from_value),
            other => Err(ValueError::mismatch("dict", other)),
        }
    }
}

fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl PartialEq for Value {
    /// Plain data compares structurally; objects compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Referenceable(a), Value::Referenceable(b)) => same_object(a, b),
            (Value::Viewable(a), Value::Viewable(b)) => same_object(a, b),
            (Value::Copyable(a), Value::Copyable(b)) => same_object(a, b),
            (Value::Cacheable(a), Value::Cacheable(b)) => same_object(a, b),
            (Value::Remote(a), Value::Remote(b)) => a == b,
            (Value::RemoteCopy(a), Value::RemoteCopy(b)) => same_object(a, b),
            (Value::RemoteCache(a), Value::RemoteCache(b)) => a == b,
            (Value::AsPerspective(p, a), Value::AsPerspective(q, b)) => p == q && a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b:?}"),
            Value::Int(n) => write!(f, "{n:?}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(bytes) => write!(f, "b<{} bytes>", bytes.len()),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(fields) => f.debug_map().entries(fields).finish(),
            Value::Referenceable(o) => write!(f, "<referenceable {:p}>", Arc::as_ptr(o)),
            Value::Viewable(o) => write!(f, "<viewable {:p}>", Arc::as_ptr(o)),
            Value::Copyable(o) => write!(f, "<copyable {}>", o.type_tag()),
            Value::Cacheable(o) => write!(f, "<cacheable {}>", o.type_tag()),
            Value::Remote(r) => write!(f, "{r:?}"),
            Value::RemoteCopy(c) => write!(f, "{c:?}"),
            Value::RemoteCache(c) => write!(f, "{c:?}"),
            Value::AsPerspective(p, inner) => write!(f, "{inner:?} as {p}"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(fields: BTreeMap<String, T>) -> Self {
        Value::Dict(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<RemoteReference> for Value {
    fn from(reference: RemoteReference) -> Self {
        Value::Remote(reference)
    }
}

impl From<RemoteCacheHandle> for Value {
    fn from(handle: RemoteCacheHandle) -> Self {
        Value::RemoteCache(handle)
    }
}

/// A value did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("integer {0} out of range")]
    OutOfRange(i64),
    #[error("missing field {0:?}")]
    MissingField(String),
}

impl ValueError {
    pub fn mismatch(expected: &'static str, found: &Value) -> Self {
        ValueError::Mismatch {
            expected,
            found: found.kind(),
        }
    }
}

/// Conversion out of a received [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ValueError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ValueError::mismatch("bool", &other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(ValueError::mismatch("int", &other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        let n = i64::from_value(value)?;
        i32::try_from(n).map_err(|_| ValueError::OutOfRange(n))
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        let n = i64::from_value(value)?;
        u32::try_from(n).map_err(|_| ValueError::OutOfRange(n))
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        let n = i64::from_value(value)?;
        u64::try_from(n).map_err(|_| ValueError::OutOfRange(n))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Float(x) => Ok(x),
            Value::Int(n) => Ok(n as f64),
            other => Err(ValueError::mismatch("float", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(ValueError::mismatch("str", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(ValueError::mismatch("list", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::None => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Dict(fields) => fields
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => Err(ValueError::mismatch("dict", &other)),
        }
    }
}

impl FromValue for RemoteReference {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Remote(reference) => Ok(reference),
            other => Err(ValueError::mismatch("remote reference", &other)),
        }
    }
}

impl FromValue for RemoteCacheHandle {
    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::RemoteCache(handle) => Ok(handle),
            other => Err(ValueError::mismatch("remote cache", &other)),
        }
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keywords: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(positional: Vec<Value>, keywords: BTreeMap<String, Value>) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<Value>, BTreeMap<String, Value>) {
        (self.positional, self.keywords)
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.positional.push(value.into());
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &BTreeMap<String, Value> {
        &self.keywords
    }

    /// Positional argument `index`, converted.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, RemoteError> {
        let value = self
            .positional
            .get(index)
            .cloned()
            .ok_or_else(|| RemoteError::bad_arguments(format!("missing argument {index}")))?;
        T::from_value(value)
            .map_err(|err| RemoteError::bad_arguments(format!("argument {index}: {err}")))
    }

    /// Positional argument `index` if present.
    pub fn get_opt<T: FromValue>(&self, index: usize) -> Result<Option<T>, RemoteError> {
        if index < self.positional.len() {
            self.get(index).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Keyword argument `name` if present.
    pub fn keyword<T: FromValue>(&self, name: &str) -> Result<Option<T>, RemoteError> {
        match self.keywords.get(name) {
            None => Ok(None),
            Some(value) => T::from_value(value.clone())
                .map(Some)
                .map_err(|err| RemoteError::bad_arguments(format!("argument {name:?}: {err}"))),
        }
    }

    /// Reject anything but `count` positional arguments and the listed keywords.
    pub fn expect(&self, count: usize, keywords: &[&str]) -> Result<(), RemoteError> {
        if self.positional.len() != count {
            return Err(RemoteError::bad_arguments(format!(
                "expected {count} arguments, got {}",
                self.positional.len()
            )));
        }
        if let Some(name) = self.keywords.keys().find(|k| !keywords.contains(&k.as_str())) {
            return Err(RemoteError::bad_arguments(format!(
                "unexpected keyword argument {name:?}"
            )));
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: BTreeMap::new(),
        }
    }
}

impl From<()> for Args {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

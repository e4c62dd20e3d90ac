//! Remote-procedure handlers and the registry plugins add them to.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Boxed unary handler.
pub type UnaryFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Boxed streaming handler.
pub type StreamFn = Arc<dyn Fn(Value) -> BoxStream<'static, Result<Value>> + Send + Sync>;

/// Shape of a handler's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// One request, one reply.
    Unary,
    /// One request, an ordered sequence of replies.
    Streaming,
}

impl HandlerKind {
    /// Name reported by introspection.
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Unary => "unary",
            HandlerKind::Streaming => "streaming",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote procedure, tagged with its reply shape by whoever registers it.
#[derive(Clone)]
pub enum Handler {
    /// Single reply.
    Unary(UnaryFn),
    /// Streamed reply. Each call starts a fresh stream.
    Streaming(StreamFn),
}

impl Handler {
    /// Wrap an async function as a unary handler.
    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Handler::Unary(Arc::new(move |args| f(args).boxed()))
    }

    /// Wrap a stream-producing function as a streaming handler.
    pub fn streaming<F, S>(f: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Handler::Streaming(Arc::new(move |args| f(args).boxed()))
    }

    /// Reply shape.
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Unary(_) => HandlerKind::Unary,
            Handler::Streaming(_) => HandlerKind::Streaming,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Deserialize handler arguments, reporting failures against `method`.
///
/// `null` is treated as an empty object so that argument structs with all
/// fields defaulted accept a bare call.
pub fn parse_args<T: DeserializeOwned>(method: &str, args: Value) -> Result<T> {
    let args = match args {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| Error::invalid_arguments(method, e))
}

/// A method dispatch table.
#[derive(Debug, Clone, Default)]
pub struct Methods {
    handlers: BTreeMap<String, Handler>,
}

impl Methods {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Names are unique.
    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::DuplicateMethod(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder-style [`Methods::insert`].
    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Result<Self> {
        self.insert(name, handler)?;
        Ok(self)
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted method names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Method name to reply shape.
    pub fn kinds(&self) -> BTreeMap<String, HandlerKind> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.clone(), handler.kind()))
            .collect()
    }

    /// Add every handler of `other`, failing on the first name clash.
    ///
    /// Nothing is added when any name clashes.
    pub fn merge(&mut self, other: &Methods) -> Result<()> {
        if let Some(name) = other.handlers.keys().find(|n| self.contains(n)) {
            return Err(Error::DuplicateMethod(name.clone()));
        }
        self.handlers
            .extend(other.handlers.iter().map(|(n, h)| (n.clone(), h.clone())));
        Ok(())
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Table of extension methods, filled at startup and merged onto a process's
/// built-in methods.
#[derive(Debug, Default)]
pub struct Registry {
    methods: Methods,
    loaded: HashSet<String>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> Result<()> {
        let name = name.into();
        tracing::debug!(method = %name, kind = %handler.kind(), "registering method");
        self.methods.insert(name, handler)
    }

    /// Snapshot of the registered handlers.
    pub fn handlers(&self) -> Methods {
        self.methods.clone()
    }

    /// Sorted registered names.
    pub fn names(&self) -> Vec<String> {
        self.methods.names()
    }

    /// Add every registered handler to `methods`.
    pub fn merge_into(&self, methods: &mut Methods) -> Result<()> {
        methods.merge(&self.methods)
    }

    /// Register every handler of `methods`, or none of them on a clash.
    pub(crate) fn register_all(&mut self, methods: &Methods) -> Result<()> {
        self.methods.merge(methods)
    }

    pub(crate) fn is_loaded(&self, source: &str) -> bool {
        self.loaded.contains(source)
    }

    pub(crate) fn mark_loaded(&mut self, source: String) {
        self.loaded.insert(source);
    }
}

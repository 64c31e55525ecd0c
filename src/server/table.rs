//! Dispatch table and service registration.
//!
//! Handlers are registered under explicit string keys. A [`Service`] groups
//! the methods of one named service so they can be registered together:
//! each method lands under `"<service>.<method>"`, and a directly callable
//! service under the bare `"<service>"`.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::handler::{wrap_async, wrap_sync, BoxedHandler};
use crate::protocol::method_key;
use crate::Codec;

fn read_ignore_poison<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    // ---
    match m.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_ignore_poison<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    // ---
    match m.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Mapping from dispatch key to handler.
///
/// Cheap to clone; clones share the same table. Inserting under an existing
/// key replaces the previous handler.
pub(crate) struct DispatchTable<C: Codec> {
    handlers: Arc<RwLock<HashMap<String, BoxedHandler<C>>>>,
}

impl<C: Codec> Clone for DispatchTable<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<C: Codec> DispatchTable<C> {
    // ---
    pub(crate) fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a handler; returns true if it replaced an existing one.
    pub(crate) fn insert(&self, key: String, handler: BoxedHandler<C>) -> bool {
        // ---
        write_ignore_poison(&self.handlers)
            .insert(key, handler)
            .is_some()
    }

    pub(crate) fn get(&self, key: &str) -> Option<BoxedHandler<C>> {
        read_ignore_poison(&self.handlers).get(key).cloned()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        // ---
        let mut keys: Vec<String> = read_ignore_poison(&self.handlers).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A named group of handlers registered together.
///
/// # Example
///
/// ```
/// use amqp_rpc::{MsgPack, Service};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Args {
///     #[serde(rename = "A")]
///     a: i64,
///     #[serde(rename = "B")]
///     b: i64,
/// }
///
/// let service: Service<MsgPack> = Service::new("Test")
///     .method_sync("Mul", |args: Args| Ok::<_, String>(args.a * args.b))
///     .method("Add", |args: Args| async move { Ok::<_, String>(args.a + args.b) });
///
/// assert_eq!(service.keys(), vec!["Test.Add", "Test.Mul"]);
/// ```
pub struct Service<C: Codec> {
    // ---
    name: String,
    entries: Vec<(String, BoxedHandler<C>)>,
}

impl<C: Codec> Service<C> {
    // ---

    /// Start a service with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an async method, registered under `"<service>.<method>"`.
    pub fn method<F, Fut, Req, Resp, E>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        // ---
        let key = method_key(&self.name, method);
        self.entries.push((key, wrap_async(handler)));
        self
    }

    /// Add a synchronous method, registered under `"<service>.<method>"`.
    ///
    /// The function runs on the dispatch task and must not block.
    pub fn method_sync<F, Req, Resp, E>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Req) -> std::result::Result<Resp, E> + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        // ---
        let key = method_key(&self.name, method);
        self.entries.push((key, wrap_sync(handler)));
        self
    }

    /// Make the service itself callable, registered under `"<service>"`.
    pub fn callable<F, Fut, Req, Resp, E>(mut self, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        // ---
        self.entries.push((self.name.clone(), wrap_async(handler)));
        self
    }

    /// Dispatch keys this service registers, sorted.
    pub fn keys(&self) -> Vec<&str> {
        // ---
        let mut keys: Vec<&str> = self.entries.iter().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub(crate) fn into_entries(self) -> Vec<(String, BoxedHandler<C>)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MsgPack;

    #[test]
    fn test_service_keys() {
        // ---
        let service: Service<MsgPack> = Service::new("serv")
            .method_sync("test", |name: String| Ok::<_, String>(format!("hello, {name}")))
            .callable(|n: u32| async move { Ok::<_, String>(n + 1) });

        assert_eq!(service.name(), "serv");
        assert_eq!(service.keys(), vec!["serv", "serv.test"]);
    }

    #[test]
    fn test_insert_replaces() {
        // ---
        let table: DispatchTable<MsgPack> = DispatchTable::new();

        assert!(!table.insert("a.b".into(), wrap_sync(|x: u8| Ok::<_, String>(x))));
        assert!(table.insert("a.b".into(), wrap_sync(|x: u8| Ok::<_, String>(x + 1))));
        assert_eq!(table.keys(), vec!["a.b".to_string()]);

        assert!(table.get("a.b").is_some());
        assert!(table.get("a.c").is_none());
    }
}

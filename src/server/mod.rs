//! RPC server side.
//!
//! A [`ServerCodec`] consumes one named queue, looks up the handler named by
//! each request's reply address, runs it, and publishes the outcome back to
//! the caller's correlation address.
//!
//! # Failure policy
//!
//! Nothing a single request does can stop the consumer loop:
//!
//! - A request without a reply address is logged and dropped; no reply is
//!   sent.
//! - An unknown dispatch key is answered with the remote error
//!   `unknown function <key>`.
//! - Argument decode errors, handler errors and handler panics are answered
//!   with their text as the remote error.
//! - A failed reply publish is logged.
//!
//! # Concurrency
//!
//! Every request is dispatched on its own task, so a handler that suspends
//! does not hold up other calls. Replies may therefore leave in a different
//! order than requests arrived.

mod handler;
mod table;

pub use table::Service;

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use handler::{wrap_async, wrap_sync, BoxedHandler};
use table::DispatchTable;

use crate::protocol::{Outcome, ReplyEnvelope, RequestEnvelope};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
    Codec,
    ConsumerHandle,
    Delivery,
    MsgPack,
    Result,
    TransportPtr,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Server end of an RPC queue.
///
/// Cheap to clone (internally `Arc`-backed). Handlers may be registered
/// before or after requests start arriving.
///
/// # Example
///
/// ```
/// use amqp_rpc::{MemoryHub, MsgPack, RpcConfig, ServerCodec, Service};
///
/// # async fn example() -> amqp_rpc::Result<()> {
/// let transport =
///     amqp_rpc::create_memory_transport_with_hub(&RpcConfig::memory("server"), MemoryHub::new())
///         .await?;
///
/// let server = ServerCodec::bind(transport, "testrpc", MsgPack).await?;
/// server.register(
///     Service::new("Test").method_sync("Hello", |name: String| Ok::<_, String>(format!("hello, {name}"))),
/// );
///
/// server.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerCodec<C: Codec = MsgPack> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for ServerCodec<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Codec> {
    // ---
    transport: TransportPtr,
    queue: String,
    table: DispatchTable<C>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Codec> ServerCodec<C> {
    // ---

    /// Declare `queue`, start consuming it, and return the running server.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the queue cannot be declared or
    /// consumed.
    pub async fn bind(transport: TransportPtr, queue: &str, codec: C) -> Result<Self> {
        // ---
        let queue = transport.declare_queue(queue).await?;
        let consumer = transport.consume(&queue).await?;

        let table = DispatchTable::new();
        let dispatcher = Dispatcher {
            transport: transport.clone(),
            codec,
            table: table.clone(),
        };

        log_info!(
            "[{}] server bound to {queue} ({})",
            transport.transport_id(),
            dispatcher.codec.name()
        );

        let task = tokio::spawn(dispatcher.run(consumer));

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                queue,
                table,
                consumer: Mutex::new(Some(task)),
            }),
        })
    }

    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Register every entry of a service.
    ///
    /// Keys already present are replaced.
    pub fn register(&self, service: Service<C>) {
        // ---
        for (key, handler) in service.into_entries() {
            self.insert(key, handler);
        }
    }

    /// Register one async handler under an explicit dispatch key.
    pub fn register_fn<F, Fut, Req, Resp, E>(&self, key: &str, handler: F)
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(key.to_string(), wrap_async(handler));
    }

    /// Register one synchronous handler under an explicit dispatch key.
    pub fn register_sync<F, Req, Resp, E>(&self, key: &str, handler: F)
    where
        F: Fn(Req) -> std::result::Result<Resp, E> + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(key.to_string(), wrap_sync(handler));
    }

    /// Registered dispatch keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.table.keys()
    }

    fn insert(&self, key: String, handler: BoxedHandler<C>) {
        // ---
        if self.inner.table.insert(key.clone(), handler) {
            log_debug!("[{}] replaced handler {key}", self.inner.transport.transport_id());
        } else {
            log_debug!("[{}] registered handler {key}", self.inner.transport.transport_id());
        }
    }

    /// True until [`close`](Self::close) is called.
    pub fn is_running(&self) -> bool {
        lock_ignore_poison(&self.inner.consumer).is_some()
    }

    /// Stop consuming requests.
    ///
    /// Dispatches already in flight still publish their replies. Closing
    /// twice is a no-op.
    pub async fn close(&self) {
        // ---
        let task = lock_ignore_poison(&self.inner.consumer).take();

        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            log_info!(
                "[{}] server on {} closed",
                self.inner.transport.transport_id(),
                self.inner.queue
            );
        }
    }
}

/// Everything the consumer loop and its dispatch tasks need.
struct Dispatcher<C: Codec> {
    // ---
    transport: TransportPtr,
    codec: C,
    table: DispatchTable<C>,
}

impl<C: Codec> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            codec: self.codec.clone(),
            table: self.table.clone(),
        }
    }
}

impl<C: Codec> Dispatcher<C> {
    // ---

    async fn run(self, mut consumer: ConsumerHandle) {
        // ---
        while let Some(delivery) = consumer.inbox.recv().await {
            if let Err(err) = self.accept(delivery) {
                log_warn!(
                    "[{}] dropped request on {}: {err}",
                    self.transport.transport_id(),
                    consumer.queue
                );
            }
        }

        log_debug!(
            "[{}] request consumer on {} stopped",
            self.transport.transport_id(),
            consumer.queue
        );
    }

    /// Validate a delivery and hand it to its own dispatch task.
    fn accept(&self, delivery: Delivery) -> Result<()> {
        // ---
        let request = RequestEnvelope::from_delivery(delivery)?;

        let this = self.clone();
        tokio::spawn(async move { this.dispatch(request).await });

        Ok(())
    }

    async fn dispatch(self, request: RequestEnvelope) {
        // ---
        let outcome = self.invoke(&request).await;

        if let Outcome::Failure(ref message) = outcome {
            log_debug!(
                "[{}] {} (id {:?}) failed: {message}",
                self.transport.transport_id(),
                request.reply_address,
                request.message_id
            );
        }

        let reply = ReplyEnvelope::answer(&request, outcome);

        match reply.publish(self.transport.as_ref()).await {
            Ok(()) => log_trace!(
                "[{}] replied to {} (id {:?})",
                self.transport.transport_id(),
                reply.correlation_address,
                reply.message_id
            ),
            Err(err) => log_error!(
                "[{}] failed to publish reply to {}: {err}",
                self.transport.transport_id(),
                reply.correlation_address
            ),
        }
    }

    async fn invoke(&self, request: &RequestEnvelope) -> Outcome {
        // ---
        let Some(handler) = self.table.get(&request.reply_address) else {
            return Outcome::Failure(unknown_function(&request.reply_address));
        };

        let codec = self.codec.clone();
        let payload = request.payload.clone();

        // Run the handler on its own task so a panic becomes a reply.
        match tokio::spawn(async move { handler.call(&codec, payload).await }).await {
            Ok(result) => Outcome::from_result(result),
            Err(join_err) => Outcome::Failure(panic_message(join_err)),
        }
    }
}

fn unknown_function(key: &str) -> String {
    format!("unknown function {key}")
}

fn panic_message(err: tokio::task::JoinError) -> String {
    // ---
    if !err.is_panic() {
        return "handler cancelled".to_string();
    }

    let payload = err.into_panic();
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    format!("handler panicked: {text}")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_unknown_function_text() {
        // ---
        assert_eq!(unknown_function("Test.Div"), "unknown function Test.Div");
    }

    #[tokio::test]
    async fn test_panic_message() {
        // ---
        let err = tokio::spawn(async { panic!("kaboom") }).await.unwrap_err();
        assert_eq!(panic_message(err), "handler panicked: kaboom");

        let err = tokio::spawn(async { panic!("{} {}", "formatted", 1) })
            .await
            .unwrap_err();
        assert_eq!(panic_message(err), "handler panicked: formatted 1");
    }
}

// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains [`ClientCodec`], which publishes calls to a server
//! queue and matches the replies arriving on its private reply queue.
//!
//! # Architecture
//!
//! Binding declares a broker-named exclusive queue and runs a background
//! receive loop on it. Each call allocates a [`PendingCall`] from the
//! [`CorrelationRegistry`], publishes the request with the call id as
//! message id, and waits on the pending call's one-shot channel. The receive
//! loop parses the message id of every reply and resolves the matching
//! entry.
//!
//! # Timeouts
//!
//! A call that sees no reply within its timeout is evicted from the
//! registry and fails with [`RpcError::Timeout`]. A reply arriving later
//! finds no entry and is discarded, so sustained timeouts never grow the
//! registry.
//!
//! # Concurrency
//!
//! Any number of calls may be in flight. Replies can arrive in any order;
//! matching is by identifier only.

mod pending;

pub use pending::{CorrelationRegistry, PendingCall};

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;

use crate::protocol::{method_key, CallId, Outcome, ReplyEnvelope, RequestEnvelope};
use crate::{
    // ---
    log_debug,
    log_info,
    log_trace,
    log_warn,
    Codec,
    ConsumerHandle,
    Delivery,
    MsgPack,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Client end of an RPC queue.
///
/// Cheap to clone (internally `Arc`-backed); clones share the reply queue
/// and the registry.
///
/// # Example
///
/// ```
/// use amqp_rpc::{ClientCodec, MemoryHub, MsgPack, RpcConfig, ServerCodec, Service};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Args {
///     #[serde(rename = "A")]
///     a: i64,
///     #[serde(rename = "B")]
///     b: i64,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> amqp_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// let config = RpcConfig::memory("example");
/// let transport = amqp_rpc::create_memory_transport_with_hub(&config, hub).await?;
///
/// let server = ServerCodec::bind(transport.clone(), "testrpc", MsgPack).await?;
/// server.register(Service::new("Test").method_sync("Mul", |args: Args| Ok::<_, String>(args.a * args.b)));
///
/// let codec = ClientCodec::bind(transport, "testrpc", MsgPack, &config).await?;
/// let product: i64 = codec.client("Test").call("Mul", &Args { a: 6, b: 7 }).await?;
/// assert_eq!(product, 42);
/// # Ok(())
/// # }
/// ```
pub struct ClientCodec<C: Codec = MsgPack> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for ClientCodec<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Codec> {
    // ---
    transport: TransportPtr,
    routing_key: String,
    reply_queue: String,
    codec: C,
    registry: CorrelationRegistry,
    request_timeout: Duration,

    /// Receive loop; `None` once closed.
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Codec> ClientCodec<C> {
    // ---

    /// Declare a private reply queue, start consuming it, and return a
    /// client that publishes calls to the server queue `routing_key`.
    ///
    /// Calls wait up to `config.request_timeout` for their reply.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the reply queue cannot be declared
    /// or consumed.
    pub async fn bind(
        transport: TransportPtr,
        routing_key: &str,
        codec: C,
        config: &RpcConfig,
    ) -> Result<Self> {
        // ---
        let reply_queue = transport.declare_queue("").await?;
        let consumer = transport.consume(&reply_queue).await?;

        log_info!(
            "[{}] client for {routing_key} bound to {reply_queue} ({})",
            transport.transport_id(),
            codec.name()
        );

        // The receive loop holds only a weak reference; dropping the last
        // handle runs `Drop for Inner`, which stops it.
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<C>>| {
            let task = tokio::spawn(receive_loop(weak.clone(), consumer));

            Inner {
                transport,
                routing_key: routing_key.to_string(),
                reply_queue,
                codec,
                registry: CorrelationRegistry::new(),
                request_timeout: config.request_timeout,
                consumer: Mutex::new(Some(task)),
            }
        });

        Ok(Self { inner })
    }

    /// A handle bound to one remote service.
    pub fn client(&self, service: impl Into<String>) -> ServiceClient<C> {
        // ---
        ServiceClient {
            codec: self.clone(),
            service: service.into(),
        }
    }

    /// Call `service.method` with one argument, using the configured timeout.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] if the server reports a failure; the message is
    ///   the server's text, e.g. `unknown function Test.Div`.
    /// - [`RpcError::Timeout`] if no reply arrives in time.
    /// - [`RpcError::Closed`] if the codec is or gets closed.
    /// - Codec and transport errors as they occur.
    pub async fn invoke<Req, Resp>(&self, service: &str, method: &str, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        // ---
        self.invoke_with_timeout(service, method, args, self.inner.request_timeout)
            .await
    }

    /// Same as [`invoke`](Self::invoke) with an explicit timeout.
    pub async fn invoke_with_timeout<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        args: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        // ---
        self.call_key(&method_key(service, method), args, timeout)
            .await
    }

    /// Call a handler by its full dispatch key.
    pub async fn call_key<Req, Resp>(&self, key: &str, args: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        // ---
        if !self.is_running() {
            return Err(RpcError::Closed);
        }

        let inner = &self.inner;

        // Encode before allocating so a bad argument leaves no entry behind.
        let payload = inner.codec.encode(args)?;

        let pending = inner.registry.next();
        let id = pending.id();

        // Lost a race with `close`, which may already have cleared the registry.
        if !self.is_running() {
            inner.registry.evict(id);
            return Err(RpcError::Closed);
        }

        let request = RequestEnvelope {
            correlation_address: inner.reply_queue.clone(),
            reply_address: key.to_string(),
            message_id: Some(id.to_string()),
            payload,
            content_type: Some(inner.codec.content_type().to_string()),
        };

        if let Err(err) = request
            .publish(inner.transport.as_ref(), &inner.routing_key)
            .await
        {
            inner.registry.evict(id);
            return Err(err);
        }

        log_trace!("[{}] call {id} -> {key}", inner.transport.transport_id());

        let outcome = match time::timeout(timeout, pending.wait()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Err(RpcError::Closed),
            Err(_elapsed) => {
                inner.registry.evict(id);
                log_debug!(
                    "[{}] call {id} -> {key} timed out after {timeout:?}",
                    inner.transport.transport_id()
                );
                return Err(RpcError::Timeout { id, after: timeout });
            }
        };

        match outcome {
            Outcome::Success(payload) => inner.codec.decode(&payload),
            Outcome::Failure(message) => Err(RpcError::Remote(message)),
        }
    }

    /// Server queue calls are published to.
    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// Broker-assigned name of the private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Number of calls waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    /// True until [`close`](Self::close) is called.
    pub fn is_running(&self) -> bool {
        lock_ignore_poison(&self.inner.consumer).is_some()
    }

    /// Stop receiving replies.
    ///
    /// Calls still waiting fail with [`RpcError::Closed`], as do calls made
    /// afterwards. Closing twice is a no-op.
    pub async fn close(&self) {
        // ---
        let task = lock_ignore_poison(&self.inner.consumer).take();

        if let Some(task) = task {
            task.abort();
            let _ = task.await;

            let abandoned = self.inner.registry.clear();
            log_info!(
                "[{}] client on {} closed, {abandoned} pending call(s) abandoned",
                self.inner.transport.transport_id(),
                self.inner.reply_queue
            );
        }
    }
}

/// Resolve replies against the registry until the queue or the client goes away.
async fn receive_loop<C: Codec>(inner: Weak<Inner<C>>, mut consumer: ConsumerHandle) {
    // ---
    while let Some(delivery) = consumer.inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if let Err(err) = inner.handle_reply(delivery) {
            log_warn!(
                "[{}] discarded reply on {}: {err}",
                inner.transport.transport_id(),
                consumer.queue
            );
        }
    }

    log_debug!("reply consumer on {} stopped", consumer.queue);
}

impl<C: Codec> Drop for Inner<C> {
    fn drop(&mut self) {
        // ---
        let task = match self.consumer.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(task) = task {
            task.abort();
        }
    }
}

impl<C: Codec> Inner<C> {
    // ---

    fn handle_reply(&self, delivery: Delivery) -> Result<()> {
        // ---
        let reply = ReplyEnvelope::from_delivery(delivery);

        let id: CallId = reply
            .message_id
            .as_deref()
            .ok_or(RpcError::MissingMessageId)?
            .parse()?;

        // A miss is a duplicate, or a reply for a call that already gave up.
        if !self.registry.resolve(id, reply.outcome()) {
            log_debug!(
                "[{}] no pending call {id}, reply dropped",
                self.transport.transport_id()
            );
        }

        Ok(())
    }
}

/// A client bound to one remote service name.
///
/// Method calls are sent as `"<service>.<method>"`.
pub struct ServiceClient<C: Codec = MsgPack> {
    // ---
    codec: ClientCodec<C>,
    service: String,
}

impl<C: Codec> Clone for ServiceClient<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            service: self.service.clone(),
        }
    }
}

impl<C: Codec> ServiceClient<C> {
    // ---

    /// Remote service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call a method of the service.
    ///
    /// See [`ClientCodec::invoke`] for the errors.
    pub async fn call<Req, Resp>(&self, method: &str, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.codec.invoke(&self.service, method, args).await
    }

    /// Call a method with an explicit timeout.
    pub async fn call_with_timeout<Req, Resp>(
        &self,
        method: &str,
        args: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.codec
            .invoke_with_timeout(&self.service, method, args, timeout)
            .await
    }

    /// Call the service itself, for services registered as callable.
    pub async fn call_direct<Req, Resp>(&self, args: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.codec
            .call_key(&self.service, args, self.codec.inner.request_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, MemoryHub, Properties, ERROR_HEADER};
    use bytes::Bytes;

    async fn client(timeout: Duration) -> (TransportPtr, ClientCodec<MsgPack>) {
        let config = RpcConfig::memory("client-unit").with_request_timeout(timeout);
        let transport = create_memory_transport_with_hub(&config, MemoryHub::new())
            .await
            .unwrap();
        transport.declare_queue("svc").await.unwrap();
        let codec = ClientCodec::bind(transport.clone(), "svc", MsgPack, &config)
            .await
            .unwrap();
        (transport, codec)
    }

    fn reply(codec: &ClientCodec<MsgPack>, message_id: Option<&str>, props: Properties) -> Delivery {
        Delivery {
            exchange: String::new(),
            routing_key: codec.reply_queue().to_string(),
            payload: MsgPack.encode(&7_u32).unwrap(),
            properties: Properties {
                message_id: message_id.map(str::to_string),
                ..props
            },
        }
    }

    #[tokio::test]
    async fn test_reply_with_bad_message_id_is_rejected() {
        // ---
        let (_t, codec) = client(Duration::from_secs(1)).await;

        let err = codec
            .inner
            .handle_reply(reply(&codec, None, Properties::default()))
            .unwrap_err();
        assert!(matches!(err, RpcError::MissingMessageId));

        let err = codec
            .inner
            .handle_reply(reply(&codec, Some("seven"), Properties::default()))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidMessageId(_)));
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_not_an_error() {
        // ---
        let (_t, codec) = client(Duration::from_secs(1)).await;
        codec
            .inner
            .handle_reply(reply(&codec, Some("12345"), Properties::default()))
            .unwrap();
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_call() {
        // ---
        let (transport, codec) = client(Duration::from_secs(5)).await;
        let mut requests = transport.consume("svc").await.unwrap();

        let caller = codec.clone();
        let call = tokio::spawn(async move { caller.invoke::<_, u32>("Svc", "get", &()).await });

        let request = requests.inbox.recv().await.unwrap();
        assert_eq!(request.properties.reply_to.as_deref(), Some("Svc.get"));
        assert_eq!(
            request.properties.correlation_id.as_deref(),
            Some(codec.reply_queue())
        );
        assert_eq!(request.properties.message_id.as_deref(), Some("1"));

        codec
            .inner
            .handle_reply(reply(&codec, Some("1"), Properties::default()))
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), 7);
        assert_eq!(codec.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_payload_is_not_decoded() {
        // ---
        let (transport, codec) = client(Duration::from_secs(5)).await;
        let mut requests = transport.consume("svc").await.unwrap();

        let caller = codec.clone();
        let call = tokio::spawn(async move { caller.invoke::<_, u32>("Svc", "get", &()).await });
        let _ = requests.inbox.recv().await.unwrap();

        let mut delivery = reply(
            &codec,
            Some("1"),
            Properties::default().with_header(ERROR_HEADER, "boom"),
        );
        delivery.payload = Bytes::from_static(b"\xc1 not msgpack");
        codec.inner.handle_reply(delivery).unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.remote_message(), Some("boom"));
    }

    #[tokio::test]
    async fn test_timeout_evicts_entry() {
        // ---
        let (_t, codec) = client(Duration::from_millis(50)).await;

        let err = codec.invoke::<_, u32>("Svc", "get", &()).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(matches!(err, RpcError::Timeout { id, .. } if id == CallId::new(1)));
        assert_eq!(codec.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiting_and_later_calls() {
        // ---
        let (_t, codec) = client(Duration::from_secs(5)).await;

        let caller = codec.clone();
        let call = tokio::spawn(async move { caller.invoke::<_, u32>("Svc", "get", &()).await });

        while codec.pending() == 0 {
            tokio::task::yield_now().await;
        }

        codec.close().await;
        assert!(!codec.is_running());
        assert!(matches!(call.await.unwrap(), Err(RpcError::Closed)));
        assert!(matches!(
            codec.invoke::<_, u32>("Svc", "get", &()).await,
            Err(RpcError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_detaches_reply_consumer() {
        // ---
        let hub = MemoryHub::new();
        let config = RpcConfig::memory("client-drop");
        let transport = create_memory_transport_with_hub(&config, hub.clone())
            .await
            .unwrap();

        let codec = ClientCodec::bind(transport.clone(), "svc", MsgPack, &config)
            .await
            .unwrap();
        let reply_queue = codec.reply_queue().to_string();
        let clone = codec.clone();

        drop(codec);
        drop(clone);
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport
            .publish("", &reply_queue, Bytes::from_static(b"late"), Properties::default())
            .await
            .unwrap();

        assert_eq!(hub.backlog_len(&reply_queue), 1);
    }
}

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended for tests, local execution, and as the
//! reference for the queue semantics the RPC layer relies on.
//!
//! ## Reference Semantics
//!
//! The hub behaves like a broker with only the default exchange:
//!
//! - Queues must be declared before they can be consumed. Declaring an empty
//!   name creates a queue named `amq.gen-<uuid>` that only the declaring
//!   transport may consume.
//! - Publishing routes to the queue named by the routing key. Messages for
//!   an undeclared queue are dropped, as the default exchange does.
//! - A declared queue with no consumer keeps messages until one attaches.
//! - A queue with several consumers hands each message to exactly one of
//!   them, round-robin.
//! - Closing a transport detaches its consumers and deletes its exclusive
//!   queues.
//! - Ownership belongs to the transport instance. Two transports created
//!   with the same `transport_id` are still distinct owners.
//!
//! ## Non-Goals
//!
//! This transport does not emulate persistence, acknowledgements, or any
//! network failure mode.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_trace,
    ConsumerHandle,
    Delivery,
    Properties,
    Result,
    RpcConfig,
    RpcError,
    Transport,
    TransportPtr,
};

/// Minimum capacity of a consumer inbox.
const INBOX_CAPACITY: usize = 64;

/// Prefix of broker-assigned queue names.
const GENERATED_PREFIX: &str = "amq.gen-";

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Consumer {
    // ---
    owner: u64,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    // ---
    /// Transport allowed to consume this queue, for exclusive queues.
    exclusive_owner: Option<u64>,
    consumers: Vec<Consumer>,
    cursor: usize,
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    /// Pick the next live consumer, round-robin.
    fn next_consumer(&mut self) -> Option<mpsc::Sender<Delivery>> {
        // ---
        self.consumers.retain(|c| !c.tx.is_closed());
        if self.consumers.is_empty() {
            return None;
        }
        let idx = self.cursor % self.consumers.len();
        self.cursor = self.cursor.wrapping_add(1);
        Some(self.consumers[idx].tx.clone())
    }
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All `MemoryTransport`
/// instances that share a `MemoryHub` see the same queues, exactly as
/// clients connected to one broker would.
///
/// # Usage in Integration Tests
///
/// For tests that need isolation from each other, construct a hub
/// explicitly and pass it to [`create_memory_transport_with_hub`]:
///
/// ```
/// # use amqp_rpc::{MemoryHub, RpcConfig};
/// # async fn example() -> amqp_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let server = amqp_rpc::create_memory_transport_with_hub(&RpcConfig::memory("server"), hub.clone()).await?;
/// let client = amqp_rpc::create_memory_transport_with_hub(&RpcConfig::memory("client"), hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    queues: Mutex<HashMap<String, QueueState>>,

    /// Source of per-transport owner tokens.
    next_owner: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Number of declared queues.
    pub fn queue_count(&self) -> usize {
        lock_ignore_poison(&self.queues).len()
    }

    /// Number of messages waiting in `queue` for a consumer.
    pub fn backlog_len(&self, queue: &str) -> usize {
        // ---
        lock_ignore_poison(&self.queues)
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    fn register_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    fn declare_queue(&self, owner: u64, transport_id: &str, name: &str) -> Result<String> {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);

        if name.is_empty() {
            let name = format!("{GENERATED_PREFIX}{}", uuid::Uuid::new_v4().simple());
            queues.insert(
                name.clone(),
                QueueState {
                    exclusive_owner: Some(owner),
                    ..QueueState::default()
                },
            );
            log_debug!("{transport_id}: declared exclusive queue {name}");
            return Ok(name);
        }

        let queue = queues.entry(name.to_string()).or_default();
        match queue.exclusive_owner {
            Some(holder) if holder != owner => Err(RpcError::Transport(format!(
                "queue {name} is exclusive to another connection"
            ))),
            _ => {
                log_debug!("{transport_id}: declared queue {name}");
                Ok(name.to_string())
            }
        }
    }

    fn consume(&self, owner: u64, transport_id: &str, name: &str) -> Result<ConsumerHandle> {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);

        let queue = queues
            .get_mut(name)
            .ok_or_else(|| RpcError::Transport(format!("no queue {name}")))?;

        if let Some(holder) = queue.exclusive_owner {
            if holder != owner {
                return Err(RpcError::Transport(format!(
                    "queue {name} is exclusive to another connection"
                )));
            }
        }

        // Sized so the backlog always fits the fresh inbox.
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY.max(queue.backlog.len()));
        for delivery in queue.backlog.drain(..) {
            let _ = tx.try_send(delivery);
        }

        queue.consumers.push(Consumer {
            owner,
            tx,
        });

        log_debug!("{transport_id}: consuming {name}");

        Ok(ConsumerHandle {
            queue: name.to_string(),
            inbox: rx,
        })
    }

    async fn publish(&self, transport_id: &str, mut delivery: Delivery) -> Result<()> {
        // ---
        if !delivery.exchange.is_empty() {
            return Err(RpcError::UnsupportedExchange(delivery.exchange));
        }

        loop {
            let tx = {
                let mut queues = lock_ignore_poison(&self.queues);

                let Some(queue) = queues.get_mut(&delivery.routing_key) else {
                    log_debug!(
                        "{transport_id}: no queue {}, message dropped",
                        delivery.routing_key
                    );
                    return Ok(());
                };

                match queue.next_consumer() {
                    Some(tx) => tx,
                    None => {
                        log_trace!("{transport_id}: queued for {}", delivery.routing_key);
                        queue.backlog.push_back(delivery);
                        return Ok(());
                    }
                }
            };

            // Send outside the lock; a consumer that went away since it was
            // picked hands the message back for the next one.
            match tx.send(delivery).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => delivery = returned,
            }
        }
    }

    fn close(&self, owner: u64, transport_id: &str) {
        // ---
        log_debug!("{transport_id}: closing transport...");

        let mut queues = lock_ignore_poison(&self.queues);

        queues.retain(|_, q| q.exclusive_owner != Some(owner));
        for queue in queues.values_mut() {
            queue.consumers.retain(|c| c.owner != owner);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            queues: Mutex::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,

    /// Hub-unique identity; `transport_id` is only a label.
    owner: u64,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, name: &str) -> Result<String> {
        self.hub.declare_queue(self.owner, &self.transport_id, name)
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerHandle> {
        self.hub.consume(self.owner, &self.transport_id, queue)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: Properties,
    ) -> Result<()> {
        // ---
        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties,
        };
        self.hub.publish(&self.transport_id, delivery).await
    }

    /// Detach this transport's consumers and delete its exclusive queues.
    ///
    /// Other transports on the same hub are unaffected.
    async fn close(&self) -> Result<()> {
        self.hub.close(self.owner, &self.transport_id);
        Ok(())
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// All transports created with this function share a single message bus.
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Never fails; the `Result` matches the broker constructors.
pub async fn create_memory_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport using the provided hub.
///
/// # Errors
///
/// Never fails; the `Result` matches the broker constructors.
pub async fn create_memory_transport_with_hub(
    config: &RpcConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.transport_id);

    Ok(Arc::new(MemoryTransport {
        transport_id: config.transport_id.clone(),
        owner: hub.register_owner(),
        hub,
    }))
}

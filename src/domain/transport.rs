// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the message-channel contract the client and server
//! codecs are written against. It mirrors the small subset of AMQP 0-9-1 the
//! RPC layer needs: declare a queue, consume it, publish to an exchange with
//! a routing key and a set of basic properties.
//!
//! The transport is responsible only for delivery. Correlation, dispatch,
//! timeouts and payload encoding are handled by the layers above.
//!
//! Concrete implementations live under `src/transport/`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Application headers attached to a message.
///
/// Only string values are carried; the RPC layer uses the `error` key.
pub type Headers = BTreeMap<String, String>;

/// Basic message properties, named after their AMQP counterparts.
///
/// The RPC layer maps its envelopes onto these fields as follows:
///
/// | property         | request                      | reply                   |
/// |------------------|------------------------------|-------------------------|
/// | `correlation_id` | reply queue of the caller    | copied from request     |
/// | `reply_to`       | dispatch key (`Svc.method`)  | copied from request     |
/// | `message_id`     | call identifier              | copied from request     |
/// | `headers.error`  | -                            | present on failure only |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    // ---
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub headers: Option<Headers>,
}

impl Properties {
    /// Look up a single header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        // ---
        self.headers
            .as_ref()
            .and_then(|h| h.get(key))
            .map(String::as_str)
    }

    /// Set a header, creating the header table if needed.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        // ---
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    // ---
    /// Exchange the message was published to (`""` is the default exchange).
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Basic properties as published.
    pub properties: Properties,
}

/// Handle returned from a successful `consume`.
///
/// Deliveries are acknowledged automatically by the transport. The inbox
/// yields `None` once the transport closes or stops consuming the queue.
pub struct ConsumerHandle {
    // ---
    /// Queue being consumed.
    pub queue: String,

    /// Receiver for delivered messages.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Message-channel abstraction.
///
/// Implementations must ensure that:
/// - `declare_queue("")` creates a private queue with a broker-assigned name
///   and returns that name.
/// - Once `consume()` returns, messages routed to the queue are delivered to
///   the returned inbox. A queue with several consumers hands each message to
///   exactly one of them.
/// - `publish()` with the default exchange (`""`) routes to the queue named
///   by the routing key.
///
/// No assumptions are made about ordering across queues, durability or
/// retries.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Declare a queue and return its name.
    ///
    /// An empty name asks the broker for an exclusive, private queue.
    async fn declare_queue(&self, name: &str) -> Result<String>;

    /// Start consuming a declared queue with automatic acknowledgement.
    async fn consume(&self, queue: &str) -> Result<ConsumerHandle>;

    /// Publish a payload.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: Properties,
    ) -> Result<()>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// Cloning is cheap and all clones share the same underlying connection.
pub type TransportPtr = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_header_lookup() {
        // ---
        let props = Properties::default();
        assert_eq!(props.header("error"), None);

        let props = props.with_header("error", "boom");
        assert_eq!(props.header("error"), Some("boom"));
        assert_eq!(props.header("other"), None);
    }
}

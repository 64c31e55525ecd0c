//! Request and reply envelopes.
//!
//! Envelopes are the RPC view of a message: they name the fields the client
//! and server agree on and translate them to and from transport
//! [`Properties`]. Payload bytes are already encoded by the codec and are
//! never inspected here.

use bytes::Bytes;

use crate::{
    // ---
    Delivery,
    Properties,
    Result,
    RpcError,
    Transport,
};

/// Header key carrying the remote error text on failed replies.
pub const ERROR_HEADER: &str = "error";

/// All messages go through the broker's default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Build the dispatch key for a method of a service.
pub fn method_key(service: &str, method: &str) -> String {
    // ---
    format!("{service}.{method}")
}

/// Result of one call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Encoded result payload.
    Success(Bytes),

    /// Remote error text.
    Failure(String),
}

impl Outcome {
    /// Convert a handler result into an outcome.
    pub fn from_result(result: std::result::Result<Bytes, String>) -> Self {
        // ---
        match result {
            Ok(payload) => Outcome::Success(payload),
            Err(message) => Outcome::Failure(message),
        }
    }
}

/// A call on its way to a server.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    // ---
    /// Queue the reply must be published to.
    pub correlation_address: String,

    /// Dispatch key of the method to invoke.
    pub reply_address: String,

    /// Call identifier, carried as a string.
    pub message_id: Option<String>,

    /// Encoded argument.
    pub payload: Bytes,

    /// Informational content type of the payload.
    pub content_type: Option<String>,
}

impl RequestEnvelope {
    // ---

    /// Extract a request from a delivered message.
    ///
    /// # Errors
    ///
    /// - [`RpcError::MissingReplyAddress`] if `reply_to` is absent; there is
    ///   nothing to dispatch to.
    /// - [`RpcError::MissingCorrelationAddress`] if `correlation_id` is
    ///   absent; there is nowhere to send the reply.
    pub fn from_delivery(delivery: Delivery) -> Result<Self> {
        // ---
        let Delivery {
            payload,
            properties,
            ..
        } = delivery;

        let reply_address = properties
            .reply_to
            .ok_or(RpcError::MissingReplyAddress)?;
        let correlation_address = properties
            .correlation_id
            .ok_or(RpcError::MissingCorrelationAddress)?;

        Ok(Self {
            correlation_address,
            reply_address,
            message_id: properties.message_id,
            payload,
            content_type: properties.content_type,
        })
    }

    /// Transport properties for this request.
    pub fn properties(&self) -> Properties {
        // ---
        Properties {
            correlation_id: Some(self.correlation_address.clone()),
            message_id: self.message_id.clone(),
            reply_to: Some(self.reply_address.clone()),
            content_type: self.content_type.clone(),
            headers: None,
        }
    }

    /// Publish the request to the server queue `routing_key`.
    pub async fn publish(&self, transport: &dyn Transport, routing_key: &str) -> Result<()> {
        // ---
        transport
            .publish(
                DEFAULT_EXCHANGE,
                routing_key,
                self.payload.clone(),
                self.properties(),
            )
            .await
    }
}

/// A reply on its way back to a caller.
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    // ---
    /// Copied verbatim from the request; also the routing key of the reply.
    pub correlation_address: String,

    /// Copied verbatim from the request.
    pub message_id: Option<String>,

    /// Copied from the request for peers that log it.
    pub reply_address: Option<String>,

    /// Error text; present only on failure.
    pub error: Option<String>,

    /// Encoded result; empty on failure.
    pub payload: Bytes,

    /// Informational content type of the payload.
    pub content_type: Option<String>,
}

impl ReplyEnvelope {
    // ---

    /// Build the reply to `request` carrying `outcome`.
    pub fn answer(request: &RequestEnvelope, outcome: Outcome) -> Self {
        // ---
        let (payload, error) = match outcome {
            Outcome::Success(payload) => (payload, None),
            Outcome::Failure(message) => (Bytes::new(), Some(message)),
        };

        Self {
            correlation_address: request.correlation_address.clone(),
            message_id: request.message_id.clone(),
            reply_address: Some(request.reply_address.clone()),
            error,
            payload,
            content_type: request.content_type.clone(),
        }
    }

    /// Extract a reply from a delivered message.
    ///
    /// The correlation address falls back to the routing key when the
    /// property is missing.
    pub fn from_delivery(delivery: Delivery) -> Self {
        // ---
        let Delivery {
            routing_key,
            payload,
            properties,
            ..
        } = delivery;

        let error = properties.header(ERROR_HEADER).map(str::to_string);

        Self {
            correlation_address: properties.correlation_id.unwrap_or(routing_key),
            message_id: properties.message_id,
            reply_address: properties.reply_to,
            error,
            payload,
            content_type: properties.content_type,
        }
    }

    /// The call outcome this reply carries.
    ///
    /// An error indicator wins over any payload.
    pub fn outcome(self) -> Outcome {
        // ---
        match self.error {
            Some(message) => Outcome::Failure(message),
            None => Outcome::Success(self.payload),
        }
    }

    /// Transport properties for this reply.
    pub fn properties(&self) -> Properties {
        // ---
        let props = Properties {
            correlation_id: Some(self.correlation_address.clone()),
            message_id: self.message_id.clone(),
            reply_to: self.reply_address.clone(),
            content_type: self.content_type.clone(),
            headers: None,
        };

        match &self.error {
            Some(message) => props.with_header(ERROR_HEADER, message.clone()),
            None => props,
        }
    }

    /// Publish the reply to the caller's queue.
    pub async fn publish(&self, transport: &dyn Transport) -> Result<()> {
        // ---
        transport
            .publish(
                DEFAULT_EXCHANGE,
                &self.correlation_address,
                self.payload.clone(),
                self.properties(),
            )
            .await
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::CallId;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// No reply was observed for the call within the allowed duration.
    #[error("call {id} timed out after {after:?}")]
    Timeout { id: CallId, after: Duration },

    /// The remote handler failed, or the method is unknown to the server.
    ///
    /// The message is the server-side error text, verbatim.
    #[error("remote error: {0}")]
    Remote(String),

    /// The codec was closed while the call was pending, or before it was issued.
    #[error("codec closed")]
    Closed,

    /// A value could not be encoded by the named codec.
    #[error("{codec} encode failed: {reason}")]
    Encode { codec: &'static str, reason: String },

    /// A payload could not be decoded by the named codec.
    #[error("{codec} decode failed: {reason}")]
    Decode { codec: &'static str, reason: String },

    /// Request arrived without a reply address (dispatch key).
    #[error("request has no reply address")]
    MissingReplyAddress,

    /// Request arrived without a correlation address (reply queue).
    #[error("request has no correlation address")]
    MissingCorrelationAddress,

    /// Reply arrived without a message identifier.
    #[error("reply has no message id")]
    MissingMessageId,

    /// Reply carried a message identifier that is not a call id.
    #[error("invalid message id: {0:?}")]
    InvalidMessageId(String),

    /// Error reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport only routes through the default exchange.
    #[error("unsupported exchange: {0:?}")]
    UnsupportedExchange(String),

    /// Required configuration is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),
}

impl RpcError {
    /// True if the error was produced by the remote side.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// True if the call gave up waiting for a reply.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// The remote error text, if this is a remote error.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            RpcError::Remote(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

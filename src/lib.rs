//! Request/response RPC over an AMQP message broker.
//!
//! A server consumes a named queue; a client publishes calls to that queue
//! and receives replies on a private, broker-named reply queue. Replies are
//! matched to calls by a per-client call identifier carried as the message
//! id, so any number of calls may be in flight on one client.
//!
//! Payloads are encoded with a pluggable [`Codec`] ([`MsgPack`] by default,
//! or [`Json`]). The broker sits behind the [`Transport`] trait: an
//! in-process transport is always available, and the `transport_lapin`
//! feature adds a real AMQP 0-9-1 transport.
//!

// Import all sub modules once...
mod client;
mod codec;
mod config;
mod domain;
mod error;
mod macros;
mod protocol;
mod server;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use client::{ClientCodec, CorrelationRegistry, PendingCall, ServiceClient};
pub use server::{ServerCodec, Service};

pub use codec::{Codec, Json, MsgPack};
pub use config::{RpcConfig, DEFAULT_REQUEST_TIMEOUT, ENV_TIMEOUT_MS, ENV_URI};
pub use error::{Result, RpcError};

pub use protocol::{
    //
    method_key,
    CallId,
    Outcome,
    ReplyEnvelope,
    RequestEnvelope,
    DEFAULT_EXCHANGE,
    ERROR_HEADER,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    ConsumerHandle,
    Delivery,
    Headers,
    Properties,
    Transport,
    TransportPtr,
};

//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker transports are hidden behind feature flags and
//! exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

use crate::{Result, RpcConfig, TransportPtr};

/// Create the transport named by `config`.
///
/// `amqp://` and `amqps://` URIs select the lapin transport; anything else
/// (including no URI) selects the in-memory transport on the process-global
/// hub.
///
/// # Errors
///
/// Returns [`RpcError::Transport`](crate::RpcError::Transport) if the broker
/// cannot be reached, or if an AMQP URI is given while the
/// `transport_lapin` feature is disabled.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    if config.is_amqp() {
        #[cfg(feature = "transport_lapin")]
        {
            return create_lapin_transport(config).await;
        }

        #[cfg(not(feature = "transport_lapin"))]
        {
            return Err(crate::RpcError::Transport(
                "AMQP URI given but the transport_lapin feature is disabled".into(),
            ));
        }
    }

    create_memory_transport(config).await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_default_is_memory() {
        // ---
        let transport = create_transport(&RpcConfig::memory("select")).await.unwrap();
        assert_eq!(transport.transport_id(), "select");
    }

    #[cfg(not(feature = "transport_lapin"))]
    #[tokio::test]
    async fn test_amqp_requires_feature() {
        // ---
        let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "select");
        assert!(create_transport(&config).await.is_err());
    }
}

//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! concrete brokers or client libraries.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    ConsumerHandle,
    Delivery,
    Headers,
    Properties,
    Transport,
    TransportPtr,
};

/// Protocol types for RPC message correlation and envelopes
///
/// This module defines how calls and their outcomes are laid out on the
/// transport, and the identifier used to match them up.
mod correlation;
mod message;

pub use correlation::CallId;
pub use message::{
    //
    method_key,
    Outcome,
    ReplyEnvelope,
    RequestEnvelope,
    DEFAULT_EXCHANGE,
    ERROR_HEADER,
};

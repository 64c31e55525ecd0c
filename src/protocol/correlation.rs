use std::fmt;
use std::str::FromStr;

use crate::RpcError;

/// Identifier correlating a reply with the call that produced it.
///
/// Allocated from a per-client counter, strictly increasing and never
/// reused. On the wire it travels as the decimal string in the AMQP
/// `message_id` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(u64);

impl CallId {
    // ---

    /// Wrap a raw counter value.
    pub const fn new(raw: u64) -> Self {
        // ---
        Self(raw)
    }

    /// The raw counter value.
    pub const fn get(self) -> u64 {
        // ---
        self.0
    }
}

impl fmt::Display for CallId {
    // ---

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallId {
    // ---
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| RpcError::InvalidMessageId(s.to_string()))
    }
}

impl From<u64> for CallId {
    // ---

    fn from(raw: u64) -> Self {
        // ---
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_wire_format() {
        // ---
        let id = CallId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<CallId>().unwrap(), id);
    }

    #[test]
    fn test_rejects_non_numeric() {
        // ---
        for bad in ["", "abc", "-1", "1.5", "18446744073709551616"] {
            let err = bad.parse::<CallId>().unwrap_err();
            assert!(matches!(err, RpcError::InvalidMessageId(ref s) if s == bad));
        }
    }

    #[test]
    fn test_ordering_follows_counter() {
        // ---
        assert!(CallId::new(1) < CallId::new(2));
        assert_eq!(CallId::from(u64::MAX).get(), u64::MAX);
    }
}

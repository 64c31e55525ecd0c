use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::{Result, RpcError};

/// JSON payloads (`application/json`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json;

impl Codec for Json {
    // ---
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        T: Serialize + ?Sized,
    {
        // ---
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| RpcError::Encode {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decode<T>(&self, payload: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        // ---
        serde_json::from_slice(payload).map_err(|e| RpcError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_output() {
        // ---
        let bytes = Json.encode(&json!({"A": 6, "B": 7})).unwrap();
        assert_eq!(&bytes[..], br#"{"A":6,"B":7}"#);
    }

    #[test]
    fn test_unit_is_null() {
        // ---
        let bytes = Json.encode(&()).unwrap();
        assert_eq!(&bytes[..], b"null");
        Json.decode::<()>(&bytes).unwrap();
    }
}

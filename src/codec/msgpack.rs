use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::{Result, RpcError};

/// MessagePack payloads (`application/msgpack`).
///
/// Structs are encoded as maps with named fields, not positional arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgPack;

impl Codec for MsgPack {
    // ---
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        T: Serialize + ?Sized,
    {
        // ---
        rmp_serde::to_vec_named(value)
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
        rmp_serde::from_slice(payload).map_err(|e| RpcError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Args {
        #[serde(rename = "A")]
        a: i64,
        #[serde(rename = "B")]
        b: i64,
    }

    #[test]
    fn test_struct_is_written_as_map() {
        // ---
        let bytes = MsgPack.encode(&Args { a: 6, b: 7 }).unwrap();

        // fixmap with two entries
        assert_eq!(bytes[0], 0x82);

        let as_map: HashMap<String, i64> = MsgPack.decode(&bytes).unwrap();
        assert_eq!(as_map["A"], 6);
        assert_eq!(as_map["B"], 7);
    }

    #[test]
    fn test_reads_map_from_dynamic_peer() {
        // ---
        let mut map = HashMap::new();
        map.insert("A".to_string(), 3_i64);
        map.insert("B".to_string(), 4_i64);
        let bytes = MsgPack.encode(&map).unwrap();

        let args: Args = MsgPack.decode(&bytes).unwrap();
        assert_eq!(args, Args { a: 3, b: 4 });
    }
}

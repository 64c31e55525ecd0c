//! Wire formats for call arguments and results.
//!
//! A [`Codec`] turns one in-memory value into a byte payload and back. The
//! client and server codecs are generic over it, so a new format only needs
//! a new `Codec` implementation.
//!
//! Two formats ship with the crate:
//!
//! - [`MsgPack`]: compact binary MessagePack. Structs are written as maps
//!   keyed by field name so peers in dynamically typed languages see plain
//!   dictionaries.
//! - [`Json`]: human-readable JSON.
//!
//! Both peers of a call must agree on the codec; nothing on the wire
//! identifies it beyond the informational content type.

mod json;
mod msgpack;

pub use json::Json;
pub use msgpack::MsgPack;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Encode/decode pair defining the payload format.
///
/// Implementations must be pure: `decode(encode(v))` reproduces the
/// structure of `v` for every value the format can represent.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Short format name used in errors and logs.
    fn name(&self) -> &'static str;

    /// MIME type attached to published messages.
    fn content_type(&self) -> &'static str;

    /// Encode a value into a payload.
    fn encode<T>(&self, value: &T) -> Result<Bytes>
    where
        T: Serialize + ?Sized;

    /// Decode a payload into a value.
    fn decode<T>(&self, payload: &[u8]) -> Result<T>
    where
        T: DeserializeOwned;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        delta: i32,
        name: String,
        tags: Vec<String>,
        attrs: BTreeMap<String, i64>,
        #[serde(with = "serde_bytes")]
        blob: Vec<u8>,
        parent: Option<u32>,
        flag: bool,
    }

    fn record() -> impl Strategy<Value = Record> {
        (
            any::<u64>(),
            any::<i32>(),
            ".{0,16}",
            prop::collection::vec(".{0,8}", 0..4),
            prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..4),
            prop::collection::vec(any::<u8>(), 0..32),
            any::<Option<u32>>(),
            any::<bool>(),
        )
            .prop_map(|(id, delta, name, tags, attrs, blob, parent, flag)| Record {
                id,
                delta,
                name,
                tags,
                attrs,
                blob,
                parent,
                flag,
            })
    }

    fn roundtrip<C: Codec>(codec: &C, value: &Record) -> Record {
        let bytes = codec.encode(value).expect("encode");
        codec.decode(&bytes).expect("decode")
    }

    proptest! {
        #[test]
        fn msgpack_roundtrip_preserves_value(value in record()) {
            prop_assert_eq!(roundtrip(&MsgPack, &value), value);
        }

        #[test]
        fn json_roundtrip_preserves_value(value in record()) {
            prop_assert_eq!(roundtrip(&Json, &value), value);
        }

        #[test]
        fn msgpack_and_json_agree_on_dynamic_maps(
            map in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
        ) {
            let from_msgpack: BTreeMap<String, i64> =
                MsgPack.decode(&MsgPack.encode(&map).expect("encode")).expect("decode");
            let from_json: BTreeMap<String, i64> =
                Json.decode(&Json.encode(&map).expect("encode")).expect("decode");
            prop_assert_eq!(&from_msgpack, &map);
            prop_assert_eq!(&from_json, &map);
        }
    }

    #[test]
    fn decode_error_names_the_codec() {
        // ---
        let err = MsgPack.decode::<Record>(b"\xc1").unwrap_err();
        assert!(err.to_string().starts_with("msgpack decode failed"), "{err}");

        let err = Json.decode::<Record>(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("json decode failed"), "{err}");
    }
}

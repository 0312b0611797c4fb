//! Binary envelope codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`: structs are written as maps with field names,
//! so peers can decode by field name rather than position and missing fields
//! fall back to their defaults.

use crate::envelope::Envelope;
use crate::error::Result;

/// MessagePack codec for binary frames.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode an envelope to MsgPack bytes (struct-as-map format).
    #[inline]
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(envelope)?)
    }

    /// Decode MsgPack bytes to an envelope.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Params;
    use serde_json::json;

    #[test]
    fn test_round_trip_all_fields() {
        let mut params = Params::new();
        params.insert("n".to_string(), json!(7));
        params.insert("nested".to_string(), json!({"list": [1, "two"]}));

        let original = Envelope::success("done")
            .with_id("c9")
            .with_key("users.get")
            .with_request(json!({"user": 42, "active": true}))
            .with_params(params);

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let encoded = MsgPackCodec::encode(&Envelope::new()).unwrap();

        // fixmap with 6 entries; array format would start with 0x96
        assert_eq!(encoded[0], 0x86, "Expected fixmap, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        assert!(MsgPackCodec::decode(b"not valid msgpack").is_err());
    }

    #[test]
    fn test_decode_partial_map_uses_defaults() {
        #[derive(serde::Serialize)]
        struct Partial<'a> {
            id: &'a str,
        }

        let bytes = rmp_serde::to_vec_named(&Partial { id: "p1" }).unwrap();
        let decoded = MsgPackCodec::decode(&bytes).unwrap();

        assert_eq!(decoded.id(), "p1");
        assert_eq!(decoded.status, 200);
        assert_eq!(decoded.request, json!(""));
    }
}

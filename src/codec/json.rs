//! Text envelope codec using `serde_json`.

use crate::envelope::Envelope;
use crate::error::Result;

/// JSON codec for text frames.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode an envelope to a JSON string.
    #[inline]
    pub fn encode(envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    /// Decode a JSON string to an envelope.
    #[inline]
    pub fn decode(text: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(text)?)
    }
}

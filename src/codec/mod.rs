//! Codec module - envelope serialization for both wire formats.
//!
//! - [`JsonCodec`] - UTF-8 JSON, carried in text frames
//! - [`MsgPackCodec`] - MessagePack maps (`to_vec_named`), carried in binary frames
//!
//! The sender picks a [`WireFormat`]; the receiver picks the decoder from the
//! frame type, so a peer can always decode either format.
//!
//! # Example
//!
//! ```
//! use simplerpc::codec::{self, WireFormat};
//! use simplerpc::Envelope;
//!
//! let env = Envelope::success("hello").with_new_id();
//! let frame = codec::encode(&env, WireFormat::Binary).unwrap();
//! assert_eq!(codec::decode(&frame).unwrap(), env);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::transport::Frame;

/// Wire encoding chosen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in a text frame.
    #[default]
    Text,
    /// MessagePack in a binary frame.
    Binary,
}

impl WireFormat {
    /// `Binary` when `binary_first` is set, `Text` otherwise.
    #[inline]
    pub fn from_binary_first(binary_first: bool) -> Self {
        if binary_first {
            WireFormat::Binary
        } else {
            WireFormat::Text
        }
    }
}

/// Encode an envelope into a frame of the given format.
pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<Frame> {
    match format {
        WireFormat::Text => Ok(Frame::Text(JsonCodec::encode(envelope)?)),
        WireFormat::Binary => Ok(Frame::Binary(MsgPackCodec::encode(envelope)?.into())),
    }
}

/// Decode a frame, choosing the codec from the frame type.
pub fn decode(frame: &Frame) -> Result<Envelope> {
    match frame {
        Frame::Text(text) => JsonCodec::decode(text),
        Frame::Binary(bytes) => MsgPackCodec::decode(bytes),
    }
}

//! Transport module - the primitives the dispatch engine needs from a socket.
//!
//! The engine only ever sends a [`Frame`] (text or binary) or closes the
//! connection with a code and reason. Anything implementing [`Transport`]
//! will do; the crate ships:
//!
//! - [`ChannelTransport`] - queues outbound items for a dedicated writer task
//! - [`websocket`] - socket writer task over axum or tokio-tungstenite sinks

mod channel;
pub mod websocket;

pub use channel::{channel_transport, ChannelTransport, Outbound};

use bytes::Bytes;

use crate::error::Result;

/// One socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame (JSON envelope).
    Text(String),
    /// Binary frame (MsgPack envelope).
    Binary(Bytes),
}

impl Frame {
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outbound half of a connection.
///
/// Implementations must not block: the engine calls these from its worker
/// and from the inbound path.
pub trait Transport: Send + Sync + 'static {
    /// Queue a frame for sending.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Close the connection with a status code and reason.
    fn close(&self, code: u16, reason: &str) -> Result<()>;
}

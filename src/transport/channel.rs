//! Channel-backed transport.
//!
//! Replaces direct socket writes with a handle that pushes onto an mpsc
//! channel. A single writer task owns the socket and drains the channel, so
//! any number of handlers can send without locking.
//!
//! ```text
//! Worker ──────┐
//! Inbound 404 ─┼─► mpsc::UnboundedSender<Outbound> ─► Writer Task ─► Socket
//! Caller ──────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Frame, Transport};
use crate::error::{Result, RpcError};

/// An item queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Data frame.
    Frame(Frame),
    /// Close the connection. The writer stops after sending it.
    Close { code: u16, reason: String },
}

/// Cheaply cloneable sending handle for one connection.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

/// Create a transport and the receiver its writer task drains.
pub fn channel_transport() -> (ChannelTransport, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl ChannelTransport {
    /// Whether `close` was called or the writer went away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn push(&self, item: Outbound) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        self.tx.send(item).map_err(|_| RpcError::ConnectionClosed)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        self.push(Outbound::Frame(frame))
    }

    fn close(&self, code: u16, reason: &str) -> Result<()> {
        let result = self.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.store(true, Ordering::Release);
        result
    }
}

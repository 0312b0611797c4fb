//! WebSocket plumbing shared by both ends.
//!
//! The server side speaks axum's socket type and the client side speaks
//! `tokio-tungstenite`'s; [`SocketMessage`] maps either message type to and
//! from a [`Frame`], so one writer task serves both.

use std::borrow::Cow;

use axum::extract::ws::{self, CloseFrame as AxumCloseFrame};
use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::{channel_transport, ChannelTransport, Frame, Outbound};
use crate::error::{Result, RpcError};

/// A socket message type the writer task can produce and the read loops
/// can consume.
pub trait SocketMessage: Sized + Send + 'static {
    /// Data message carrying a frame.
    fn from_frame(frame: Frame) -> Self;

    /// Close message with a code and reason.
    fn close(code: u16, reason: String) -> Self;

    /// The data frame, or `None` for control messages (ping, pong, close).
    fn into_frame(self) -> Option<Frame>;

    fn is_close(&self) -> bool;
}

impl SocketMessage for Message {
    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::binary(bytes),
        }
    }

    fn close(code: u16, reason: String) -> Self {
        Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))
    }

    fn into_frame(self) -> Option<Frame> {
        match self {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(bytes) => Some(Frame::Binary(Bytes::from(bytes))),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }
}

impl SocketMessage for ws::Message {
    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => ws::Message::Text(text),
            Frame::Binary(bytes) => ws::Message::Binary(bytes.to_vec()),
        }
    }

    fn close(code: u16, reason: String) -> Self {
        ws::Message::Close(Some(AxumCloseFrame {
            code,
            reason: Cow::Owned(reason),
        }))
    }

    fn into_frame(self) -> Option<Frame> {
        match self {
            ws::Message::Text(text) => Some(Frame::Text(text)),
            ws::Message::Binary(bytes) => Some(Frame::Binary(Bytes::from(bytes))),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, ws::Message::Close(_))
    }
}

/// Spawn the writer task for a socket sink.
///
/// Returns the transport handle to give to the dispatch engine and the task
/// handle. The task ends after sending a close frame, or once every
/// transport clone has been dropped.
pub fn spawn_writer_task<S, M>(sink: S) -> (ChannelTransport, JoinHandle<Result<()>>)
where
    M: SocketMessage,
    S: Sink<M> + Unpin + Send + 'static,
    S::Error: Into<RpcError>,
{
    let (transport, rx) = channel_transport();
    let task = tokio::spawn(writer_loop(rx, sink));
    (transport, task)
}

async fn writer_loop<S, M>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut sink: S) -> Result<()>
where
    M: SocketMessage,
    S: Sink<M> + Unpin,
    S::Error: Into<RpcError>,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => sink.send(M::from_frame(frame)).await.map_err(Into::into)?,
            Outbound::Close { code, reason } => {
                sink.send(M::close(code, reason)).await.map_err(Into::into)?;
                return Ok(());
            }
        }
    }

    // All senders gone: close politely, ignoring a peer that already left.
    if let Err(e) = sink.close().await {
        let e: RpcError = e.into();
        tracing::debug!("Socket close after writer shutdown: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tungstenite_mapping() {
        let text = Message::from_frame(Frame::Text("hi".to_string()));
        assert_eq!(text.into_frame(), Some(Frame::Text("hi".to_string())));

        let binary = Message::from_frame(Frame::Binary(Bytes::from_static(b"\x01\x02")));
        assert_eq!(
            binary.into_frame(),
            Some(Frame::Binary(Bytes::from_static(b"\x01\x02")))
        );

        assert_eq!(Message::Ping(Default::default()).into_frame(), None);
        assert!(<Message as SocketMessage>::close(1000, "bye".into()).is_close());
    }

    #[test]
    fn test_axum_mapping() {
        let text = ws::Message::from_frame(Frame::Text("hi".to_string()));
        assert_eq!(text.into_frame(), Some(Frame::Text("hi".to_string())));

        let binary = ws::Message::from_frame(Frame::Binary(Bytes::from_static(b"\x03")));
        assert_eq!(binary.into_frame(), Some(Frame::Binary(Bytes::from_static(b"\x03"))));

        match <ws::Message as SocketMessage>::close(403, "Auth fail".into()) {
            ws::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 403);
                assert_eq!(frame.reason, "Auth fail");
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writer_sends_frames_then_close() {
        use crate::transport::Transport;
        use parking_lot::Mutex;
        use std::sync::Arc;

        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let sink = Box::pin(futures_util::sink::unfold((), move |(), msg: Message| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(msg);
                Ok::<_, RpcError>(())
            }
        }));

        let (transport, task) = spawn_writer_task(sink);
        transport.send(Frame::Text("a".to_string())).unwrap();
        transport.close(1000, "done").unwrap();
        task.await.unwrap().unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Message::text("a".to_string()));
        assert!(sent[1].is_close());
    }
}

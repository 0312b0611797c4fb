//! Per-dispatch context handed to handlers.
//!
//! Carries the transport of the connection the envelope arrived on and what
//! is known about that connection. A *detached* context has neither; it is
//! used for locally synthesized invocations such as correlation timeouts, so
//! handlers must tolerate missing handles.
//!
//! # Example
//!
//! ```
//! use simplerpc::dispatch::CallContext;
//! use simplerpc::{codec::WireFormat, Envelope};
//!
//! let ctx = CallContext::detached();
//! assert!(ctx.is_detached());
//! assert!(ctx.send(&Envelope::success("x"), WireFormat::Text).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{self, WireFormat};
use crate::envelope::Envelope;
use crate::error::{Result, RpcError};
use crate::transport::Transport;

/// What the handshake revealed about a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    peer_addr: Option<SocketAddr>,
    path: String,
    query: HashMap<String, String>,
}

impl ConnectionInfo {
    /// Build from the peer address and the request target's path and query.
    pub fn new(peer_addr: Option<SocketAddr>, path: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            peer_addr,
            path: path.into(),
            query: query.map(parse_query).unwrap_or_default(),
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Parse a form-encoded query such as `a=1&b=x%26y` into a map of decoded
/// values. The first occurrence of a name wins; a name without `=` maps to an
/// empty value.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Context passed to every handler invocation.
///
/// `CallContext` is `Clone` and cheap to share: both handles are `Arc`s.
#[derive(Clone, Default)]
pub struct CallContext {
    transport: Option<Arc<dyn Transport>>,
    connection: Option<Arc<ConnectionInfo>>,
}

impl CallContext {
    /// Context bound to a connection's transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            connection: None,
        }
    }

    /// Context with no transport and no connection.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Attach handshake details.
    pub fn with_connection(mut self, connection: Arc<ConnectionInfo>) -> Self {
        self.connection = Some(connection);
        self
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.transport.is_none()
    }

    #[inline]
    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    #[inline]
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_deref()
    }

    /// Encode and send an envelope on this context's connection.
    pub fn send(&self, envelope: &Envelope, format: WireFormat) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(RpcError::NotConnected)?;
        transport.send(codec::encode(envelope, format)?)
    }

    /// Close this context's connection.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(RpcError::NotConnected)?;
        transport.close(code, reason)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("detached", &self.is_detached())
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_transport, Frame, Outbound};

    #[test]
    fn test_parse_query() {
        let params = parse_query("token=abc&x=1&token=second&flag");
        assert_eq!(params.get("token").map(String::as_str), Some("abc"));
        assert_eq!(params.get("x").map(String::as_str), Some("1"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_parse_query_decodes_values() {
        let params = parse_query("token=a%26b%3Dc&space=my+secret&pct=50%25");
        assert_eq!(params.get("token").map(String::as_str), Some("a&b=c"));
        assert_eq!(params.get("space").map(String::as_str), Some("my secret"));
        assert_eq!(params.get("pct").map(String::as_str), Some("50%"));
    }

    #[test]
    fn test_connection_info() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let info = ConnectionInfo::new(Some(addr), "/ws", Some("token=t"));

        assert_eq!(info.peer_addr(), Some(addr));
        assert_eq!(info.path(), "/ws");
        assert_eq!(info.query_param("token"), Some("t"));
        assert_eq!(info.query_param("missing"), None);
    }

    #[test]
    fn test_detached_context_cannot_send() {
        let ctx = CallContext::detached();
        assert!(ctx.is_detached());
        assert!(ctx.connection().is_none());
        assert!(matches!(
            ctx.send(&Envelope::new(), WireFormat::Text),
            Err(RpcError::NotConnected)
        ));
        assert!(matches!(ctx.close(1000, "bye"), Err(RpcError::NotConnected)));
    }

    #[test]
    fn test_send_encodes_with_format() {
        let (transport, mut rx) = channel_transport();
        let ctx = CallContext::new(Arc::new(transport));

        ctx.send(&Envelope::success("a"), WireFormat::Text).unwrap();
        ctx.send(&Envelope::success("b"), WireFormat::Binary).unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(Frame::Text(_))));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(Frame::Binary(_))));
    }

    #[test]
    fn test_context_is_clone() {
        let (transport, _rx) = channel_transport();
        let info = Arc::new(ConnectionInfo::new(None, "/ws", None));
        let ctx = CallContext::new(Arc::new(transport)).with_connection(info);
        let other = ctx.clone();

        assert!(!other.is_detached());
        assert_eq!(other.connection().map(ConnectionInfo::path), Some("/ws"));
    }
}

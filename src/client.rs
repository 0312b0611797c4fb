//! WebSocket client (initiator role).
//!
//! The [`ClientBuilder`] collects the target address, routes and settings.
//! [`RpcClient`] manages the lifecycle:
//! 1. Connect to `ws[s]://{url}?token={token}`
//! 2. Spawn the writer task and the read loop
//! 3. Feed inbound frames to its [`DispatchEngine`]
//!
//! The peer may call routes registered here just as the client calls the
//! server's; replies to the client's own calls are correlated by id.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use simplerpc::{Envelope, RpcClient};
//!
//! #[tokio::main]
//! async fn main() -> simplerpc::Result<()> {
//!     let client = RpcClient::builder("127.0.0.1:8080/ws")
//!         .token("secret")
//!         .connect()
//!         .await?;
//!
//!     let reply = client.call(Envelope::call("echo", json!("hi"))).await?;
//!     println!("{:?}", reply.request);
//!
//!     client.stop();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::cache::DEFAULT_TIMEOUT;
use crate::codec::WireFormat;
use crate::dispatch::{
    handler_fn, CallContext, DispatchEngine, EngineConfig, Handler, HandlerResult, Role,
    TOKEN_PARAM,
};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::transport::websocket::{self, SocketMessage};
use crate::transport::{ChannelTransport, Transport};

/// Builder for configuring and connecting an [`RpcClient`].
pub struct ClientBuilder {
    url: String,
    ssl: bool,
    token: String,
    binary_first: bool,
    timeout: Duration,
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl ClientBuilder {
    /// Create a builder for `host[:port][/path]`, without a scheme.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ssl: false,
            token: String::new(),
            binary_first: false,
            timeout: DEFAULT_TIMEOUT,
            routes: Vec::new(),
        }
    }

    /// Use `wss://`. Requires a TLS-enabled build of `tokio-tungstenite`.
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Token sent as the `token` query parameter.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Send as MessagePack instead of JSON by default.
    pub fn binary_first(mut self, binary_first: bool) -> Self {
        self.binary_first = binary_first;
        self
    }

    /// Correlation timeout for outgoing calls.
    ///
    /// Default: 120 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a closure the peer can call.
    pub fn route<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route_handler(path, handler_fn(handler))
    }

    /// Register a prepared handler the peer can call.
    pub fn route_handler(mut self, path: &str, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((path.to_string(), handler));
        self
    }

    /// The full socket URL this builder connects to. The token is
    /// form-encoded.
    pub fn endpoint(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(TOKEN_PARAM, &self.token)
            .finish();
        format!("{}://{}?{}", scheme, self.url, query)
    }

    /// Connect and start the read loop.
    pub async fn connect(self) -> Result<RpcClient> {
        RpcClient::connect(self).await
    }
}

/// A connected client.
pub struct RpcClient {
    engine: Arc<DispatchEngine>,
    transport: ChannelTransport,
    standby: Arc<AtomicBool>,
    shutdown_rx: Option<oneshot::Receiver<()>>,
    reader_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
}

impl RpcClient {
    /// Create a new client builder.
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    async fn connect(builder: ClientBuilder) -> Result<Self> {
        let endpoint = builder.endpoint();

        let engine = Arc::new(DispatchEngine::new(
            Role::Initiator,
            EngineConfig {
                timeout: builder.timeout,
                format: WireFormat::from_binary_first(builder.binary_first),
            },
        ));
        for (path, handler) in builder.routes {
            engine.add_route(&path, handler)?;
        }

        let (ws, _response) = tokio_tungstenite::connect_async(endpoint.as_str()).await?;
        let (sink, source) = ws.split();
        let (transport, writer_task) = websocket::spawn_writer_task(sink);

        engine.start();
        let standby = Arc::new(AtomicBool::new(true));
        tracing::debug!("Connected to {}", builder.url);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = CallContext::new(Arc::new(transport.clone()));
        let reader_engine = Arc::clone(&engine);
        let reader_standby = Arc::clone(&standby);

        let reader_task = tokio::spawn(async move {
            read_loop(source, &reader_engine, ctx).await;
            reader_standby.store(false, Ordering::Release);
            let _ = shutdown_tx.send(());
        });

        Ok(RpcClient {
            engine,
            transport,
            standby,
            shutdown_rx: Some(shutdown_rx),
            reader_task,
            _writer_task: writer_task,
        })
    }

    /// Whether the connection is open.
    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    /// The client's engine.
    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    /// Register a closure the peer can call.
    pub fn add_route<F, Fut>(&self, path: &str, handler: F) -> Result<()>
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.engine.add_route(path, handler_fn(handler))
    }

    /// Unbind a dot-path and its subtree.
    pub fn remove_route(&self, path: &str) -> bool {
        self.engine.remove_route(path)
    }

    /// Register a reply handler for an id without sending anything.
    pub fn add_callback<F, Fut>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.engine.pending().put(id, handler_fn(handler));
    }

    /// Send an envelope in the configured format.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_with_format(envelope, self.engine.format())
    }

    /// Send an envelope in an explicit format.
    pub fn send_with_format(&self, envelope: &Envelope, format: WireFormat) -> Result<()> {
        self.engine.send(&self.transport, envelope, format)
    }

    /// Send a call and run `handler` on its reply or timeout. Returns the id.
    pub fn send_and_callback<F, Fut>(&self, envelope: Envelope, handler: F) -> Result<String>
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.engine.send_and_callback(
            &self.transport,
            envelope,
            self.engine.format(),
            handler_fn(handler),
        )
    }

    /// Send a call and wait for its reply (or the local 408).
    pub async fn call(&self, envelope: Envelope) -> Result<Envelope> {
        self.engine
            .call(&self.transport, envelope, self.engine.format())
            .await
    }

    /// Close the socket and stop the engine. Pending calls are dropped.
    pub fn stop(&self) {
        if let Err(e) = self.transport.close(1000, "") {
            tracing::debug!("Close on stop: {}", e);
        }
        self.engine.shutdown();
        self.reader_task.abort();
        self.standby.store(false, Ordering::Release);
    }

    /// Wait until the peer closes the connection.
    ///
    /// This consumes the client.
    pub async fn wait_for_shutdown(mut self) -> Result<()> {
        if let Some(rx) = self.shutdown_rx.take() {
            let _ = rx.await;
        }
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<S>(mut source: S, engine: &DispatchEngine, ctx: CallContext)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                tracing::debug!("Server closed connection: {:?}", frame);
                break;
            }
            Ok(message) => {
                if let Some(frame) = message.into_frame() {
                    engine.handle_frame(&frame, ctx.clone());
                }
            }
            Err(e) => {
                tracing::error!("WebSocket connection failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let builder = ClientBuilder::new("localhost:8080/ws").token("abc");
        assert_eq!(builder.endpoint(), "ws://localhost:8080/ws?token=abc");

        let secure = ClientBuilder::new("example.com/ws").ssl(true);
        assert_eq!(secure.endpoint(), "wss://example.com/ws?token=");
    }

    #[test]
    fn test_endpoint_encodes_reserved_characters() {
        for token in ["a&b=c", "my secret", "50%+#x"] {
            let endpoint = ClientBuilder::new("localhost:8080/ws").token(token).endpoint();
            let (_, query) = endpoint.split_once('?').unwrap();

            assert!(!query.contains(' '));
            assert!(!query.contains('#'));
            let params = crate::dispatch::parse_query(query);
            assert_eq!(params.len(), 1);
            assert_eq!(params.get("token").map(String::as_str), Some(token));
        }
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = RpcClient::builder("localhost:8080/ws")
            .binary_first(true)
            .timeout(Duration::from_secs(5))
            .route("push.notice", |_env: Envelope, _ctx| async { Ok(None) });

        assert!(builder.binary_first);
        assert_eq!(builder.timeout, Duration::from_secs(5));
        assert_eq!(builder.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RpcClient::builder(format!("{}/ws", addr)).connect().await;
        assert!(result.is_err());
    }
}

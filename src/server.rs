//! WebSocket server (responder role).
//!
//! The [`ServerBuilder`] collects routes and settings; [`RpcServer`] serves
//! an axum router and owns one [`DispatchEngine`] shared by every connection.
//! The router has two routes:
//! - `GET /` answers with a liveness probe
//! - the configured path (default `/ws`) upgrades to a WebSocket
//!
//! Anything else gets axum's 404. For each upgraded socket the server checks
//! the `token` query parameter (close 403 on mismatch), spawns a writer task
//! and feeds inbound frames to the engine.
//!
//! # Example
//!
//! ```no_run
//! use simplerpc::{Envelope, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> simplerpc::Result<()> {
//!     let server = RpcServer::builder()
//!         .port(8080)
//!         .token("secret")
//!         .route("echo", |env: Envelope, _ctx| async move {
//!             Ok(Some(Envelope::success("echo").with_request(env.request)))
//!         })
//!         .start()
//!         .await?;
//!
//!     server.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::DEFAULT_TIMEOUT;
use crate::codec::{MsgPackCodec, WireFormat};
use crate::dispatch::{
    handler_fn, CallContext, ConnectionInfo, DispatchEngine, EngineConfig, HandlerResult,
    HandshakeGuard, Handler, Role,
};
use crate::envelope::Envelope;
use crate::error::{Result, RpcError};
use crate::transport::websocket::{self, SocketMessage};
use crate::transport::{ChannelTransport, Transport};

/// Path of the liveness probe.
pub const LIVENESS_PATH: &str = "/";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default WebSocket path.
pub const DEFAULT_PATH: &str = "/ws";

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Message carried by the liveness probe reply.
pub const LIVENESS_MESSAGE: &str = "SimpleRPC";

/// Builder for configuring and starting an [`RpcServer`].
pub struct ServerBuilder {
    host: String,
    port: u16,
    path: String,
    token: String,
    binary_first: bool,
    timeout: Duration,
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            token: String::new(),
            binary_first: false,
            timeout: DEFAULT_TIMEOUT,
            routes: Vec::new(),
        }
    }

    /// Bind address. Default: `0.0.0.0`
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Listening port; 0 picks a free one. Default: 8080
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// WebSocket path. Default: `/ws`
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Required connection token. Empty disables the check.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Send engine-generated replies as MessagePack instead of JSON.
    pub fn binary_first(mut self, binary_first: bool) -> Self {
        self.binary_first = binary_first;
        self
    }

    /// Correlation timeout for server-initiated calls.
    ///
    /// Default: 120 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a closure for a dot-path.
    pub fn route<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route_handler(path, handler_fn(handler))
    }

    /// Register a prepared handler for a dot-path.
    pub fn route_handler(mut self, path: &str, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((path.to_string(), handler));
        self
    }

    /// Bind, start the engine and begin accepting connections.
    pub async fn start(self) -> Result<RpcServer> {
        RpcServer::start(self).await
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the router and every connection task.
struct Shared {
    engine: Arc<DispatchEngine>,
    path: String,
    guard: HandshakeGuard,
    connections: DashMap<SocketAddr, ChannelTransport>,
}

/// A running server.
pub struct RpcServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
}

impl RpcServer {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn start(builder: ServerBuilder) -> Result<Self> {
        if builder.path == LIVENESS_PATH {
            return Err(RpcError::InvalidRoute(format!(
                "{} is reserved for the liveness probe",
                LIVENESS_PATH
            )));
        }

        let engine = Arc::new(DispatchEngine::new(
            Role::Responder,
            EngineConfig {
                timeout: builder.timeout,
                format: WireFormat::from_binary_first(builder.binary_first),
            },
        ));
        for (path, handler) in builder.routes {
            engine.add_route(&path, handler)?;
        }

        let listener = TcpListener::bind((builder.host.as_str(), builder.port)).await?;
        let local_addr = listener.local_addr()?;
        engine.start();

        let shared = Arc::new(Shared {
            engine,
            path: builder.path,
            guard: HandshakeGuard::new(builder.token),
            connections: DashMap::new(),
        });

        let router = build_router(Arc::clone(&shared));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        });

        tracing::info!("Listening on ws://{}{}", local_addr, shared.path);

        Ok(RpcServer {
            shared,
            local_addr,
            shutdown_tx,
            serve_task,
        })
    }

    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The engine shared by all connections.
    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.shared.engine
    }

    /// Number of authorized open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Register a closure for a dot-path.
    pub fn add_route<F, Fut>(&self, path: &str, handler: F) -> Result<()>
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.shared.engine.add_route(path, handler_fn(handler))
    }

    /// Unbind a dot-path and its subtree.
    pub fn remove_route(&self, path: &str) -> bool {
        self.shared.engine.remove_route(path)
    }

    /// Send an envelope on a connection using the configured format.
    pub fn send(&self, ctx: &CallContext, envelope: &Envelope) -> Result<()> {
        let transport = ctx.transport().ok_or(RpcError::NotConnected)?;
        self.shared
            .engine
            .send(transport.as_ref(), envelope, self.shared.engine.format())
    }

    /// Call the peer on a connection and run `handler` on its reply or timeout.
    pub fn send_and_callback<F, Fut>(&self, ctx: &CallContext, envelope: Envelope, handler: F) -> Result<String>
    where
        F: Fn(Envelope, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let transport = ctx.transport().ok_or(RpcError::NotConnected)?;
        let engine = &self.shared.engine;
        engine.send_and_callback(transport.as_ref(), envelope, engine.format(), handler_fn(handler))
    }

    /// Call the peer on a connection and wait for the reply.
    ///
    /// Handlers share one serialized worker, and the reply is handled on it
    /// too: inside a handler use [`send_and_callback`](Self::send_and_callback)
    /// instead of awaiting this.
    pub async fn call(&self, ctx: &CallContext, envelope: Envelope) -> Result<Envelope> {
        let transport = ctx.transport().ok_or(RpcError::NotConnected)?;
        let engine = &self.shared.engine;
        engine.call(transport.as_ref(), envelope, engine.format()).await
    }

    /// Stop accepting, close every connection and stop the engine.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        for entry in self.shared.connections.iter() {
            if let Err(e) = entry.value().close(1000, "Server stopping") {
                tracing::debug!("Close {} on stop: {}", entry.key(), e);
            }
        }
        self.shared.connections.clear();
        self.shared.engine.shutdown();
        tracing::info!("Server on {} stopped", self.local_addr);
    }

    /// Wait until [`stop`](Self::stop) is called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

fn build_router(shared: Arc<Shared>) -> Router {
    let path = shared.path.clone();
    Router::new()
        .route(LIVENESS_PATH, get(liveness))
        .route(&path, get(upgrade))
        .with_state(shared)
}

async fn liveness() -> Response {
    match MsgPackCodec::encode(&Envelope::success(LIVENESS_MESSAGE)) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode liveness reply: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    State(shared): State<Arc<Shared>>,
) -> Response {
    let info = Arc::new(ConnectionInfo::new(
        Some(peer),
        shared.path.clone(),
        query.as_deref(),
    ));
    ws.on_upgrade(move |socket| serve_socket(socket, info, shared))
}

async fn serve_socket(socket: WebSocket, info: Arc<ConnectionInfo>, shared: Arc<Shared>) {
    let peer = info.peer_addr();
    let (sink, mut source) = socket.split();
    let (transport, writer_task) = websocket::spawn_writer_task(sink);
    let ctx = CallContext::new(Arc::new(transport.clone())).with_connection(info);

    if !shared.engine.on_connect(&shared.guard, &ctx) {
        drop(ctx);
        drop(transport);
        if let Ok(Err(e)) = writer_task.await {
            tracing::debug!("Close after auth failure on {:?}: {}", peer, e);
        }
        return;
    }

    let Some(peer) = peer else {
        return;
    };
    shared.connections.insert(peer, transport);
    tracing::debug!("Connection from {}", peer);

    while let Some(message) = source.next().await {
        match message {
            Ok(message) if message.is_close() => break,
            Ok(message) => {
                if let Some(frame) = message.into_frame() {
                    shared.engine.handle_frame(&frame, ctx.clone());
                }
            }
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    shared.connections.remove(&peer);
    writer_task.abort();
    tracing::debug!("Connection from {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ServerBuilder::default();
        assert_eq!(builder.host, DEFAULT_HOST);
        assert_eq!(builder.port, DEFAULT_PORT);
        assert_eq!(builder.path, DEFAULT_PATH);
        assert!(builder.token.is_empty());
        assert!(!builder.binary_first);
        assert_eq!(builder.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = RpcServer::builder()
            .path("rpc")
            .token("t")
            .binary_first(true)
            .route("a.b", |_env: Envelope, _ctx| async { Ok(None) })
            .route("a.c", |_env: Envelope, _ctx| async { Ok(None) });

        assert_eq!(builder.path, "/rpc");
        assert_eq!(builder.routes.len(), 2);
    }

    #[tokio::test]
    async fn test_liveness_path_is_reserved() {
        let result = RpcServer::builder().host("127.0.0.1").port(0).path("/").start().await;
        assert!(matches!(result, Err(RpcError::InvalidRoute(_))));
    }

    #[tokio::test]
    async fn test_blank_route_fails_start() {
        let result = RpcServer::builder()
            .host("127.0.0.1")
            .port(0)
            .route("", |_env: Envelope, _ctx| async { Ok(None) })
            .start()
            .await;
        assert!(matches!(result, Err(RpcError::InvalidRoute(_))));
    }
}

//! The dispatch engine shared by both ends of a connection.
//!
//! Inbound frames are decoded and classified: a blank key is a reply and is
//! correlated through the pending-call cache by id, anything else is a named
//! call resolved through the route trie. Resolved handlers run on the
//! engine's [`SerialWorker`]. Outbound calls register their reply handler
//! before the frame leaves.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    handler_fn, CallContext, HandshakeGuard, Handler, SerialWorker, AUTH_FAIL_CODE,
    AUTH_FAIL_REASON,
};
use crate::cache::{CorrelationCache, DEFAULT_TIMEOUT};
use crate::codec::{self, WireFormat};
use crate::envelope::{Envelope, NOT_FOUND_MESSAGE};
use crate::error::{Result, RpcError};
use crate::router::RouteTrie;
use crate::transport::{Frame, Transport};

/// Route trie holding shared handlers.
pub type Routes = RouteTrie<Arc<dyn Handler>>;

/// Pending-call cache holding reply handlers.
pub type PendingCalls = CorrelationCache<Arc<dyn Handler>>;

/// Which end of the connection an engine serves. Only used for logging;
/// both roles dispatch identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections.
    Responder,
    /// Opens the connection.
    Initiator,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Responder => "responder",
            Role::Initiator => "initiator",
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Correlation timeout, also the sweep period.
    pub timeout: Duration,
    /// Encoding for replies the engine sends on its own (handler replies, 404s).
    pub format: WireFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            format: WireFormat::default(),
        }
    }
}

/// Routes inbound envelopes to handlers and correlates replies.
pub struct DispatchEngine {
    role: Role,
    format: WireFormat,
    routes: Arc<Routes>,
    pending: Arc<PendingCalls>,
    worker: SerialWorker,
}

impl DispatchEngine {
    /// Engine with a fresh trie and cache.
    pub fn new(role: Role, config: EngineConfig) -> Self {
        Self::with_components(
            role,
            config.format,
            Arc::new(RouteTrie::new()),
            Arc::new(CorrelationCache::new(config.timeout)),
        )
    }

    /// Engine over injected components.
    ///
    /// The engine takes over the cache's expiry callback, replacing any
    /// callback already set: each expired entry has a 408 envelope delivered
    /// to its handler on this engine's worker, with a detached context.
    /// [`shutdown`](Self::shutdown) clears the cache; dropping the engine
    /// only stops its worker, so other owners keep their entries.
    pub fn with_components(
        role: Role,
        format: WireFormat,
        routes: Arc<Routes>,
        pending: Arc<PendingCalls>,
    ) -> Self {
        let worker = SerialWorker::new(role.label());
        let submitter = worker.handle();
        let weak = Arc::downgrade(&pending);

        pending.set_callback(move |id, handler| {
            tracing::debug!("Call {} timed out", id);
            let job = run_handler(
                handler,
                Envelope::timeout(id),
                CallContext::detached(),
                format,
                weak.clone(),
            );
            if let Err(e) = submitter.submit(job) {
                tracing::warn!("Timeout for {} not delivered: {}", id, e);
            }
        });

        Self {
            role,
            format,
            routes,
            pending,
            worker,
        }
    }

    /// Start the worker and the cache sweep. Must be called within a tokio
    /// runtime.
    pub fn start(&self) {
        self.worker.start();
        self.pending.start();
        tracing::debug!("{} engine started", self.role.label());
    }

    /// Stop the sweep and the worker. Pending calls are discarded without
    /// firing their timeouts.
    pub fn shutdown(&self) {
        self.pending.shutdown();
        self.worker.shutdown();
        tracing::debug!("{} engine stopped", self.role.label());
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    #[inline]
    pub fn routes(&self) -> &Arc<Routes> {
        &self.routes
    }

    #[inline]
    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    #[inline]
    pub fn worker(&self) -> &SerialWorker {
        &self.worker
    }

    /// Bind a handler to a dot-path.
    pub fn add_route(&self, path: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.routes.register(path, handler)
    }

    /// Unbind a dot-path and everything below it.
    pub fn remove_route(&self, path: &str) -> bool {
        self.routes.unregister(path)
    }

    /// Run the handshake check for a new connection. On failure the
    /// connection is closed with 403 and `false` is returned.
    pub fn on_connect(&self, guard: &HandshakeGuard, ctx: &CallContext) -> bool {
        let Some(connection) = ctx.connection() else {
            return !guard.is_enabled();
        };
        match guard.authorize(connection) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Rejecting connection from {:?}: {}",
                    connection.peer_addr(),
                    e
                );
                if let Err(e) = ctx.close(AUTH_FAIL_CODE, AUTH_FAIL_REASON) {
                    tracing::debug!("Close after auth failure: {}", e);
                }
                false
            }
        }
    }

    /// Decode and dispatch an inbound frame. Undecodable frames are dropped.
    pub fn handle_frame(&self, frame: &Frame, ctx: CallContext) {
        match codec::decode(frame) {
            Ok(envelope) => self.dispatch(envelope, ctx),
            Err(e) => tracing::error!("Data conversion failed: {}", e),
        }
    }

    /// Dispatch a JSON text payload.
    pub fn handle_text(&self, text: &str, ctx: CallContext) {
        match codec::JsonCodec::decode(text) {
            Ok(envelope) => self.dispatch(envelope, ctx),
            Err(e) => tracing::error!("Data conversion failed: {}", e),
        }
    }

    /// Dispatch a MessagePack binary payload.
    pub fn handle_binary(&self, data: &[u8], ctx: CallContext) {
        match codec::MsgPackCodec::decode(data) {
            Ok(envelope) => self.dispatch(envelope, ctx),
            Err(e) => tracing::error!("Data conversion failed: {}", e),
        }
    }

    /// Route a decoded envelope.
    pub fn dispatch(&self, envelope: Envelope, ctx: CallContext) {
        if envelope.is_reply() {
            match self.pending.take(envelope.id()) {
                Some(handler) => self.execute(handler, envelope, ctx),
                None => tracing::debug!("Dropping unmatched reply {}", envelope.id()),
            }
            return;
        }

        match self.routes.resolve(&envelope.key) {
            Some(handler) => self.execute(handler, envelope, ctx),
            None => {
                tracing::debug!("No route for {}", envelope.key);
                let reply = Envelope::error404(NOT_FOUND_MESSAGE).with_id(envelope.id());
                if let Err(e) = ctx.send(&reply, self.format) {
                    tracing::warn!("Failed to send 404 for {}: {}", envelope.id(), e);
                }
            }
        }
    }

    fn execute(&self, handler: Arc<dyn Handler>, envelope: Envelope, ctx: CallContext) {
        let id = envelope.id().to_owned();
        let job = run_handler(
            handler,
            envelope,
            ctx,
            self.format,
            Arc::downgrade(&self.pending),
        );
        if let Err(e) = self.worker.submit(job) {
            tracing::error!("Dropping dispatch of {}: {}", id, e);
        }
    }

    /// Encode and send one envelope. If encoding a call fails, the pending
    /// entry for its id is removed; a reply leaves the cache alone.
    pub fn send(&self, transport: &dyn Transport, envelope: &Envelope, format: WireFormat) -> Result<()> {
        match codec::encode(envelope, format) {
            Ok(frame) => transport.send(frame),
            Err(e) => {
                tracing::error!("Failed to convert data: {}", e);
                forget_unsent_call(&self.pending, envelope);
                Err(e)
            }
        }
    }

    /// Send a call and register `handler` for its reply.
    ///
    /// The envelope gets a fresh id if it has none. The entry is registered
    /// before the frame is sent so a fast reply always finds it; on failure
    /// it is removed again. Returns the call id.
    pub fn send_and_callback(
        &self,
        transport: &dyn Transport,
        envelope: Envelope,
        format: WireFormat,
        handler: Arc<dyn Handler>,
    ) -> Result<String> {
        let envelope = if envelope.id().is_empty() {
            envelope.with_new_id()
        } else {
            envelope
        };
        let id = envelope.id().to_owned();

        self.pending.put(id.clone(), handler);
        if let Err(e) = self.send(transport, &envelope, format) {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Send a call and wait for its reply, or for the local 408 on timeout.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] if the engine shuts down
    /// first.
    pub async fn call(
        &self,
        transport: &dyn Transport,
        envelope: Envelope,
        format: WireFormat,
    ) -> Result<Envelope> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let handler = handler_fn(move |reply: Envelope, _ctx| {
            let slot = Arc::clone(&slot);
            async move {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(reply);
                }
                Ok(None)
            }
        });

        self.send_and_callback(transport, envelope, format, handler)?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}

async fn run_handler(
    handler: Arc<dyn Handler>,
    envelope: Envelope,
    ctx: CallContext,
    format: WireFormat,
    pending: Weak<PendingCalls>,
) {
    let id = envelope.id().to_owned();
    let is_call = !envelope.is_reply();

    match handler.call(envelope, ctx.clone()).await {
        Ok(Some(reply)) => {
            let reply = if reply.id().is_empty() {
                reply.with_id(id)
            } else {
                reply
            };
            deliver(&ctx, &reply, format, &pending);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Handler for {} failed: {}", id, e);
            if is_call {
                let reply = Envelope::error(e.to_string()).with_id(id);
                deliver(&ctx, &reply, format, &pending);
            }
        }
    }
}

/// Drop the pending entry of a call that never left. Replies share their
/// id with a call they answer and must not touch the cache.
fn forget_unsent_call(pending: &PendingCalls, envelope: &Envelope) -> bool {
    !envelope.is_reply() && pending.remove(envelope.id())
}

fn deliver(ctx: &CallContext, reply: &Envelope, format: WireFormat, pending: &Weak<PendingCalls>) {
    let Some(transport) = ctx.transport() else {
        tracing::debug!("No transport for {}, reply dropped", reply.id());
        return;
    };

    let frame = match codec::encode(reply, format) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Failed to convert data: {}", e);
            if let Some(pending) = pending.upgrade() {
                forget_unsent_call(&pending, reply);
            }
            return;
        }
    };

    if let Err(e) = transport.send(frame) {
        tracing::warn!("Failed to send {}: {}", reply.id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ConnectionInfo;
    use crate::envelope::status;
    use crate::transport::{channel_transport, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn engine(role: Role) -> DispatchEngine {
        let engine = DispatchEngine::new(role, EngineConfig::default());
        engine.start();
        engine
    }

    fn connection() -> (CallContext, mpsc::UnboundedReceiver<Outbound>) {
        let (transport, rx) = channel_transport();
        (CallContext::new(Arc::new(transport)), rx)
    }

    async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Envelope {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => codec::decode(&frame).unwrap(),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_named_call_gets_reply_with_inherited_id() {
        let engine = engine(Role::Responder);
        engine
            .add_route(
                "echo",
                handler_fn(|env: Envelope, _ctx| async move {
                    Ok(Some(Envelope::success("ok").with_request(env.request)))
                }),
            )
            .unwrap();

        let (ctx, mut rx) = connection();
        let call = Envelope::call("echo", json!("hi"));
        engine.dispatch(call.clone(), ctx);

        let reply = next_envelope(&mut rx).await;
        assert_eq!(reply.id(), call.id());
        assert_eq!(reply.request, json!("hi"));
        assert!(reply.is_reply());
    }

    #[tokio::test]
    async fn test_unknown_key_gets_404() {
        let engine = engine(Role::Responder);
        let (ctx, mut rx) = connection();

        engine.dispatch(Envelope::call("nope.x", json!(null)).with_id("c7"), ctx);

        let reply = next_envelope(&mut rx).await;
        assert_eq!(reply.status, status::NOT_FOUND);
        assert_eq!(reply.message, NOT_FOUND_MESSAGE);
        assert_eq!(reply.id(), "c7");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_500() {
        let engine = engine(Role::Responder);
        engine
            .add_route(
                "fail",
                handler_fn(|_env: Envelope, _ctx| async move { Err(RpcError::handler("bad input")) }),
            )
            .unwrap();

        let (ctx, mut rx) = connection();
        engine.dispatch(Envelope::call("fail", json!(null)).with_id("c9"), ctx);

        let reply = next_envelope(&mut rx).await;
        assert_eq!(reply.status, status::ERROR);
        assert_eq!(reply.message, "bad input");
        assert_eq!(reply.id(), "c9");
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let engine = engine(Role::Responder);
        let (ctx, mut rx) = connection();

        engine.handle_frame(&Frame::Text("{not json".into()), ctx.clone());
        engine.handle_binary(&[0xc1], ctx);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let engine = engine(Role::Initiator);
        let (ctx, mut rx) = connection();

        engine.dispatch(Envelope::success("late").with_id("ghost"), ctx);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(engine.pending().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_callback_registers_before_send() {
        let engine = engine(Role::Initiator);
        let (ctx, mut rx) = connection();
        let transport = ctx.transport().cloned().unwrap();

        let id = engine
            .send_and_callback(
                transport.as_ref(),
                Envelope::call("a.b", json!(1)),
                WireFormat::Binary,
                handler_fn(|_env: Envelope, _ctx| async move { Ok(None) }),
            )
            .unwrap();

        assert!(engine.pending().contains(&id));
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => assert!(frame.is_binary()),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_send_removes_entry() {
        let engine = engine(Role::Initiator);
        let (transport, rx) = channel_transport();
        drop(rx);

        let envelope = Envelope::call("a.b", json!(1));
        let id = envelope.id().to_owned();
        let result = engine.send_and_callback(
            &transport,
            envelope,
            WireFormat::Text,
            handler_fn(|_env: Envelope, _ctx| async move { Ok(None) }),
        );

        assert!(result.is_err());
        assert!(!engine.pending().contains(&id));
    }

    #[tokio::test]
    async fn test_call_resolves_with_reply() {
        let engine = Arc::new(engine(Role::Initiator));
        let (ctx, mut rx) = connection();
        let transport = ctx.transport().cloned().unwrap();

        let caller = Arc::clone(&engine);
        let pending = tokio::spawn(async move {
            caller
                .call(transport.as_ref(), Envelope::call("math.add", json!([1, 2])), WireFormat::Text)
                .await
        });

        let call = next_envelope(&mut rx).await;
        engine.dispatch(Envelope::success("ok").with_id(call.id()).with_request(json!(3)), ctx);

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.request, json!(3));
    }

    #[test]
    fn test_drop_leaves_shared_cache_intact() {
        let routes = Arc::new(RouteTrie::new());
        let pending: Arc<PendingCalls> = Arc::new(CorrelationCache::new(Duration::from_secs(60)));
        let engine = DispatchEngine::with_components(
            Role::Initiator,
            WireFormat::Text,
            Arc::clone(&routes),
            Arc::clone(&pending),
        );

        pending.put("kept", handler_fn(|_env: Envelope, _ctx| async move { Ok(None) }));
        drop(engine);

        assert!(pending.contains("kept"));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_unsent_reply_keeps_pending_entry() {
        let engine = DispatchEngine::new(Role::Initiator, EngineConfig::default());
        let noop = handler_fn(|_env: Envelope, _ctx| async move { Ok(None) });
        engine.pending().put("c5", noop);

        let reply = Envelope::success("ok").with_id("c5");
        assert!(!forget_unsent_call(engine.pending(), &reply));
        assert!(engine.pending().contains("c5"));

        let call = Envelope::call("a.b", json!(null)).with_id("c5");
        assert!(forget_unsent_call(engine.pending(), &call));
        assert!(!engine.pending().contains("c5"));
    }

    #[tokio::test]
    async fn test_on_connect_rejects_bad_token() {
        let engine = engine(Role::Responder);
        let guard = HandshakeGuard::new("secret");

        let (transport, mut rx) = channel_transport();
        let info = Arc::new(ConnectionInfo::new(None, "/ws", Some("token=wrong")));
        let ctx = CallContext::new(Arc::new(transport)).with_connection(info);

        assert!(!engine.on_connect(&guard, &ctx));
        match rx.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, AUTH_FAIL_CODE);
                assert_eq!(reason, AUTH_FAIL_REASON);
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_connect_accepts_good_token() {
        let engine = engine(Role::Responder);
        let guard = HandshakeGuard::new("secret");

        let (transport, mut rx) = channel_transport();
        let info = Arc::new(ConnectionInfo::new(None, "/ws", Some("token=secret")));
        let ctx = CallContext::new(Arc::new(transport)).with_connection(info);

        assert!(engine.on_connect(&guard, &ctx));
        assert!(rx.try_recv().is_err());
    }
}

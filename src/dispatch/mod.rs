//! Dispatch module - handler execution and call correlation.
//!
//! Provides:
//! - [`DispatchEngine`] - decodes, routes and correlates envelopes for one role
//! - [`Handler`] with the [`handler_fn`] and [`typed`] adapters
//! - [`CallContext`] - the transport and connection handed to each handler
//! - [`SerialWorker`] - the single FIFO executor behind every engine
//! - [`HandshakeGuard`] - the per-connection token check
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use simplerpc::dispatch::{typed, DispatchEngine, EngineConfig, Role};
//!
//! let engine = DispatchEngine::new(Role::Responder, EngineConfig::default());
//! engine
//!     .add_route("math.add", typed(|(a, b): (i64, i64), _ctx| async move { Ok(a + b) }))
//!     .unwrap();
//! assert_eq!(engine.routes().paths(), vec!["math.add".to_string()]);
//! ```

mod context;
mod engine;
mod handler;
mod handshake;
mod worker;

pub use context::{parse_query, CallContext, ConnectionInfo};
pub use engine::{DispatchEngine, EngineConfig, PendingCalls, Role, Routes};
pub use handler::{handler_fn, typed, BoxFuture, FnHandler, Handler, HandlerResult, TypedHandler};
pub use handshake::{HandshakeGuard, AUTH_FAIL_CODE, AUTH_FAIL_REASON, TOKEN_PARAM};
pub use worker::{Job, SerialWorker, WorkerHandle};

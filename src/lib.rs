//! # simplerpc
//!
//! Bidirectional RPC over a persistent WebSocket.
//!
//! Both ends can call and answer. Every frame carries one [`Envelope`]:
//! a non-blank `key` names a handler on the receiving side, a blank `key`
//! marks a reply that is matched to its call by `id`.
//!
//! ## Architecture
//!
//! - **Routing** ([`router`]): dot-paths such as `user.profile.get` resolve
//!   through a concurrent trie
//! - **Correlation** ([`cache`]): outgoing calls park their reply handler in
//!   a timed cache; unanswered calls get a local 408
//! - **Dispatch** ([`dispatch`]): one engine per role decodes, routes and runs
//!   handlers on a single serialized worker
//! - **Wire** ([`codec`], [`transport`]): JSON text frames or MessagePack
//!   binary frames over `tokio-tungstenite`
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use simplerpc::dispatch::typed;
//! use simplerpc::{Envelope, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> simplerpc::Result<()> {
//!     let server = RpcServer::builder()
//!         .host("127.0.0.1")
//!         .port(0)
//!         .route_handler("math.add", typed(|(a, b): (i64, i64), _ctx| async move { Ok(a + b) }))
//!         .start()
//!         .await?;
//!
//!     let client = RpcClient::builder(format!("{}/ws", server.local_addr()))
//!         .connect()
//!         .await?;
//!     let reply = client.call(Envelope::call("math.add", json!([1, 2]))).await?;
//!     assert_eq!(reply.request, json!(3));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod router;
pub mod transport;

mod client;
mod server;

pub use cache::CorrelationCache;
pub use client::{ClientBuilder, RpcClient};
pub use dispatch::{CallContext, DispatchEngine, Handler};
pub use envelope::Envelope;
pub use error::{Result, RpcError};
pub use router::RouteTrie;
pub use server::{RpcServer, ServerBuilder, DEFAULT_PATH, DEFAULT_PORT, LIVENESS_MESSAGE};

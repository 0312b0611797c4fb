//! Echo server - routes, typed handlers and server-initiated calls.
//!
//! ```text
//! cargo run --example echo_server
//! cargo run --example echo_client
//! curl -s localhost:8080/ | xxd    # liveness probe
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use simplerpc::dispatch::typed;
use simplerpc::{Envelope, RpcServer};
use tracing_subscriber::EnvFilter;

/// Input structure for the echo route.
#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo route.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = RpcServer::builder()
        .port(8080)
        .token("secret")
        .route_handler(
            "echo",
            typed(|input: EchoInput, _ctx| async move {
                Ok(EchoOutput {
                    echo: input.message,
                })
            }),
        )
        .route("user.whoami", |_env: Envelope, ctx| async move {
            let peer = ctx
                .connection()
                .and_then(|c| c.peer_addr())
                .map(|addr| addr.to_string())
                .unwrap_or_default();
            Ok(Some(Envelope::success(peer)))
        })
        .start()
        .await?;

    // Server-initiated call: greet the caller, then ping it back.
    let server = Arc::new(server);
    let weak = Arc::downgrade(&server);
    server.add_route("user.hello", move |_env: Envelope, ctx| {
        let weak = weak.clone();
        async move {
            if let Some(server) = weak.upgrade() {
                server.send_and_callback(&ctx, Envelope::call("client.ping", json!(null)), |reply: Envelope, _ctx| async move {
                    tracing::info!("client.ping -> {} {}", reply.status, reply.message);
                    Ok(None)
                })?;
            }
            Ok(Some(Envelope::success("hello")))
        }
    })?;

    tokio::select! {
        _ = server.wait_for_shutdown() => {}
        _ = tokio::signal::ctrl_c() => server.stop(),
    }
    Ok(())
}

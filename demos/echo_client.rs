//! Echo client - calls the echo server and answers its calls.

use std::time::Duration;

use serde_json::json;
use simplerpc::{Envelope, RpcClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = RpcClient::builder("127.0.0.1:8080/ws")
        .token("secret")
        .timeout(Duration::from_secs(5))
        .route("client.ping", |_env: Envelope, _ctx| async move {
            Ok(Some(Envelope::success("pong")))
        })
        .connect()
        .await?;

    let reply = client
        .call(Envelope::call("echo", json!({"message": "hello"})))
        .await?;
    tracing::info!("echo -> {} {}", reply.status, reply.request);

    let reply = client.call(Envelope::call("user.whoami", json!(null))).await?;
    tracing::info!("whoami -> {}", reply.message);

    // The server answers and calls our client.ping route back.
    let reply = client.call(Envelope::call("user.hello", json!(null))).await?;
    tracing::info!("hello -> {}", reply.message);

    let reply = client.call(Envelope::call("math.multiply", json!([2, 3]))).await?;
    tracing::info!("missing -> {} {}", reply.status, reply.message);

    // Fire-and-callback: the handler runs on the reply or on the local 408.
    let id = client.send_and_callback(Envelope::call("echo", json!({"message": "later"})), |env: Envelope, _ctx| async move {
        tracing::info!("callback -> {} {}", env.status, env.request);
        Ok(None)
    })?;
    tracing::info!("sent {}", id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.stop();
    Ok(())
}

//! Start a deepsider-proxy server programmatically.
//!
//! Usage:
//!   cargo run --example serve
//!   curl -H "Authorization: Bearer $DEEPSIDER_TOKEN" localhost:7860/admin/balance

use deepsider_proxy::proxy::build_client;
use deepsider_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ProxyConfig::find_and_load(None)?;
    println!("Upstream: {}", config.upstream.base_url);

    let logger = SharedLogger::new("proxy-example.log")?;
    let client = build_client(&config)?;

    let port = config.port;
    let state = Arc::new(AppState::new(config, client, logger));

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Listening on http://{}", addr);
    println!();
    println!("  OPENAI_BASE_URL=http://localhost:{}/v1", port);

    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use comparables::{build_router, init_tracing, AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    let state = AppState::initialize(config).context("failed to initialize services")?;
    let app = build_router(Arc::new(state));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "recommendation service listening");
    axum::serve(listener, app).await?;
    Ok(())
}

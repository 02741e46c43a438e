//! HTTP surface: `GET /health` and `POST /predict`

mod handlers;
mod routes;

pub use handlers::ApiError;
pub use routes::{create_router, AppState};

use std::sync::Arc;

use crate::engine::AdvisorEngine;

/// Bind the configured address and serve until the process is stopped.
pub async fn serve(engine: Arc<AdvisorEngine>) -> anyhow::Result<()> {
    let addr = engine.settings().bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "listening");
    axum::serve(listener, create_router(engine)).await?;
    Ok(())
}

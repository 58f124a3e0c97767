//! HTTP-streaming transport: `POST/GET/DELETE /mcp` via `rmcp`'s built-in
//! session-aware service, plus `/health` and optional API-key gating.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{SpikeError, SpikeResult};
use crate::fleet::Fleet;

use super::auth::{require_api_key, ApiKeyState};
use super::SpikeMultiplexer;

async fn health(handler: axum::extract::State<SpikeMultiplexer>) -> impl IntoResponse {
    let tools = handler.0.tool_count().await;
    axum::Json(serde_json::json!({"status": "ok", "tools": tools}))
}

async fn not_found() -> impl IntoResponse {
    (
        axum::http::StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({"error": "Not found"})),
    )
}

pub async fn serve(fleet: Arc<Fleet>, port: u16, api_key: Option<String>) -> SpikeResult<()> {
    let handler = SpikeMultiplexer::new(Arc::clone(&fleet));
    let cancellation = CancellationToken::new();

    let config = StreamableHttpServerConfig {
        stateful_mode: true,
        ..Default::default()
    };

    let factory_handler = handler.clone();
    let service: StreamableHttpService<SpikeMultiplexer> = StreamableHttpService::new(
        move || Ok(factory_handler.clone()),
        Arc::default(),
        config,
    );

    let mut app = axum::Router::new().nest_service("/mcp", service);
    if let Some(key) = api_key {
        app = app.route_layer(axum::middleware::from_fn_with_state(
            ApiKeyState {
                expected: Arc::new(key),
            },
            require_api_key,
        ));
    }

    let app = app
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(handler);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(SpikeError::Io)?;
    info!(%addr, "serving MCP over streamable HTTP");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            crate::shutdown::wait_for_signal().await;
            cancellation.cancel();
        })
        .await
        .map_err(SpikeError::Io)?;

    fleet.close_all().await;
    Ok(())
}

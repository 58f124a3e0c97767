//! SSE transport: `GET /sse` opens the event stream and hands back a
//! session id in the stream prelude, `POST /messages?sessionId=<id>`
//! delivers client messages for that session. Same `/health` and API-key
//! rules as the streamable-HTTP transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::routing::get;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
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
    let ct = CancellationToken::new();

    let bind: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| SpikeError::InvalidConfig(format!("invalid bind address: {e}")))?;

    let config = SseServerConfig {
        bind,
        sse_path: "/sse".to_string(),
        post_path: "/messages".to_string(),
        ct: ct.child_token(),
        sse_keep_alive: Some(Duration::from_secs(15)),
    };

    let (sse_server, router) = SseServer::new(config);

    let mut app = router;
    if let Some(key) = api_key {
        app = app.route_layer(axum::middleware::from_fn_with_state(
            ApiKeyState {
                expected: Arc::new(key),
            },
            require_api_key,
        ));
    }
    let health_router = axum::Router::new()
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(handler.clone());

    let app = app
        .merge(health_router)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(SpikeError::Io)?;
    info!(%bind, "serving MCP over SSE");

    let accept_ct = ct.child_token();
    let accept_handler = handler.clone();
    let accept_loop = tokio::spawn(async move {
        use rmcp::ServiceExt;
        let mut sse_server = sse_server;
        while let Some(transport) = sse_server.next_transport().await {
            let session_handler = accept_handler.clone();
            let session_ct = accept_ct.child_token();
            tokio::spawn(async move {
                if let Ok(service) = session_handler.serve_with_ct(transport, session_ct).await {
                    let _ = service.waiting().await;
                }
            });
        }
    });

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            crate::shutdown::wait_for_signal().await;
            ct.cancel();
        })
        .await
        .map_err(SpikeError::Io);

    accept_loop.abort();
    fleet.close_all().await;
    serve_result?;
    Ok(())
}

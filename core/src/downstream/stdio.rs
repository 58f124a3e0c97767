//! Single long-lived server bound to process stdio. stdout carries MCP
//! JSON-RPC frames exclusively; every diagnostic goes to stderr via
//! `tracing`'s default writer.

use std::sync::Arc;

use tracing::info;

use crate::error::{SpikeError, SpikeResult};
use crate::fleet::Fleet;

use super::SpikeMultiplexer;

pub async fn serve(fleet: Arc<Fleet>) -> SpikeResult<()> {
    let handler = SpikeMultiplexer::new(Arc::clone(&fleet));
    let transport = rmcp::transport::io::stdio();

    info!("serving MCP over stdio");
    let service = rmcp::serve_server(handler, transport)
        .await
        .map_err(|e| SpikeError::Sdk(Box::new(e.into())))?;

    let shutdown = crate::shutdown::wait_for_signal();
    tokio::select! {
        result = service.waiting() => {
            result.map_err(|e| SpikeError::Sdk(Box::new(e.into())))?;
        }
        _ = shutdown => {
            info!("shutdown signal received, closing stdio session");
        }
    }

    fleet.close_all().await;
    Ok(())
}

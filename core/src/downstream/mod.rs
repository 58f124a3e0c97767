//! The MCP server exposed to downstream clients: a single [`ServerHandler`]
//! implementation shared across all three transports.

mod auth;
pub mod http;
pub mod sse;
pub mod stdio;

pub use auth::constant_time_eq;

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};

use crate::fleet::Fleet;

/// Handles `tools/list` and `tools/call` against a shared [`Fleet`].
/// One instance backs every session on every transport.
#[derive(Clone)]
pub struct SpikeMultiplexer {
    fleet: Arc<Fleet>,
}

impl SpikeMultiplexer {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub async fn tool_count(&self) -> usize {
        self.fleet.get_all_tools().await.len()
    }
}

impl ServerHandler for SpikeMultiplexer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "spike".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("spike MCP multiplexer".into()),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Aggregates tools from every configured upstream MCP server under a \
                 namespaced, filtered, toolset-gated catalog."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let namespaced = self.fleet.get_all_tools().await;
        let tools = namespaced
            .into_iter()
            .map(|nt| {
                let description = match &nt.descriptor.description {
                    Some(desc) => format!("[{}] {}", nt.server, desc),
                    None => format!("[{}] {}", nt.server, nt.descriptor.name),
                };
                let schema = match nt.descriptor.input_schema {
                    serde_json::Value::Object(map) => map,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("type".to_string(), serde_json::json!("object"));
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                Tool {
                    name: nt.namespaced_name.into(),
                    description: Some(description.into()),
                    input_schema: Arc::new(schema),
                    output_schema: None,
                    annotations: None,
                    title: None,
                    icons: None,
                }
            })
            .collect();

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        match self.fleet.call_tool(&request.name, arguments).await {
            Ok(result) => Ok(result),
            Err(err) => Ok(CallToolResult::error(vec![Content::text(
                err.to_mcp_error_text(),
            )])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_tool_converts_engine_errors_into_is_error_results() {
        let fleet = Arc::new(Fleet::default());
        let multiplexer = SpikeMultiplexer::new(fleet);
        let result = multiplexer
            .fleet()
            .call_tool("ghost__do_thing", serde_json::Map::new())
            .await;
        assert!(result.is_err());
    }
}

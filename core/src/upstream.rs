//! One upstream MCP server connection: connect, cache its tool catalog,
//! forward calls, close.
//!
//! Ownership is exclusive — the Fleet Manager is the only caller that holds
//! an `Upstream`; nothing retains a reference across a `close()`.

use std::process::Stdio;
use std::time::Instant;

use rmcp::model::CallToolRequestParam;
use rmcp::service::{NotificationContext, RunningService};
use rmcp::transport::{
    streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::{ClientHandler, RmcpError, RoleClient, ServiceExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ToolDescriptor, UpstreamConfig};
use crate::error::{SpikeError, SpikeResult};

/// `{content: [...], isError?}`, forwarded verbatim from the transport.
pub type CallResult = rmcp::model::CallToolResult;

/// Concatenates every `text` content block with newlines; the only block
/// type the engine itself interprets (agent loop tool_result bookkeeping,
/// session engine post-call JSON parsing).
pub fn call_result_text(result: &CallResult) -> String {
    result
        .content
        .iter()
        .filter_map(|block| block.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_to_descriptor(tool: &rmcp::model::Tool) -> ToolDescriptor {
    let schema = serde_json::Value::Object((*tool.input_schema).clone());
    ToolDescriptor::new(
        tool.name.to_string(),
        tool.description.as_ref().map(|d| d.to_string()),
        schema,
    )
}

/// Notifies the Fleet Manager that an upstream's `tools/list` may have
/// changed, so it can be refreshed in place instead of waiting for the next
/// reconnect. One instance per upstream client.
#[derive(Clone)]
struct RefreshHandler {
    name: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandler for RefreshHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        let _ = self.tx.send(self.name.clone());
    }
}

type Client = RunningService<RoleClient, RefreshHandler>;

pub struct Upstream {
    name: String,
    config: UpstreamConfig,
    client: Option<Client>,
    connected: bool,
    tools: Vec<ToolDescriptor>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
    refresh_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Upstream {
    pub fn new(name: impl Into<String>, config: UpstreamConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: None,
            connected: false,
            tools: Vec::new(),
            connected_at: None,
            last_error: None,
            refresh_tx: None,
        }
    }

    /// Wires this upstream's `notifications/tools/list_changed` handler to
    /// `tx`; the Fleet Manager owns the receiving end and recomputes this
    /// upstream's tool cache when a name arrives.
    pub fn with_refresh_sender(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    fn handler(&self) -> RefreshHandler {
        RefreshHandler {
            name: self.name.clone(),
            tx: self
                .refresh_tx
                .clone()
                .unwrap_or_else(|| mpsc::unbounded_channel().0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Builds the transport named by `self.config`, initializes the MCP
    /// session, and caches `tools/list`. A successful connect that yields
    /// zero tools is a soft warning, not a failure — the upstream remains
    /// in the fleet as an empty contributor.
    pub async fn connect(&mut self) -> SpikeResult<()> {
        let client = match &self.config {
            UpstreamConfig::Stdio { command, args, env, .. } => {
                self.connect_stdio(command, args, env).await
            }
            UpstreamConfig::Http { url, env, .. } => self.connect_http(url, env).await,
            UpstreamConfig::Sse { url, env, .. } => self.connect_sse(url, env).await,
        };

        let client = match client {
            Ok(client) => client,
            Err(err) => {
                let message = err.to_string();
                self.last_error = Some(message.clone());
                if SpikeError::looks_like_auth_failure(&message) {
                    warn!(upstream = %self.name, "connect failed, looks like a missing or invalid credential");
                    return Err(SpikeError::UpstreamAuth {
                        name: self.name.clone(),
                        env_hint: "SPIKE_AUTH_TOKEN".to_string(),
                    });
                }
                return Err(SpikeError::UpstreamConnect {
                    name: self.name.clone(),
                    source: Box::new(err),
                });
            }
        };

        let tools = match client.list_all_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                let message = err.to_string();
                self.last_error = Some(message.clone());
                if SpikeError::looks_like_auth_failure(&message) {
                    warn!(upstream = %self.name, "tools/list failed, looks like a missing or invalid credential");
                    return Err(SpikeError::UpstreamAuth {
                        name: self.name.clone(),
                        env_hint: "SPIKE_AUTH_TOKEN".to_string(),
                    });
                }
                return Err(SpikeError::UpstreamConnect {
                    name: self.name.clone(),
                    source: Box::new(SpikeError::Sdk(Box::new(err.into()))),
                });
            }
        };

        self.tools = tools.iter().map(tool_to_descriptor).collect();
        self.client = Some(client);
        self.connected = true;
        self.connected_at = Some(Instant::now());
        self.last_error = None;

        if self.tools.is_empty() {
            warn!(
                upstream = %self.name,
                "connected but advertised zero tools — check that the expected \
                 credential environment variable is set"
            );
        } else {
            debug!(upstream = %self.name, tool_count = self.tools.len(), "connected");
        }

        Ok(())
    }

    async fn connect_stdio(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> SpikeResult<Client> {
        let path = std::env::var("PATH").unwrap_or_default();
        let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
            |cmd| {
                cmd.env_clear()
                    .env("PATH", &path)
                    .args(args)
                    .envs(env.iter())
                    .stderr(Stdio::inherit());
            },
        ))
        .map_err(SpikeError::Io)?;

        info!(upstream = %self.name, %command, "connecting via stdio");
        self.handler()
            .serve(transport)
            .await
            .map_err(|e| SpikeError::Sdk(Box::new(e.into())))
    }

    async fn connect_http(
        &self,
        url: &str,
        env: &std::collections::HashMap<String, String>,
    ) -> SpikeResult<Client> {
        let mut config = StreamableHttpClientTransportConfig::with_uri(url);
        if let Some(token) = env.get("SPIKE_AUTH_TOKEN") {
            config.auth_header = Some(token.clone());
        }
        let transport = StreamableHttpClientTransport::from_config(config);

        info!(upstream = %self.name, %url, "connecting via streamable HTTP");
        self.handler()
            .serve(transport)
            .await
            .map_err(|e| SpikeError::Sdk(Box::new(e.into())))
    }

    async fn connect_sse(
        &self,
        url: &str,
        env: &std::collections::HashMap<String, String>,
    ) -> SpikeResult<Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(token) = env.get("SPIKE_AUTH_TOKEN") {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| SpikeError::InvalidConfig(format!("invalid auth token for {url}")))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let http_client = builder.build().map_err(SpikeError::Http)?;

        let transport = SseClientTransport::start_with_client(
            http_client,
            rmcp::transport::sse_client::SseClientConfig {
                sse_endpoint: url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| SpikeError::Sdk(Box::new(RmcpError::transport_creation::<SseClientTransport<reqwest::Client>>(e))))?;

        info!(upstream = %self.name, %url, "connecting via SSE");
        self.handler()
            .serve(transport)
            .await
            .map_err(|e| SpikeError::Sdk(Box::new(e.into())))
    }

    /// Requires `connected`; forwards verbatim, including `isError`. The
    /// caller passes the upstream-local (un-namespaced) tool name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> SpikeResult<CallResult> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SpikeError::NotConnected(self.name.clone()))?;
        if !self.connected {
            return Err(SpikeError::NotConnected(self.name.clone()));
        }

        client
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| SpikeError::Sdk(Box::new(e.into())))
    }

    /// Re-fetches `tools/list` and swaps the cached catalog in place,
    /// without tearing down and reopening the session. Called after the
    /// upstream sends `notifications/tools/list_changed`.
    pub async fn refresh_tools(&mut self) -> SpikeResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SpikeError::NotConnected(self.name.clone()))?;
        let tools = client
            .list_all_tools()
            .await
            .map_err(|e| SpikeError::Sdk(Box::new(e.into())))?;
        self.tools = tools.iter().map(tool_to_descriptor).collect();
        debug!(upstream = %self.name, tool_count = self.tools.len(), "refreshed tool list");
        Ok(())
    }

    pub async fn close(&mut self) -> SpikeResult<()> {
        if let Some(client) = self.client.take() {
            client
                .cancel()
                .await
                .map_err(|e| SpikeError::Sdk(Box::new(e.into())))?;
        }
        self.connected = false;
        self.tools.clear();
        self.connected_at = None;
        Ok(())
    }
}

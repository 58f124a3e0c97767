//! Crate-wide error taxonomy.
//!
//! Mirrors the error table in the engine specification: each variant names
//! the component that raises it; the recovery policy lives with the caller,
//! not the error type. Every error that crosses the MCP downstream boundary
//! is converted to a `CallResult{isError: true}` rather than a transport
//! fault — see [`crate::downstream`].

use thiserror::Error;

pub type SpikeResult<T> = Result<T, SpikeError>;

#[derive(Debug, Error)]
pub enum SpikeError {
    #[error("upstream '{0}' is not connected")]
    NotConnected(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("cannot resolve wire name into a (server, tool) pair: {0}")]
    CannotResolve(String),

    #[error("toolset '{toolset}' is not loaded, so tools on server '{server}' are hidden")]
    ToolsetNotLoaded { server: String, toolset: String },

    #[error("unknown toolset: {0}")]
    UnknownToolset(String),

    #[error("upstream '{name}' failed to connect: {source}")]
    UpstreamConnect {
        name: String,
        #[source]
        source: Box<SpikeError>,
    },

    #[error("upstream '{name}' looks unauthenticated (expected ${env_hint} to be set)")]
    UpstreamAuth { name: String, env_hint: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid JSON arguments: {0}")]
    InvalidJsonArgs(String),

    #[error("missing required parameter '{0}'")]
    MissingRequiredParam(String),

    #[error(
        "ambiguous tool reference '{query}': best match '{best}' did not clear the disambiguation margin over '{runner_up}'"
    )]
    Ambiguous {
        query: String,
        best: String,
        runner_up: String,
    },

    #[error("chat stream error: {0}")]
    Stream(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Sdk(#[from] Box<rmcp::RmcpError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl SpikeError {
    /// True for the authentication-like upstream failures the spec calls
    /// out for a diagnostic hint (401/403/"Unauthorized" substring).
    pub fn looks_like_auth_failure(message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        lower.contains("401") || lower.contains("403") || lower.contains("unauthorized")
    }

    /// Render this error as the text body of an MCP `isError: true` result,
    /// per the propagation policy in the error-handling section: every
    /// boundary-crossing error becomes `"Error: <message>"`.
    pub fn to_mcp_error_text(&self) -> String {
        format!("Error: {self}")
    }
}

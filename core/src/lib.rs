//! Upstream fleet management, downstream MCP multiplexing, and the
//! agent/session engine behind spike.
//!
//! A single process connects to many upstream MCP servers ([`upstream`],
//! [`fleet`]), merges their tool catalogs under a namespaced, filtered,
//! toolset-gated view ([`namespace`], [`filter`], [`toolset`]), and
//! re-exposes that view to downstream clients over stdio, HTTP-streaming or
//! SSE ([`downstream`]). [`agent`] drives an LLM through that merged
//! catalog; [`session`] drives an interactive REPL through the same thing.

pub mod agent;
pub mod config;
pub mod discovery;
pub mod downstream;
pub mod error;
pub mod filter;
pub mod fleet;
pub mod namespace;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod toolset;
pub mod upstream;
pub mod watch;

pub use config::{NamespacedTool, ResolvedConfig, ToolDescriptor, UpstreamConfig};
pub use error::{SpikeError, SpikeResult};
pub use fleet::Fleet;

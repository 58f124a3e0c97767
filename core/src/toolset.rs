//! Groups upstreams into named toolsets whose tools stay hidden from the
//! catalog until the toolset is explicitly loaded, plus the three synthetic
//! `spike__*` meta-tools that let an LLM page capabilities in on demand.

use std::collections::HashSet;

use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Content};

use crate::config::ToolsetSpec;
use crate::error::{SpikeError, SpikeResult};

pub const META_SERVER: &str = "spike";
pub const LIST_TOOLSETS: &str = "list_toolsets";
pub const LOAD_TOOLSET: &str = "load_toolset";
pub const UNLOAD_TOOLSET: &str = "unload_toolset";

pub struct ToolsetController {
    toolsets: std::collections::HashMap<String, ToolsetSpec>,
    loaded: Mutex<HashSet<String>>,
}

impl ToolsetController {
    pub fn new(toolsets: std::collections::HashMap<String, ToolsetSpec>) -> Self {
        Self {
            toolsets,
            loaded: Mutex::new(HashSet::new()),
        }
    }

    /// A server is visible iff it belongs to no toolset, or at least one
    /// containing toolset is loaded.
    pub fn is_visible(&self, server: &str) -> bool {
        let containing: Vec<&str> = self
            .toolsets
            .iter()
            .filter(|(_, spec)| spec.servers.iter().any(|s| s == server))
            .map(|(name, _)| name.as_str())
            .collect();

        if containing.is_empty() {
            return true;
        }
        let loaded = self.loaded.lock();
        containing.iter().any(|name| loaded.contains(*name))
    }

    /// The first toolset (by iteration) that lists `server` as a member,
    /// used only to name the toolset in a `ToolsetNotLoaded` error.
    pub fn containing_toolset(&self, server: &str) -> Option<String> {
        self.toolsets
            .iter()
            .find(|(_, spec)| spec.servers.iter().any(|s| s == server))
            .map(|(name, _)| name.clone())
    }

    pub fn load_toolset(&self, name: &str) -> SpikeResult<()> {
        if !self.toolsets.contains_key(name) {
            return Err(SpikeError::UnknownToolset(name.to_string()));
        }
        self.loaded.lock().insert(name.to_string());
        Ok(())
    }

    pub fn unload_toolset(&self, name: &str) -> SpikeResult<()> {
        if !self.toolsets.contains_key(name) {
            return Err(SpikeError::UnknownToolset(name.to_string()));
        }
        self.loaded.lock().remove(name);
        Ok(())
    }

    pub fn original_name<'a>(wire_name: &'a str, sep: &str) -> Option<&'a str> {
        wire_name.strip_prefix(&format!("{META_SERVER}{sep}"))
    }

    pub fn is_meta_tool(wire_name: &str, sep: &str) -> bool {
        matches!(
            Self::original_name(wire_name, sep),
            Some(LIST_TOOLSETS) | Some(LOAD_TOOLSET) | Some(UNLOAD_TOOLSET)
        )
    }

    /// Dispatches a meta-tool call. `tool_count` reports how many tools a
    /// given server currently advertises, supplied by the Fleet Manager
    /// since toolset membership alone doesn't know per-server catalogs.
    pub fn call(
        &self,
        original_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        tool_count: impl Fn(&str) -> usize,
    ) -> CallToolResult {
        match original_name {
            LIST_TOOLSETS => self.list_toolsets(tool_count),
            LOAD_TOOLSET => self.handle_load(arguments, tool_count),
            UNLOAD_TOOLSET => self.handle_unload(arguments),
            other => CallToolResult::error(vec![Content::text(format!(
                "Error: unknown meta-tool '{other}'"
            ))]),
        }
    }

    fn list_toolsets(&self, tool_count: impl Fn(&str) -> usize) -> CallToolResult {
        let loaded = self.loaded.lock();
        let entries: Vec<serde_json::Value> = self
            .toolsets
            .iter()
            .map(|(name, spec)| {
                let total: usize = spec.servers.iter().map(|s| tool_count(s)).sum();
                serde_json::json!({
                    "name": name,
                    "description": spec.description,
                    "loaded": loaded.contains(name),
                    "servers": spec.servers,
                    "toolCount": total,
                })
            })
            .collect();
        CallToolResult::success(vec![Content::text(
            serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string()),
        )])
    }

    fn handle_load(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
        tool_count: impl Fn(&str) -> usize,
    ) -> CallToolResult {
        let Some(name) = arguments.get("name").and_then(|v| v.as_str()) else {
            return CallToolResult::error(vec![Content::text(
                "Error: missing required parameter 'name'",
            )]);
        };
        match self.load_toolset(name) {
            Ok(()) => {
                let spec = &self.toolsets[name];
                let total: usize = spec.servers.iter().map(|s| tool_count(s)).sum();
                CallToolResult::success(vec![Content::text(format!(
                    "Loaded toolset '{name}': servers [{}], {total} tools now available",
                    spec.servers.join(", ")
                ))])
            }
            Err(err) => CallToolResult::error(vec![Content::text(err.to_mcp_error_text())]),
        }
    }

    fn handle_unload(&self, arguments: &serde_json::Map<String, serde_json::Value>) -> CallToolResult {
        let Some(name) = arguments.get("name").and_then(|v| v.as_str()) else {
            return CallToolResult::error(vec![Content::text(
                "Error: missing required parameter 'name'",
            )]);
        };
        if !self.loaded.lock().contains(name) {
            return CallToolResult::error(vec![Content::text(format!(
                "Error: toolset '{name}' is not loaded"
            ))]);
        }
        match self.unload_toolset(name) {
            Ok(()) => CallToolResult::success(vec![Content::text(format!(
                "Unloaded toolset '{name}'"
            ))]),
            Err(err) => CallToolResult::error(vec![Content::text(err.to_mcp_error_text())]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ToolsetController {
        let mut toolsets = std::collections::HashMap::new();
        toolsets.insert(
            "github".to_string(),
            ToolsetSpec {
                servers: vec!["github-mcp".to_string()],
                description: None,
            },
        );
        toolsets.insert(
            "testing".to_string(),
            ToolsetSpec {
                servers: vec!["vitest".to_string(), "playwright".to_string()],
                description: None,
            },
        );
        ToolsetController::new(toolsets)
    }

    #[test]
    fn server_in_no_toolset_is_always_visible() {
        let controller = controller();
        assert!(controller.is_visible("some-other-server"));
    }

    #[test]
    fn loading_a_toolset_only_affects_its_own_members() {
        let controller = controller();
        assert!(!controller.is_visible("github-mcp"));
        controller.load_toolset("github").unwrap();
        assert!(controller.is_visible("github-mcp"));
        assert!(!controller.is_visible("vitest"));
    }

    #[test]
    fn unknown_toolset_names_fail() {
        let controller = controller();
        assert!(matches!(
            controller.load_toolset("nope"),
            Err(SpikeError::UnknownToolset(_))
        ));
        assert!(matches!(
            controller.unload_toolset("nope"),
            Err(SpikeError::UnknownToolset(_))
        ));
    }

    #[test]
    fn meta_tool_names_are_recognised() {
        assert!(ToolsetController::is_meta_tool("spike__list_toolsets", "__"));
        assert!(ToolsetController::is_meta_tool("spike__load_toolset", "__"));
        assert!(!ToolsetController::is_meta_tool("vitest__run_tests", "__"));
    }

    #[test]
    fn unload_toolset_fails_when_not_loaded() {
        let controller = controller();
        let mut args = serde_json::Map::new();
        args.insert("name".to_string(), serde_json::json!("github"));
        let result = controller.handle_unload(&args);
        assert_eq!(result.is_error, Some(true));
    }

    #[test]
    fn list_toolsets_reports_loaded_state_and_tool_counts() {
        let controller = controller();
        controller.load_toolset("testing").unwrap();
        let result = controller.list_toolsets(|server| match server {
            "vitest" => 2,
            "playwright" => 1,
            _ => 0,
        });
        let text = crate::upstream::call_result_text(&result);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let testing = parsed
            .as_array()
            .unwrap()
            .iter()
            .find(|v| v["name"] == "testing")
            .unwrap();
        assert_eq!(testing["loaded"], true);
        assert_eq!(testing["toolCount"], 3);
    }
}

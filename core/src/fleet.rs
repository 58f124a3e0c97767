//! Owns every upstream connection, composes the downstream tool catalog,
//! and dispatches `tools/call` to the right upstream.
//!
//! Structural changes to the upstream map (insert/remove) go through a
//! single `parking_lot::Mutex`-guarded insertion-order list so iteration
//! order is stable across `getAllTools()` calls; the per-upstream
//! `dashmap::DashMap` entries hold an async-aware lock so a slow `callTool`
//! on one upstream never blocks structural changes to another.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{NamespacedTool, ResolvedConfig, UpstreamConfig};
use crate::error::{SpikeError, SpikeResult};
use crate::filter;
use crate::namespace::{self, DEFAULT_SEPARATOR};
use crate::reconnect::ReconnectScheduler;
use crate::toolset::{ToolsetController, META_SERVER};
use crate::upstream::{CallResult, Upstream};

pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Per-upstream outcome of [`probe_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamStatus {
    Connected { tool_count: usize },
    Failed { message: String },
    TimedOut,
}

pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Independently probes every configured upstream with a fresh, short-lived
/// connection capped at `timeout` — never touches a `Fleet`'s own persistent
/// upstream map, so a health check never disturbs traffic already flowing
/// through those connections. A connect that doesn't finish in time is
/// aborted and reported as `TimedOut` rather than left to hang.
pub async fn probe_status(
    resolved: &ResolvedConfig,
    timeout: Duration,
) -> BTreeMap<String, UpstreamStatus> {
    let mut tasks = JoinSet::new();
    for (name, config) in resolved.upstreams.iter() {
        let name = name.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let mut upstream = Upstream::new(name.clone(), config);
            let status = match tokio::time::timeout(timeout, upstream.connect()).await {
                Ok(Ok(())) => UpstreamStatus::Connected {
                    tool_count: upstream.tools().len(),
                },
                Ok(Err(err)) => UpstreamStatus::Failed {
                    message: err.to_string(),
                },
                Err(_) => UpstreamStatus::TimedOut,
            };
            let _ = upstream.close().await;
            (name, status)
        });
    }

    let mut out = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok((name, status)) = joined {
            out.insert(name, status);
        }
    }
    out
}

pub struct Fleet {
    order: Mutex<Vec<String>>,
    upstreams: DashMap<String, Arc<AsyncMutex<Upstream>>>,
    separator: String,
    no_prefix: bool,
    toolsets: Option<Arc<ToolsetController>>,
    refresh_tx: mpsc::UnboundedSender<String>,
    refresh_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<String>>>,
    scheduler: Arc<ReconnectScheduler>,
}

impl Fleet {
    pub fn new(separator: impl Into<String>, no_prefix: bool) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            order: Mutex::new(Vec::new()),
            upstreams: DashMap::new(),
            separator: separator.into(),
            no_prefix,
            toolsets: None,
            refresh_tx,
            refresh_rx: AsyncMutex::new(Some(refresh_rx)),
            scheduler: Arc::new(ReconnectScheduler::default()),
        }
    }

    pub fn with_toolsets(mut self, toolsets: Arc<ToolsetController>) -> Self {
        self.toolsets = Some(toolsets);
        self
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Drains tool-list-changed notices from every upstream client and
    /// refreshes the named upstream's cache in place. Runs until the fleet
    /// (and every clone of its sender) is dropped; call once per fleet,
    /// after wrapping it in an `Arc`.
    pub async fn run_refresh_loop(self: &Arc<Self>) {
        let mut rx = match self.refresh_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some(name) = rx.recv().await {
            let Some(handle) = self.upstreams.get(&name).map(|e| Arc::clone(&e)) else {
                continue;
            };
            let mut upstream = handle.lock().await;
            match upstream.refresh_tools().await {
                Ok(()) => debug!(upstream = %name, "tool list refreshed after change notification"),
                Err(err) => warn!(upstream = %name, %err, "failed to refresh tool list"),
            }
        }
    }

    fn insert(&self, name: String, upstream: Upstream) {
        if !self.upstreams.contains_key(&name) {
            self.order.lock().push(name.clone());
        }
        self.upstreams
            .insert(name, Arc::new(AsyncMutex::new(upstream)));
    }

    fn remove(&self, name: &str) -> Option<Arc<AsyncMutex<Upstream>>> {
        self.order.lock().retain(|k| k != name);
        self.upstreams.remove(name).map(|(_, v)| v)
    }

    fn ordered_names(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    /// Creates one Upstream per configured entry and connects all of them
    /// concurrently. Per-upstream failures are logged, not propagated: a
    /// slow or broken upstream never blocks the others, and every upstream
    /// — failed or not — stays in the fleet so `status` can report it.
    pub async fn connect_all(self: &Arc<Self>, resolved: &ResolvedConfig) {
        let mut tasks = JoinSet::new();
        let mut attempted = 0usize;

        for (name, config) in resolved.upstreams.iter() {
            attempted += 1;
            let name = name.clone();
            let config = config.clone();
            let refresh_tx = self.refresh_tx.clone();
            tasks.spawn(async move {
                let mut upstream =
                    Upstream::new(name.clone(), config.clone()).with_refresh_sender(refresh_tx);
                let result = upstream.connect().await;
                (name, config, upstream, result)
            });
        }

        let mut connected = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (name, config, upstream, result) = match joined {
                Ok(quad) => quad,
                Err(join_err) => {
                    warn!(%join_err, "connect task panicked");
                    continue;
                }
            };
            match &result {
                Ok(()) => connected += 1,
                Err(err) => {
                    warn!(upstream = %name, %err, "upstream connect failed");
                    self.schedule_reconnect(name.clone(), config);
                }
            }
            self.insert(name, upstream);
        }

        info!(connected, attempted, "connectAll finished");
    }

    /// Installs a backoff timer that retries `Fleet::reconnect` for `name`
    /// until it succeeds or the scheduler's attempt cap is reached. Called
    /// whenever an upstream connect attempt fails outside of an explicit,
    /// operator-requested reconnect.
    fn schedule_reconnect(self: &Arc<Self>, name: String, config: UpstreamConfig) {
        let fleet = Arc::clone(self);
        let retry_name = name.clone();
        self.scheduler.schedule_reconnect(name, move || {
            let fleet = Arc::clone(&fleet);
            let name = retry_name.clone();
            let config = config.clone();
            async move { fleet.reconnect(&name, config).await }
        });
    }

    /// Closes and re-opens a single upstream under the same name.
    pub async fn reconnect(&self, name: &str, config: UpstreamConfig) -> SpikeResult<()> {
        self.disconnect_server(name).await;
        let mut upstream = Upstream::new(name, config).with_refresh_sender(self.refresh_tx.clone());
        let result = upstream.connect().await;
        self.insert(name.to_string(), upstream);
        result
    }

    /// No-op on unknown names. Also cancels any pending reconnect timer for
    /// `name` — an explicit disconnect means the operator no longer wants
    /// this upstream retried in the background.
    pub async fn disconnect_server(&self, name: &str) {
        self.scheduler.cancel(name);
        if let Some(handle) = self.remove(name) {
            let mut upstream = handle.lock().await;
            if let Some(connected_at) = upstream.connected_at() {
                debug!(
                    upstream = %name,
                    uptime_secs = connected_at.elapsed().as_secs(),
                    last_error = ?upstream.last_error(),
                    "disconnecting"
                );
            }
            if let Err(err) = upstream.close().await {
                warn!(upstream = %name, %err, "error while closing upstream");
            }
        }
    }

    pub async fn close_all(&self) {
        self.scheduler.cancel_all();
        let names = self.ordered_names();
        let mut tasks = JoinSet::new();
        for name in names {
            if let Some(handle) = self.remove(&name) {
                tasks.spawn(async move {
                    let mut upstream = handle.lock().await;
                    let _ = upstream.close().await;
                });
            }
        }
        while tasks.join_next().await.is_some() {}
    }

    /// `removed = old \ new` (disconnected), `added = new \ old` (connected;
    /// failures logged, `added` reflects only successes), `changed`
    /// (present in both, structurally different) reconnected.
    pub async fn apply_config_diff(
        self: &Arc<Self>,
        old: &ResolvedConfig,
        new: &ResolvedConfig,
    ) -> ConfigDiff {
        let old_keys: HashSet<&String> = old.upstreams.keys().collect();
        let new_keys: HashSet<&String> = new.upstreams.keys().collect();

        let removed: Vec<String> = old_keys.difference(&new_keys).map(|s| s.to_string()).collect();
        for name in &removed {
            self.disconnect_server(name).await;
        }

        let mut added = Vec::new();
        for name in new_keys.difference(&old_keys) {
            let config = new.upstreams.get(name).expect("key from new config").clone();
            let mut upstream = Upstream::new((*name).clone(), config.clone())
                .with_refresh_sender(self.refresh_tx.clone());
            match upstream.connect().await {
                Ok(()) => {
                    self.insert((*name).to_string(), upstream);
                    added.push((*name).to_string());
                }
                Err(err) => {
                    warn!(upstream = %name, %err, "new upstream failed to connect");
                    self.schedule_reconnect((*name).clone(), config);
                }
            }
        }

        let mut changed = Vec::new();
        for name in old_keys.intersection(&new_keys) {
            let old_config = old.upstreams.get(name).expect("key from old config");
            let new_config = new.upstreams.get(name).expect("key from new config");
            if !old_config.config_equals(new_config) {
                if let Err(err) = self.reconnect(name, new_config.clone()).await {
                    warn!(upstream = %name, %err, "reconnect during config diff failed");
                    self.schedule_reconnect((*name).clone(), new_config.clone());
                }
                changed.push((*name).to_string());
            }
        }

        ConfigDiff {
            added,
            removed,
            changed,
        }
    }

    /// In stable fleet-iteration order: filtered + namespaced tools for
    /// every toolset-visible upstream, then the Toolset Controller's
    /// meta-tools (owned by the synthetic server `spike`).
    pub async fn get_all_tools(&self) -> Vec<NamespacedTool> {
        let mut out = Vec::new();
        for name in self.ordered_names() {
            if let Some(controller) = &self.toolsets {
                if !controller.is_visible(&name) {
                    continue;
                }
            }
            let Some(handle) = self.upstreams.get(&name).map(|e| Arc::clone(&e)) else {
                continue;
            };
            let upstream = handle.lock().await;
            let filtered = match upstream.config().tools_filter() {
                Some(config) => filter::filter(upstream.tools(), config),
                None => upstream.tools().to_vec(),
            };
            for descriptor in filtered {
                if self.no_prefix {
                    out.push(NamespacedTool {
                        namespaced_name: descriptor.name.clone(),
                        server: name.clone(),
                        descriptor,
                    });
                } else {
                    out.push(NamespacedTool::new(name.clone(), descriptor, &self.separator));
                }
            }
        }

        if self.toolsets.is_some() {
            for tool_name in [
                crate::toolset::LIST_TOOLSETS,
                crate::toolset::LOAD_TOOLSET,
                crate::toolset::UNLOAD_TOOLSET,
            ] {
                out.push(NamespacedTool::new(
                    META_SERVER,
                    meta_tool_descriptor(tool_name),
                    &self.separator,
                ));
            }
        }

        out
    }

    pub async fn tool_count(&self, server: &str) -> usize {
        match self.upstreams.get(server) {
            Some(handle) => {
                let handle = Arc::clone(&handle);
                handle.lock().await.tools().len()
            }
            None => 0,
        }
    }

    /// Dispatches a `tools/call`, preserving the entire upstream result
    /// (including `isError`) verbatim.
    pub async fn call_tool(
        &self,
        wire_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> SpikeResult<CallResult> {
        if let Some(controller) = &self.toolsets {
            if ToolsetController::is_meta_tool(wire_name, &self.separator) {
                let original = ToolsetController::original_name(wire_name, &self.separator)
                    .expect("is_meta_tool implies a server prefix");
                let mut counts = std::collections::HashMap::new();
                for name in self.ordered_names() {
                    counts.insert(name.clone(), self.tool_count(&name).await);
                }
                return Ok(controller.call(original, &arguments, |server| {
                    counts.get(server).copied().unwrap_or(0)
                }));
            }
        }

        if self.no_prefix {
            for name in self.ordered_names() {
                let Some(handle) = self.upstreams.get(&name).map(|e| Arc::clone(&e)) else {
                    continue;
                };
                let upstream = handle.lock().await;
                if upstream.tools().iter().any(|t| t.name == wire_name) {
                    if let Some(controller) = &self.toolsets {
                        if !controller.is_visible(&name) {
                            continue;
                        }
                    }
                    drop(upstream);
                    return self.dispatch(&name, wire_name, arguments).await;
                }
            }
            return Err(SpikeError::ToolNotFound(wire_name.to_string()));
        }

        let known: Vec<String> = self.ordered_names();
        let known_refs: Vec<&str> = known.iter().map(String::as_str).collect();
        let (server, tool_name) = namespace::parse(wire_name, known_refs, &self.separator)
            .ok_or_else(|| SpikeError::CannotResolve(wire_name.to_string()))?;

        if !self.upstreams.contains_key(&server) {
            return Err(SpikeError::NotConnected(server));
        }
        if let Some(controller) = &self.toolsets {
            if !controller.is_visible(&server) {
                let toolset = controller
                    .containing_toolset(&server)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(SpikeError::ToolsetNotLoaded { server, toolset });
            }
        }

        self.dispatch(&server, &tool_name, arguments).await
    }

    async fn dispatch(
        &self,
        server: &str,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> SpikeResult<CallResult> {
        let handle = self
            .upstreams
            .get(server)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| SpikeError::NotConnected(server.to_string()))?;
        let upstream = handle.lock().await;

        if let Some(filter_config) = upstream.config().tools_filter() {
            let visible = filter::filter(upstream.tools(), filter_config);
            if !visible.iter().any(|t| t.name == tool_name) {
                return Err(SpikeError::ToolNotFound(format!("{server}{}{tool_name}", self.separator)));
            }
        }

        upstream.call_tool(tool_name, arguments).await
    }
}

fn meta_tool_descriptor(name: &str) -> crate::config::ToolDescriptor {
    let schema = match name {
        crate::toolset::LIST_TOOLSETS => serde_json::json!({"type": "object"}),
        _ => serde_json::json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        }),
    };
    let description = match name {
        crate::toolset::LIST_TOOLSETS => "List available toolsets and their load state.",
        crate::toolset::LOAD_TOOLSET => "Load a toolset, making its servers' tools visible.",
        crate::toolset::UNLOAD_TOOLSET => "Unload a previously loaded toolset.",
        _ => "",
    };
    crate::config::ToolDescriptor::new(name, Some(description.to_string()), schema)
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stdio_config(command: &str) -> UpstreamConfig {
        UpstreamConfig::Stdio {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            tools: None,
        }
    }

    #[tokio::test]
    async fn connect_all_is_a_noop_on_empty_config() {
        let fleet = Arc::new(Fleet::default());
        let resolved = ResolvedConfig::new();
        fleet.connect_all(&resolved).await;
        assert!(fleet.get_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn failed_connect_schedules_a_reconnect_attempt() {
        let fleet = Arc::new(Fleet::default());
        let mut resolved = ResolvedConfig::new();
        resolved
            .upstreams
            .insert("bad".to_string(), stdio_config("definitely-not-a-real-binary-xyz"));

        fleet.connect_all(&resolved).await;
        assert!(fleet.scheduler.has_pending("bad"));
    }

    #[tokio::test]
    async fn disconnecting_a_server_cancels_its_pending_reconnect() {
        let fleet = Arc::new(Fleet::default());
        let mut resolved = ResolvedConfig::new();
        resolved
            .upstreams
            .insert("bad".to_string(), stdio_config("definitely-not-a-real-binary-xyz"));

        fleet.connect_all(&resolved).await;
        assert!(fleet.scheduler.has_pending("bad"));
        fleet.disconnect_server("bad").await;
        assert!(!fleet.scheduler.has_pending("bad"));
    }

    #[tokio::test]
    async fn refresh_loop_ignores_notices_for_unconnected_upstreams() {
        let fleet = Arc::new(Fleet::default());
        let loop_handle = tokio::spawn({
            let fleet = Arc::clone(&fleet);
            async move { fleet.run_refresh_loop().await }
        });
        fleet.refresh_tx.send("ghost".to_string()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!loop_handle.is_finished());
        loop_handle.abort();
    }

    #[tokio::test]
    async fn probe_status_reports_failed_for_a_bogus_command() {
        let mut resolved = ResolvedConfig::new();
        resolved
            .upstreams
            .insert("bad".to_string(), stdio_config("definitely-not-a-real-binary-xyz"));

        let statuses = probe_status(&resolved, Duration::from_secs(10)).await;
        match statuses.get("bad").unwrap() {
            UpstreamStatus::Failed { .. } => {}
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_status_reports_timed_out_when_the_budget_is_exhausted() {
        let mut resolved = ResolvedConfig::new();
        resolved.upstreams.insert(
            "slow".to_string(),
            UpstreamConfig::Stdio {
                command: "sleep".to_string(),
                args: vec!["5".to_string()],
                env: HashMap::new(),
                tools: None,
            },
        );

        let statuses = probe_status(&resolved, Duration::from_millis(1)).await;
        assert_eq!(statuses.get("slow"), Some(&UpstreamStatus::TimedOut));
    }

    #[tokio::test]
    async fn call_tool_fails_with_cannot_resolve_for_unknown_namespace() {
        let fleet = Fleet::default();
        let err = fleet
            .call_tool("ghost__do_thing", serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpikeError::CannotResolve(_)));
    }

    #[tokio::test]
    async fn disconnect_server_on_unknown_name_is_a_noop() {
        let fleet = Fleet::default();
        fleet.disconnect_server("nothing-here").await;
    }

    #[tokio::test]
    async fn apply_config_diff_with_identical_configs_is_empty() {
        let fleet = Arc::new(Fleet::default());
        let mut resolved = ResolvedConfig::new();
        resolved
            .upstreams
            .insert("srv".to_string(), stdio_config("/bin/nonexistent-binary"));

        let diff = fleet.apply_config_diff(&resolved, &resolved).await;
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
    }
}

//! A bundled catalogue of known "apps" (named bundles of tools), refreshable
//! from whatever upstream happens to expose a `store_list_apps_with_tools`
//! tool. Used by the session engine to group tools for display (§4.J).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fleet::Fleet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(rename = "toolNames", default)]
    pub tool_names: Vec<String>,
}

const REFRESH_TOOL_SUFFIX: &str = "store_list_apps_with_tools";

struct Indices {
    apps: Vec<AppInfo>,
    by_tool_name: HashMap<String, usize>,
    by_slug: HashMap<String, usize>,
}

impl Indices {
    fn build(apps: Vec<AppInfo>) -> Self {
        let mut by_tool_name = HashMap::new();
        let mut by_slug = HashMap::new();
        for (idx, app) in apps.iter().enumerate() {
            by_slug.insert(app.slug.clone(), idx);
            for tool in &app.tool_names {
                by_tool_name.insert(tool.clone(), idx);
            }
        }
        Self {
            apps,
            by_tool_name,
            by_slug,
        }
    }
}

/// The bundled app catalogue. Starts from [`bundled_apps`] and can be
/// refreshed in place from a live upstream; a failed refresh leaves the
/// previous catalogue untouched.
pub struct AppRegistry {
    indices: RwLock<Indices>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::build(bundled_apps())),
        }
    }

    pub fn by_tool_name(&self, tool_name: &str) -> Option<AppInfo> {
        let indices = self.indices.read();
        indices
            .by_tool_name
            .get(tool_name)
            .map(|&idx| indices.apps[idx].clone())
    }

    pub fn by_slug(&self, slug: &str) -> Option<AppInfo> {
        let indices = self.indices.read();
        indices.by_slug.get(slug).map(|&idx| indices.apps[idx].clone())
    }

    pub fn all(&self) -> Vec<AppInfo> {
        self.indices.read().apps.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.read().apps.is_empty()
    }

    /// Looks for a tool named (or suffixed) `store_list_apps_with_tools`
    /// across every connected upstream, calls it with no arguments, and —
    /// if the result parses as a non-empty `AppInfo` array — swaps in the
    /// new catalogue. Any failure along the way is silently ignored.
    pub async fn refresh_from_remote(&self, fleet: &Arc<Fleet>) {
        let catalog = fleet.get_all_tools().await;
        let Some(target) = catalog.iter().find(|nt| {
            nt.descriptor.name == REFRESH_TOOL_SUFFIX
                || nt.descriptor.name.ends_with(REFRESH_TOOL_SUFFIX)
        }) else {
            return;
        };

        let Ok(result) = fleet
            .call_tool(&target.namespaced_name, serde_json::Map::new())
            .await
        else {
            return;
        };

        let text = crate::upstream::call_result_text(&result);
        let Ok(apps) = serde_json::from_str::<Vec<AppInfo>>(&text) else {
            return;
        };
        if apps.is_empty() {
            return;
        }

        *self.indices.write() = Indices::build(apps);
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The bundled catalogue shipped with the binary. Empty until a concrete
/// app list is vendored in; `refresh_from_remote` is the intended way to
/// populate it in practice.
fn bundled_apps() -> Vec<AppInfo> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<AppInfo> {
        vec![AppInfo {
            slug: "github".to_string(),
            name: "GitHub".to_string(),
            icon: None,
            category: Some("dev".to_string()),
            tagline: None,
            tool_names: vec!["github__create_issue".to_string()],
        }]
    }

    #[test]
    fn fresh_registry_starts_empty() {
        let registry = AppRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.by_slug("github").is_none());
    }

    #[test]
    fn indices_rebuild_on_swap() {
        let registry = AppRegistry::new();
        *registry.indices.write() = Indices::build(sample());
        assert_eq!(registry.by_slug("github").unwrap().name, "GitHub");
        assert_eq!(
            registry
                .by_tool_name("github__create_issue")
                .unwrap()
                .slug,
            "github"
        );
    }

    #[tokio::test]
    async fn refresh_is_a_noop_when_no_upstream_exposes_the_tool() {
        let fleet = Arc::new(Fleet::default());
        let registry = AppRegistry::new();
        registry.refresh_from_remote(&fleet).await;
        assert!(registry.is_empty());
    }
}

//! Core data model: tool descriptors, namespaced tools, and the resolved
//! upstream configuration shape (engine spec §3, wire format §6.1).
//!
//! Tool input schemas are kept as opaque [`serde_json::Value`] trees on
//! purpose — the engine never type-checks them, only forwards them verbatim
//! to the LLM or the owning upstream, per the "dynamic tool schemas" design
//! note. Building a typed schema representation here would be exactly the
//! kind of premature structure the spec tells implementers to avoid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::filter::ToolFilterConfig;
use crate::namespace::{self, DEFAULT_SEPARATOR};

/// An immutable descriptor of a tool as advertised by an upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Top-level `{type: "object", properties?: {...}, required?: [...]}`.
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema,
        }
    }

    pub fn required_params(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn property_defaults(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut defaults = serde_json::Map::new();
        if let Some(properties) = self.input_schema.get("properties").and_then(|v| v.as_object()) {
            for (name, schema) in properties {
                if let Some(default) = schema.get("default") {
                    defaults.insert(name.clone(), default.clone());
                }
            }
        }
        defaults
    }

    pub fn property_type(&self, name: &str) -> Option<&str> {
        self.input_schema
            .get("properties")?
            .get(name)?
            .get("type")?
            .as_str()
    }
}

/// A [`ToolDescriptor`] plus the owning upstream's name and its namespaced
/// wire name. `(server, original_name)` is unique by construction, so
/// `namespaced_name` is unique across the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    pub server: String,
    pub descriptor: ToolDescriptor,
    pub namespaced_name: String,
}

impl NamespacedTool {
    pub fn new(server: impl Into<String>, descriptor: ToolDescriptor, sep: &str) -> Self {
        let server = server.into();
        let namespaced_name = namespace::namespace(&server, &descriptor.name, sep);
        Self {
            server,
            descriptor,
            namespaced_name,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.descriptor.name
    }
}

/// One upstream's connection configuration (engine spec §3 `UpstreamConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum UpstreamConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools: Option<ToolFilterConfig>,
    },
    Http {
        url: String,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools: Option<ToolFilterConfig>,
    },
    Sse {
        url: String,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools: Option<ToolFilterConfig>,
    },
}

impl UpstreamConfig {
    pub fn env(&self) -> &HashMap<String, String> {
        match self {
            UpstreamConfig::Stdio { env, .. }
            | UpstreamConfig::Http { env, .. }
            | UpstreamConfig::Sse { env, .. } => env,
        }
    }

    pub fn env_mut(&mut self) -> &mut HashMap<String, String> {
        match self {
            UpstreamConfig::Stdio { env, .. }
            | UpstreamConfig::Http { env, .. }
            | UpstreamConfig::Sse { env, .. } => env,
        }
    }

    pub fn tools_filter(&self) -> Option<&ToolFilterConfig> {
        match self {
            UpstreamConfig::Stdio { tools, .. }
            | UpstreamConfig::Http { tools, .. }
            | UpstreamConfig::Sse { tools, .. } => tools.as_ref(),
        }
    }

    /// Structural equality over the serialized form, used by
    /// `Fleet::apply_config_diff` to detect a "changed" upstream.
    pub fn config_equals(&self, other: &UpstreamConfig) -> bool {
        self == other
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.env().get("SPIKE_AUTH_TOKEN").map(String::as_str)
    }
}

/// A named group of upstream names whose tools are hidden until the group
/// is loaded (engine spec §4.F).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsetSpec {
    pub servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The fully merged configuration the engine acts on (engine spec §3
/// `ResolvedConfig`).
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub upstreams: indexmap_like::OrderedMap,
    pub toolsets: HashMap<String, ToolsetSpec>,
    pub lazy_loading: bool,
    pub separator: String,
    pub sources: Vec<std::path::PathBuf>,
}

impl ResolvedConfig {
    pub fn new() -> Self {
        Self {
            upstreams: indexmap_like::OrderedMap::default(),
            toolsets: HashMap::new(),
            lazy_loading: false,
            separator: DEFAULT_SEPARATOR.to_string(),
            sources: Vec::new(),
        }
    }
}

/// A minimal insertion-ordered string-keyed map. The engine spec requires
/// `getAllTools()` to iterate upstreams in "stable iteration order of the
/// fleet mapping" — a plain `HashMap` does not provide that, and pulling in
/// the `indexmap` crate for one map is more than this module needs, so a
/// small local type does the job and keeps iteration order equal to
/// discovery/merge order.
pub mod indexmap_like {
    use std::collections::HashMap;

    use super::UpstreamConfig;

    #[derive(Debug, Clone, Default)]
    pub struct OrderedMap {
        order: Vec<String>,
        entries: HashMap<String, UpstreamConfig>,
    }

    impl OrderedMap {
        pub fn insert(&mut self, key: String, value: UpstreamConfig) {
            if !self.entries.contains_key(&key) {
                self.order.push(key.clone());
            }
            self.entries.insert(key, value);
        }

        pub fn remove(&mut self, key: &str) -> Option<UpstreamConfig> {
            self.order.retain(|k| k != key);
            self.entries.remove(key)
        }

        pub fn get(&self, key: &str) -> Option<&UpstreamConfig> {
            self.entries.get(key)
        }

        pub fn contains_key(&self, key: &str) -> bool {
            self.entries.contains_key(key)
        }

        pub fn keys(&self) -> impl Iterator<Item = &String> {
            self.order.iter()
        }

        pub fn iter(&self) -> impl Iterator<Item = (&String, &UpstreamConfig)> {
            self.order.iter().map(move |k| (k, &self.entries[k]))
        }

        pub fn len(&self) -> usize {
            self.order.len()
        }

        pub fn is_empty(&self) -> bool {
            self.order.is_empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_preserves_insertion_order() {
        let mut map = indexmap_like::OrderedMap::default();
        map.insert(
            "b".to_string(),
            UpstreamConfig::Stdio {
                command: "b".to_string(),
                args: vec![],
                env: HashMap::new(),
                tools: None,
            },
        );
        map.insert(
            "a".to_string(),
            UpstreamConfig::Stdio {
                command: "a".to_string(),
                args: vec![],
                env: HashMap::new(),
                tools: None,
            },
        );
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn required_params_reads_schema() {
        let tool = ToolDescriptor::new(
            "t",
            None,
            serde_json::json!({"type": "object", "required": ["a", "b"]}),
        );
        assert_eq!(tool.required_params(), vec!["a", "b"]);
    }

    #[test]
    fn property_defaults_collects_only_declared_defaults() {
        let tool = ToolDescriptor::new(
            "t",
            None,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "x": {"type": "string", "default": "hi"},
                    "y": {"type": "number"}
                }
            }),
        );
        let defaults = tool.property_defaults();
        assert_eq!(defaults.get("x"), Some(&serde_json::json!("hi")));
        assert!(!defaults.contains_key("y"));
    }

    #[test]
    fn config_equals_detects_value_changes() {
        let a = UpstreamConfig::Stdio {
            command: "v1".to_string(),
            args: vec![],
            env: HashMap::new(),
            tools: None,
        };
        let b = UpstreamConfig::Stdio {
            command: "v2".to_string(),
            args: vec![],
            env: HashMap::new(),
            tools: None,
        };
        assert!(!a.config_equals(&b));
        assert!(a.config_equals(&a.clone()));
    }
}

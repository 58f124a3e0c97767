//! Glob-based allow/block filtering of a server's advertised tools.
//!
//! Patterns are anchored and support only the `*` wildcard (zero-or-more of
//! any character); every other regex metacharacter in the pattern is
//! escaped so user-supplied globs can't smuggle in a real regex.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ToolDescriptor;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolFilterConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<String>,
}

impl ToolFilterConfig {
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty() && self.blocked.is_empty()
    }
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    anchored.push('^');
    for part in pattern.split('*') {
        if !anchored.ends_with('^') {
            anchored.push_str(".*");
        }
        anchored.push_str(&regex::escape(part));
    }
    anchored.push('$');
    // Built from `regex::escape`d literals joined by a fixed `.*`, so this
    // can only fail to compile if `pattern` itself is pathological in a way
    // escaping can't protect against, which does not happen for `&str`.
    Regex::new(&anchored).unwrap_or_else(|_| Regex::new("$^").expect("empty-match fallback"))
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| glob_to_regex(p).is_match(name))
}

/// Returns `tools` unchanged if neither list is configured. Otherwise:
/// if `allowed` is non-empty, keep only tools matching at least one allowed
/// pattern; then, regardless, drop any tool matching a blocked pattern.
pub fn filter(tools: &[ToolDescriptor], config: &ToolFilterConfig) -> Vec<ToolDescriptor> {
    if config.is_empty() {
        return tools.to_vec();
    }

    let mut out: Vec<ToolDescriptor> = if config.allowed.is_empty() {
        tools.to_vec()
    } else {
        tools
            .iter()
            .filter(|t| matches_any(&t.name, &config.allowed))
            .cloned()
            .collect()
    };

    if !config.blocked.is_empty() {
        out.retain(|t| !matches_any(&t.name, &config.blocked));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(name, None, serde_json::json!({"type": "object"}))
    }

    #[test]
    fn no_filters_returns_input_unchanged() {
        let tools = vec![tool("read_file"), tool("write_file")];
        let result = filter(&tools, &ToolFilterConfig::default());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn allowed_then_blocked_narrows_the_set() {
        let tools = vec![
            tool("read_file"),
            tool("write_file"),
            tool("search_code"),
            tool("dangerous_delete"),
            tool("run_tests"),
        ];
        let config = ToolFilterConfig {
            allowed: vec!["read_*".to_string(), "write_*".to_string()],
            blocked: vec!["write_*".to_string()],
        };
        let result = filter(&tools, &config);
        let names: Vec<&str> = result.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["read_file"]);
    }

    #[test]
    fn blocked_only_drops_matches() {
        let tools = vec![tool("safe"), tool("danger_zone")];
        let config = ToolFilterConfig {
            allowed: vec![],
            blocked: vec!["danger_*".to_string()],
        };
        let result = filter(&tools, &config);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "safe");
    }

    #[test]
    fn patterns_escape_regex_metacharacters() {
        let tools = vec![tool("a.b"), tool("axb")];
        let config = ToolFilterConfig {
            allowed: vec!["a.b".to_string()],
            blocked: vec![],
        };
        let result = filter(&tools, &config);
        // Literal '.' must not act as regex "any character".
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "a.b");
    }

    #[test]
    fn filter_is_idempotent() {
        let tools = vec![tool("read_file"), tool("write_file"), tool("other")];
        let config = ToolFilterConfig {
            allowed: vec!["read_*".to_string()],
            blocked: vec![],
        };
        let once = filter(&tools, &config);
        let twice = filter(&once, &config);
        assert_eq!(once.len(), twice.len());
        assert_eq!(
            once.iter().map(|t| &t.name).collect::<Vec<_>>(),
            twice.iter().map(|t| &t.name).collect::<Vec<_>>()
        );
    }
}

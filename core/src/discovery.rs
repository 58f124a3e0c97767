//! Layered config discovery: global file, project file, explicit path,
//! inline stdio/URL additions, `${VAR}` expansion, and synthetic upstream
//! injection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::config::{ResolvedConfig, ToolsetSpec, UpstreamConfig};
use crate::namespace::DEFAULT_SEPARATOR;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, UpstreamConfig>,
    #[serde(default)]
    toolsets: HashMap<String, ToolsetSpec>,
    #[serde(default, rename = "lazyLoading")]
    lazy_loading: Option<bool>,
}

/// An inline addition supplied on the command line, outside any file.
#[derive(Debug, Clone)]
pub enum InlineAddition {
    /// `name=command with args` — whitespace-split into `command` + `args`.
    Stdio { name: String, command_line: String },
    /// `name=url` — recorded as an HTTP-streaming upstream.
    Url { name: String, url: String },
}

pub struct DiscoveryInputs {
    pub home: Option<PathBuf>,
    pub cwd: PathBuf,
    pub explicit_path: Option<PathBuf>,
    pub inline: Vec<InlineAddition>,
}

fn load_file(path: &Path) -> Option<ConfigFile> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ConfigFile>(&contents) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping invalid config file");
            None
        }
    }
}

fn merge_file(resolved: &mut ResolvedConfig, path: &Path) -> bool {
    let Some(file) = load_file(path) else {
        return false;
    };
    for (name, config) in file.mcp_servers {
        resolved.upstreams.insert(name, config);
    }
    for (name, spec) in file.toolsets {
        resolved.toolsets.insert(name, spec);
    }
    if let Some(lazy) = file.lazy_loading {
        resolved.lazy_loading = lazy;
    }
    resolved.sources.push(path.to_path_buf());
    true
}

fn apply_inline(resolved: &mut ResolvedConfig, additions: &[InlineAddition]) {
    for addition in additions {
        match addition {
            InlineAddition::Stdio { name, command_line } => {
                let mut parts = command_line.split_whitespace();
                let Some(command) = parts.next() else {
                    warn!(name, "empty inline stdio command, skipping");
                    continue;
                };
                resolved.upstreams.insert(
                    name.clone(),
                    UpstreamConfig::Stdio {
                        command: command.to_string(),
                        args: parts.map(str::to_string).collect(),
                        env: HashMap::new(),
                        tools: None,
                    },
                );
            }
            InlineAddition::Url { name, url } => {
                resolved.upstreams.insert(
                    name.clone(),
                    UpstreamConfig::Http {
                        url: url.clone(),
                        env: HashMap::new(),
                        tools: None,
                    },
                );
            }
        }
    }
}

/// Replaces every `${VAR}` substring with the process environment value,
/// warning once per unset variable referenced.
fn expand_env_value(value: &str, name: &str, key: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            result.push_str(rest);
            return result;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        match std::env::var(var_name) {
            Ok(v) => result.push_str(&v),
            Err(_) => {
                warn!(upstream = name, key, var = var_name, "referenced env var is unset");
            }
        }
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    result
}

fn expand_env(resolved: &mut ResolvedConfig) {
    let names: Vec<String> = resolved.upstreams.keys().cloned().collect();
    for name in names {
        let Some(config) = resolved.upstreams.get(&name).cloned() else {
            continue;
        };
        let mut config = config;
        let expanded: HashMap<String, String> = config
            .env()
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_value(v, &name, k)))
            .collect();
        *config.env_mut() = expanded;
        resolved.upstreams.insert(name, config);
    }
}

/// Checks for an externally-stored auth token for `spike-land`. The actual
/// credential store lookup is out of scope for the core; callers supply the
/// result (or `None` if no store is configured / no token is present).
pub fn inject_synthetic_spike_land(
    resolved: &mut ResolvedConfig,
    token_base_url: &str,
    token: Option<&str>,
) {
    if resolved.upstreams.contains_key("spike-land") {
        return;
    }
    let Some(token) = token else {
        return;
    };
    let mut env = HashMap::new();
    env.insert("SPIKE_AUTH_TOKEN".to_string(), token.to_string());
    resolved.upstreams.insert(
        "spike-land".to_string(),
        UpstreamConfig::Http {
            url: format!("{token_base_url}/api/mcp"),
            env,
            tools: None,
        },
    );
}

/// Runs the full layered merge: global file, project file, explicit path,
/// inline additions, then `${VAR}` expansion. Synthetic upstream injection
/// is a separate step since it needs a credential lookup the core doesn't
/// own.
pub fn discover(inputs: &DiscoveryInputs) -> ResolvedConfig {
    let mut resolved = ResolvedConfig::new();
    resolved.separator = DEFAULT_SEPARATOR.to_string();

    if let Some(home) = &inputs.home {
        merge_file(&mut resolved, &home.join(".mcp.json"));
    }
    merge_file(&mut resolved, &inputs.cwd.join(".mcp.json"));
    if let Some(explicit) = &inputs.explicit_path {
        let path = if explicit.is_absolute() {
            explicit.clone()
        } else {
            inputs.cwd.join(explicit)
        };
        merge_file(&mut resolved, &path);
    }

    apply_inline(&mut resolved, &inputs.inline);
    expand_env(&mut resolved);

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn project_file_wins_over_global_on_shared_key() {
        let home_dir = tempfile::tempdir().unwrap();
        let cwd_dir = tempfile::tempdir().unwrap();
        write_config(
            &home_dir,
            ".mcp.json",
            r#"{"mcpServers": {"srv": {"transport": "stdio", "command": "global"}}}"#,
        );
        write_config(
            &cwd_dir,
            ".mcp.json",
            r#"{"mcpServers": {"srv": {"transport": "stdio", "command": "project"}}}"#,
        );

        let resolved = discover(&DiscoveryInputs {
            home: Some(home_dir.path().to_path_buf()),
            cwd: cwd_dir.path().to_path_buf(),
            explicit_path: None,
            inline: vec![],
        });

        match resolved.upstreams.get("srv").unwrap() {
            UpstreamConfig::Stdio { command, .. } => assert_eq!(command, "project"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_file_is_skipped_without_aborting_discovery() {
        let cwd_dir = tempfile::tempdir().unwrap();
        write_config(&cwd_dir, ".mcp.json", "not json");

        let resolved = discover(&DiscoveryInputs {
            home: None,
            cwd: cwd_dir.path().to_path_buf(),
            explicit_path: None,
            inline: vec![],
        });
        assert!(resolved.upstreams.is_empty());
        assert!(resolved.sources.is_empty());
    }

    #[test]
    fn inline_stdio_addition_splits_command_and_args() {
        let cwd_dir = tempfile::tempdir().unwrap();
        let resolved = discover(&DiscoveryInputs {
            home: None,
            cwd: cwd_dir.path().to_path_buf(),
            explicit_path: None,
            inline: vec![InlineAddition::Stdio {
                name: "vitest".to_string(),
                command_line: "npx vitest-mcp --flag".to_string(),
            }],
        });
        match resolved.upstreams.get("vitest").unwrap() {
            UpstreamConfig::Stdio { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &vec!["vitest-mcp".to_string(), "--flag".to_string()]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn inline_url_addition_becomes_http_streaming() {
        let cwd_dir = tempfile::tempdir().unwrap();
        let resolved = discover(&DiscoveryInputs {
            home: None,
            cwd: cwd_dir.path().to_path_buf(),
            explicit_path: None,
            inline: vec![InlineAddition::Url {
                name: "remote".to_string(),
                url: "https://example.com/mcp".to_string(),
            }],
        });
        assert!(matches!(
            resolved.upstreams.get("remote").unwrap(),
            UpstreamConfig::Http { .. }
        ));
    }

    #[test]
    #[serial]
    fn env_expansion_substitutes_known_variables() {
        std::env::set_var("SPIKE_TEST_TOKEN", "abc123");
        let cwd_dir = tempfile::tempdir().unwrap();
        write_config(
            &cwd_dir,
            ".mcp.json",
            r#"{"mcpServers": {"srv": {"transport": "http", "url": "https://x", "env": {"SPIKE_AUTH_TOKEN": "${SPIKE_TEST_TOKEN}"}}}}"#,
        );
        let resolved = discover(&DiscoveryInputs {
            home: None,
            cwd: cwd_dir.path().to_path_buf(),
            explicit_path: None,
            inline: vec![],
        });
        assert_eq!(
            resolved.upstreams.get("srv").unwrap().env().get("SPIKE_AUTH_TOKEN"),
            Some(&"abc123".to_string())
        );
        std::env::remove_var("SPIKE_TEST_TOKEN");
    }

    #[test]
    fn injecting_spike_land_is_a_noop_when_already_configured() {
        let mut resolved = ResolvedConfig::new();
        resolved.upstreams.insert(
            "spike-land".to_string(),
            UpstreamConfig::Http {
                url: "https://existing".to_string(),
                env: HashMap::new(),
                tools: None,
            },
        );
        inject_synthetic_spike_land(&mut resolved, "https://base", Some("token"));
        match resolved.upstreams.get("spike-land").unwrap() {
            UpstreamConfig::Http { url, .. } => assert_eq!(url, "https://existing"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn injecting_spike_land_adds_an_http_upstream_with_the_token() {
        let mut resolved = ResolvedConfig::new();
        inject_synthetic_spike_land(&mut resolved, "https://base", Some("tok"));
        match resolved.upstreams.get("spike-land").unwrap() {
            UpstreamConfig::Http { url, env, .. } => {
                assert_eq!(url, "https://base/api/mcp");
                assert_eq!(env.get("SPIKE_AUTH_TOKEN"), Some(&"tok".to_string()));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn injecting_spike_land_without_a_token_is_a_noop() {
        let mut resolved = ResolvedConfig::new();
        inject_synthetic_spike_land(&mut resolved, "https://base", None);
        assert!(!resolved.upstreams.contains_key("spike-land"));
    }
}

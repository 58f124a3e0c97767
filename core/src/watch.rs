//! Debounced config file watching: collapse bursts of filesystem events into
//! a single re-discovery, and hand the refreshed `ResolvedConfig` to a sink
//! (normally `Fleet::apply_config_diff`).

use std::path::PathBuf;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::config::ResolvedConfig;
use crate::discovery::{discover, DiscoveryInputs};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Watches every file discovery successfully loaded and re-runs discovery
/// once per debounce window of filesystem activity, sending the refreshed
/// config to `sink`.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
}

impl ConfigWatcher {
    pub fn start(
        inputs: DiscoveryInputs,
        debounce: Duration,
        sink: mpsc::UnboundedSender<ResolvedConfig>,
    ) -> notify::Result<Self> {
        let watched_paths = discover(&inputs).sources;

        let mut debouncer = new_debouncer(
            debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) if !events.is_empty() => {
                    let refreshed = discover(&inputs);
                    if sink.send(refreshed).is_err() {
                        warn!("config change sink dropped, stopping watch");
                    }
                }
                Ok(_) => {}
                Err(errors) => {
                    for e in errors {
                        error!(error = %e, "config watcher error");
                    }
                }
            },
        )?;

        for path in &watched_paths {
            if let Some(parent) = path.parent() {
                let _ = debouncer.watcher().watch(parent, RecursiveMode::NonRecursive);
            }
        }

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Paths a watcher should monitor, exposed separately for callers that want
/// to watch explicit file locations rather than re-run discovery to find
/// them (e.g. before the first successful load).
pub fn candidate_paths(home: Option<&PathBuf>, cwd: &PathBuf) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        paths.push(home.join(".mcp.json"));
    }
    paths.push(cwd.join(".mcp.json"));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_paths_includes_home_and_cwd_files() {
        let home = PathBuf::from("/home/user");
        let cwd = PathBuf::from("/project");
        let paths = candidate_paths(Some(&home), &cwd);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/user/.mcp.json"),
                PathBuf::from("/project/.mcp.json"),
            ]
        );
    }

    #[test]
    fn candidate_paths_omits_home_when_absent() {
        let cwd = PathBuf::from("/project");
        let paths = candidate_paths(None, &cwd);
        assert_eq!(paths, vec![PathBuf::from("/project/.mcp.json")]);
    }
}

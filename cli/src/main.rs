//! Thin binary wiring: parses just enough of the command line to pick a
//! subcommand and a transport, then hands off to `spike-core`. Full
//! argument parsing (flags, help text, shell completion) is out of scope —
//! this is the shape the core's collaborators expect, not a CLI framework.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use spike_core::discovery::{discover, DiscoveryInputs};
use spike_core::downstream::{http, sse, stdio};
use spike_core::fleet::{probe_status, Fleet, UpstreamStatus, DEFAULT_STATUS_TIMEOUT};
use spike_core::toolset::ToolsetController;
use spike_core::watch::{ConfigWatcher, DEFAULT_DEBOUNCE};
use tracing::warn;

enum Transport {
    Stdio,
    Http,
    Sse,
}

struct ServeArgs {
    transport: Transport,
    port: u16,
    api_key: Option<String>,
}

fn parse_serve_args(args: &[String]) -> Result<ServeArgs> {
    let mut transport = Transport::Stdio;
    let mut port = 8787u16;
    let mut api_key = std::env::var("SPIKE_API_KEY").ok();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--transport" => {
                let value = iter.next().context("--transport needs a value")?;
                transport = match value.as_str() {
                    "stdio" => Transport::Stdio,
                    "http" => Transport::Http,
                    "sse" => Transport::Sse,
                    other => bail!("unknown transport '{other}'"),
                };
            }
            "--port" => {
                let value = iter.next().context("--port needs a value")?;
                port = value.parse().context("--port must be a number")?;
            }
            "--api-key" => {
                api_key = Some(iter.next().context("--api-key needs a value")?.clone());
            }
            other => bail!("unrecognised serve argument '{other}'"),
        }
    }

    Ok(ServeArgs {
        transport,
        port,
        api_key,
    })
}

fn discovery_inputs() -> DiscoveryInputs {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    DiscoveryInputs {
        home,
        cwd,
        explicit_path: std::env::var_os("SPIKE_CONFIG").map(PathBuf::from),
        inline: Vec::new(),
    }
}

fn discover_config() -> spike_core::ResolvedConfig {
    discover(&discovery_inputs())
}

/// Builds the fleet, connects every configured upstream, and spawns the two
/// background loops that keep it current: the tool-refresh drain and a
/// debounced config file watcher that reconciles the fleet on every edit.
async fn build_fleet() -> Arc<Fleet> {
    let resolved = discover_config();
    let toolsets = if resolved.toolsets.is_empty() {
        None
    } else {
        Some(Arc::new(ToolsetController::new(resolved.toolsets.clone())))
    };

    let mut fleet = Fleet::new(resolved.separator.clone(), false);
    if let Some(controller) = toolsets {
        fleet = fleet.with_toolsets(controller);
    }
    let fleet = Arc::new(fleet);
    fleet.connect_all(&resolved).await;
    tokio::spawn({
        let fleet = Arc::clone(&fleet);
        async move { fleet.run_refresh_loop().await }
    });
    spawn_config_watch(Arc::clone(&fleet), resolved);
    fleet
}

/// Keeps the `ConfigWatcher` alive for the process lifetime and applies
/// every refreshed config against the fleet's current state. Watch failures
/// (e.g. no config file exists yet to watch) are logged, not fatal — the
/// fleet still runs with whatever was discovered at startup.
fn spawn_config_watch(fleet: Arc<Fleet>, initial: spike_core::ResolvedConfig) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = match ConfigWatcher::start(discovery_inputs(), DEFAULT_DEBOUNCE, tx) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(%err, "config watcher unavailable, hot-reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        let _watcher = watcher;
        let mut current = initial;
        while let Some(refreshed) = rx.recv().await {
            fleet.apply_config_diff(&current, &refreshed).await;
            current = refreshed;
        }
    });
}

async fn run_serve(args: &[String]) -> Result<()> {
    let serve_args = parse_serve_args(args)?;
    let fleet = build_fleet().await;

    match serve_args.transport {
        Transport::Stdio => stdio::serve(fleet).await.map_err(Into::into),
        Transport::Http => http::serve(fleet, serve_args.port, serve_args.api_key)
            .await
            .map_err(Into::into),
        Transport::Sse => sse::serve(fleet, serve_args.port, serve_args.api_key)
            .await
            .map_err(Into::into),
    }
}

async fn run_status() -> Result<()> {
    let resolved = discover_config();
    if resolved.upstreams.is_empty() {
        eprintln!("no upstreams configured");
        std::process::exit(1);
    }

    let statuses = probe_status(&resolved, DEFAULT_STATUS_TIMEOUT).await;

    let mut any_unreachable = false;
    for name in resolved.upstreams.keys() {
        match statuses.get(name) {
            Some(UpstreamStatus::Connected { tool_count }) => println!("{name}: {tool_count} tools"),
            Some(UpstreamStatus::Failed { message }) => {
                any_unreachable = true;
                println!("{name}: failed ({message})");
            }
            Some(UpstreamStatus::TimedOut) => {
                any_unreachable = true;
                println!("{name}: timed out");
            }
            None => {
                any_unreachable = true;
                println!("{name}: unreachable");
            }
        }
    }

    if any_unreachable {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_shell() -> Result<()> {
    use spike_core::session::{parse_input, NoPrompt, ParsedInput, SessionState};
    use std::io::{self, BufRead, Write};

    let fleet = build_fleet().await;
    let mut state = SessionState::new();
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush().ok();
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse_input(input) {
            ParsedInput::Command { name, .. } if name == "quit" || name == "exit" => break,
            ParsedInput::Command { name, .. } => {
                println!("(command '{name}' not implemented in this shell)");
            }
            ParsedInput::DirectToolCall { query, argument } => {
                match spike_core::session::invoke(&fleet, &mut state, &query, &argument, &NoPrompt)
                    .await
                {
                    Ok(text) => println!("{text}"),
                    Err(err) => println!("Error: {err}"),
                }
            }
        }
    }

    fleet.close_all().await;
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    args.retain(|a| a != "--verbose" && a != "-v");
    init_logging(verbose);

    let Some(command) = args.first().cloned() else {
        eprintln!("usage: spike <serve|chat|shell|status> [options]");
        std::process::exit(1);
    };
    let rest = &args[1..];

    let result = match command.as_str() {
        "serve" => run_serve(rest).await,
        "status" => run_status().await,
        "shell" => run_shell().await,
        "chat" => {
            eprintln!("chat requires a configured ChatClient; not wired up in this binary shape");
            std::process::exit(1);
        }
        other => {
            eprintln!("unknown subcommand '{other}'");
            std::process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

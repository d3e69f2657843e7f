// SPDX-License-Identifier: Apache-2.0

//! CLI entry point: parses arguments, initializes `tracing`, and dispatches
//! into the `tap` library. Errors are propagated via `anyhow` and reported
//! by the runtime as a non-zero exit code, matching the corpus's
//! `thiserror`-for-library / `anyhow`-for-bin split.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tap::cli::{self, Cli, Command};
use tap::client;
use tap::config::RunnerConfig;
use tap::control_server::{self, ServerState};
use tap::locator;
use tap::ring_buffer::RingBuffer;
use tap::supervisor::{SpawnConfig, Supervisor};
use tap::types::{RestartRequest, StopRequest};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_new(RunnerConfig::log_directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Splits `name` into `(tap_dir, base_name)` under `base_dir`, matching the
/// locator's own socket layout: `prefix:base` lives at `base_dir/prefix/.tap`.
fn tap_dir_for_name(base_dir: &Path, name: &str) -> (PathBuf, String) {
    match name.rsplit_once(':') {
        Some((prefix, base)) => (base_dir.join(prefix).join(".tap"), base.to_string()),
        None => (base_dir.join(".tap"), name.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            name,
            cwd,
            env_file,
            pty,
            max_lines,
            max_bytes,
            forward,
            base_dir,
            command,
        } => {
            let env = cli::load_env_file(env_file.as_ref())
                .context("failed to read --env-file")?;
            let spawn = SpawnConfig {
                command,
                cwd,
                env,
                use_pty: pty,
            };
            let config = RunnerConfig::resolve(name, base_dir, max_lines, max_bytes, forward, spawn)
                .context("failed to resolve runner configuration")?;
            run_runner(config).await
        }
        Command::Status { name, base_dir } => cmd_status(&name, base_dir).await,
        Command::Logs {
            name,
            base_dir,
            follow,
            since_cursor,
            since_ms,
            last,
            stream,
            grep,
            regex,
            case_sensitive,
            invert,
            max_lines,
            max_bytes,
        } => {
            cmd_logs(
                &name,
                base_dir,
                follow,
                since_cursor,
                since_ms,
                last,
                stream,
                grep,
                regex,
                case_sensitive,
                invert,
                max_lines,
                max_bytes,
            )
            .await
        }
        Command::Restart {
            name,
            base_dir,
            grace,
            ready_substring,
            ready_regex,
            ready_case_sensitive,
            timeout,
            clear_logs,
        } => {
            let req = cli::restart_request(
                grace.as_deref(),
                ready_substring,
                ready_regex,
                ready_case_sensitive,
                timeout.as_deref(),
                clear_logs,
            )
            .map_err(|e| anyhow::anyhow!(e))?;
            cmd_restart(&name, base_dir, req).await
        }
        Command::Stop { name, base_dir, grace } => {
            let grace_ms = grace
                .as_deref()
                .map(tap::config::parse_duration_ms)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            cmd_stop(&name, base_dir, StopRequest { grace_ms }).await
        }
        Command::Ps { base_dir } => cmd_ps(base_dir).await,
    }
}

async fn run_runner(config: RunnerConfig) -> anyhow::Result<()> {
    let (tap_dir, base_name) = tap_dir_for_name(&config.base_dir, &config.name);
    let socket_path = tap_dir.join(format!("{base_name}.sock"));

    let ring = Arc::new(RingBuffer::new(config.max_lines, config.max_bytes));
    let supervisor = Arc::new(Supervisor::new(ring.clone(), config.spawn.clone()));

    supervisor
        .spawn(false)
        .await
        .context("failed to spawn child")?;

    let listener = control_server::bind_with_stale_recovery(&socket_path)
        .await
        .context("failed to bind control socket")?;
    info!(socket = %socket_path.display(), "runner listening");

    let (shutdown_tx, _rx) = watch::channel(false);
    let state = ServerState::new(
        config.name.clone(),
        ring,
        supervisor.clone(),
        socket_path,
        config.spawn.use_pty,
        config.forward,
        shutdown_tx,
    );

    let signal_state = state.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        warn!("shutdown signal received, stopping child");
        signal_state.supervisor.stop(Duration::from_secs(2)).await;
        signal_state.begin_shutdown();
    });

    control_server::serve(listener, state).await;
    info!("runner exiting");
    Ok(())
}

async fn cmd_status(name: &str, base_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let base_dir = resolve_base_dir(base_dir)?;
    let socket_path = locator::resolve(&base_dir, name, None)?;
    let status = client::get_status(&socket_path, Duration::from_secs(5)).await?;
    println!(
        "{}: {:?} (pid={:?}) uptime={}ms buffer={}/{} lines",
        status.name,
        status.child_state,
        status.child_pid,
        status.uptime_ms,
        status.buffer.current_lines,
        status.buffer.max_lines
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_logs(
    name: &str,
    base_dir: Option<PathBuf>,
    follow: bool,
    since_cursor: Option<u64>,
    since_ms: Option<u64>,
    last: Option<usize>,
    stream: Option<String>,
    grep: Option<String>,
    regex: bool,
    case_sensitive: bool,
    invert: bool,
    max_lines: Option<usize>,
    max_bytes: Option<usize>,
) -> anyhow::Result<()> {
    let base_dir = resolve_base_dir(base_dir)?;
    let socket_path = locator::resolve(&base_dir, name, None)?;
    let tap_dir = socket_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base_dir.join(".tap"));

    let mut since_cursor = since_cursor.or_else(|| {
        if follow {
            tap::cursor_cache::read_cursor(&tap_dir, name).ok().flatten()
        } else {
            None
        }
    });

    loop {
        let opts = cli::logs_query_options(
            since_cursor,
            since_ms,
            last,
            stream.as_deref(),
            grep.clone(),
            regex,
            case_sensitive,
            invert,
            max_lines,
            max_bytes,
        );
        let query = cli::query_options_to_query_string(&opts);
        let response = client::get_logs(&socket_path, &query, Duration::from_secs(5)).await?;
        for event in &response.events {
            println!("[{}] {}: {}", event.seq, event.stream.as_str(), event.text);
        }
        since_cursor = Some(response.cursor_next);
        if follow {
            let _ = tap::cursor_cache::write_cursor(&tap_dir, name, response.cursor_next);
            tokio::time::sleep(Duration::from_millis(500)).await;
        } else {
            break;
        }
    }
    Ok(())
}

async fn cmd_restart(
    name: &str,
    base_dir: Option<PathBuf>,
    req: RestartRequest,
) -> anyhow::Result<()> {
    let base_dir = resolve_base_dir(base_dir)?;
    let socket_path = locator::resolve(&base_dir, name, None)?;
    let response = client::post_restart(&socket_path, &req, Duration::from_secs(30)).await?;
    if response.ready {
        println!("restarted, ready (pid={:?})", response.pid);
    } else {
        bail!(
            "restarted but not ready: {}",
            response.reason.unwrap_or_else(|| "unknown".to_string())
        );
    }
    Ok(())
}

async fn cmd_stop(name: &str, base_dir: Option<PathBuf>, req: StopRequest) -> anyhow::Result<()> {
    let base_dir = resolve_base_dir(base_dir)?;
    let socket_path = locator::resolve(&base_dir, name, None)?;
    client::post_stop(&socket_path, &req, Duration::from_secs(10)).await?;
    println!("stopped");
    Ok(())
}

async fn cmd_ps(base_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let base_dir = resolve_base_dir(base_dir)?;
    let services = locator::discover_services(&base_dir, 5);
    if services.is_empty() {
        println!("no services found under {}", base_dir.display());
        return Ok(());
    }
    for service in services {
        println!("{}\t{}", service.name, service.socket_path.display());
    }
    Ok(())
}

fn resolve_base_dir(base_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match base_dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("failed to determine current directory"),
    }
}

//! magiknative - node agent for native units
//!
//! Reads desired-state notifications and remote evaluation requests as JSON
//! lines on stdin, applies them to the local orchestrator and writes every
//! state-store event and evaluation reply as a JSON line on stdout. Logs go to
//! stderr.
//!
//! ## Usage
//!
//! ```sh
//! magiknative [--config <path>]
//! magiknative version
//! magiknative help
//! ```
//!
//! ## Input lines
//!
//! ```text
//! {"uuid":"i1","status":"DEFINE","fdu_id":"d1","name":"web","command":"sleep","args":["100"]}
//! {"eval":"start","instance":"i1","arg":"PORT=8080","id":"42"}
//! ```
//!
//! ## Shutdown
//!
//! ```text
//! SIGTERM / SIGINT ──► shutdown channel ──┐
//!                                         ├──► main loop exits
//! stdin EOF ──────────────────────────────┘        │
//!                     worker finishes its current notification
//!                                                  │
//!                              force-terminate every instance
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use magiknative::{
    Dispatcher, EvalRequest, IpNetworkManager, JsonLinesStore, NodeConfig, Notification,
    Orchestrator, Platform, StateStore, constants::DEFAULT_CONFIG_PATH,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable overriding the configured log filter.
const LOG_ENV: &str = "MAGIKNATIVE_LOG";

/// Pending notifications before the reader blocks.
const NOTIFICATION_QUEUE: usize = 256;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Serve { config: Option<PathBuf> },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "version" | "--version" | "-V" => return Ok(Command::Version),
            "help" | "--help" | "-h" => return Ok(Command::Help),
            "--config" | "-c" => {
                let path = args.get(i + 1).ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
                i += 2;
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(Command::Serve { config })
}

fn print_help() {
    println!(
        r#"magiknative - node agent for native units

USAGE:
    magiknative [--config <path>]
    magiknative version
    magiknative help

OPTIONS:
    -c, --config <path>   Node configuration (default: {})

ENVIRONMENT:
    {}     Log filter, overrides log_level (e.g. "magiknative=debug")
"#,
        DEFAULT_CONFIG_PATH, LOG_ENV
    );
}

fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let config = match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            NodeConfig::from_file(Path::new(DEFAULT_CONFIG_PATH))
                .with_context(|| format!("loading {}", DEFAULT_CONFIG_PATH))?
        }
        None => NodeConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let command = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            print_help();
            return ExitCode::from(2);
        }
    };

    let config_path = match command {
        Command::Version => {
            println!("magiknative {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Command::Help => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Command::Serve { config } => config,
    };

    let config = match load_config(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set tracing subscriber");
        return ExitCode::FAILURE;
    }

    match serve(config).await {
        Ok(failures) if failures == 0 => ExitCode::SUCCESS,
        Ok(failures) => {
            warn!(failures, "some instances could not be terminated");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "agent failed");
            ExitCode::FAILURE
        }
    }
}

/// Runs the agent until shutdown. Returns the number of instances that could
/// not be terminated.
async fn serve(config: NodeConfig) -> anyhow::Result<usize> {
    let platform = Platform::detect();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node_id,
        platform = %platform,
        "magiknative starting"
    );
    if !platform.supports_namespaces() {
        warn!("network namespaces unavailable, configure will fail");
    }

    config.ensure_layout().context("creating base directories")?;

    let output = Arc::new(JsonLinesStore::stdout());
    let store: Arc<dyn StateStore> = output.clone();
    let orchestrator = Arc::new(
        Orchestrator::new(&config, Arc::new(IpNetworkManager::new()), store.clone())
            .context("building orchestrator")?,
    );
    store.plugin_started(&config.node_id).await?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<&'static str>(1);
    spawn_signal_forwarder(shutdown_tx)?;

    let (notify_tx, notify_rx) = mpsc::channel::<Notification>(NOTIFICATION_QUEUE);
    let dispatcher = Dispatcher::new(orchestrator.clone(), &config);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        let stop = async {
            let _ = stop_rx.await;
        };
        dispatcher.run_until(notify_rx, stop).await
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            reason = shutdown_rx.recv() => {
                info!(reason = reason.unwrap_or("channel closed"), "initiating shutdown");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = route_line(&line, &orchestrator, &output, &notify_tx).await {
                            warn!(error = %e, "discarding input line");
                        }
                    }
                    Ok(None) => {
                        info!(reason = "stdin closed", "initiating shutdown");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }
        }
    }

    // Every step of a transition is individually time-bounded, so the worker
    // returns once its current notification is applied.
    let _ = stop_tx.send(());
    drop(notify_tx);
    if let Err(e) = worker.await {
        error!(error = %e, "notification worker failed");
    }
    let failures = orchestrator.shutdown().await;
    info!(failures, "magiknative stopped");
    Ok(failures)
}

/// Sends evaluation requests to a spawned task and notifications to the worker.
async fn route_line(
    line: &str,
    orchestrator: &Arc<Orchestrator>,
    output: &Arc<JsonLinesStore>,
    notify_tx: &mpsc::Sender<Notification>,
) -> anyhow::Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let value: serde_json::Value = serde_json::from_str(line).context("invalid JSON")?;

    if value.get("eval").is_some() {
        let request: EvalRequest = serde_json::from_value(value).context("invalid eval request")?;
        let orchestrator = orchestrator.clone();
        let output = output.clone();
        tokio::spawn(async move {
            let response = orchestrator.evaluate(&request).await;
            if let Err(e) = output.write_line(&response) {
                error!(instance = %request.instance, error = %e, "failed to write eval reply");
            }
        });
        return Ok(());
    }

    let notification = Notification::from_value(value)?;
    debug!(instance = %notification.uuid, action = %notification.status, "queued notification");
    notify_tx
        .send(notification)
        .await
        .context("notification worker stopped")?;
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_forwarder(tx: mpsc::Sender<&'static str>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        let reason = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        let _ = tx.send(reason).await;
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_forwarder(tx: mpsc::Sender<&'static str>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send("ctrl-c").await;
        }
    });
    Ok(())
}

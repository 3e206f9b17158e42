use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use redis::aio::ConnectionManager;
use tokio::signal;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use spillway::admission::{AdmissionDecision, AdmissionGate, CallerResponse};
use spillway::config::SpillwayConfig;
use spillway::queue::{DeferredTask, OverflowQueue, RedisQueue, RedisQueueConfig};
use spillway::ratelimit::{ClientIdentity, RedisStore};
use spillway::worker::{CompletionLogger, Deduplicate, DeferredWorker, TaskHandler};

/// How long completed task ids are remembered for redelivery suppression.
const DEDUP_RETENTION: Duration = Duration::from_secs(3600);

/// Upper bound on establishing a Redis connection at startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "spillway", version, about = "Admission control with overflow queueing")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also append logs to this file, e.g. logs/app.log
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the deferred worker until interrupted
    Worker,
    /// Run one admission for a client and print the caller response
    Admit {
        /// Client identity to admit
        client: String,
    },
    /// Print dead-lettered tasks
    DeadLetters,
    /// Return every in-flight task to the queue; run only while no worker is up
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Held until exit so buffered file logs are flushed
    let _log_guard = init_tracing(cli.log_json, cli.log_file.as_deref())?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SpillwayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(store = %config.store.url, queue = %config.queue.name, "Configuration loaded");

    let store_conn = connect(&config.store.url).await?;
    let queue_conn = if config.queue_url() == config.store.url {
        store_conn.clone()
    } else {
        connect(config.queue_url()).await?
    };

    let store = Arc::new(RedisStore::with_connection(store_conn));
    let queue = Arc::new(RedisQueue::with_connection(
        queue_conn,
        RedisQueueConfig {
            name: config.queue.name.clone(),
            timeout: config.queue.timeout(),
            poll_interval: config.queue.poll_interval(),
        },
    ));

    match cli.command {
        Command::Worker => {
            let handler = Arc::new(Deduplicate::new(CompletionLogger, DEDUP_RETENTION));
            let worker = DeferredWorker::new(queue, handler, &config.worker)
                .with_queue_timeout(config.queue.timeout());

            worker.run(shutdown_signal()).await;
        }
        Command::Admit { client } => {
            let gate = AdmissionGate::from_config(store, queue, &config);
            let result = gate.admit(&client).await;

            if let Ok(AdmissionDecision::Accepted) = result {
                let task = DeferredTask::new(ClientIdentity::parse(&client)?);
                if let Err(e) = CompletionLogger.execute(&task).await {
                    tracing::error!(error = %e, "Immediate execution failed");
                }
            }

            let response = CallerResponse::from(&result);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::DeadLetters => {
            let dead = queue.dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
        Command::Recover => {
            let recovered = queue.recover().await.context("recovering in-flight tasks")?;
            info!(recovered, "Returned in-flight tasks to the queue");
        }
    }

    info!("Spillway stopped");
    Ok(())
}

/// Install the console subscriber, plus a non-blocking file sink if asked.
fn init_tracing(json: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = if json {
        fmt::layer().json().with_thread_ids(true).boxed()
    } else {
        fmt::layer().with_target(false).with_thread_ids(true).boxed()
    };

    let (file, guard) = match log_file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(guard)
}

/// Split a log file path into its directory (`.` if none) and file name.
fn split_log_path(path: &Path) -> anyhow::Result<(&Path, &std::ffi::OsStr)> {
    let name = path
        .file_name()
        .with_context(|| format!("log file path {} has no file name", path.display()))?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok((dir, name))
}

async fn connect(url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(url).with_context(|| format!("invalid Redis URL {}", url))?;
    let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
        .await
        .with_context(|| format!("timed out connecting to {}", url))?
        .with_context(|| format!("connecting to {}", url))?;
    Ok(conn)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

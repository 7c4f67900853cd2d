#![forbid(unsafe_code)]

//! `agent-console` — local agent console server binary.
//!
//! Bootstraps configuration, restores the task snapshot, starts the
//! debounced persister and serves the REST API plus `/ws/pty`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use agent_console::config::GlobalConfig;
use agent_console::logbuf::LogBuffer;
use agent_console::orchestrator::TaskEngine;
use agent_console::persistence::{
    spawn_persister, FileSnapshotStore, PersistHandle, SnapshotSource, SnapshotStore,
};
use agent_console::state::AppState;
use agent_console::{http, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-console", about = "Agent console server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let logs = LogBuffer::default();
    init_tracing(args.log_format, logs.clone())?;
    info!("agent-console server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args, logs))
}

async fn run(args: Cli, logs: LogBuffer) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_toml_str("")?,
    };
    config.apply_env_overrides();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Restore tasks ───────────────────────────────────
    let store = Arc::new(FileSnapshotStore::new(config.tasks.state_file.clone()));
    let (persist, requests) = PersistHandle::channel();
    let engine = Arc::new(TaskEngine::new(Arc::clone(&config), persist.clone()));

    match store.load().await {
        Ok(Some(snapshot)) => {
            let restored = engine.rehydrate(snapshot);
            info!(restored, path = %store.path().display(), "task snapshot loaded");
        }
        Ok(None) => info!(path = %store.path().display(), "no task snapshot yet"),
        Err(err) => warn!(%err, "ignoring unreadable task snapshot"),
    }

    // The persister outlives the HTTP server so the final flush always runs.
    let persist_ct = CancellationToken::new();
    let persister = spawn_persister(
        requests,
        Arc::clone(&engine) as Arc<dyn SnapshotSource>,
        store,
        config.tasks.persist_debounce(),
        persist_ct.clone(),
    );
    persist.flush_now();

    // ── Start HTTP ──────────────────────────────────────
    let bind = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    let port = listener.local_addr()?.port();

    let state = Arc::new(AppState::new(Arc::clone(&config), engine, logs).with_port(port));
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = http::serve(listener, state, server_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!(port, "agent-console ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    let _ = server.await;

    // ── Final snapshot ──────────────────────────────────
    persist.shutdown().await;
    persist_ct.cancel();
    let _ = persister.await;
    info!("agent-console shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, logs: LogBuffer) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let text = (log_format == LogFormat::Text).then(fmt::layer);
    let json = (log_format == LogFormat::Json).then(|| fmt::layer().json());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text)
        .with(json)
        .with(logs)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}

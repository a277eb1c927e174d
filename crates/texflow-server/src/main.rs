//! texflow compiler service.
//!
//! Loads the configuration, connects to the store and runs the scheduler
//! until interrupted.
//!
//! Usage: `texflow-server [config.json]`. The path falls back to
//! `TEXFLOW_CONFIG`, then `config.json`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use texflow_db::{connect, ConnectOptions, PgDocumentStore, Records};
use texflow_jobs::{
    defaults, CompileContext, CompilerConfig, DockerRuntime, ProcessPool, SandboxPool, Scheduler,
    SchedulerHandle, Strategy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(defaults::ENV_CONFIG_PATH).ok())
        .unwrap_or_else(|| defaults::CONFIG_PATH.to_string());
    let config = Arc::new(
        CompilerConfig::load(&config_path)
            .with_context(|| format!("failed to load {}", config_path))?,
    );

    let database_url = config
        .database_url
        .as_deref()
        .context("database_url is not configured (set it in the config or DATABASE_URL)")?;
    let pool = connect(
        database_url,
        ConnectOptions::for_workers(config.worker_count()),
    )
    .await?;
    let store = PgDocumentStore::new(pool);
    store.migrate().await?;
    let records = Records::new(Arc::new(store));

    let ctx = CompileContext::new(config.clone(), records.clone()).await?;
    info!(
        subsystem = "server",
        config = %config_path,
        strategy = ?config.strategy,
        workers = config.worker_count(),
        scratch_root = %ctx.scratch_root.display(),
        "Starting compiler service"
    );

    let handle = match config.strategy {
        Strategy::Process => {
            Scheduler::new(records, ProcessPool::start(ctx), config.clone()).start()
        }
        Strategy::Sandbox => {
            let sandbox = config
                .sandbox
                .clone()
                .context("sandbox strategy requires a `sandbox` section")?;
            let runtime = Arc::new(DockerRuntime::new(sandbox, ctx.scratch_root.clone()));
            let pool = SandboxPool::start(ctx, runtime).await?;
            Scheduler::new(records, pool, config.clone()).start()
        }
    };

    shutdown_signal().await;
    stop(handle).await
}

async fn stop(handle: SchedulerHandle) -> anyhow::Result<()> {
    info!(subsystem = "server", "Shutting down");
    handle.shutdown().await?;
    handle.join().await?;
    info!(subsystem = "server", "Compiler service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "texflow=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    // "texflow" prefixes every crate target in the workspace.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "texflow=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("texflow-server.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

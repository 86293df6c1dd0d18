pub mod aggregator;
pub mod compiler;
pub mod db;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod oauth;
pub mod pipeline;
pub mod redaction;
pub mod resolver;
pub mod scheduler;
pub mod warehouse;

pub use crate::engine::EngineCore;
pub use crate::errors::{AppError, AppResult};

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DATA_DIR_ENV: &str = "METRICS_ENGINE_DATA_DIR";
const MODELS_DIR_ENV: &str = "METRICS_ENGINE_MODELS_DIR";
const TENANTS_ENV: &str = "METRICS_ENGINE_TENANTS";

/// Starts the engine service and blocks until Ctrl-C.
pub fn run() -> AppResult<()> {
    let data_dir = std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    std::fs::create_dir_all(&data_dir)?;
    init_tracing(&data_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(data_dir))
}

async fn serve(data_dir: PathBuf) -> AppResult<()> {
    let engine = EngineCore::new(data_dir)?;
    tracing::info!(data_dir = %engine.data_dir().display(), "metrics engine starting");

    if let Ok(models_dir) = std::env::var(MODELS_DIR_ENV) {
        for tenant_id in parse_tenants(&std::env::var(TENANTS_ENV).unwrap_or_default())? {
            engine.register_models_from_dir(tenant_id, Path::new(&models_dir))?;
        }
    }

    engine.start_scheduler();

    let minutes = engine.settings()?.refresh_interval_minutes.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.enqueue_all_tenants().await {
                    Ok(queued) => tracing::info!(queued, "queued periodic pipeline runs"),
                    Err(error) => tracing::warn!(error = %error, "periodic refresh could not list tenants"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

fn parse_tenants(raw: &str) -> AppResult<Vec<models::TenantId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<i64>()
                .map(models::TenantId)
                .map_err(|_| AppError::Validation(format!("invalid tenant id '{}' in {}", value, TENANTS_ENV)))
        })
        .collect()
}

fn init_tracing(data_dir: &Path) -> anyhow::Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
        .context("installing tracing subscriber")
}

// Buffer proxy - a localhost HTTP(S) interception proxy that accelerates
// LLM context-compaction requests via a precomputed double-buffer.
//
// Architecture:
// - server (axum): catch-all HTTP surface, forwards to upstream
// - engine: per-conversation double-buffer state machine
// - checkpoint: background summarization call against upstream
// - persistence: best-effort SQLite snapshots for restart diagnostics
// - dashboard: observability HTTP/WS surface

mod checkpoint;
mod config;
mod detector;
mod dashboard;
mod engine;
mod error;
mod events;
mod handler;
mod persistence;
mod server;
mod sse;
mod store;
mod tokens;

use anyhow::{Context, Result};
use checkpoint::ReqwestUpstream;
use config::{Config, LogFormat, LogRotation};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    Config::ensure_config_exists();
    let config = Config::from_env();

    let _log_guard = init_logging(&config);

    tracing::info!(
        proxy_bind = %config.proxy_bind,
        dashboard_bind = %config.dashboard_bind,
        passthrough = config.passthrough,
        "starting bufferproxy"
    );

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY not set; background checkpoint calls will fail until it is");
    }
    let upstream: Arc<dyn checkpoint::Upstream> =
        Arc::new(ReqwestUpstream::new(config.upstream_api_url.clone(), api_key).context("failed to build upstream client")?);

    let db_pool = match persistence::open_pool(&config.persistence_db_path) {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::error!(error = %e, "failed to open persistence database; continuing without durable snapshots");
            None
        }
    };

    let store = Arc::new(store::ConversationStore::new(std::time::Duration::from_secs(
        config.conversation_ttl_seconds,
    )));

    if let Some(pool) = &db_pool {
        match persistence::load_all(pool) {
            Ok(rows) => {
                tracing::info!(rows = rows.len(), "rehydrating dashboard listing from persisted snapshots");
                store.seed_from_persisted(rows);
            }
            Err(e) => tracing::warn!(error = %e, "failed to load persisted conversation rows"),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let (eviction_stop_tx, mut eviction_stop_rx) = tokio::sync::oneshot::channel::<()>();

    let eviction_store = store.clone();
    let eviction_db_pool = db_pool.clone();
    let eviction_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = eviction_store.evict_idle().await;
                    if !evicted.is_empty() {
                        tracing::debug!(evicted = evicted.len(), "evicted idle conversations");
                        if let Some(pool) = &eviction_db_pool {
                            for key in &evicted {
                                persistence::delete_conversation(pool, key);
                            }
                        }
                    }
                }
                _ = &mut eviction_stop_rx => break,
            }
        }
    });

    let server_store = store.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::start_proxy(config, upstream, db_pool, server_store, shutdown_rx).await {
            tracing::error!(error = %e, "proxy server exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(());
    await_with_grace_period(server_handle, Duration::from_secs(5), "proxy server").await;
    let _ = eviction_stop_tx.send(());
    await_with_grace_period(eviction_handle, Duration::from_secs(5), "eviction loop").await;

    // Cancel whatever checkpoints are still in flight rather than letting
    // the process hang on a 120s upstream call that nobody will read the
    // result of.
    store.cancel_all_checkpoints().await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for a spawned task up to `grace`, killing the process if it's still
/// stuck past that — a wedged graceful-shutdown path shouldn't turn into an
/// operator having to SIGKILL the proxy by hand.
async fn await_with_grace_period<T>(handle: tokio::task::JoinHandle<T>, grace: Duration, label: &str) {
    if tokio::time::timeout(grace, handle).await.is_err() {
        tracing::error!(task = label, grace_secs = grace.as_secs(), "shutdown grace period elapsed; exiting");
        std::process::exit(1);
    }
}

/// Build the stdout (and, if configured, rotating file) tracing layers from
/// `[logging]` config. Returns the `WorkerGuard` for the file layer, which
/// must stay alive for the process lifetime or buffered lines are dropped
/// silently on exit.
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = format!("bufferproxy={},tower_http=debug,axum=debug", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if !config.logging.file_enabled {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
        }
        return None;
    }

    let rotation = match config.logging.file_rotation {
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let file_appender = tracing_appender::rolling::RollingFileAppender::new(rotation, &config.logging.file_dir, &config.logging.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking).with_ansi(false))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
    }
    Some(guard)
}

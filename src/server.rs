//! Router assembly and the two listeners (proxy + dashboard, which may
//! share one bind address).

use crate::checkpoint::Upstream;
use crate::config::Config;
use crate::dashboard;
use crate::detector::CompactionDetector;
use crate::engine::{BufferEngine, EngineConfig};
use crate::events::DashboardEvent;
use crate::handler::{proxy_handler, ProxyState};
use crate::persistence::DbPool;
use crate::store::ConversationStore;
use crate::tokens::ModelWindows;
use anyhow::{Context, Result};
use axum::{routing::any, routing::get, routing::post, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Build the router and run both listeners until `shutdown_rx` fires.
/// `store` is owned by the caller so it can also drive a TTL-eviction
/// background task independent of the HTTP server's lifetime.
pub async fn start_proxy(
    config: Config,
    upstream: Arc<dyn Upstream>,
    db_pool: Option<DbPool>,
    store: Arc<ConversationStore>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .http1_only()
        .build()
        .context("failed to create upstream HTTP client")?;

    let (events_tx, _events_rx) = broadcast::channel::<DashboardEvent>(1024);

    let engine = Arc::new(BufferEngine::new(
        EngineConfig {
            checkpoint_threshold: config.checkpoint_threshold,
            swap_threshold: config.swap_threshold,
            compact_trigger_tokens: config.compact_trigger_tokens,
            checkpoint_timeout: Duration::from_secs(120),
        },
        upstream,
        store.clone(),
        config.passthrough,
        events_tx,
    ));

    let state = ProxyState {
        client,
        api_url: config.upstream_api_url.clone(),
        store: store.clone(),
        engine,
        detector: Arc::new(CompactionDetector::default()),
        model_windows: Arc::new(ModelWindows::default()),
        db_pool,
    };

    let app = Router::new()
        .route("/health", get(dashboard::health))
        .route("/dashboard/api/conversations", get(dashboard::list_conversations))
        .route("/dashboard/api/conversation/:key", get(dashboard::get_conversation))
        .route("/dashboard/ws", get(dashboard::ws::upgrade))
        .route("/v1/_reset", post(dashboard::reset))
        .route("/*path", any(proxy_handler))
        .with_state(state);

    tracing::info!(bind = %config.proxy_bind, "starting buffer proxy");

    let listener = TcpListener::bind(config.proxy_bind)
        .await
        .context("failed to bind proxy listener")?;

    tracing::info!(bind = %config.proxy_bind, "buffer proxy listening");

    // The common case is one process, one port; DASHBOARD_BIND differing
    // from PROXY_BIND starts a second listener serving the identical
    // router, so the dashboard routes are also reachable there.
    let (shutdown_a, shutdown_b) = split_shutdown(shutdown_rx);

    if config.dashboard_bind != config.proxy_bind {
        let dashboard_listener = TcpListener::bind(config.dashboard_bind)
            .await
            .context("failed to bind dashboard listener")?;
        tracing::info!(bind = %config.dashboard_bind, "dashboard listening on separate port");

        let dashboard_app = app.clone();
        let dashboard_server = axum::serve(dashboard_listener, dashboard_app).with_graceful_shutdown(async move {
            shutdown_b.await.ok();
        });

        let proxy_server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_a.await.ok();
        });

        tokio::try_join!(
            async { proxy_server.await.context("proxy server error") },
            async { dashboard_server.await.context("dashboard server error") },
        )?;
    } else {
        drop(shutdown_b);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_a.await.ok();
            })
            .await
            .context("server error")?;
    }

    tracing::info!("buffer proxy shut down gracefully");
    Ok(())
}

/// Fan a single shutdown signal out to (up to) two listeners.
fn split_shutdown(
    rx: tokio::sync::oneshot::Receiver<()>,
) -> (tokio::sync::oneshot::Receiver<()>, tokio::sync::oneshot::Receiver<()>) {
    let (tx_a, rx_a) = tokio::sync::oneshot::channel();
    let (tx_b, rx_b) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if rx.await.is_ok() {
            let _ = tx_a.send(());
            let _ = tx_b.send(());
        }
    });
    (rx_a, rx_b)
}

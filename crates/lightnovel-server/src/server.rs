use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use lightnovel_core::{BroadcastHub, SchedulerStats, TaskScheduler};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::cache::{ContentInvalidator, TieredCache, TieredCacheOptions};
use crate::config::AppConfig;
use crate::realtime::{self, Notifier, RealtimeSettings};

/// Shared handles for request handlers.
///
/// Every component is built once in [`ServerBuilder::build`] and passed in
/// explicitly; nothing here is a process global.
#[derive(Clone)]
pub struct AppState {
    pub cache: TieredCache,
    pub hub: Arc<BroadcastHub>,
    pub scheduler: Arc<TaskScheduler>,
    pub notifier: Notifier,
    pub invalidator: ContentInvalidator,
    pub realtime: RealtimeSettings,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/ws", get(realtime::ws_handler))
        .route("/api/v1/ws/status", get(ws_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let remote_ok = state.cache.is_remote_available().await;
    let scheduler: SchedulerStats = state.scheduler.stats();
    let status = if remote_ok && !scheduler.stopped && !state.hub.is_shut_down() {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "uptimeSecs": state.hub.uptime().as_secs(),
        "cache": state.cache.stats(),
        "remoteCache": remote_ok,
        "scheduler": {
            "workers": scheduler.workers,
            "queued": scheduler.queued,
            "stopped": scheduler.stopped,
        },
        "connections": state.hub.connection_count(),
    }))
}

async fn ws_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "code": 0,
        "data": state.hub.stats(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

pub struct LightnovelServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
    shutdown: CancellationToken,
    reaper: JoinHandle<()>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Build and start the runtime components: batch scheduler, remote tier,
    /// cache, hub, and the hub's dead-connection reaper.
    pub async fn build(self) -> anyhow::Result<LightnovelServer> {
        let cfg = self.config;
        cfg.validate().map_err(anyhow::Error::msg)?;

        let shutdown = CancellationToken::new();
        let (state, reaper) = build_state(&cfg, &shutdown).await;

        Ok(LightnovelServer {
            addr: self.addr,
            app: build_app(state.clone()),
            state,
            shutdown,
            reaper,
        })
    }
}

/// Wire up [`AppState`] from configuration. The returned handle is the
/// hub reaper, which stops when `shutdown` is cancelled.
pub async fn build_state(
    cfg: &AppConfig,
    shutdown: &CancellationToken,
) -> (AppState, JoinHandle<()>) {
    let scheduler = TaskScheduler::new_shared(cfg.scheduler.workers);
    scheduler.start(shutdown);

    let remote = crate::create_remote_tier(&cfg.redis).await;
    let cache = TieredCache::new(
        remote,
        scheduler.clone(),
        TieredCacheOptions::from_config(&cfg.cache, &cfg.redis),
    );

    let realtime = RealtimeSettings::from(&cfg.realtime);
    let hub = Arc::new(BroadcastHub::with_policy(&realtime.heartbeat));
    let reaper = hub.spawn_reaper(cfg.realtime.reap_interval(), shutdown.child_token());

    let notifier = Notifier::new(hub.clone());
    let invalidator = ContentInvalidator::new(cache.clone(), notifier.clone());

    let state = AppState {
        cache,
        hub,
        scheduler,
        notifier,
        invalidator,
        realtime,
    };
    (state, reaper)
}

impl LightnovelServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        // Upgraded sockets outlive their HTTP connection, so close them as
        // soon as the signal arrives rather than after serve returns.
        let hub = self.state.hub.clone();
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            hub.shutdown();
        })
        .await?;

        shutdown_runtime(&self.state, &self.shutdown).await;
        let _ = self.reaper.await;
        Ok(())
    }
}

/// Close every push connection, then let queued batch work finish.
pub async fn shutdown_runtime(state: &AppState, shutdown: &CancellationToken) {
    state.hub.shutdown();

    let stop = state.scheduler.stop();
    if tokio::time::timeout(Duration::from_secs(30), stop).await.is_err() {
        tracing::warn!("batch scheduler did not drain in time, aborting");
        state.scheduler.abort();
    }
    shutdown.cancel();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

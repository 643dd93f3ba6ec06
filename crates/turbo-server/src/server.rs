use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use turbo_core::path;
use turbo_store::Storage;
use turbo_telemetry::ServerMetrics;

use crate::config::ServerSettings;
use crate::connection;
use crate::health;
use crate::hub::Hub;

/// How long [`ServerHandle::shutdown`] waits for background tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub heartbeat: Duration,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState, static_dir: Option<&std::path::Path>) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/data", get(data_root_handler))
        .route("/data/{*path}", get(data_handler))
        .with_state(state);
    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle that owns the background tasks.
pub async fn start(
    config: &ServerSettings,
    store: Arc<dyn Storage>,
    metrics: Arc<ServerMetrics>,
) -> Result<ServerHandle, std::io::Error> {
    let hub = Arc::new(Hub::new(store, metrics, config.outbox_capacity));
    let shutdown = CancellationToken::new();

    let state = AppState {
        hub: Arc::clone(&hub),
        heartbeat: config.heartbeat_interval(),
    };
    let router = build_router(state, config.static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, storage = hub.store().backend(), "turbo server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    let reaper = spawn_reaper(
        Arc::clone(&hub),
        config.heartbeat_interval(),
        config.client_timeout(),
        shutdown.clone(),
    );

    Ok(ServerHandle {
        addr,
        hub,
        shutdown,
        tasks: vec![server, reaper],
    })
}

/// Disconnect sessions that stopped answering pings.
fn spawn_reaper(
    hub: Arc<Hub>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = hub.reap(timeout);
                    if removed > 0 {
                        tracing::info!(removed, "reaped unresponsive sessions");
                    }
                }
            }
        }
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop accepting, close every session and wait for background tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.hub.disconnect_all();
        tracing::info!(sessions = closed, tasks = self.tasks.len(), "shutting down");

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some tasks may still be running");
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve(socket, state.hub, state.heartbeat))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hub = &state.hub;
    Json(health::health_check(
        hub.uptime(),
        hub.session_count(),
        hub.bus().subscription_count(),
        hub.store().backend(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.metrics().snapshot())
}

#[derive(Debug, Default, Deserialize)]
struct DataQuery {
    #[serde(default)]
    descendants: bool,
}

async fn data_root_handler(state: State<AppState>, query: Query<DataQuery>) -> Response {
    read_data(&state.hub, path::ROOT, query.descendants).await
}

async fn data_handler(
    state: State<AppState>,
    Path(raw): Path<String>,
    query: Query<DataQuery>,
) -> Response {
    read_data(&state.hub, &path::canonicalize(&raw), query.descendants).await
}

async fn read_data(hub: &Hub, path: &str, descendants: bool) -> Response {
    let entry = match hub.store().get(path).await {
        Ok(entry) => entry,
        Err(e) => return storage_failure(path, e),
    };
    let mut body = json!({
        "path": path,
        "value": entry.value,
        "revision": entry.revision,
    });
    if descendants {
        match hub.store().descendants(path).await {
            Ok(rows) => {
                body["descendants"] = rows
                    .into_iter()
                    .map(|(path, entry)| json!({"path": path, "value": entry.value, "revision": entry.revision}))
                    .collect();
            }
            Err(e) => return storage_failure(path, e),
        }
    }
    Json(body).into_response()
}

fn storage_failure(path: &str, error: turbo_store::StoreError) -> Response {
    tracing::warn!(path, error = %error, "data read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::netroxy::{net, tunnel::dashboard::Dashboard};

#[derive(Clone)]
pub struct AdminState {
    pub dashboard: Arc<dyn Dashboard>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/servers", get(servers))
        .route("/sessions", get(sessions))
        .route("/sessions/{name}", get(session))
        .route("/mappings", get(mappings))
        .route("/mappings/{port}", get(mapping))
        .route("/mappings/{port}/on", post(enable_mapping))
        .route("/mappings/{port}/off", post(disable_mapping))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let addr = net::normalize_bind_addr(addr);
    TcpListener::bind(addr.as_ref())
        .await
        .map_err(|err| anyhow::anyhow!("admin: bind {addr}: {err}"))
}

pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(admin_addr = %addr, "admin: listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: what })).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> Response {
    match &st.prometheus {
        Some(h) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            h.render(),
        )
            .into_response(),
        None => not_found("metrics recorder not installed".into()),
    }
}

async fn servers(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.dashboard.servers()))
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.dashboard.list_sessions()))
}

async fn session(State(st): State<Arc<AdminState>>, Path(name): Path<String>) -> Response {
    match st.dashboard.get_session(&name) {
        Some(s) => (StatusCode::OK, Json(s)).into_response(),
        None => not_found(format!("no session named {name:?}")),
    }
}

async fn mappings(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.dashboard.list_mappings()))
}

async fn mapping(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    match st.dashboard.get_mapping(port) {
        Some(m) => (StatusCode::OK, Json(m)).into_response(),
        None => not_found(format!("no mapping on port {port}")),
    }
}

fn toggle(st: &AdminState, port: u16, on: bool) -> Response {
    if st.dashboard.set_mapping_enabled(port, on) {
        (StatusCode::OK, Json(true)).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(false)).into_response()
    }
}

async fn enable_mapping(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    toggle(&st, port, true)
}

async fn disable_mapping(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    toggle(&st, port, false)
}

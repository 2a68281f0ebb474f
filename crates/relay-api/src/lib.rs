//! HTTP surface — C13, §4.9.
//!
//! Routes are nested under `/v1`, plus an unauthenticated `/health` and
//! `/ready` pair (the latter backed by the sweeper's liveness beacon) and a
//! `/status` metrics snapshot, matching the teacher's pattern of an
//! operator-facing surface alongside the capability-gated one.
//!
//! `/v1/transfer/chunk` and `/v1/transfer/download` carry request bodies
//! that can legitimately take longer than the deadline applied to every
//! other route, so they're nested outside the `TimeoutLayer`.

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

pub use handlers::ApiState;

use crate::error::ApiError;
use handlers::{check_rate_limit, session, signal, transfer};

async fn health(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "health", &addr.ip().to_string())?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn ready(State(state): State<ApiState>) -> axum::http::StatusCode {
    if state.sweeper.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Snapshot of the process-wide counters (§4.10). Deliberately ungated by
/// capability — it carries only aggregate counts, never session/transfer
/// data — but operators deploying this behind a public listener should
/// firewall `/status` the way they would any other metrics endpoint.
async fn status(State(state): State<ApiState>) -> Json<relay_services::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let deadline = TimeoutLayer::new(Duration::from_secs(15));

    let v1_routes = Router::new()
        .route("/session/create", post(session::create))
        .route("/session/claim", post(session::claim))
        .route("/session/sas/commit", post(session::sas_commit))
        .route("/session/approve", post(session::approve))
        .route("/session/reject", post(session::reject))
        .route("/session/poll", get(session::poll))
        .route("/p2p/offer", post(signal::offer))
        .route("/p2p/answer", post(signal::answer))
        .route("/p2p/ice", post(signal::ice))
        .route("/p2p/poll", get(signal::poll))
        .route("/p2p/ice_config", get(signal::ice_config))
        .route("/transfer/init", post(transfer::init))
        .route("/transfer/finalize", post(transfer::finalize))
        .route("/transfer/manifest", get(transfer::manifest))
        .route("/transfer/download_token", post(transfer::download_token))
        .route("/transfer/receipt", post(transfer::receipt))
        .route("/transfer/scan_init", post(transfer::scan_init))
        .route("/transfer/scan_chunk", post(transfer::scan_chunk))
        .route("/transfer/scan_finalize", post(transfer::scan_finalize))
        .layer(deadline);

    // No deadline: chunk upload and ranged download bodies are allowed to
    // run past the 15s budget applied to every other route.
    let v1_unbounded = Router::new()
        .route("/transfer/chunk", put(transfer::chunk))
        .route("/transfer/download", get(transfer::download));

    let api = Router::new()
        .merge(v1_routes)
        .merge(v1_unbounded)
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .with_state(state)
        .nest("/v1", api)
        .layer(cors)
}

/// Serves `state`'s router on `listen_addr` until `shutdown` resolves, then
/// gives in-flight requests `drain_deadline` to finish before returning
/// (§5: stop accept, drain, then the caller stops the sweeper).
pub async fn serve(
    state: ApiState,
    listen_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    drain_deadline: Duration,
) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = listen_addr, "API listening");

    let triggered = Arc::new(tokio::sync::Notify::new());
    let triggered_for_shutdown = triggered.clone();
    let shutdown = async move {
        shutdown.await;
        triggered_for_shutdown.notify_one();
    };

    let serving = axum::serve(listener, app).with_graceful_shutdown(shutdown);
    tokio::select! {
        result = serving => result?,
        _ = async { triggered.notified().await; tokio::time::sleep(drain_deadline).await } => {
            tracing::warn!("drain deadline exceeded, forcing exit");
        }
    }
    Ok(())
}

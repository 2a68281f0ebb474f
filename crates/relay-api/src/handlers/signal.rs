//! /v1/p2p/{offer,answer,ice,poll,ice_config} — C12, §4.7.
//!
//! All five routes share one `xfer.signal` capability bound only to
//! (session_id, claim_id) — either party may present it, since the server
//! never distinguishes sender from receiver here.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use relay_core::capability::{Bindings, Requirement, Route, Scope};
use relay_core::model::SignalMessage;
use relay_core::RelayError;

use super::{authorize, check_rate_limit, ApiState};
use crate::error::ApiError;

fn signal_requirement(route: Route, session_id: &str, claim_id: &str) -> Requirement {
    Requirement {
        scope: Some(Scope::XferSignal),
        route: Some(route),
        bindings: Bindings {
            session_id: Some(session_id.to_string()),
            claim_id: Some(claim_id.to_string()),
            ..Default::default()
        },
        single_use: false,
    }
}

#[derive(Deserialize)]
pub struct OfferRequest {
    pub session_id: String,
    pub claim_id: String,
    pub sdp: String,
}

pub async fn offer(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<OfferRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    authorize(
        &state,
        &headers,
        signal_requirement(Route::P2pOffer, &req.session_id, &req.claim_id),
    )?;

    state
        .signaling
        .signal(&req.session_id, &req.claim_id, SignalMessage::Offer { sdp: req.sdp })
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct AnswerRequest {
    pub session_id: String,
    pub claim_id: String,
    pub sdp: String,
}

pub async fn answer(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    authorize(
        &state,
        &headers,
        signal_requirement(Route::P2pAnswer, &req.session_id, &req.claim_id),
    )?;

    state
        .signaling
        .signal(&req.session_id, &req.claim_id, SignalMessage::Answer { sdp: req.sdp })
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct IceRequest {
    pub session_id: String,
    pub claim_id: String,
    pub candidate: String,
}

pub async fn ice(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<IceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    authorize(
        &state,
        &headers,
        signal_requirement(Route::P2pIce, &req.session_id, &req.claim_id),
    )?;

    state
        .signaling
        .signal(&req.session_id, &req.claim_id, SignalMessage::Ice { candidate: req.candidate })
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct PollQuery {
    pub session_id: String,
    pub claim_id: String,
}

pub async fn poll(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<PollQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<SignalMessage>>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    authorize(
        &state,
        &headers,
        signal_requirement(Route::P2pPoll, &q.session_id, &q.claim_id),
    )?;

    let messages = state.signaling.poll(&q.session_id, &q.claim_id).await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
pub struct IceConfigQuery {
    pub session_id: String,
    pub claim_id: String,
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn ice_config(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<IceConfigQuery>,
    headers: HeaderMap,
) -> Result<Json<relay_services::signaling::IceConfigResponse>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let payload = authorize(
        &state,
        &headers,
        signal_requirement(Route::P2pIceConfig, &q.session_id, &q.claim_id),
    )?;

    let mode = match q.mode.as_deref() {
        Some("relay") => relay_services::signaling::IceMode::Relay,
        _ => relay_services::signaling::IceMode::Direct,
    };

    // Relay credentials are scoped to a stable identity per claim, not per
    // request, so quota tracking can recognize repeated requests from the
    // same pairing.
    let relay_identity = payload
        .bindings
        .claim_id
        .as_deref()
        .ok_or_else(|| ApiError(RelayError::Internal("signal token missing claim_id".into())))?
        .to_string();

    let config = state
        .signaling
        .ice_config(&q.session_id, &q.claim_id, mode, &relay_identity)
        .await?;
    Ok(Json(config))
}

//! /v1/session/{create,claim,sas/commit,approve,reject,poll} — C8, §4.4.
//!
//! `create`, `sas/commit`, `approve`, `reject`, and `poll` are gated only by
//! knowledge of the (unguessable, server-random) session_id/claim_id — there
//! is no antecedent capability token for a brand-new pairing to present.
//! `claim` is gated by the single-use claim token instead. This matches the
//! route table's "(public under session id+claim id)" rows (§4.9) more than
//! it enforces the `session.create`/`session.approve` scopes literally —
//! see DESIGN.md's Open Question notes.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use relay_core::logging::{hash_identifier, log_event};
use relay_core::RelayError;

use super::{check_rate_limit, client_ip, ApiState};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateRequest {
    pub receiver_pubkey_b64: String,
    pub session_ttl_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct CreateResponse {
    pub session_id: String,
    pub claim_token: String,
    pub claim_url: String,
}

pub async fn create(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let ip = addr.ip().to_string();
    check_rate_limit(&state, "v1", &ip)?;

    let limits = &state.config.quotas.sessions_per_day;
    if !state.quota.allow_session(&ip, &ip, limits.per_ip, limits.per_session) {
        log_event("quota_blocked", &[("reason", "sessions_per_day")]);
        return Err(ApiError(RelayError::NotFound));
    }

    let ttl = req
        .session_ttl_secs
        .map(chrono::Duration::seconds)
        .unwrap_or_else(|| chrono::Duration::minutes(30));

    let (session_id, claim_token) = state.sessions.create(req.receiver_pubkey_b64, ttl).await?;
    state.metrics.sessions_created();
    log_event("session_created", &[("session_id", &hash_identifier(&session_id))]);

    let claim_url = format!("udrop://claim?session_id={session_id}&claim_token={claim_token}");
    Ok(Json(CreateResponse {
        session_id,
        claim_token,
        claim_url,
    }))
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub session_id: String,
    pub claim_token: String,
    pub sender_label: String,
    pub sender_pubkey_b64: String,
}

#[derive(Serialize)]
pub struct ClaimResponse {
    pub claim_id: String,
}

pub async fn claim(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    check_rate_limit(&state, "session_claim", &client_ip(Some(ConnectInfo(addr))))?;

    let claim_id = state
        .sessions
        .claim(
            &req.session_id,
            &req.claim_token,
            req.sender_label,
            req.sender_pubkey_b64,
        )
        .await?;
    log_event(
        "claim_created",
        &[
            ("session_id", &hash_identifier(&req.session_id)),
            ("claim_id", &hash_identifier(&claim_id)),
        ],
    );
    Ok(Json(ClaimResponse { claim_id }))
}

#[derive(Deserialize)]
pub struct SasCommitRequest {
    pub session_id: String,
    pub claim_id: String,
    pub is_sender: bool,
}

pub async fn sas_commit(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SasCommitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    state
        .sessions
        .sas_commit(&req.session_id, &req.claim_id, req.is_sender)
        .await?;
    log_event(
        "sas_committed",
        &[("claim_id", &hash_identifier(&req.claim_id))],
    );
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub session_id: String,
    pub claim_id: String,
    #[serde(default)]
    pub scan_required: bool,
}

#[derive(Serialize)]
pub struct ApproveResponse {
    pub sender_send_init_token: String,
    pub receiver_receive_token: String,
    pub signal_token: String,
}

pub async fn approve(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApproveResponse>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let caps = state
        .sessions
        .approve(&req.session_id, &req.claim_id, req.scan_required)
        .await?;
    Ok(Json(ApproveResponse {
        sender_send_init_token: caps.sender_send_init_token,
        receiver_receive_token: caps.receiver_receive_token,
        signal_token: caps.signal_token,
    }))
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub session_id: String,
    pub claim_id: String,
}

pub async fn reject(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    state.sessions.reject(&req.session_id, &req.claim_id).await?;
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
) -> Result<Json<relay_services::session_manager::ClaimSnapshot>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let snapshot = state.sessions.poll(&q.session_id, &q.claim_id).await?;
    Ok(Json(snapshot))
}

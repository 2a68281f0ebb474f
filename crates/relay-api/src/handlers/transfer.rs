//! /v1/transfer/{init,chunk,finalize,manifest,download_token,download,receipt,
//! scan_init,scan_chunk,scan_finalize} — C9/C10, §4.5, §4.6.
//!
//! Every route here is gated by a capability token except `download`, which
//! is gated by the single-use download token instead (§4.9 route table). For
//! routes whose binding (manifest_hash, transfer_id) isn't yet known to the
//! caller at request-build time, the handler peeks the resource read-only
//! first — matching `TransferEngine::get_meta`'s documented purpose — before
//! constructing the `Requirement` the presented token must satisfy.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use relay_core::capability::{Bindings, Requirement, Route, Scope};
use relay_core::crypto::b64url_decode;
use relay_core::RelayError;
use relay_services::transfer_engine::QuotaLimits;

use super::{authorize, check_rate_limit, header_str, header_u64, ApiState};
use crate::error::ApiError;

fn requirement(scope: Scope, route: Route, bindings: Bindings) -> Requirement {
    Requirement {
        scope: Some(scope),
        route: Some(route),
        bindings,
        single_use: false,
    }
}

// ── init ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InitRequest {
    pub session_id: String,
    pub claim_id: String,
    pub manifest_ciphertext_b64: String,
    pub total_bytes: u64,
}

#[derive(Serialize)]
pub struct InitResponse {
    pub transfer_id: String,
    pub upload_token: String,
}

pub async fn init(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    let ip = addr.ip().to_string();
    check_rate_limit(&state, "v1", &ip)?;

    let mut req_requirement = requirement(
        Scope::XferSendInit,
        Route::TransferInit,
        Bindings {
            session_id: Some(req.session_id.clone()),
            claim_id: Some(req.claim_id.clone()),
            ..Default::default()
        },
    );
    req_requirement.single_use = true;
    authorize(&state, &headers, req_requirement)?;

    let manifest_ciphertext = b64url_decode(&req.manifest_ciphertext_b64)
        .map_err(|_| ApiError(RelayError::InvalidRequest("bad manifest_ciphertext_b64".into())))?;

    let q = &state.config.quotas;
    let limits = QuotaLimits {
        transfers_day_ip: q.transfers_per_day.per_ip,
        transfers_day_session: q.transfers_per_day.per_session,
        concurrent_ip: q.concurrent_transfers.per_ip,
        concurrent_session: q.concurrent_transfers.per_session,
        bytes_day_ip: q.bytes_per_day.per_ip,
        bytes_day_session: q.bytes_per_day.per_session,
    };

    let result = state
        .transfers
        .init(
            &req.session_id,
            &req.claim_id,
            &ip,
            &manifest_ciphertext,
            req.total_bytes,
            limits,
        )
        .await?;

    Ok(Json(InitResponse {
        transfer_id: result.transfer_id,
        upload_token: result.upload_token,
    }))
}

// ── chunk ─────────────────────────────────────────────────────────────────────

pub async fn chunk(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let ip = addr.ip().to_string();
    check_rate_limit(&state, "v1", &ip)?;

    let session_id = header_str(&headers, "session_id")?.to_string();
    let transfer_id = header_str(&headers, "transfer_id")?.to_string();
    let offset = header_u64(&headers, "offset")?;

    let meta = state.transfers.get_meta(&transfer_id).await?;

    let payload = authorize(
        &state,
        &headers,
        requirement(
            Scope::XferSend,
            Route::TransferChunk,
            Bindings {
                transfer_id: Some(transfer_id.clone()),
                manifest_hash: Some(meta.manifest_hash.clone()),
                ..Default::default()
            },
        ),
    )?;

    // §4.5: the send token's max_bytes was minted equal to total_bytes at
    // init() time, and this write must fit within it — this re-checks the
    // token's own stated bound, on top of (not instead of) the engine's
    // check against the transfer's actual total_bytes.
    let max_bytes = payload
        .max_bytes
        .filter(|&m| m == meta.total_bytes)
        .ok_or(RelayError::NotFound)?;
    if offset.saturating_add(body.len() as u64) > max_bytes {
        return Err(ApiError(RelayError::NotFound));
    }

    let q = &state.config.quotas.bytes_per_day;
    state
        .transfers
        .chunk(
            &transfer_id,
            &ip,
            &session_id,
            offset,
            &body,
            q.per_ip,
            q.per_session,
        )
        .await?;

    Ok(StatusCode::OK)
}

// ── finalize ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FinalizeRequest {
    pub transfer_id: String,
}

pub async fn finalize(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    authorize(
        &state,
        &headers,
        requirement(
            Scope::XferSend,
            Route::TransferFinalize,
            Bindings {
                transfer_id: Some(req.transfer_id.clone()),
                ..Default::default()
            },
        ),
    )?;

    state.transfers.finalize(&req.transfer_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── manifest ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ManifestQuery {
    pub transfer_id: String,
}

pub async fn manifest(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<ManifestQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let meta = state.transfers.get_meta(&q.transfer_id).await?;

    authorize(
        &state,
        &headers,
        requirement(
            Scope::XferReceive,
            Route::TransferManifest,
            Bindings {
                transfer_id: Some(q.transfer_id.clone()),
                manifest_hash: Some(meta.manifest_hash.clone()),
                ..Default::default()
            },
        ),
    )?;

    let bytes = state.transfers.manifest(&q.transfer_id).await?;
    Ok((
        StatusCode::OK,
        [("content-type", "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// ── download_token ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DownloadTokenRequest {
    pub transfer_id: String,
}

#[derive(Serialize)]
pub struct DownloadTokenResponse {
    pub download_token: String,
}

pub async fn download_token(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<DownloadTokenRequest>,
) -> Result<Json<DownloadTokenResponse>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let meta = state.transfers.get_meta(&req.transfer_id).await?;

    let payload = authorize(
        &state,
        &headers,
        requirement(
            Scope::XferReceive,
            Route::TransferDownloadToken,
            Bindings {
                transfer_id: Some(req.transfer_id.clone()),
                manifest_hash: Some(meta.manifest_hash.clone()),
                ..Default::default()
            },
        ),
    )?;

    let session_id = payload
        .bindings
        .session_id
        .ok_or_else(|| ApiError(RelayError::Internal("xfer.receive token missing session_id".into())))?;
    let claim_id = payload
        .bindings
        .claim_id
        .ok_or_else(|| ApiError(RelayError::Internal("xfer.receive token missing claim_id".into())))?;

    let token = state
        .transfers
        .mint_download_token(&session_id, &claim_id, &req.transfer_id)
        .await?;

    Ok(Json(DownloadTokenResponse { download_token: token }))
}

// ── download ──────────────────────────────────────────────────────────────────

/// Parses a single fully-specified `Range: bytes=S-E` header. Open-ended
/// ranges are rejected as structurally invalid (§6: "Range must be
/// well-formed").
fn parse_range(value: &str) -> Result<(u64, u64), ApiError> {
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| ApiError(RelayError::InvalidRequest("malformed Range header".into())))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| ApiError(RelayError::InvalidRequest("malformed Range header".into())))?;
    let start: u64 = start
        .parse()
        .map_err(|_| ApiError(RelayError::InvalidRequest("malformed Range header".into())))?;
    let end: u64 = end
        .parse()
        .map_err(|_| ApiError(RelayError::InvalidRequest("malformed Range header".into())))?;
    Ok((start, end))
}

pub async fn download(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let session_id = header_str(&headers, "session_id")?.to_string();
    let claim_id = header_str(&headers, "claim_id")?.to_string();
    let transfer_id = header_str(&headers, "transfer_id")?.to_string();
    let download_tok = header_str(&headers, "download_token")?.to_string();
    let range = header_str(&headers, "range")?.to_string();

    let (start, end) = parse_range(&range)?;

    // Single-use: this call both validates and atomically consumes the
    // token, so a concurrent or replayed request with the same token fails
    // indistinguishably (I6).
    state
        .transfers
        .consume_download_token(&session_id, &claim_id, &transfer_id, &download_tok)
        .await?;

    let range_result = state.transfers.download_range(&transfer_id, start, end).await?;

    let content_range = format!("bytes {}-{}/{}", start, end, range_result.total_bytes);
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            ("content-type", "application/octet-stream".to_string()),
            ("content-range", content_range),
            ("content-length", range_result.bytes.len().to_string()),
        ],
        range_result.bytes,
    )
        .into_response())
}

// ── receipt ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReceiptRequest {
    pub transfer_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn receipt(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ReceiptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let meta = state.transfers.get_meta(&req.transfer_id).await?;

    authorize(
        &state,
        &headers,
        requirement(
            Scope::XferReceive,
            Route::TransferReceipt,
            Bindings {
                transfer_id: Some(req.transfer_id.clone()),
                manifest_hash: Some(meta.manifest_hash.clone()),
                ..Default::default()
            },
        ),
    )?;

    state.transfers.receipt(&req.transfer_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── scan_init / scan_chunk / scan_finalize ──────────────────────────────────────

#[derive(Deserialize)]
pub struct ScanInitRequest {
    pub transfer_id: String,
    pub total_bytes: u64,
    pub chunk_size: u64,
}

#[derive(Serialize)]
pub struct ScanInitResponse {
    pub scan_id: String,
    pub scan_key_b64: String,
}

pub async fn scan_init(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ScanInitRequest>,
) -> Result<Json<ScanInitResponse>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let payload = authorize(
        &state,
        &headers,
        requirement(
            Scope::XferSend,
            Route::TransferScanInit,
            Bindings {
                transfer_id: Some(req.transfer_id.clone()),
                ..Default::default()
            },
        ),
    )?;

    let session_id = payload
        .bindings
        .session_id
        .ok_or_else(|| ApiError(RelayError::Internal("xfer.send token missing session_id".into())))?;
    let claim_id = payload
        .bindings
        .claim_id
        .ok_or_else(|| ApiError(RelayError::Internal("xfer.send token missing claim_id".into())))?;

    let init = state
        .scans
        .scan_init(&session_id, &claim_id, &req.transfer_id, req.total_bytes, req.chunk_size)
        .await?;

    Ok(Json(ScanInitResponse {
        scan_id: init.scan_id,
        scan_key_b64: init.scan_key_b64,
    }))
}

pub async fn scan_chunk(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let scan_id = header_str(&headers, "scan_id")?.to_string();
    let chunk_index = header_u64(&headers, "chunk_index")?;

    let transfer_id = state.scans.peek_transfer_id(&scan_id).await?;

    authorize(
        &state,
        &headers,
        requirement(
            Scope::XferSend,
            Route::TransferScanChunk,
            Bindings {
                transfer_id: Some(transfer_id),
                ..Default::default()
            },
        ),
    )?;

    state.scans.scan_chunk(&scan_id, chunk_index, &body).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct ScanFinalizeRequest {
    pub scan_id: String,
}

#[derive(Serialize)]
pub struct ScanFinalizeResponse {
    pub verdict: String,
}

pub async fn scan_finalize(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ScanFinalizeRequest>,
) -> Result<Json<ScanFinalizeResponse>, ApiError> {
    check_rate_limit(&state, "v1", &addr.ip().to_string())?;

    let transfer_id = state.scans.peek_transfer_id(&req.scan_id).await?;

    authorize(
        &state,
        &headers,
        requirement(
            Scope::XferSend,
            Route::TransferScanFinalize,
            Bindings {
                transfer_id: Some(transfer_id),
                ..Default::default()
            },
        ),
    )?;

    let verdict = state.scans.scan_finalize(&req.scan_id).await?;
    let verdict = match verdict {
        relay_core::ScanVerdict::Clean => "clean",
        relay_core::ScanVerdict::Dirty => "failed",
        relay_core::ScanVerdict::Unavailable => "unavailable",
    };

    Ok(Json(ScanFinalizeResponse {
        verdict: verdict.to_string(),
    }))
}


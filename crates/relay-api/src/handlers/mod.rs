//! HTTP API handlers — translates JSON/header wire shapes into calls on the
//! services crate, and funnels every rejection through [`crate::error::ApiError`].

pub mod session;
pub mod signal;
pub mod transfer;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap};

use relay_core::capability::{CapabilityPayload, Requirement};
use relay_core::config::RelayConfig;
use relay_core::{Clock, RelayError};
use relay_services::{
    CapabilityService, Metrics, QuotaTracker, RateLimiter, ScanEngine, SessionManager,
    SignalingService, Sweeper, TransferEngine,
};

use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub transfers: Arc<TransferEngine>,
    pub scans: Arc<ScanEngine>,
    pub signaling: Arc<SignalingService>,
    pub capabilities: Arc<CapabilityService>,
    pub quota: Arc<QuotaTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<RelayConfig>,
    pub sweeper: Arc<Sweeper>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Extracts `Authorization: Bearer <token>` and validates it against
/// `requirement`. Every rejection reason — missing header, malformed header,
/// failed capability validation — collapses to the same `Unauthorized`, which
/// the responder renders identically to `NotFound` (§4.9).
pub fn authorize(
    state: &ApiState,
    headers: &HeaderMap,
    requirement: Requirement,
) -> Result<CapabilityPayload, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(RelayError::Unauthorized)?;

    state
        .capabilities
        .validate(token, &requirement)
        .ok_or_else(|| ApiError(RelayError::Unauthorized))
}

/// The caller's IP, used as a quota/rate-limit key. Falls back to a fixed
/// placeholder when no peer address is available (e.g. a unix socket).
pub fn client_ip(addr: Option<ConnectInfo<SocketAddr>>) -> String {
    addr.map(|ConnectInfo(a)| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Enforces the configured per-group fixed-window rate limit.
pub fn check_rate_limit(state: &ApiState, group: &str, key: &str) -> Result<(), ApiError> {
    let window = match group {
        "health" => &state.config.rate_limits.health,
        "session_claim" => &state.config.rate_limits.session_claim,
        _ => &state.config.rate_limits.v1,
    };
    if state.rate_limiter.allow(group, key, window.max, window.window_secs) {
        Ok(())
    } else {
        Err(ApiError(RelayError::RateLimited))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(RelayError::InvalidRequest(format!("missing header {name}"))))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<u64, ApiError> {
    header_str(headers, name)?
        .parse()
        .map_err(|_| ApiError(RelayError::InvalidRequest(format!("invalid header {name}"))))
}

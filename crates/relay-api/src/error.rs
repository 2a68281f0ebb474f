//! The one responder every handler's reject branch funnels through.
//!
//! `Unauthorized`, `NotFound`, and `QuotaExceeded` all render byte-identical
//! 404 bodies — this is the indistinguishable-error discipline (§4.9, §9):
//! an attacker probing wrong tokens, wrong bindings, and missing objects
//! must not be able to tell them apart from the response alone.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use relay_core::logging::log_event;
use relay_core::RelayError;

pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let RelayError::Internal(_) = &self.0 {
            log_event("internal_error", &[]);
        }

        let status = match &self.0 {
            RelayError::Unauthorized | RelayError::NotFound | RelayError::QuotaExceeded => {
                StatusCode::NOT_FOUND
            }
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::ChunkConflict => StatusCode::CONFLICT,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::TurnUnavailable => StatusCode::CONFLICT,
            RelayError::SasRequired => StatusCode::CONFLICT,
            RelayError::Internal(_) => StatusCode::NOT_FOUND,
        };

        (status, Json(json!({ "error": self.0.code() }))).into_response()
    }
}

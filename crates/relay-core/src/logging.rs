//! Logging allowlist — C7.
//!
//! Every log line in this codebase goes through `log_event`. It only emits
//! a fixed set of field names, and hashes anything identifier-shaped before
//! it ever reaches `tracing`, so no plaintext leaks into the logs beyond the
//! enumerated event names. Per §1 Non-goals: "plaintext log fields beyond
//! an allowlist of hashed identifiers and enumerated event names" is out of
//! bounds.

use crate::crypto::hash;

/// Field names this codebase is allowed to log. Anything else is a bug.
pub const ALLOWED_FIELDS: &[&str] = &[
    "session_id",
    "claim_id",
    "transfer_id",
    "scan_id",
    "peer_id",
    "ip_hash",
    "route",
    "scope",
    "reason",
    "bytes",
    "count",
];

/// Event names this codebase is allowed to log.
pub const ALLOWED_EVENTS: &[&str] = &[
    "session_created",
    "claim_created",
    "sas_committed",
    "session_approved",
    "transfer_initiated",
    "chunk_written",
    "chunk_conflict",
    "transfer_finalized",
    "manifest_served",
    "download_token_issued",
    "download_served",
    "receipt_processed",
    "scan_initiated",
    "scan_finalized",
    "quota_blocked",
    "rate_limited",
    "capability_revoked",
    "sweep_completed",
    "internal_error",
];

/// Hash an identifier-shaped value (session/claim/transfer/scan/peer ID, or
/// an IP address) to an 8-hex-char prefix — enough to correlate log lines
/// across a request without exposing the raw value.
pub fn hash_identifier(value: &str) -> String {
    hex::encode(&hash(value.as_bytes())[..4])
}

/// Emit a structured log line restricted to the allowlist above.
///
/// `fields` are (name, value) pairs; identifier-shaped fields should already
/// be hashed by the caller via `hash_identifier` before being passed in.
/// Panics in debug builds if an unlisted field name or event is passed —
/// this is a programming error, not a runtime condition.
pub fn log_event(event: &str, fields: &[(&str, &str)]) {
    debug_assert!(
        ALLOWED_EVENTS.contains(&event),
        "event '{event}' is not in the logging allowlist"
    );
    for (name, _) in fields {
        debug_assert!(
            ALLOWED_FIELDS.contains(name),
            "field '{name}' is not in the logging allowlist"
        );
    }

    match fields {
        [] => tracing::info!(event, "relay event"),
        _ => {
            let joined = fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(event, fields = %joined, "relay event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_identifier_is_deterministic_and_short() {
        let h1 = hash_identifier("session-abc123");
        let h2 = hash_identifier("session-abc123");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);
    }

    #[test]
    fn hash_identifier_differs_for_different_inputs() {
        assert_ne!(hash_identifier("a"), hash_identifier("b"));
    }

    #[test]
    fn log_event_accepts_allowlisted_event_and_fields() {
        log_event("quota_blocked", &[("session_id", "deadbeef"), ("reason", "transfers_per_day")]);
    }
}

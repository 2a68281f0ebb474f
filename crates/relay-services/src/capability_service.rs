//! Capability service — C3, §4.1.
//!
//! Tokens are `base64url(payload_json) + "." + base64url(HMAC-SHA256(payload_json))`.
//! The JTI ledger and revocation sets are DashMaps pruned lazily against the
//! clock, matching the teacher's `TrustRegistry` shape: a concurrent map of
//! rules, checked and pruned on access rather than by a dedicated task.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use relay_core::capability::{Bindings, CapabilityPayload, Requirement, Scope, TOKEN_VERSION};
use relay_core::crypto::{b64url_decode, b64url_encode, random_token, SigningKey};
use relay_core::Clock;

#[derive(Debug, Clone)]
pub struct IssueSpec {
    pub scope: Scope,
    pub ttl: chrono::Duration,
    pub bindings: Bindings,
    pub max_bytes: Option<u64>,
    pub max_rate_bps: Option<u64>,
    pub allowed_routes: Vec<relay_core::capability::Route>,
    pub single_use: bool,
}

pub struct CapabilityService {
    signing_key: SigningKey,
    clock: Arc<dyn Clock>,
    /// jti -> exp
    jti_ledger: DashMap<String, chrono::DateTime<chrono::Utc>>,
    /// transfer_id -> exp (entries pruned once past expiry; revocation is
    /// permanent in practice since transfers are short-lived, but we still
    /// bound memory by pruning stale entries)
    revoked_transfers: DashMap<String, chrono::DateTime<chrono::Utc>>,
    revoked_devices: DashMap<String, chrono::DateTime<chrono::Utc>>,
    global_revoked: std::sync::atomic::AtomicBool,
}

/// How long a revocation entry is retained before pruning. Revocations
/// outlive any token that could reference them, so this just bounds the
/// size of the revocation maps rather than affecting correctness.
const REVOCATION_RETENTION: chrono::Duration = chrono::Duration::hours(24);

impl CapabilityService {
    pub fn new(signing_key: SigningKey, clock: Arc<dyn Clock>) -> Self {
        Self {
            signing_key,
            clock,
            jti_ledger: DashMap::new(),
            revoked_transfers: DashMap::new(),
            revoked_devices: DashMap::new(),
            global_revoked: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Load the signing secret from `path`, generating and persisting one
    /// (mode 0o600) on first use.
    pub fn load_or_generate_secret(path: &PathBuf) -> std::io::Result<SigningKey> {
        if path.exists() {
            let bytes = fs::read(path)?;
            return Ok(SigningKey::new(bytes));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut secret = vec![0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
        fs::write(path, &secret)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(SigningKey::new(secret))
    }

    pub fn issue(&self, spec: IssueSpec) -> String {
        let now = self.clock.now();
        let payload = CapabilityPayload {
            version: TOKEN_VERSION,
            scope: spec.scope,
            iat: now,
            exp: now + spec.ttl,
            jti: random_token(16),
            bindings: spec.bindings,
            visibility: "e2e".to_string(),
            max_bytes: spec.max_bytes,
            max_rate_bps: spec.max_rate_bps,
            allowed_routes: spec.allowed_routes,
            single_use: spec.single_use,
        };
        self.encode(&payload)
    }

    fn encode(&self, payload: &CapabilityPayload) -> String {
        let payload_json = serde_json::to_vec(payload).expect("payload always serializes");
        let sig = self.signing_key.sign(&payload_json);
        format!("{}.{}", b64url_encode(&payload_json), b64url_encode(&sig))
    }

    /// Validate a token against a requirement (I4). Returns the decoded
    /// payload on success. Every rejection reason collapses to `None` —
    /// callers must not branch on *why* validation failed in any way that
    /// could leak through a response.
    pub fn validate(&self, token: &str, requirement: &Requirement) -> Option<CapabilityPayload> {
        let (payload_b64, sig_b64) = token.split_once('.')?;
        let payload_json = b64url_decode(payload_b64).ok()?;
        let sig = b64url_decode(sig_b64).ok()?;

        if !self.signing_key.verify(&payload_json, &sig) {
            return None;
        }

        let payload: CapabilityPayload = serde_json::from_slice(&payload_json).ok()?;

        if payload.version != TOKEN_VERSION {
            return None;
        }

        let now = self.clock.now();
        if payload.exp <= now {
            return None;
        }

        if let Some(want_scope) = requirement.scope {
            if payload.scope != want_scope {
                return None;
            }
        }

        if let Some(route) = requirement.route {
            if !payload.allowed_routes.contains(&route) {
                return None;
            }
        }

        if !payload.bindings.satisfies(&requirement.bindings) {
            return None;
        }

        if self.global_revoked.load(std::sync::atomic::Ordering::Relaxed) {
            return None;
        }

        if let Some(transfer_id) = &payload.bindings.transfer_id {
            if self.revoked_transfers.contains_key(transfer_id) {
                return None;
            }
        }

        if let Some(peer_id) = &payload.bindings.peer_id {
            if self.revoked_devices.contains_key(peer_id) {
                return None;
            }
        }

        if requirement.single_use {
            if !payload.single_use {
                return None;
            }
            // Atomic check-then-insert: entry() gives us a single lock
            // acquisition across both the presence check and the insert.
            let mut rejected = false;
            self.jti_ledger
                .entry(payload.jti.clone())
                .and_modify(|_| rejected = true)
                .or_insert(payload.exp);
            if rejected {
                return None;
            }
        }

        self.prune(now);
        Some(payload)
    }

    pub fn revoke_transfer(&self, transfer_id: &str) {
        let exp = self.clock.now() + REVOCATION_RETENTION;
        self.revoked_transfers.insert(transfer_id.to_string(), exp);
    }

    pub fn revoke_device(&self, peer_id: &str) {
        let exp = self.clock.now() + REVOCATION_RETENTION;
        self.revoked_devices.insert(peer_id.to_string(), exp);
    }

    pub fn revoke_jti(&self, jti: &str) {
        let exp = self.clock.now() + REVOCATION_RETENTION;
        self.jti_ledger.insert(jti.to_string(), exp);
    }

    pub fn revoke_global(&self) {
        self.global_revoked.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Drop ledger/revocation entries whose retention window has passed.
    fn prune(&self, now: chrono::DateTime<chrono::Utc>) {
        self.jti_ledger.retain(|_, exp| *exp > now);
        self.revoked_transfers.retain(|_, exp| *exp > now);
        self.revoked_devices.retain(|_, exp| *exp > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::capability::Route;
    use relay_core::FakeClock;

    fn service() -> (CapabilityService, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let key = SigningKey::new(b"test secret at least 32 bytes!!".to_vec());
        (CapabilityService::new(key, clock.clone()), clock)
    }

    fn spec(scope: Scope, single_use: bool) -> IssueSpec {
        IssueSpec {
            scope,
            ttl: chrono::Duration::minutes(5),
            bindings: Bindings {
                session_id: Some("s1".into()),
                transfer_id: Some("t1".into()),
                ..Default::default()
            },
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![Route::TransferChunk],
            single_use,
        }
    }

    #[test]
    fn issued_token_validates_with_matching_requirement() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));

        let req = Requirement {
            scope: Some(Scope::XferSend),
            route: Some(Route::TransferChunk),
            bindings: Bindings {
                session_id: Some("s1".into()),
                transfer_id: Some("t1".into()),
                ..Default::default()
            },
            single_use: false,
        };

        assert!(svc.validate(&token, &req).is_some());
    }

    #[test]
    fn mismatched_binding_fails_validation() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));

        let req = Requirement {
            scope: Some(Scope::XferSend),
            bindings: Bindings {
                transfer_id: Some("wrong".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(svc.validate(&token, &req).is_none());
    }

    #[test]
    fn mismatched_scope_fails_validation() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));

        let req = Requirement {
            scope: Some(Scope::XferReceive),
            ..Default::default()
        };
        assert!(svc.validate(&token, &req).is_none());
    }

    #[test]
    fn route_not_in_allowed_routes_fails() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));

        let req = Requirement {
            route: Some(Route::TransferFinalize),
            ..Default::default()
        };
        assert!(svc.validate(&token, &req).is_none());
    }

    #[test]
    fn expired_token_fails_validation() {
        let (svc, clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));
        clock.advance(std::time::Duration::from_secs(600));
        assert!(svc.validate(&token, &Requirement::default()).is_none());
    }

    #[test]
    fn single_use_token_cannot_be_replayed() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSendInit, true));

        let req = Requirement {
            single_use: true,
            ..Default::default()
        };

        assert!(svc.validate(&token, &req).is_some());
        assert!(svc.validate(&token, &req).is_none());
    }

    #[test]
    fn non_single_use_requirement_does_not_consume_jti() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));

        // Validated twice with single_use *not* required — should succeed both times.
        assert!(svc.validate(&token, &Requirement::default()).is_some());
        assert!(svc.validate(&token, &Requirement::default()).is_some());
    }

    #[test]
    fn revoked_transfer_fails_validation() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));
        svc.revoke_transfer("t1");
        assert!(svc.validate(&token, &Requirement::default()).is_none());
    }

    #[test]
    fn global_revocation_blocks_everything() {
        let (svc, _clock) = service();
        let token = svc.issue(spec(Scope::XferSend, false));
        svc.revoke_global();
        assert!(svc.validate(&token, &Requirement::default()).is_none());
    }

    #[test]
    fn tampered_token_fails_validation() {
        let (svc, _clock) = service();
        let mut token = svc.issue(spec(Scope::XferSend, false));
        token.push('x');
        assert!(svc.validate(&token, &Requirement::default()).is_none());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (svc, _clock) = service();
        let now = chrono::Utc::now();
        let payload = CapabilityPayload {
            version: TOKEN_VERSION + 1,
            scope: Scope::XferSend,
            iat: now,
            exp: now + chrono::Duration::minutes(5),
            jti: "j1".into(),
            bindings: Bindings::default(),
            visibility: "e2e".into(),
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![],
            single_use: false,
        };
        let token = svc.encode(&payload);
        assert!(svc.validate(&token, &Requirement::default()).is_none());
    }
}

//! Session manager — C8, §4.4.
//!
//! The claim state machine: pending → (claim, sas_commit)* → approved |
//! rejected. Claim tokens are single-use, compared in constant time.

use std::sync::Arc;

use relay_core::capability::{Bindings, Route, Scope};
use relay_core::crypto::{constant_time_eq, hash, random_token};
use relay_core::model::{Claim, ClaimStatus, Session, SessionAuthContext};
use relay_core::{Clock, RelayError};

use crate::capability_service::{CapabilityService, IssueSpec};
use crate::store::Store;

pub struct SessionManager {
    store: Arc<dyn Store>,
    capabilities: Arc<CapabilityService>,
    clock: Arc<dyn Clock>,
    claim_ttl: chrono::Duration,
}

/// Capabilities minted for the sender and receiver on approval (§4.4).
pub struct ApprovalCapabilities {
    pub sender_send_init_token: String,
    pub receiver_receive_token: String,
    /// Shared `xfer.signal` capability — either party can present it.
    pub signal_token: String,
}

/// What `session.poll` exposes to either party.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimSnapshot {
    pub status: ClaimStatus,
    pub sas_sender_confirmed: bool,
    pub sas_receiver_confirmed: bool,
    pub scan_status: relay_core::model::ScanStatus,
    pub transfer_id: Option<String>,
    pub receive_token: Option<String>,
    pub send_init_token: Option<String>,
    pub signal_token: Option<String>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn Store>,
        capabilities: Arc<CapabilityService>,
        clock: Arc<dyn Clock>,
        claim_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            capabilities,
            clock,
            claim_ttl,
        }
    }

    /// session.create — issues a fresh session and a single-use claim token.
    /// Returns (session_id, claim_token).
    pub async fn create(
        &self,
        receiver_pubkey_b64: String,
        session_ttl: chrono::Duration,
    ) -> Result<(String, String), RelayError> {
        let now = self.clock.now();
        let claim_token = random_token(24);
        let session = Session {
            session_id: random_token(18),
            created_at: now,
            expires_at: now + session_ttl,
            claim_token_hash: hash(claim_token.as_bytes()),
            claim_token_expires_at: now + self.claim_ttl,
            claim_token_used: false,
            receiver_pubkey_b64,
            claims: Vec::new(),
        };
        let session_id = session.session_id.clone();

        self.store
            .create_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok((session_id, claim_token))
    }

    /// session.claim — single-use claim token; creates a pending Claim.
    /// Indistinguishable from "session not found" on any rejection per I4
    /// and the design notes' Open Question #2.
    pub async fn claim(
        &self,
        session_id: &str,
        claim_token: &str,
        sender_label: String,
        sender_pubkey_b64: String,
    ) -> Result<String, RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let now = self.clock.now();
        if session.expires_at < now {
            return Err(RelayError::NotFound);
        }
        if session.claim_token_used {
            return Err(RelayError::NotFound);
        }
        if session.claim_token_expires_at < now {
            return Err(RelayError::NotFound);
        }
        if !constant_time_eq(&session.claim_token_hash, &hash(claim_token.as_bytes())) {
            return Err(RelayError::NotFound);
        }

        let claim_id = random_token(12);
        let mut claim = Claim::new(claim_id.clone(), false);
        claim.sender_label = Some(sender_label);
        claim.sender_pubkey_b64 = Some(sender_pubkey_b64);

        session.claims.push(claim);
        session.claim_token_used = true;

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(claim_id)
    }

    /// session.sas/commit
    pub async fn sas_commit(
        &self,
        session_id: &str,
        claim_id: &str,
        is_sender: bool,
    ) -> Result<(), RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session
            .find_claim_mut(claim_id)
            .ok_or(RelayError::NotFound)?;

        if claim.status != ClaimStatus::Pending {
            return Err(RelayError::NotFound);
        }

        if is_sender {
            claim.sas_sender_confirmed = true;
        } else {
            claim.sas_receiver_confirmed = true;
        }

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(())
    }

    /// session.approve — I3: requires both SAS confirmations. Mints the
    /// sender's `xfer.send_init` and the receiver's `xfer.receive` tokens.
    pub async fn approve(
        &self,
        session_id: &str,
        claim_id: &str,
        scan_required: bool,
    ) -> Result<ApprovalCapabilities, RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session
            .find_claim(claim_id)
            .ok_or(RelayError::NotFound)?
            .clone();

        if claim.status != ClaimStatus::Pending {
            return Err(RelayError::NotFound);
        }

        if !claim.sas_ready() {
            return Err(RelayError::SasRequired);
        }

        let sender_pubkey = claim
            .sender_pubkey_b64
            .clone()
            .ok_or_else(|| RelayError::Internal("approved claim missing sender pubkey".into()))?;
        let receiver_pubkey = session.receiver_pubkey_b64.clone();

        let now = self.clock.now();
        let ctx = SessionAuthContext {
            session_id: session_id.to_string(),
            claim_id: claim_id.to_string(),
            sender_pubkey_b64: sender_pubkey.clone(),
            receiver_pubkey_b64: receiver_pubkey.clone(),
            approved_at: now,
        };
        self.store
            .save_session_auth_context(ctx)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        let mut claim_bindings = Bindings {
            session_id: Some(session_id.to_string()),
            claim_id: Some(claim_id.to_string()),
            sender_pubkey_b64: Some(sender_pubkey),
            receiver_pubkey_b64: Some(receiver_pubkey),
            ..Default::default()
        };

        let send_init_token = self.capabilities.issue(IssueSpec {
            scope: Scope::XferSendInit,
            ttl: self.claim_ttl,
            bindings: claim_bindings.clone(),
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![Route::TransferInit],
            single_use: true,
        });

        // The receive-side token is bound to the same identity set; it is
        // rebound with manifest_hash once the transfer is init'd (§4.5).
        claim_bindings.manifest_hash = None;
        let receive_token = self.capabilities.issue(IssueSpec {
            scope: Scope::XferReceive,
            ttl: chrono::Duration::hours(1),
            bindings: claim_bindings.clone(),
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![
                Route::TransferManifest,
                Route::TransferDownloadToken,
                Route::TransferReceipt,
            ],
            single_use: false,
        });

        // Signaling is symmetric: one shared capability, bound only to
        // (session_id, claim_id), usable by whichever party presents it.
        let signal_bindings = Bindings {
            session_id: Some(session_id.to_string()),
            claim_id: Some(claim_id.to_string()),
            ..Default::default()
        };
        let signal_token = self.capabilities.issue(IssueSpec {
            scope: Scope::XferSignal,
            ttl: chrono::Duration::hours(1),
            bindings: signal_bindings,
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![
                Route::P2pOffer,
                Route::P2pAnswer,
                Route::P2pIce,
                Route::P2pPoll,
                Route::P2pIceConfig,
            ],
            single_use: false,
        });

        let claim_mut = session.find_claim_mut(claim_id).expect("checked above");
        claim_mut.status = ClaimStatus::Approved;
        claim_mut.scan_required = scan_required;
        claim_mut.scan_status = if scan_required {
            relay_core::model::ScanStatus::Pending
        } else {
            relay_core::model::ScanStatus::NotRequired
        };
        claim_mut.receive_token = Some(receive_token.clone());
        claim_mut.send_init_token = Some(send_init_token.clone());
        claim_mut.signal_token = Some(signal_token.clone());

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(ApprovalCapabilities {
            sender_send_init_token: send_init_token,
            receiver_receive_token: receive_token,
            signal_token,
        })
    }

    /// session.poll — lets either party observe the claim's current state
    /// without a capability token (gated instead by knowing session_id and
    /// claim_id, which are themselves unguessable random tokens).
    pub async fn poll(&self, session_id: &str, claim_id: &str) -> Result<ClaimSnapshot, RelayError> {
        let session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session.find_claim(claim_id).ok_or(RelayError::NotFound)?;

        Ok(ClaimSnapshot {
            status: claim.status,
            sas_sender_confirmed: claim.sas_sender_confirmed,
            sas_receiver_confirmed: claim.sas_receiver_confirmed,
            scan_status: claim.scan_status,
            transfer_id: claim.transfer_id.clone(),
            receive_token: claim.receive_token.clone(),
            send_init_token: claim.send_init_token.clone(),
            signal_token: claim.signal_token.clone(),
        })
    }

    pub async fn reject(&self, session_id: &str, claim_id: &str) -> Result<(), RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session
            .find_claim_mut(claim_id)
            .ok_or(RelayError::NotFound)?;

        if claim.status != ClaimStatus::Pending {
            return Err(RelayError::NotFound);
        }
        claim.status = ClaimStatus::Rejected;

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemStore;
    use relay_core::crypto::SigningKey;
    use relay_core::FakeClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn manager() -> SessionManager {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("udrop-session-mgr-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(FilesystemStore::new(&dir).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        let caps = Arc::new(CapabilityService::new(
            SigningKey::new(b"test secret at least 32 bytes!!".to_vec()),
            clock.clone(),
        ));
        SessionManager::new(store, caps, clock, chrono::Duration::minutes(3))
    }

    #[tokio::test]
    async fn happy_path_approval_requires_both_sas() {
        let mgr = manager();
        let (session_id, claim_token) = mgr.create("recv_pub".into(), chrono::Duration::minutes(5)).await.unwrap();
        let claim_id = mgr.claim(&session_id, &claim_token, "alice".into(), "send_pub".into()).await.unwrap();

        let result = mgr.approve(&session_id, &claim_id, false).await;
        assert!(matches!(result, Err(RelayError::SasRequired)));

        mgr.sas_commit(&session_id, &claim_id, true).await.unwrap();
        let result = mgr.approve(&session_id, &claim_id, false).await;
        assert!(matches!(result, Err(RelayError::SasRequired)));

        mgr.sas_commit(&session_id, &claim_id, false).await.unwrap();
        let result = mgr.approve(&session_id, &claim_id, false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn claim_token_is_single_use() {
        let mgr = manager();
        let (session_id, claim_token) = mgr.create("recv_pub".into(), chrono::Duration::minutes(5)).await.unwrap();
        mgr.claim(&session_id, &claim_token, "alice".into(), "send_pub".into()).await.unwrap();

        let result = mgr.claim(&session_id, &claim_token, "bob".into(), "send_pub2".into()).await;
        assert!(matches!(result, Err(RelayError::NotFound)));
    }

    #[tokio::test]
    async fn wrong_claim_token_is_indistinguishable_from_reuse() {
        let mgr = manager();
        let (session_id, claim_token) = mgr.create("recv_pub".into(), chrono::Duration::minutes(5)).await.unwrap();
        mgr.claim(&session_id, &claim_token, "alice".into(), "send_pub".into()).await.unwrap();

        let reuse = mgr.claim(&session_id, &claim_token, "bob".into(), "x".into()).await;
        let wrong = mgr.claim(&session_id, "totally-wrong-token", "bob".into(), "x".into()).await;
        assert!(matches!(reuse, Err(RelayError::NotFound)));
        assert!(matches!(wrong, Err(RelayError::NotFound)));
    }
}

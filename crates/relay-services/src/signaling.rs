//! P2P signaling — C12, §4.7.
//!
//! An in-memory, per-claim queue of opaque offer/answer/ICE messages, plus
//! `ice_config` credential issuance. The server never interprets SDP or ICE
//! candidate content — it only forwards it and drains it atomically on poll.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use relay_core::crypto::b64_std_encode;
use relay_core::model::SignalMessage;
use relay_core::{Clock, RelayError};

use crate::quota::QuotaTracker;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceMode {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IceConfigResponse {
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    pub turn_ttl_secs: Option<i64>,
}

pub struct SignalingService {
    store: Arc<dyn Store>,
    quota: Arc<QuotaTracker>,
    clock: Arc<dyn Clock>,
    stun_urls: Vec<String>,
    turn_url: Option<String>,
    turn_shared_secret: Option<Vec<u8>>,
    turn_credential_ttl: chrono::Duration,
    relay_per_day: u64,
    relay_concurrent: u64,
}

impl SignalingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        quota: Arc<QuotaTracker>,
        clock: Arc<dyn Clock>,
        stun_urls: Vec<String>,
        turn_url: Option<String>,
        turn_shared_secret: Option<Vec<u8>>,
        turn_credential_ttl: chrono::Duration,
        relay_per_day: u64,
        relay_concurrent: u64,
    ) -> Self {
        Self {
            store,
            quota,
            clock,
            stun_urls,
            turn_url,
            turn_shared_secret,
            turn_credential_ttl,
            relay_per_day,
            relay_concurrent,
        }
    }

    pub async fn signal(
        &self,
        session_id: &str,
        claim_id: &str,
        message: SignalMessage,
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
        claim.signal_queue.push(message);

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Drains the claim's queue atomically: every message returned here is
    /// removed, never delivered twice.
    pub async fn poll(
        &self,
        session_id: &str,
        claim_id: &str,
    ) -> Result<Vec<SignalMessage>, RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session
            .find_claim_mut(claim_id)
            .ok_or(RelayError::NotFound)?;
        let drained = std::mem::take(&mut claim.signal_queue);

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(drained)
    }

    pub async fn ice_config(
        &self,
        session_id: &str,
        claim_id: &str,
        mode: IceMode,
        relay_identity: &str,
    ) -> Result<IceConfigResponse, RelayError> {
        match mode {
            IceMode::Direct => Ok(IceConfigResponse {
                stun_urls: self.stun_urls.clone(),
                ..Default::default()
            }),
            IceMode::Relay => {
                if !self.quota.allow_relay(
                    relay_identity,
                    self.relay_per_day,
                    self.relay_concurrent,
                    self.turn_credential_ttl,
                ) {
                    return Err(RelayError::NotFound);
                }

                let secret = self
                    .turn_shared_secret
                    .as_ref()
                    .ok_or(RelayError::TurnUnavailable)?;
                let turn_url = self
                    .turn_url
                    .clone()
                    .ok_or(RelayError::TurnUnavailable)?;

                let now = self.clock.now();
                let expiry = (now + self.turn_credential_ttl).timestamp();
                let username = format!("{session_id}:{claim_id}:{expiry}");

                let mut mac = Hmac::<Sha1>::new_from_slice(secret)
                    .expect("HMAC accepts any key length");
                mac.update(username.as_bytes());
                // Standard base64, not this relay's usual url-safe encoding —
                // a TURN server expects the RFC 5766 short-term-credential
                // alphabet (§4.7).
                let credential = b64_std_encode(&mac.finalize().into_bytes());

                Ok(IceConfigResponse {
                    stun_urls: Vec::new(),
                    turn_url: Some(turn_url),
                    turn_username: Some(username),
                    turn_credential: Some(credential),
                    turn_ttl_secs: Some(self.turn_credential_ttl.num_seconds()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemStore;
    use relay_core::model::{Claim, Session};
    use relay_core::FakeClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    async fn service_with_session(
        turn: Option<(&str, &str)>,
    ) -> (SignalingService, String, String) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("udrop-signal-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        let store: Arc<dyn Store> = Arc::new(FilesystemStore::new(&dir).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        let quota = Arc::new(QuotaTracker::new(clock.clone()));

        let session_id = "s1".to_string();
        let claim_id = "c1".to_string();
        store
            .create_session(Session {
                session_id: session_id.clone(),
                created_at: clock.now(),
                expires_at: clock.now() + chrono::Duration::minutes(30),
                claim_token_hash: [0u8; 32],
                claim_token_expires_at: clock.now() + chrono::Duration::minutes(30),
                claim_token_used: true,
                receiver_pubkey_b64: "recv_pub".into(),
                claims: vec![Claim::new(claim_id.clone(), false)],
            })
            .await
            .unwrap();

        let (turn_url, secret) = match turn {
            Some((url, secret)) => (Some(url.to_string()), Some(secret.as_bytes().to_vec())),
            None => (None, None),
        };

        let svc = SignalingService::new(
            store,
            quota,
            clock,
            vec!["stun:stun.example.org:3478".to_string()],
            turn_url,
            secret,
            chrono::Duration::minutes(10),
            0,
            0,
        );
        (svc, session_id, claim_id)
    }

    #[tokio::test]
    async fn poll_drains_queue_atomically() {
        let (svc, session_id, claim_id) = service_with_session(None).await;
        svc.signal(&session_id, &claim_id, SignalMessage::Offer { sdp: "o".into() })
            .await
            .unwrap();
        svc.signal(&session_id, &claim_id, SignalMessage::Ice { candidate: "c".into() })
            .await
            .unwrap();

        let drained = svc.poll(&session_id, &claim_id).await.unwrap();
        assert_eq!(drained.len(), 2);

        let second = svc.poll(&session_id, &claim_id).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn direct_mode_returns_stun_urls() {
        let (svc, session_id, claim_id) = service_with_session(None).await;
        let config = svc
            .ice_config(&session_id, &claim_id, IceMode::Direct, "peer1")
            .await
            .unwrap();
        assert_eq!(config.stun_urls.len(), 1);
    }

    #[tokio::test]
    async fn relay_mode_without_turn_configured_fails_distinguishably() {
        let (svc, session_id, claim_id) = service_with_session(None).await;
        let result = svc
            .ice_config(&session_id, &claim_id, IceMode::Relay, "peer1")
            .await;
        assert!(matches!(result, Err(RelayError::TurnUnavailable)));
    }

    #[tokio::test]
    async fn relay_mode_with_turn_configured_issues_credentials() {
        let (svc, session_id, claim_id) =
            service_with_session(Some(("turn:turn.example.org:3478", "shared-secret"))).await;
        let config = svc
            .ice_config(&session_id, &claim_id, IceMode::Relay, "peer1")
            .await
            .unwrap();
        assert!(config.turn_username.is_some());
        let credential = config.turn_credential.unwrap();
        // Standard base64 output never contains the url-safe alphabet's
        // substitute characters.
        assert!(!credential.contains('-') && !credential.contains('_'));
    }
}

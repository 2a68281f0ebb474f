//! Persisted data model — §3 of the spec.
//!
//! These types are pure data: no I/O, no locking. The store (C2) persists
//! them; the engines (C8–C12) are the only code that mutates them.

use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type ClaimId = String;
pub type TransferId = String;
pub type ScanId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    NotRequired,
    Pending,
    Clean,
    Failed,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Active,
    Complete,
}

/// One opaque P2P signaling message, queued per claim (C12).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Ice { candidate: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: ClaimId,
    pub sender_label: Option<String>,
    pub sender_pubkey_b64: Option<String>,
    pub sas_sender_confirmed: bool,
    pub sas_receiver_confirmed: bool,
    pub status: ClaimStatus,
    pub transfer_id: Option<TransferId>,
    pub scan_required: bool,
    pub scan_status: ScanStatus,
    /// The receiver's current `xfer.receive` capability, re-minted once a
    /// transfer exists so it can additionally bind `manifest_hash`. `None`
    /// until approval; fetched by `session.poll`.
    pub receive_token: Option<String>,
    /// The sender's single-use `xfer.send_init` capability, minted on
    /// approval. The sender has no other channel to receive it than polling
    /// the same session/claim it already knows from `session.claim`.
    pub send_init_token: Option<String>,
    /// Shared `xfer.signal` capability, bound to (session_id, claim_id) only
    /// — p2p signaling does not distinguish which party holds it.
    pub signal_token: Option<String>,
    /// Queue of opaque signaling messages, drained atomically by poll.
    pub signal_queue: Vec<SignalMessage>,
}

impl Claim {
    pub fn new(claim_id: ClaimId, scan_required: bool) -> Self {
        Self {
            claim_id,
            sender_label: None,
            sender_pubkey_b64: None,
            sas_sender_confirmed: false,
            sas_receiver_confirmed: false,
            status: ClaimStatus::Pending,
            transfer_id: None,
            scan_required,
            scan_status: if scan_required {
                ScanStatus::Pending
            } else {
                ScanStatus::NotRequired
            },
            receive_token: None,
            send_init_token: None,
            signal_token: None,
            signal_queue: Vec::new(),
        }
    }

    /// I3: approval is only reachable when both SAS confirmations are true.
    pub fn sas_ready(&self) -> bool {
        self.sas_sender_confirmed && self.sas_receiver_confirmed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub claim_token_hash: [u8; 32],
    pub claim_token_expires_at: chrono::DateTime<chrono::Utc>,
    pub claim_token_used: bool,
    pub receiver_pubkey_b64: String,
    pub claims: Vec<Claim>,
}

impl Session {
    pub fn find_claim(&self, claim_id: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_id == claim_id)
    }

    pub fn find_claim_mut(&mut self, claim_id: &str) -> Option<&mut Claim> {
        self.claims.iter_mut().find(|c| c.claim_id == claim_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAuthContext {
    pub session_id: SessionId,
    pub claim_id: ClaimId,
    pub sender_pubkey_b64: String,
    pub receiver_pubkey_b64: String,
    pub approved_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMeta {
    pub transfer_id: TransferId,
    pub session_id: SessionId,
    pub claim_id: ClaimId,
    pub status: TransferStatus,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub manifest_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub scan_id: ScanId,
    pub session_id: SessionId,
    pub claim_id: ClaimId,
    pub transfer_id: TransferId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub scan_key: [u8; 32],
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunks_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadToken {
    pub hash: [u8; 32],
    pub session_id: SessionId,
    pub claim_id: ClaimId,
    pub transfer_id: TransferId,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub used: bool,
}

/// Rolling 24h counter window — §4.2.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyCounter {
    pub window_start: chrono::DateTime<chrono::Utc>,
    pub count: u64,
    pub bytes: u64,
}

impl DailyCounter {
    pub fn fresh(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
            bytes: 0,
        }
    }

    /// Lazily rolls the window over if 24h have elapsed since window_start.
    pub fn roll_if_expired(&mut self, now: chrono::DateTime<chrono::Utc>) {
        if now - self.window_start >= chrono::Duration::hours(24) {
            self.window_start = now;
            self.count = 0;
            self.bytes = 0;
        }
    }
}

//! Capability token payload shape — §3 "Capability claims payload", §4.1.
//!
//! The token container models optional binding fields as present/absent
//! (`Option<T>`), never as empty-string sentinels, so "absent in the
//! requirement" is distinguishable from "empty in the token" per the design
//! notes (§9).

use serde::{Deserialize, Serialize};

pub const TOKEN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    SessionCreate,
    SessionClaim,
    SessionApprove,
    XferSendInit,
    XferSend,
    XferReceive,
    XferDownload,
    XferReceipt,
    XferResume,
    XferDownloadToken,
    XferSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    SessionCreate,
    SessionClaim,
    SessionSasCommit,
    SessionApprove,
    SessionPoll,
    P2pOffer,
    P2pAnswer,
    P2pIce,
    P2pPoll,
    P2pIceConfig,
    TransferInit,
    TransferChunk,
    TransferFinalize,
    TransferManifest,
    TransferDownloadToken,
    TransferDownload,
    TransferReceipt,
    TransferScanInit,
    TransferScanChunk,
    TransferScanFinalize,
}

/// Binding fields a capability token may carry, and a request may require.
/// Every field is `Option` — `None` means "not bound", not "bound to empty".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    pub session_id: Option<String>,
    pub claim_id: Option<String>,
    pub transfer_id: Option<String>,
    pub peer_id: Option<String>,
    pub sender_pubkey_b64: Option<String>,
    pub receiver_pubkey_b64: Option<String>,
    pub manifest_hash: Option<String>,
}

impl Bindings {
    /// True iff every `Some` field in `requirement` matches the same field
    /// in `self` exactly (I4). Fields the requirement leaves `None` are
    /// not checked — the token may bind more than the request cares about.
    pub fn satisfies(&self, requirement: &Bindings) -> bool {
        fn matches(token: &Option<String>, required: &Option<String>) -> bool {
            match required {
                None => true,
                Some(want) => token.as_deref() == Some(want.as_str()),
            }
        }

        matches(&self.session_id, &requirement.session_id)
            && matches(&self.claim_id, &requirement.claim_id)
            && matches(&self.transfer_id, &requirement.transfer_id)
            && matches(&self.peer_id, &requirement.peer_id)
            && matches(&self.sender_pubkey_b64, &requirement.sender_pubkey_b64)
            && matches(&self.receiver_pubkey_b64, &requirement.receiver_pubkey_b64)
            && matches(&self.manifest_hash, &requirement.manifest_hash)
    }
}

/// The signed payload — serialized to JSON, then HMAC'd (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityPayload {
    pub version: u32,
    pub scope: Scope,
    pub iat: chrono::DateTime<chrono::Utc>,
    pub exp: chrono::DateTime<chrono::Utc>,
    pub jti: String,
    #[serde(default)]
    pub bindings: Bindings,
    /// Always "e2e" — documents that the server never sees plaintext.
    pub visibility: String,
    pub max_bytes: Option<u64>,
    pub max_rate_bps: Option<u64>,
    pub allowed_routes: Vec<Route>,
    pub single_use: bool,
}

/// What a handler requires of a presented token, before it is authorized.
#[derive(Debug, Clone, Default)]
pub struct Requirement {
    pub scope: Option<Scope>,
    pub route: Option<Route>,
    pub bindings: Bindings,
    pub single_use: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_satisfies_when_requirement_is_subset() {
        let token = Bindings {
            session_id: Some("s1".into()),
            claim_id: Some("c1".into()),
            ..Default::default()
        };
        let req = Bindings {
            session_id: Some("s1".into()),
            ..Default::default()
        };
        assert!(token.satisfies(&req));
    }

    #[test]
    fn bindings_rejects_mismatch() {
        let token = Bindings {
            session_id: Some("s1".into()),
            ..Default::default()
        };
        let req = Bindings {
            session_id: Some("s2".into()),
            ..Default::default()
        };
        assert!(!token.satisfies(&req));
    }

    #[test]
    fn bindings_rejects_absent_in_token_present_in_requirement() {
        let token = Bindings::default();
        let req = Bindings {
            transfer_id: Some("t1".into()),
            ..Default::default()
        };
        assert!(!token.satisfies(&req));
    }
}

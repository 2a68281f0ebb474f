//! Storage interface — C2, §6 "Persisted state layout (abstract)".
//!
//! This is an abstract capability interface; `fs` provides a reference
//! filesystem-backed implementation. A production deployment could swap in
//! a different backend (object storage, a database) without touching any
//! engine code, as long as it honors the same atomicity and serialization
//! guarantees documented on each method.

pub mod fs;

use async_trait::async_trait;
use relay_core::model::{
    ClaimId, DownloadToken, ScanId, ScanSession, Session, SessionAuthContext, SessionId,
    TransferId, TransferMeta,
};

/// Counts of expired records purged by one sweep pass (C14).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SweepReport {
    pub sessions_deleted: u64,
    pub transfers_deleted: u64,
    pub scans_deleted: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The abstract storage interface the transfer plane is built against.
///
/// Implementations MUST provide atomic rename-or-equivalent for manifest
/// and meta writes (I8), and MUST serialize per-transfer chunk writes
/// (§5 ordering guarantees).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn create_session(&self, session: Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;
    async fn update_session(&self, session: Session) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;

    async fn save_session_auth_context(&self, ctx: SessionAuthContext) -> Result<(), StoreError>;
    async fn get_session_auth_context(
        &self,
        session_id: &SessionId,
        claim_id: &ClaimId,
    ) -> Result<Option<SessionAuthContext>, StoreError>;

    async fn save_manifest(&self, transfer_id: &TransferId, bytes: &[u8]) -> Result<(), StoreError>;
    async fn load_manifest(&self, transfer_id: &TransferId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save_transfer_meta(&self, meta: TransferMeta) -> Result<(), StoreError>;
    async fn get_transfer_meta(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMeta>, StoreError>;
    async fn delete_transfer_meta(&self, transfer_id: &TransferId) -> Result<(), StoreError>;

    /// Write `bytes` at `offset` in the transfer's chunk range. Implementations
    /// must serialize this per-transfer (§5); the transfer engine additionally
    /// wraps this in its own per-transfer critical section for the
    /// check-then-write idempotency semantics.
    async fn write_chunk(
        &self,
        transfer_id: &TransferId,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Read `length` bytes starting at `offset`. Returns fewer bytes if the
    /// range extends past what has been written.
    async fn read_range(
        &self,
        transfer_id: &TransferId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StoreError>;

    /// Delete {manifest, chunk range, transfer meta} atomically (I8).
    async fn delete_transfer(&self, transfer_id: &TransferId) -> Result<(), StoreError>;

    async fn save_scan_session(&self, scan: ScanSession) -> Result<(), StoreError>;
    async fn get_scan_session(&self, scan_id: &ScanId) -> Result<Option<ScanSession>, StoreError>;
    async fn update_scan_session(&self, scan: ScanSession) -> Result<(), StoreError>;
    async fn save_scan_chunk(
        &self,
        scan_id: &ScanId,
        chunk_index: u64,
        sealed: &[u8],
    ) -> Result<(), StoreError>;
    async fn load_scan_chunks(&self, scan_id: &ScanId) -> Result<Vec<Vec<u8>>, StoreError>;
    async fn delete_scan_session(&self, scan_id: &ScanId) -> Result<(), StoreError>;

    async fn save_download_token(&self, token: DownloadToken) -> Result<(), StoreError>;
    async fn get_download_token(
        &self,
        hash: &[u8; 32],
    ) -> Result<Option<DownloadToken>, StoreError>;
    /// Atomically mark a token used; returns false if already used (I6).
    async fn consume_download_token(&self, hash: &[u8; 32]) -> Result<bool, StoreError>;

    /// All sessions, transfers (not complete), and scan sessions whose
    /// expires_at is before `now`. Deletes them and their dependents in one
    /// logical pass (C14).
    async fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<SweepReport, StoreError>;
}

// Re-exported for convenience at the crate root.
pub use fs::FilesystemStore;

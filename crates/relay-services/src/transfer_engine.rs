//! Transfer engine — C9, §4.5.
//!
//! Owns the chunked upload/download state machine: init, idempotent chunk
//! append, finalize, manifest/range reads, download tokens, and
//! receipt-driven deletion. Capability validation (scope, route, bindings)
//! happens one layer up in `relay-api`; this module still re-checks the
//! domain invariants (claim approved, byte-range idempotency, I1/I2) that no
//! capability token can express on its own.

use std::sync::Arc;

use dashmap::DashMap;

use relay_core::capability::{Bindings, Route, Scope};
use relay_core::crypto::{b64url_encode, hash, random_token};
use relay_core::model::{ClaimStatus, TransferId, TransferMeta, TransferStatus};
use relay_core::{Clock, RelayError};

use crate::capability_service::{CapabilityService, IssueSpec};
use crate::metrics::Metrics;
use crate::quota::QuotaTracker;
use crate::store::Store;
use crate::throttle::ThrottleManager;

const TRANSFER_ID_ALLOC_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaLimits {
    pub transfers_day_ip: u64,
    pub transfers_day_session: u64,
    pub concurrent_ip: u64,
    pub concurrent_session: u64,
    pub bytes_day_ip: u64,
    pub bytes_day_session: u64,
}

pub struct InitResult {
    pub transfer_id: String,
    pub upload_token: String,
}

pub struct DownloadRange {
    pub bytes: Vec<u8>,
    pub total_bytes: u64,
}

pub struct TransferEngine {
    store: Arc<dyn Store>,
    capabilities: Arc<CapabilityService>,
    quota: Arc<QuotaTracker>,
    throttle: Arc<ThrottleManager>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    transfer_ttl: chrono::Duration,
    download_token_ttl: chrono::Duration,
    chunk_locks: DashMap<TransferId, Arc<tokio::sync::Mutex<()>>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn Store>,
        capabilities: Arc<CapabilityService>,
        quota: Arc<QuotaTracker>,
        throttle: Arc<ThrottleManager>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        transfer_ttl: chrono::Duration,
        download_token_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            capabilities,
            quota,
            throttle,
            metrics,
            clock,
            transfer_ttl,
            download_token_ttl,
            chunk_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, transfer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks
            .entry(transfer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Read-only peek used by the API layer to learn `manifest_hash` before
    /// it can even construct the capability `Requirement` for this route.
    pub async fn get_meta(&self, transfer_id: &str) -> Result<TransferMeta, RelayError> {
        self.store
            .get_transfer_meta(&transfer_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn init(
        &self,
        session_id: &str,
        claim_id: &str,
        ip: &str,
        manifest_ciphertext: &[u8],
        total_bytes: u64,
        limits: QuotaLimits,
    ) -> Result<InitResult, RelayError> {
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

        if claim.status != ClaimStatus::Approved || !claim.sas_ready() {
            return Err(RelayError::NotFound);
        }

        let auth_ctx = self
            .store
            .get_session_auth_context(&session_id.to_string(), &claim_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let mut transfer_id = random_token(18);
        for _ in 0..TRANSFER_ID_ALLOC_RETRIES {
            if self.get_meta(&transfer_id).await.is_err() {
                break;
            }
            transfer_id = random_token(18);
        }

        if !self.quota.begin_transfer(
            &transfer_id,
            ip,
            session_id,
            limits.transfers_day_ip,
            limits.transfers_day_session,
            limits.concurrent_ip,
            limits.concurrent_session,
        ) {
            self.metrics.quota_rejections();
            return Err(RelayError::NotFound);
        }

        let now = self.clock.now();
        let manifest_hash = b64url_encode(&hash(manifest_ciphertext));

        self.store
            .save_manifest(&transfer_id, manifest_ciphertext)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        self.store
            .save_transfer_meta(TransferMeta {
                transfer_id: transfer_id.clone(),
                session_id: session_id.to_string(),
                claim_id: claim_id.to_string(),
                status: TransferStatus::Active,
                bytes_received: 0,
                total_bytes,
                created_at: now,
                expires_at: now + self.transfer_ttl,
                manifest_hash: manifest_hash.clone(),
            })
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        let bindings = Bindings {
            session_id: Some(session_id.to_string()),
            claim_id: Some(claim_id.to_string()),
            transfer_id: Some(transfer_id.clone()),
            sender_pubkey_b64: Some(auth_ctx.sender_pubkey_b64.clone()),
            receiver_pubkey_b64: Some(auth_ctx.receiver_pubkey_b64.clone()),
            manifest_hash: Some(manifest_hash),
            ..Default::default()
        };

        let send_token = self.capabilities.issue(IssueSpec {
            scope: Scope::XferSend,
            ttl: self.transfer_ttl,
            bindings: bindings.clone(),
            max_bytes: Some(total_bytes),
            max_rate_bps: None,
            allowed_routes: vec![
                Route::TransferChunk,
                Route::TransferFinalize,
                Route::TransferScanInit,
                Route::TransferScanChunk,
                Route::TransferScanFinalize,
            ],
            single_use: false,
        });

        let receive_token = self.capabilities.issue(IssueSpec {
            scope: Scope::XferReceive,
            ttl: chrono::Duration::hours(1),
            bindings,
            max_bytes: None,
            max_rate_bps: None,
            allowed_routes: vec![
                Route::TransferManifest,
                Route::TransferDownloadToken,
                Route::TransferReceipt,
            ],
            single_use: false,
        });

        let claim_mut = session.find_claim_mut(claim_id).expect("checked above");
        claim_mut.transfer_id = Some(transfer_id.clone());
        claim_mut.receive_token = Some(receive_token);

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        self.metrics.transfers_init();

        Ok(InitResult {
            transfer_id,
            upload_token: send_token,
        })
    }

    /// §5: the check-then-write decision is serialized through this
    /// transfer's lock, independent of the store's own internal lock, so the
    /// idempotency comparison and the write it authorizes cannot race with
    /// another writer's decision for the same transfer.
    pub async fn chunk(
        &self,
        transfer_id: &str,
        ip: &str,
        session_id: &str,
        offset: u64,
        data: &[u8],
        bytes_day_limit_ip: u64,
        bytes_day_limit_session: u64,
    ) -> Result<(), RelayError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        let mut meta = self.get_meta(transfer_id).await?;
        if meta.status != TransferStatus::Active {
            return Err(RelayError::NotFound);
        }

        let len = data.len() as u64;
        let write_end = offset.saturating_add(len);
        if write_end > meta.total_bytes {
            return Err(RelayError::NotFound);
        }

        let overlap_end = write_end.min(meta.bytes_received);
        if overlap_end > offset {
            let overlap_len = overlap_end - offset;
            let existing = self
                .store
                .read_range(&transfer_id.to_string(), offset, overlap_len)
                .await
                .map_err(|e| RelayError::Internal(e.to_string()))?;
            if existing != data[..overlap_len as usize] {
                self.metrics.chunk_conflicts();
                return Err(RelayError::ChunkConflict);
            }
        }

        let new_bytes = write_end.saturating_sub(meta.bytes_received);
        if new_bytes > 0
            && !self.quota.add_bytes(
                ip,
                session_id,
                new_bytes,
                bytes_day_limit_ip,
                bytes_day_limit_session,
            )
        {
            self.metrics.quota_rejections();
            return Err(RelayError::NotFound);
        }

        let delay = self.throttle.reserve(transfer_id, len);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.store
            .write_chunk(&transfer_id.to_string(), offset, data)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        meta.bytes_received = meta.bytes_received.max(write_end);
        self.store
            .save_transfer_meta(meta)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        self.metrics.chunks_written();
        Ok(())
    }

    pub async fn finalize(&self, transfer_id: &str) -> Result<(), RelayError> {
        let mut meta = self.get_meta(transfer_id).await?;
        if meta.status != TransferStatus::Active || meta.bytes_received != meta.total_bytes {
            return Err(RelayError::NotFound);
        }
        meta.status = TransferStatus::Complete;
        self.store
            .save_transfer_meta(meta)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        self.quota.end_transfer(transfer_id);
        self.metrics.transfers_completed();
        Ok(())
    }

    pub async fn manifest(&self, transfer_id: &str) -> Result<Vec<u8>, RelayError> {
        self.store
            .load_manifest(&transfer_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)
    }

    pub async fn mint_download_token(
        &self,
        session_id: &str,
        claim_id: &str,
        transfer_id: &str,
    ) -> Result<String, RelayError> {
        let token = random_token(24);
        let token_hash = hash(token.as_bytes());
        let now = self.clock.now();

        self.store
            .save_download_token(relay_core::model::DownloadToken {
                hash: token_hash,
                session_id: session_id.to_string(),
                claim_id: claim_id.to_string(),
                transfer_id: transfer_id.to_string(),
                expires_at: now + self.download_token_ttl,
                used: false,
            })
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(token)
    }

    /// Validates + atomically consumes a download token bound to this exact
    /// (session, claim, transfer) triple (I6).
    pub async fn consume_download_token(
        &self,
        session_id: &str,
        claim_id: &str,
        transfer_id: &str,
        token: &str,
    ) -> Result<(), RelayError> {
        let token_hash = hash(token.as_bytes());
        let record = self
            .store
            .get_download_token(&token_hash)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        if record.session_id != session_id
            || record.claim_id != claim_id
            || record.transfer_id != transfer_id
            || record.expires_at < self.clock.now()
        {
            return Err(RelayError::NotFound);
        }

        let consumed = self
            .store
            .consume_download_token(&token_hash)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        if !consumed {
            return Err(RelayError::NotFound);
        }
        Ok(())
    }

    pub async fn download_range(
        &self,
        transfer_id: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<DownloadRange, RelayError> {
        let meta = self.get_meta(transfer_id).await?;
        if start > end_inclusive || end_inclusive >= meta.total_bytes {
            return Err(RelayError::NotFound);
        }
        let length = end_inclusive - start + 1;
        let bytes = self
            .store
            .read_range(&transfer_id.to_string(), start, length)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(DownloadRange {
            bytes,
            total_bytes: meta.total_bytes,
        })
    }

    /// receipt — deletes all ciphertext and metadata, ends quota tracking,
    /// revokes every capability bound to this transfer, and drops its
    /// throttle limiter. By the time a second receipt could arrive, the
    /// revocation above already makes its capability fail validation, so
    /// this method itself needs no idempotency guard (I8).
    pub async fn receipt(&self, transfer_id: &str) -> Result<(), RelayError> {
        self.get_meta(transfer_id).await?;

        self.store
            .delete_transfer(&transfer_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        self.quota.end_transfer(transfer_id);
        self.throttle.forget(transfer_id);
        self.capabilities.revoke_transfer(transfer_id);
        Ok(())
    }
}

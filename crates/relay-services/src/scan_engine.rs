//! Scan engine — C10, §4.6.
//!
//! A second, independently-keyed ciphertext ingestion used only for
//! server-side malware scanning. The scan key is generated fresh per scan
//! session and is never derived from or equal to any session key (I7).

use std::sync::Arc;
use std::time::Duration;

use relay_core::crypto::{b64url_encode, random_token};
use relay_core::model::{ClaimStatus, ScanStatus, ScanSession};
use relay_core::{Clock, RelayError, ScanVerdict, Scanner};

use crate::metrics::Metrics;
use crate::store::Store;

pub struct ScanInit {
    pub scan_id: String,
    pub scan_key_b64: String,
}

pub struct ScanEngine {
    store: Arc<dyn Store>,
    scanner: Arc<dyn Scanner>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    scan_ttl: chrono::Duration,
    max_scan_bytes: u64,
    max_scan_duration: Duration,
}

impl ScanEngine {
    pub fn new(
        store: Arc<dyn Store>,
        scanner: Arc<dyn Scanner>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        scan_ttl: chrono::Duration,
        max_scan_bytes: u64,
        max_scan_duration: Duration,
    ) -> Self {
        Self {
            store,
            scanner,
            clock,
            metrics,
            scan_ttl,
            max_scan_bytes,
            max_scan_duration,
        }
    }

    /// Read-only peek used by the API layer to learn `transfer_id` before it
    /// can construct the capability `Requirement` for `scan_chunk`/
    /// `scan_finalize`, which are addressed by `scan_id` alone on the wire.
    pub async fn peek_transfer_id(&self, scan_id: &str) -> Result<String, RelayError> {
        self.store
            .get_scan_session(&scan_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map(|s| s.transfer_id)
            .ok_or(RelayError::NotFound)
    }

    pub async fn scan_init(
        &self,
        session_id: &str,
        claim_id: &str,
        transfer_id: &str,
        total_bytes: u64,
        chunk_size: u64,
    ) -> Result<ScanInit, RelayError> {
        let session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let claim = session.find_claim(claim_id).ok_or(RelayError::NotFound)?;
        if claim.status != ClaimStatus::Approved || !claim.scan_required {
            return Err(RelayError::NotFound);
        }

        let scan_id = random_token(16);
        let scan_key = relay_core::crypto::random_key32();
        let now = self.clock.now();

        self.store
            .save_scan_session(ScanSession {
                scan_id: scan_id.clone(),
                session_id: session_id.to_string(),
                claim_id: claim_id.to_string(),
                transfer_id: transfer_id.to_string(),
                created_at: now,
                expires_at: now + self.scan_ttl,
                scan_key,
                total_bytes,
                chunk_size,
                chunks_received: 0,
            })
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(ScanInit {
            scan_id,
            scan_key_b64: b64url_encode(&scan_key),
        })
    }

    pub async fn scan_chunk(
        &self,
        scan_id: &str,
        chunk_index: u64,
        sealed: &[u8],
    ) -> Result<(), RelayError> {
        let mut scan = self
            .store
            .get_scan_session(&scan_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        self.store
            .save_scan_chunk(&scan_id.to_string(), chunk_index, sealed)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        scan.chunks_received += 1;
        self.store
            .update_scan_session(scan)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Decrypts every stored chunk in ascending index order, invokes the
    /// scanner capability on the concatenated plaintext under a deadline,
    /// persists the verdict on the claim, and deletes the scan session and
    /// all its chunks regardless of outcome.
    pub async fn scan_finalize(&self, scan_id: &str) -> Result<ScanVerdict, RelayError> {
        let scan = self
            .store
            .get_scan_session(&scan_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        let sealed_chunks = self
            .store
            .load_scan_chunks(&scan_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        let verdict = self.decrypt_and_scan(&scan, &sealed_chunks).await;

        self.persist_verdict(&scan.session_id, &scan.claim_id, verdict)
            .await?;

        self.store
            .delete_scan_session(&scan_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        match verdict {
            ScanVerdict::Clean => self.metrics.scan_verdicts_clean(),
            ScanVerdict::Dirty => self.metrics.scan_verdicts_failed(),
            ScanVerdict::Unavailable => self.metrics.scan_verdicts_unavailable(),
        }

        Ok(verdict)
    }

    async fn decrypt_and_scan(&self, scan: &ScanSession, sealed_chunks: &[Vec<u8>]) -> ScanVerdict {
        let mut plaintext = Vec::new();
        for (index, sealed) in sealed_chunks.iter().enumerate() {
            match relay_core::crypto::scan_open(&scan.scan_key, index as u64, sealed) {
                Ok(mut opened) => {
                    plaintext.append(&mut opened);
                    if plaintext.len() as u64 > self.max_scan_bytes {
                        return ScanVerdict::Unavailable;
                    }
                }
                Err(_) => return ScanVerdict::Dirty,
            }
        }

        match tokio::time::timeout(
            self.max_scan_duration,
            self.scanner.scan(self.max_scan_duration, &plaintext),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(_) => ScanVerdict::Unavailable,
        }
    }

    async fn persist_verdict(
        &self,
        session_id: &str,
        claim_id: &str,
        verdict: ScanVerdict,
    ) -> Result<(), RelayError> {
        let mut session = self
            .store
            .get_session(&session_id.to_string())
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::NotFound)?;

        if let Some(claim) = session.find_claim_mut(claim_id) {
            claim.scan_status = match verdict {
                ScanVerdict::Clean => ScanStatus::Clean,
                ScanVerdict::Dirty => ScanStatus::Failed,
                ScanVerdict::Unavailable => ScanStatus::Unavailable,
            };
        }

        self.store
            .update_session(session)
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(())
    }
}

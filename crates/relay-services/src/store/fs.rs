//! Reference filesystem-backed `Store` implementation.
//!
//! Every record write follows the teacher's own discipline for the chunk
//! cache: write to a temp file, `sync_all`, then `rename` into place. Chunk
//! byte-range writes go through a per-transfer lock held in a `DashMap`, so
//! two concurrent writers to the same transfer serialize at this boundary
//! (§5 ordering guarantees) — the transfer engine above still owns the
//! idempotency *decision*, but the mutual exclusion itself lives here.

use std::fs;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use relay_core::model::{
    ClaimId, DownloadToken, ScanId, ScanSession, Session, SessionAuthContext, SessionId,
    TransferId, TransferMeta,
};

use super::{Store, StoreError, SweepReport};

pub struct FilesystemStore {
    root: PathBuf,
    transfer_locks: DashMap<TransferId, Arc<AsyncMutex<()>>>,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in [
            "sessions",
            "session_auth",
            "manifests",
            "transfers",
            "chunks",
            "scans",
            "scan_chunks",
            "download_tokens",
        ] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            transfer_locks: DashMap::new(),
        })
    }

    fn path(&self, sub: &str, name: &str) -> PathBuf {
        self.root.join(sub).join(name)
    }

    fn lock_for(&self, transfer_id: &TransferId) -> Arc<AsyncMutex<()>> {
        self.transfer_locks
            .entry(transfer_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Atomic write: tmp file → fsync → rename. Matches the teacher's
    /// `ChunkCache::put` discipline.
    fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&text)?))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        Self::atomic_write(path, &bytes)
    }

    fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn auth_ctx_key(session_id: &SessionId, claim_id: &ClaimId) -> String {
    format!("{session_id}__{claim_id}")
}

#[async_trait]
impl Store for FilesystemStore {
    async fn create_session(&self, session: Session) -> Result<(), StoreError> {
        let path = self.path("sessions", &format!("{}.json", session.session_id));
        Self::write_json(&path, &session)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Self::read_json(&self.path("sessions", &format!("{id}.json")))
    }

    async fn update_session(&self, session: Session) -> Result<(), StoreError> {
        let path = self.path("sessions", &format!("{}.json", session.session_id));
        Self::write_json(&path, &session)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        Self::remove_if_exists(&self.path("sessions", &format!("{id}.json")))
    }

    async fn save_session_auth_context(&self, ctx: SessionAuthContext) -> Result<(), StoreError> {
        let key = auth_ctx_key(&ctx.session_id, &ctx.claim_id);
        Self::write_json(&self.path("session_auth", &format!("{key}.json")), &ctx)
    }

    async fn get_session_auth_context(
        &self,
        session_id: &SessionId,
        claim_id: &ClaimId,
    ) -> Result<Option<SessionAuthContext>, StoreError> {
        let key = auth_ctx_key(session_id, claim_id);
        Self::read_json(&self.path("session_auth", &format!("{key}.json")))
    }

    async fn save_manifest(&self, transfer_id: &TransferId, bytes: &[u8]) -> Result<(), StoreError> {
        Self::atomic_write(&self.path("manifests", &format!("{transfer_id}.bin")), bytes)
    }

    async fn load_manifest(&self, transfer_id: &TransferId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path("manifests", &format!("{transfer_id}.bin"));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    async fn save_transfer_meta(&self, meta: TransferMeta) -> Result<(), StoreError> {
        let path = self.path("transfers", &format!("{}.json", meta.transfer_id));
        Self::write_json(&path, &meta)
    }

    async fn get_transfer_meta(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMeta>, StoreError> {
        Self::read_json(&self.path("transfers", &format!("{transfer_id}.json")))
    }

    async fn delete_transfer_meta(&self, transfer_id: &TransferId) -> Result<(), StoreError> {
        Self::remove_if_exists(&self.path("transfers", &format!("{transfer_id}.json")))
    }

    async fn write_chunk(
        &self,
        transfer_id: &TransferId,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        let path = self.path("chunks", &format!("{transfer_id}.bin"));
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.write_at(bytes, offset)?;
        file.sync_all()?;
        Ok(())
    }

    async fn read_range(
        &self,
        transfer_id: &TransferId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StoreError> {
        let path = self.path("chunks", &format!("{transfer_id}.bin"));
        let file = fs::File::open(&path)?;
        let file_len = file.metadata()?.len();
        let want_end = offset.saturating_add(length).min(file_len);
        if offset >= want_end {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; (want_end - offset) as usize];
        file.read_at(&mut buf, offset)?;
        Ok(buf)
    }

    async fn delete_transfer(&self, transfer_id: &TransferId) -> Result<(), StoreError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        Self::remove_if_exists(&self.path("manifests", &format!("{transfer_id}.bin")))?;
        Self::remove_if_exists(&self.path("chunks", &format!("{transfer_id}.bin")))?;
        Self::remove_if_exists(&self.path("transfers", &format!("{transfer_id}.json")))?;
        self.transfer_locks.remove(transfer_id);
        Ok(())
    }

    async fn save_scan_session(&self, scan: ScanSession) -> Result<(), StoreError> {
        let path = self.path("scans", &format!("{}.json", scan.scan_id));
        Self::write_json(&path, &scan)
    }

    async fn get_scan_session(&self, scan_id: &ScanId) -> Result<Option<ScanSession>, StoreError> {
        Self::read_json(&self.path("scans", &format!("{scan_id}.json")))
    }

    async fn update_scan_session(&self, scan: ScanSession) -> Result<(), StoreError> {
        let path = self.path("scans", &format!("{}.json", scan.scan_id));
        Self::write_json(&path, &scan)
    }

    async fn save_scan_chunk(
        &self,
        scan_id: &ScanId,
        chunk_index: u64,
        sealed: &[u8],
    ) -> Result<(), StoreError> {
        let dir = self.root.join("scan_chunks").join(scan_id);
        fs::create_dir_all(&dir)?;
        Self::atomic_write(&dir.join(format!("{chunk_index}.bin")), sealed)
    }

    async fn load_scan_chunks(&self, scan_id: &ScanId) -> Result<Vec<Vec<u8>>, StoreError> {
        let dir = self.root.join("scan_chunks").join(scan_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut indices: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .collect();
        indices.sort_unstable();

        let mut chunks = Vec::with_capacity(indices.len());
        for idx in indices {
            chunks.push(fs::read(dir.join(format!("{idx}.bin")))?);
        }
        Ok(chunks)
    }

    async fn delete_scan_session(&self, scan_id: &ScanId) -> Result<(), StoreError> {
        Self::remove_if_exists(&self.path("scans", &format!("{scan_id}.json")))?;
        let dir = self.root.join("scan_chunks").join(scan_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn save_download_token(&self, token: DownloadToken) -> Result<(), StoreError> {
        let name = format!("{}.json", hex::encode(token.hash));
        Self::write_json(&self.path("download_tokens", &name), &token)
    }

    async fn get_download_token(
        &self,
        hash: &[u8; 32],
    ) -> Result<Option<DownloadToken>, StoreError> {
        let name = format!("{}.json", hex::encode(hash));
        Self::read_json(&self.path("download_tokens", &name))
    }

    async fn consume_download_token(&self, hash: &[u8; 32]) -> Result<bool, StoreError> {
        let name = format!("{}.json", hex::encode(hash));
        let path = self.path("download_tokens", &name);
        let Some(mut token): Option<DownloadToken> = Self::read_json(&path)? else {
            return Ok(false);
        };
        if token.used {
            return Ok(false);
        }
        token.used = true;
        Self::write_json(&path, &token)?;
        Ok(true)
    }

    async fn sweep_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let sessions_dir = self.root.join("sessions");
        if sessions_dir.exists() {
            for entry in fs::read_dir(&sessions_dir)?.filter_map(|e| e.ok()) {
                if let Ok(bytes) = fs::read(entry.path()) {
                    if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
                        if session.expires_at < now {
                            Self::remove_if_exists(&entry.path())?;
                            report.sessions_deleted += 1;
                        }
                    }
                }
            }
        }

        let transfers_dir = self.root.join("transfers");
        if transfers_dir.exists() {
            for entry in fs::read_dir(&transfers_dir)?.filter_map(|e| e.ok()) {
                if let Ok(bytes) = fs::read(entry.path()) {
                    if let Ok(meta) = serde_json::from_slice::<TransferMeta>(&bytes) {
                        let is_terminal = matches!(
                            meta.status,
                            relay_core::model::TransferStatus::Complete
                        );
                        if meta.expires_at < now && !is_terminal {
                            self.delete_transfer(&meta.transfer_id).await?;
                            report.transfers_deleted += 1;
                        }
                    }
                }
            }
        }

        let scans_dir = self.root.join("scans");
        if scans_dir.exists() {
            for entry in fs::read_dir(&scans_dir)?.filter_map(|e| e.ok()) {
                if let Ok(bytes) = fs::read(entry.path()) {
                    if let Ok(scan) = serde_json::from_slice::<ScanSession>(&bytes) {
                        if scan.expires_at < now {
                            self.delete_scan_session(&scan.scan_id).await?;
                            report.scans_deleted += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::model::{Claim, TransferStatus};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> FilesystemStore {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("udrop-store-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        FilesystemStore::new(&dir).unwrap()
    }

    fn sample_session(id: &str) -> Session {
        Session {
            session_id: id.to_string(),
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(3),
            claim_token_hash: [0u8; 32],
            claim_token_expires_at: chrono::Utc::now() + chrono::Duration::minutes(3),
            claim_token_used: false,
            receiver_pubkey_b64: "abc".to_string(),
            claims: vec![Claim::new("c1".into(), false)],
        }
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = temp_store();
        let session = sample_session("s1");
        store.create_session(session.clone()).await.unwrap();
        let loaded = store.get_session(&"s1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.claims.len(), 1);
    }

    #[tokio::test]
    async fn manifest_roundtrip() {
        let store = temp_store();
        store.save_manifest(&"t1".to_string(), b"MANIFEST").await.unwrap();
        let loaded = store.load_manifest(&"t1".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded, b"MANIFEST");
    }

    #[tokio::test]
    async fn chunk_write_and_range_read() {
        let store = temp_store();
        let tid = "t1".to_string();
        store.write_chunk(&tid, 0, b"hello").await.unwrap();
        let data = store.read_range(&tid, 0, 5).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn chunk_overwrite_at_same_offset_is_idempotent_on_disk() {
        let store = temp_store();
        let tid = "t1".to_string();
        store.write_chunk(&tid, 0, b"data").await.unwrap();
        store.write_chunk(&tid, 0, b"data").await.unwrap();
        let data = store.read_range(&tid, 0, 4).await.unwrap();
        assert_eq!(data, b"data");
    }

    #[tokio::test]
    async fn delete_transfer_removes_everything() {
        let store = temp_store();
        let tid = "t1".to_string();
        store.save_manifest(&tid, b"M").await.unwrap();
        store.write_chunk(&tid, 0, b"hello").await.unwrap();
        store
            .save_transfer_meta(TransferMeta {
                transfer_id: tid.clone(),
                session_id: "s1".into(),
                claim_id: "c1".into(),
                status: TransferStatus::Active,
                bytes_received: 5,
                total_bytes: 5,
                created_at: chrono::Utc::now(),
                expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
                manifest_hash: "x".into(),
            })
            .await
            .unwrap();

        store.delete_transfer(&tid).await.unwrap();

        assert!(store.load_manifest(&tid).await.unwrap().is_none());
        assert!(store.get_transfer_meta(&tid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn download_token_single_use() {
        let store = temp_store();
        let hash = [7u8; 32];
        store
            .save_download_token(DownloadToken {
                hash,
                session_id: "s1".into(),
                claim_id: "c1".into(),
                transfer_id: "t1".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
                used: false,
            })
            .await
            .unwrap();

        assert!(store.consume_download_token(&hash).await.unwrap());
        assert!(!store.consume_download_token(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_expired_deletes_only_expired_and_nonterminal() {
        let store = temp_store();
        let now = chrono::Utc::now();

        let mut expired_session = sample_session("expired");
        expired_session.expires_at = now - chrono::Duration::minutes(1);
        store.create_session(expired_session).await.unwrap();

        let mut live_session = sample_session("live");
        live_session.expires_at = now + chrono::Duration::minutes(5);
        store.create_session(live_session).await.unwrap();

        store
            .save_transfer_meta(TransferMeta {
                transfer_id: "expired_complete".into(),
                session_id: "s1".into(),
                claim_id: "c1".into(),
                status: TransferStatus::Complete,
                bytes_received: 5,
                total_bytes: 5,
                created_at: now,
                expires_at: now - chrono::Duration::minutes(1),
                manifest_hash: "x".into(),
            })
            .await
            .unwrap();

        let report = store.sweep_expired(now).await.unwrap();
        assert_eq!(report.sessions_deleted, 1);
        // complete transfers are terminal and must survive expiry sweep
        assert_eq!(report.transfers_deleted, 0);

        assert!(store.get_session(&"expired".to_string()).await.unwrap().is_none());
        assert!(store.get_session(&"live".to_string()).await.unwrap().is_some());
    }
}

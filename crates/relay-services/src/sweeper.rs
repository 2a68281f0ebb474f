//! Sweeper — C14, §4.8.
//!
//! Runs as a single independent task on the clock's schedule, deleting
//! everything past its `expires_at` (sessions unconditionally, transfers and
//! scans only when non-terminal), and stamping a liveness beacon so the
//! readiness probe can tell "never swept" and "stalled" apart from healthy.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use relay_core::logging::log_event;
use relay_core::Clock;

use crate::metrics::Metrics;
use crate::store::{Store, StoreError};

pub struct Sweeper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    interval: Duration,
    last_swept_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            metrics,
            interval,
            last_swept_at: Mutex::new(None),
        }
    }

    pub async fn sweep_once(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let report = self.store.sweep_expired(now).await?;
        self.metrics.add_sweep_report(&report);
        *self.last_swept_at.lock().unwrap() = Some(now);

        let total = report.sessions_deleted + report.transfers_deleted + report.scans_deleted;
        if total > 0 {
            log_event("sweep_completed", &[("count", &total.to_string())]);
        }
        Ok(())
    }

    /// Runs sweeps on `interval` until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::warn!(error = %err, "sweep pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Readiness: a sweep has completed since process start and within one
    /// interval of now.
    pub fn is_ready(&self) -> bool {
        match *self.last_swept_at.lock().unwrap() {
            None => false,
            Some(last) => self.clock.now() - last <= chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::seconds(30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemStore;
    use relay_core::model::{Claim, Session};
    use relay_core::FakeClock;

    fn temp_store() -> Arc<dyn Store> {
        let dir = std::env::temp_dir().join(format!("udrop-sweeper-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(FilesystemStore::new(&dir).unwrap())
    }

    #[tokio::test]
    async fn not_ready_before_first_sweep() {
        let store = temp_store();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        let metrics = Arc::new(Metrics::new());
        let sweeper = Sweeper::new(store, clock, metrics, Duration::from_secs(30));
        assert!(!sweeper.is_ready());
    }

    #[tokio::test]
    async fn ready_immediately_after_a_sweep_and_stale_after_two_intervals() {
        let store = temp_store();
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let metrics = Arc::new(Metrics::new());
        let sweeper = Sweeper::new(store, clock_dyn, metrics, Duration::from_secs(30));

        sweeper.sweep_once().await.unwrap();
        assert!(sweeper.is_ready());

        clock.advance(Duration::from_secs(90));
        assert!(!sweeper.is_ready());
    }

    #[tokio::test]
    async fn sweep_deletes_expired_session_and_reports_it() {
        let store = temp_store();
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        let metrics = Arc::new(Metrics::new());

        store
            .create_session(Session {
                session_id: "expired".into(),
                created_at: clock.now(),
                expires_at: clock.now() - chrono::Duration::minutes(1),
                claim_token_hash: [0u8; 32],
                claim_token_expires_at: clock.now(),
                claim_token_used: false,
                receiver_pubkey_b64: "x".into(),
                claims: vec![Claim::new("c1".into(), false)],
            })
            .await
            .unwrap();

        let sweeper = Sweeper::new(store.clone(), clock, metrics.clone(), Duration::from_secs(30));
        sweeper.sweep_once().await.unwrap();

        assert!(store.get_session(&"expired".to_string()).await.unwrap().is_none());
        assert_eq!(metrics.snapshot().sweep_sessions_deleted, 1);
    }
}

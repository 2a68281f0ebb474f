//! Process-wide counters — C15.
//!
//! Plain `AtomicU64`s, same shape as a Prometheus counter family without the
//! dependency: cheap to increment from any handler, snapshotted on demand
//! for the operator-only status route.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    sessions_created: AtomicU64,
    transfers_init: AtomicU64,
    transfers_completed: AtomicU64,
    chunks_written: AtomicU64,
    chunk_conflicts: AtomicU64,
    quota_rejections: AtomicU64,
    scan_verdicts_clean: AtomicU64,
    scan_verdicts_failed: AtomicU64,
    scan_verdicts_unavailable: AtomicU64,
    sweep_sessions_deleted: AtomicU64,
    sweep_transfers_deleted: AtomicU64,
    sweep_scans_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub transfers_init: u64,
    pub transfers_completed: u64,
    pub chunks_written: u64,
    pub chunk_conflicts: u64,
    pub quota_rejections: u64,
    pub scan_verdicts_clean: u64,
    pub scan_verdicts_failed: u64,
    pub scan_verdicts_unavailable: u64,
    pub sweep_sessions_deleted: u64,
    pub sweep_transfers_deleted: u64,
    pub sweep_scans_deleted: u64,
}

macro_rules! counter_incr {
    ($name:ident) => {
        pub fn $name(&self) {
            self.$name.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter_incr!(sessions_created);
    counter_incr!(transfers_init);
    counter_incr!(transfers_completed);
    counter_incr!(chunks_written);
    counter_incr!(chunk_conflicts);
    counter_incr!(quota_rejections);
    counter_incr!(scan_verdicts_clean);
    counter_incr!(scan_verdicts_failed);
    counter_incr!(scan_verdicts_unavailable);

    pub fn add_sweep_report(&self, report: &crate::store::SweepReport) {
        self.sweep_sessions_deleted
            .fetch_add(report.sessions_deleted, Ordering::Relaxed);
        self.sweep_transfers_deleted
            .fetch_add(report.transfers_deleted, Ordering::Relaxed);
        self.sweep_scans_deleted
            .fetch_add(report.scans_deleted, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            transfers_init: self.transfers_init.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunk_conflicts: self.chunk_conflicts.load(Ordering::Relaxed),
            quota_rejections: self.quota_rejections.load(Ordering::Relaxed),
            scan_verdicts_clean: self.scan_verdicts_clean.load(Ordering::Relaxed),
            scan_verdicts_failed: self.scan_verdicts_failed.load(Ordering::Relaxed),
            scan_verdicts_unavailable: self.scan_verdicts_unavailable.load(Ordering::Relaxed),
            sweep_sessions_deleted: self.sweep_sessions_deleted.load(Ordering::Relaxed),
            sweep_transfers_deleted: self.sweep_transfers_deleted.load(Ordering::Relaxed),
            sweep_scans_deleted: self.sweep_scans_deleted.load(Ordering::Relaxed),
        }
    }
}

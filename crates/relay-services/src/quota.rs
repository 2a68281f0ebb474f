//! Quota tracker — C4, §4.2.
//!
//! Rolling 24h counters keyed by (kind, identity), plus concurrent-transfer
//! and relay-issuance counts. Every check-then-mutate holds the write guard
//! on each involved `DashMap` entry for the whole operation — acquired via
//! `entry()`, never released and reacquired between the `exceeds` check and
//! the increment — so two concurrent callers racing on the same key can't
//! both observe room under the cap and both push past it. Same shape as the
//! teacher's `TrustRegistry`/`TokenBucket` locking, just with counter
//! arithmetic instead of a single enum value.
//!
//! A zero limit means unlimited (never blocks) and allocates no counter.

use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

use relay_core::model::DailyCounter;
use relay_core::Clock;

/// 0 means "unlimited".
fn exceeds(current: u64, added: u64, limit: u64) -> bool {
    limit != 0 && current + added > limit
}

pub struct QuotaTracker {
    clock: Arc<dyn Clock>,
    sessions_ip: DashMap<String, DailyCounter>,
    sessions_session: DashMap<String, DailyCounter>,
    transfers_ip: DashMap<String, DailyCounter>,
    transfers_session: DashMap<String, DailyCounter>,
    bytes_ip: DashMap<String, DailyCounter>,
    bytes_session: DashMap<String, DailyCounter>,
    relay_ip: DashMap<String, DailyCounter>,

    /// transfer_id -> (ip, session_id), so end_transfer can find what to decrement.
    active_transfers: DashMap<String, (String, String)>,
    concurrent_ip: DashMap<String, u64>,
    concurrent_session: DashMap<String, u64>,

    /// identity -> list of (expiry) entries for relay-concurrency tracking.
    relay_active: DashMap<String, Vec<chrono::DateTime<chrono::Utc>>>,
}

impl QuotaTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions_ip: DashMap::new(),
            sessions_session: DashMap::new(),
            transfers_ip: DashMap::new(),
            transfers_session: DashMap::new(),
            bytes_ip: DashMap::new(),
            bytes_session: DashMap::new(),
            relay_ip: DashMap::new(),
            active_transfers: DashMap::new(),
            concurrent_ip: DashMap::new(),
            concurrent_session: DashMap::new(),
            relay_active: DashMap::new(),
        }
    }

    /// Rolls the entry if expired and returns a write guard held by the
    /// caller across its own check-then-mutate, so the roll, the read, and
    /// the increment all happen under one lock acquisition.
    fn touch_mut<'a>(
        map: &'a DashMap<String, DailyCounter>,
        key: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> RefMut<'a, String, DailyCounter> {
        map.entry(key.to_string())
            .and_modify(|c| c.roll_if_expired(now))
            .or_insert_with(|| DailyCounter::fresh(now))
    }

    pub fn allow_session(&self, ip: &str, session: &str, limit_ip: u64, limit_session: u64) -> bool {
        let now = self.clock.now();
        let mut ip_c = Self::touch_mut(&self.sessions_ip, ip, now);
        let mut session_c = Self::touch_mut(&self.sessions_session, session, now);

        if exceeds(ip_c.count, 1, limit_ip) || exceeds(session_c.count, 1, limit_session) {
            return false;
        }

        ip_c.count += 1;
        session_c.count += 1;
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin_transfer(
        &self,
        transfer_id: &str,
        ip: &str,
        session: &str,
        day_limit_ip: u64,
        day_limit_session: u64,
        concurrent_limit_ip: u64,
        concurrent_limit_session: u64,
    ) -> bool {
        if self.active_transfers.contains_key(transfer_id) {
            // Idempotent: already counted.
            return true;
        }

        let now = self.clock.now();
        let mut day_ip = Self::touch_mut(&self.transfers_ip, ip, now);
        let mut day_session = Self::touch_mut(&self.transfers_session, session, now);
        let mut conc_ip = self.concurrent_ip.entry(ip.to_string()).or_insert(0);
        let mut conc_session = self.concurrent_session.entry(session.to_string()).or_insert(0);

        if exceeds(day_ip.count, 1, day_limit_ip)
            || exceeds(day_session.count, 1, day_limit_session)
            || exceeds(*conc_ip, 1, concurrent_limit_ip)
            || exceeds(*conc_session, 1, concurrent_limit_session)
        {
            return false;
        }

        day_ip.count += 1;
        day_session.count += 1;
        *conc_ip += 1;
        *conc_session += 1;
        drop((day_ip, day_session, conc_ip, conc_session));
        self.active_transfers
            .insert(transfer_id.to_string(), (ip.to_string(), session.to_string()));
        true
    }

    pub fn end_transfer(&self, transfer_id: &str) {
        if let Some((_, (ip, session))) = self.active_transfers.remove(transfer_id) {
            if let Some(mut c) = self.concurrent_ip.get_mut(&ip) {
                *c = c.saturating_sub(1);
            }
            if let Some(mut c) = self.concurrent_session.get_mut(&session) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn add_bytes(&self, ip: &str, session: &str, n: u64, day_limit_ip: u64, day_limit_session: u64) -> bool {
        let now = self.clock.now();
        let mut ip_c = Self::touch_mut(&self.bytes_ip, ip, now);
        let mut session_c = Self::touch_mut(&self.bytes_session, session, now);

        if exceeds(ip_c.bytes, n, day_limit_ip) || exceeds(session_c.bytes, n, day_limit_session) {
            return false;
        }

        ip_c.bytes += n;
        session_c.bytes += n;
        true
    }

    pub fn allow_relay(&self, identity: &str, per_day: u64, concurrent: u64, ttl: chrono::Duration) -> bool {
        let now = self.clock.now();
        let mut day = Self::touch_mut(&self.relay_ip, identity, now);
        let mut active = self.relay_active.entry(identity.to_string()).or_default();
        active.retain(|exp| *exp > now);

        if exceeds(day.count, 1, per_day) || exceeds(active.len() as u64, 1, concurrent) {
            return false;
        }

        active.push(now + ttl);
        day.count += 1;
        true
    }
}

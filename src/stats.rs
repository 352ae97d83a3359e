//! Session counters.
//!
//! Lock-free tallies updated from the hot path and printed by the heartbeat
//! task and the end-of-session summary.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct SessionStats {
    started_at: Instant,
    pub book_updates: AtomicU64,
    pub updates_dropped: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub evaluations: AtomicU64,
    pub opportunities: AtomicU64,
    pub rejections: AtomicU64,
    pub submissions: AtomicU64,
    pub fills: AtomicU64,
    pub hedges: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub realized_pnl_cents: AtomicI64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            book_updates: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            evaluations: AtomicU64::new(0),
            opportunities: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            hedges: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            realized_pnl_cents: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pnl(&self, cents: i64) {
        self.realized_pnl_cents.fetch_add(cents, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "uptime {}s | updates {} (dropped {}) | evals {} | opps {} | rejects {} | \
             submitted {} | fills {} | hedges {} | done {} | failed {} | pnl ${:.2}",
            self.uptime_secs(),
            self.book_updates.load(Ordering::Relaxed),
            self.updates_dropped.load(Ordering::Relaxed),
            self.evaluations.load(Ordering::Relaxed),
            self.opportunities.load(Ordering::Relaxed),
            self.rejections.load(Ordering::Relaxed),
            self.submissions.load(Ordering::Relaxed),
            self.fills.load(Ordering::Relaxed),
            self.hedges.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.realized_pnl_cents.load(Ordering::Relaxed) as f64 / 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_report() {
        let stats = SessionStats::new();
        SessionStats::bump(&stats.opportunities);
        SessionStats::bump(&stats.opportunities);
        stats.add_pnl(1_000);
        stats.add_pnl(-250);

        let report = stats.to_string();
        assert!(report.contains("opps 2"));
        assert!(report.contains("pnl $7.50"));
    }
}

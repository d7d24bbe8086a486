//! Fix loop counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::record::{FixOutcome, FixStatus};

/// Process-wide counters, updated lock-free.
#[derive(Debug, Default)]
pub struct Metrics {
    reports: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fixes_succeeded: AtomicU64,
    fixes_failed: AtomicU64,
    denied_breaker: AtomicU64,
    denied_limiter: AtomicU64,
    unfixable: AtomicU64,
    cancelled: AtomicU64,
    busy: AtomicU64,
    halted: AtomicU64,
    timeouts: AtomicU64,
    tokens: AtomicU64,
    /// Cost in micro-dollars so it can stay an integer
    cost_micros: AtomicU64,
}

/// Serializable view of [`Metrics`] plus the current gauges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub reports: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fixes_succeeded: u64,
    pub fixes_failed: u64,
    pub denied_breaker: u64,
    pub denied_limiter: u64,
    pub unfixable: u64,
    pub cancelled: u64,
    pub busy: u64,
    pub halted: u64,
    pub timeouts: u64,
    pub tokens: u64,
    pub cost_usd: f64,
    pub open_circuits: usize,
    pub cache_entries: usize,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_received(&self) {
        bump(&self.reports);
    }

    pub fn cache_lookup(&self, hit: bool) {
        bump(if hit { &self.cache_hits } else { &self.cache_misses });
    }

    pub fn denied_by_breaker(&self) {
        bump(&self.denied_breaker);
    }

    pub fn denied_by_limiter(&self) {
        bump(&self.denied_limiter);
    }

    /// Count a finished cycle by its status, plus its spend.
    pub fn record_outcome(&self, outcome: &FixOutcome) {
        match outcome.status {
            FixStatus::Fixed => bump(&self.fixes_succeeded),
            FixStatus::VerificationFailed | FixStatus::ApplyFailed | FixStatus::NoFix => {
                bump(&self.fixes_failed)
            }
            FixStatus::TimedOut => {
                bump(&self.timeouts);
                bump(&self.fixes_failed);
            }
            FixStatus::Unfixable => bump(&self.unfixable),
            FixStatus::Cancelled => bump(&self.cancelled),
            FixStatus::Busy => bump(&self.busy),
            FixStatus::Halted => bump(&self.halted),
            // counted by the specific denial hooks
            FixStatus::Denied => {}
        }
        self.tokens.fetch_add(outcome.tokens, Ordering::Relaxed);
        self.cost_micros
            .fetch_add((outcome.cost_usd * 1_000_000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, open_circuits: usize, cache_entries: usize) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            reports: load(&self.reports),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            fixes_succeeded: load(&self.fixes_succeeded),
            fixes_failed: load(&self.fixes_failed),
            denied_breaker: load(&self.denied_breaker),
            denied_limiter: load(&self.denied_limiter),
            unfixable: load(&self.unfixable),
            cancelled: load(&self.cancelled),
            busy: load(&self.busy),
            halted: load(&self.halted),
            timeouts: load(&self.timeouts),
            tokens: load(&self.tokens),
            cost_usd: load(&self.cost_micros) as f64 / 1_000_000.0,
            open_circuits,
            cache_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::ProjectId;

    #[test]
    fn test_outcomes_are_counted() {
        let metrics = Metrics::new();
        let project = ProjectId::from("todo");

        let mut fixed = FixOutcome::new(project.clone(), "h", FixStatus::Fixed);
        fixed.tokens = 1_500;
        fixed.cost_usd = 0.0125;
        metrics.record_outcome(&fixed);
        metrics.record_outcome(&FixOutcome::new(project.clone(), "h", FixStatus::TimedOut));
        metrics.record_outcome(&FixOutcome::new(project, "h", FixStatus::Busy));
        metrics.cache_lookup(true);
        metrics.cache_lookup(false);

        let snapshot = metrics.snapshot(2, 7);
        assert_eq!(snapshot.fixes_succeeded, 1);
        assert_eq!(snapshot.fixes_failed, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.busy, 1);
        assert_eq!(snapshot.tokens, 1_500);
        assert!((snapshot.cost_usd - 0.0125).abs() < 1e-9);
        assert_eq!((snapshot.cache_hits, snapshot.cache_misses), (1, 1));
        assert_eq!((snapshot.open_circuits, snapshot.cache_entries), (2, 7));
    }
}

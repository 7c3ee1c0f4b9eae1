use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::analytics::observer::OutcomeObserver;
use crate::http::outcome::{DispatchReport, Outcome};

#[derive(Debug, Default)]
pub struct Stats {
    pub admitted: AtomicU64,
    // Refused before admission (encoding or credential problems)
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    // Registry answered with a non-2xx status
    pub refused_by_registry: AtomicU64,
    pub failed: AtomicU64,

    pub last_wait_ms: AtomicU64,
    pub last_dispatch_latency_ms: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_wait(&self, ms: u64) {
        self.last_wait_ms.store(ms, Ordering::Relaxed);
    }

    pub fn log_stats(&self) {
        let admitted = self.admitted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let refused = self.refused_by_registry.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let wait = self.last_wait_ms.load(Ordering::Relaxed);
        let latency = self.last_dispatch_latency_ms.load(Ordering::Relaxed);

        info!(
            "STATS: Admitted: {} | Rejected: {} | Outcomes: {} OK, {} Refused, {} Failed | Last wait {}ms, Last dispatch {}ms",
            admitted, rejected, succeeded, refused, failed, wait, latency
        );
    }
}

impl OutcomeObserver for Stats {
    fn on_outcome(&self, report: &DispatchReport) {
        match &report.outcome {
            Outcome::Success { status, .. } if (200..300).contains(status) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Success { .. } => {
                self.refused_by_registry.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_dispatch_latency_ms
            .store(report.latency_ms, Ordering::Relaxed);
    }
}

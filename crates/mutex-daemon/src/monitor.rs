//! Exclusion monitor: counts how many processes are inside at once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use mutex_core::ProcessId;
use serde::Serialize;
use tracing::error;

/// Totals observed over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    /// Completed critical sections
    pub entries: u64,
    /// Largest number of processes inside at the same time
    pub max_concurrency: usize,
    /// Entries that found somebody else already inside
    pub violations: u64,
}

/// Shared by every demo process of a cluster.
#[derive(Debug, Default)]
pub struct ExclusionMonitor {
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    entries: AtomicU64,
    violations: AtomicU64,
}

impl ExclusionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `process` entering. Returns how many are inside now.
    pub fn enter(&self, process: ProcessId) -> usize {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        if now > 1 {
            self.violations.fetch_add(1, Ordering::SeqCst);
            error!(%process, inside = now, "Mutual exclusion violated");
        }
        now
    }

    pub fn exit(&self, _process: ProcessId) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.entries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inside(&self) -> usize {
        self.inside.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> MonitorReport {
        MonitorReport {
            entries: self.entries.load(Ordering::SeqCst),
            max_concurrency: self.max_inside.load(Ordering::SeqCst),
            violations: self.violations.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: u32) -> ProcessId {
        ProcessId::new(raw).unwrap()
    }

    #[test]
    fn test_sequential_entries_are_clean() {
        let monitor = ExclusionMonitor::new();
        for raw in 1..=3 {
            assert_eq!(monitor.enter(pid(raw)), 1);
            monitor.exit(pid(raw));
        }
        assert_eq!(
            monitor.report(),
            MonitorReport {
                entries: 3,
                max_concurrency: 1,
                violations: 0,
            }
        );
        assert_eq!(monitor.inside(), 0);
    }

    #[test]
    fn test_overlap_is_a_violation() {
        let monitor = ExclusionMonitor::new();
        monitor.enter(pid(1));
        assert_eq!(monitor.enter(pid(2)), 2);
        monitor.exit(pid(2));
        monitor.exit(pid(1));

        let report = monitor.report();
        assert_eq!(report.max_concurrency, 2);
        assert_eq!(report.violations, 1);
        assert_eq!(report.entries, 2);
    }
}

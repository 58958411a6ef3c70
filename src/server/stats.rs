//! Session manager statistics.
//!
//! A small serialized counter bundle. Counters are mutated from the
//! manager task at the end of each relevant continuation and read from
//! any thread as a consistent snapshot.

use std::sync::{Mutex, MutexGuard};

/// Snapshot of the manager's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// Sessions currently serving a client.
    pub active_sessions: usize,
    /// Session handles held for reuse.
    pub recycled_sessions: usize,
    /// Connections accepted since start (or the last reset).
    pub total_accepted: u64,
    /// Accept attempts that failed, recoverable or fatal.
    pub accept_errors: u64,
    /// Sessions that wound down cleanly.
    pub total_stopped: u64,
    /// Sessions that wound down carrying an error.
    pub stop_errors: u64,
}

/// Counter bundle behind a short critical section.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    inner: Mutex<ManagerStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerStats> {
        // Plain-old-data guarded here; recover from poisoning.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish the current active-list length.
    pub fn set_active_session_count(&self, count: usize) {
        self.lock().active_sessions = count;
    }

    /// Publish the current recycled-pool length.
    pub fn set_recycled_session_count(&self, count: usize) {
        self.lock().recycled_sessions = count;
    }

    /// Record one accept outcome.
    pub fn session_accepted(&self, failed: bool) {
        let mut stats = self.lock();
        if failed {
            stats.accept_errors += 1;
        } else {
            stats.total_accepted += 1;
        }
    }

    /// Record one session-stop outcome.
    pub fn session_stopped(&self, failed: bool) {
        let mut stats = self.lock();
        if failed {
            stats.stop_errors += 1;
        } else {
            stats.total_stopped += 1;
        }
    }

    /// Consistent snapshot of every counter.
    pub fn snapshot(&self) -> ManagerStats {
        *self.lock()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        *self.lock() = ManagerStats::default();
    }
}

//! Per-handler counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters of one handler, updated by whichever thread delivers.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    /// Records waiting in the queue (queued handlers only)
    queue_len: AtomicUsize,
    /// Records written by the sink
    write_count: AtomicU64,
    /// Records that failed to format or write
    failure_count: AtomicU64,
    /// Records rejected by a full queue with the drop policy
    dropped_count: AtomicU64,
    /// File rotations performed
    rotation_count: AtomicU64,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_write_count(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_failure_count(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_dropped_count(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_rotation_count(&self) {
        self.rotation_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            write_count: self.write_count(),
            failure_count: self.failure_count(),
            dropped_count: self.dropped_count(),
            rotation_count: self.rotation_count(),
        }
    }
}

/// Point-in-time copy of [`HandlerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub write_count: u64,
    pub failure_count: u64,
    pub dropped_count: u64,
    pub rotation_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = HandlerMetrics::new();
        metrics.inc_write_count();
        metrics.inc_write_count();
        metrics.inc_dropped_count();
        metrics.inc_rotation_count();
        metrics.set_queue_len(4);

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                queue_len: 4,
                write_count: 2,
                failure_count: 0,
                dropped_count: 1,
                rotation_count: 1,
            }
        );
    }
}

// Global in-flight frame accounting. A frame holds one slot from admission
// until its handler completes; the RAII guard releases the slot even when the
// task is shed from the worker queue before running.
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use relay_metrics::MetricsRegistry;

#[derive(Debug)]
pub struct OverloadController {
    inflight: AtomicI64,
    max_inflight: i64,
    metrics: Arc<MetricsRegistry>,
}

impl OverloadController {
    pub fn new(max_inflight: u32, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inflight: AtomicI64::new(0),
            max_inflight: i64::from(max_inflight),
            metrics,
        })
    }

    /// Claim an in-flight slot, or refuse when the cap is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<InflightGuard> {
        let prev = self.inflight.fetch_add(1, Ordering::AcqRel);
        if self.max_inflight > 0 && prev >= self.max_inflight {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        self.metrics.inflight_frames.inc();
        Some(InflightGuard {
            controller: Arc::clone(self),
        })
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }
}

/// Releases its in-flight slot on drop.
#[derive(Debug)]
pub struct InflightGuard {
    controller: Arc<OverloadController>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.controller.inflight.fetch_sub(1, Ordering::AcqRel);
        self.controller.metrics.inflight_frames.dec();
    }
}

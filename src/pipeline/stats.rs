//! Pipeline counters shared between the worker and the control handle

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
struct Counters {
    frames_delivered: AtomicU64,
    buffers_released: AtomicU64,
    stale_returns: AtomicU64,
    acquire_errors: AtomicU64,
}

#[derive(Default)]
pub struct PipelineStats {
    counters: CachePadded<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_delivered: u64,
    pub buffers_released: u64,
    pub stale_returns: u64,
    pub acquire_errors: u64,
}

impl PipelineStats {
    pub(crate) fn frame_delivered(&self) {
        self.counters
            .frames_delivered
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camhal_frames_delivered").increment(1);
    }

    pub(crate) fn buffer_released(&self) {
        self.counters
            .buffers_released
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camhal_buffers_released").increment(1);
    }

    pub(crate) fn stale_return(&self) {
        self.counters.stale_returns.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camhal_stale_returns").increment(1);
    }

    pub(crate) fn acquire_error(&self) {
        self.counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camhal_acquire_errors").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_delivered: self.counters.frames_delivered.load(Ordering::Relaxed),
            buffers_released: self.counters.buffers_released.load(Ordering::Relaxed),
            stale_returns: self.counters.stale_returns.load(Ordering::Relaxed),
            acquire_errors: self.counters.acquire_errors.load(Ordering::Relaxed),
        }
    }
}

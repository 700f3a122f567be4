//! Monotonic counters shared across tasks and threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    pub vision_requests: AtomicU64,
    pub vision_success: AtomicU64,
    pub vision_timeout: AtomicU64,
    pub false_triggers_prevented: AtomicU64,
    pub xrun_counter: AtomicU64,
    pub oversize_frames_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Counter handle used by the state machine's effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    VisionRequests,
    VisionSuccess,
    VisionTimeout,
    FalseTriggersPrevented,
    Xrun,
    OversizeFramesDropped,
}

impl Metrics {
    pub fn bump(&self, counter: Counter) {
        let cell = match counter {
            Counter::VisionRequests => &self.vision_requests,
            Counter::VisionSuccess => &self.vision_success,
            Counter::VisionTimeout => &self.vision_timeout,
            Counter::FalseTriggersPrevented => &self.false_triggers_prevented,
            Counter::Xrun => &self.xrun_counter,
            Counter::OversizeFramesDropped => &self.oversize_frames_dropped,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        let cell = match counter {
            Counter::VisionRequests => &self.vision_requests,
            Counter::VisionSuccess => &self.vision_success,
            Counter::VisionTimeout => &self.vision_timeout,
            Counter::FalseTriggersPrevented => &self.false_triggers_prevented,
            Counter::Xrun => &self.xrun_counter,
            Counter::OversizeFramesDropped => &self.oversize_frames_dropped,
        };
        cell.load(Ordering::Relaxed)
    }
}

//! Per-worker retargeting bookkeeping.

use crate::rate_buffer::RateBuffer;
use crate::types::Timestamp;

#[derive(Debug, Clone)]
pub(crate) struct WorkerState {
    /// Timestamp of the last share processed for this worker
    pub last_share: Timestamp,
    /// Timestamp of the last retarget evaluation
    pub last_retarget: Timestamp,
    /// Recent inter-share intervals
    pub buffer: RateBuffer,
}

impl WorkerState {
    /// Fresh state for a worker first seen at `now`.
    ///
    /// The retarget clock starts half a window in the past, so the first
    /// evaluation comes after half a window of shares rather than a full one.
    pub fn new(now: Timestamp, retarget_window: i64, capacity: usize) -> Self {
        Self {
            last_share: now,
            last_retarget: now - retarget_window / 2,
            buffer: RateBuffer::new(capacity),
        }
    }

    /// Whether the worker has been silent for longer than `expiry` seconds.
    pub fn is_idle(&self, now: Timestamp, expiry: i64) -> bool {
        self.last_share < now - expiry
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            last_share: self.last_share,
            last_retarget: self.last_retarget,
            samples: self.buffer.size(),
            average_interval: self.buffer.average(),
        }
    }
}

/// Read-only view of a worker's retargeting state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub last_share: Timestamp,
    pub last_retarget: Timestamp,
    /// Intervals currently in the averaging window
    pub samples: usize,
    /// Mean interval in seconds, if any samples exist
    pub average_interval: Option<f64>,
}

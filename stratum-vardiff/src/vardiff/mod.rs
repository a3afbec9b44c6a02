//! Variable difficulty retargeting.
//!
//! The connection layer calls [`VardiffController::submit`] once for every
//! accepted share. The controller keeps a short history of inter-share
//! intervals per worker and, at most once per retarget window, compares the
//! average interval with the target band:
//!
//! - too slow (average above the band): lower the difficulty, never below
//!   the configured minimum;
//! - too fast (average below the band): raise it, never above the configured
//!   maximum or, with capping enabled, the cached network difficulty;
//! - otherwise leave it alone.
//!
//! The proposed change is proportional, `current * target / average`, so a
//! worker twice as fast as wanted gets twice the difficulty. Changes smaller
//! than one unit are rounded away from zero to exactly one unit.
//!
//! # Concurrency
//!
//! Shares from different workers are processed fully in parallel; shares from
//! the same worker are serialized on that worker's lock. `submit` never
//! waits on I/O: persistence writes are queued to the recorder task and the
//! network difficulty is refreshed in the background.

mod worker;

pub use worker::WorkerSnapshot;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::VardiffConfig;
use crate::error::Result;
use crate::network::NetworkDifficultyCache;
use crate::persistence::DifficultyRecorder;
use crate::session::{Notification, SessionHandle};
use crate::tracing::prelude::*;
use crate::types::{unix_now, IntervalBand, RetargetBounds, Timestamp};
use worker::WorkerState;

/// What a call to [`VardiffController::submit`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubmitOutcome {
    /// First share from a new or returning idle worker; the pool default
    /// difficulty was recorded.
    Initialized,
    /// Interval recorded; not yet time to evaluate.
    Sampled,
    /// Evaluated; share rate is inside the target band.
    WithinBounds,
    /// Evaluated; too slow, but already at the minimum difficulty.
    Unchanged,
    /// Difficulty applied and the miner notified. `to` equals `from` when a
    /// fast worker is already at the ceiling.
    Retargeted { from: f64, to: f64 },
}

/// Per-worker difficulty controller.
pub struct VardiffController {
    config: VardiffConfig,
    bounds: RetargetBounds,
    capacity: usize,
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerState>>>>,
    network: Option<NetworkDifficultyCache>,
    recorder: DifficultyRecorder,
}

impl VardiffController {
    /// Create a controller.
    ///
    /// `network` is consulted only when `config.use_network_cap` is set.
    pub fn new(
        config: VardiffConfig,
        recorder: DifficultyRecorder,
        network: Option<NetworkDifficultyCache>,
    ) -> Result<Self> {
        config.validate()?;

        if config.use_network_cap && network.is_none() {
            warn!("Network difficulty cap enabled without a difficulty source, capping at max_difficulty only");
        }

        let bounds = config.bounds();
        let capacity = config.buffer_capacity();
        info!(
            band = %bounds,
            window_secs = config.retarget_window,
            min = config.min_difficulty,
            max = config.max_difficulty,
            network_cap = config.use_network_cap,
            "Vardiff configured"
        );

        Ok(Self {
            config,
            bounds,
            capacity,
            workers: RwLock::new(HashMap::new()),
            network,
            recorder,
        })
    }

    pub fn config(&self) -> &VardiffConfig {
        &self.config
    }

    pub fn bounds(&self) -> RetargetBounds {
        self.bounds
    }

    /// Number of workers currently tracked.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn snapshot(&self, worker: &str) -> Option<WorkerSnapshot> {
        let state = self.workers.read().get(worker).cloned()?;
        let snapshot = state.lock().snapshot();
        Some(snapshot)
    }

    /// Account for one accepted share and retarget the worker if due.
    ///
    /// `current_difficulty` is the difficulty the share was mined at and
    /// `timestamp` its arrival time. Must be called from within a Tokio
    /// runtime when network capping is enabled.
    pub fn submit(
        &self,
        session: &dyn SessionHandle,
        job_id: &str,
        current_difficulty: f64,
        timestamp: Timestamp,
        worker: &str,
    ) -> SubmitOutcome {
        let window = self.config.retarget_window as i64;
        let (entry, created) = self.worker_entry(worker, timestamp);
        let mut state = entry.lock();

        if created || state.is_idle(timestamp, self.config.idle_expiry as i64) {
            if !created {
                debug!(worker = %worker, last_share = state.last_share, "Worker returned from idle");
                *state = WorkerState::new(timestamp, window, self.capacity);
            }
            drop(state);
            debug!(worker = %worker, difficulty = self.config.pool_target, "Tracking worker");
            self.recorder.record(worker, self.config.pool_target);
            return SubmitOutcome::Initialized;
        }

        let interval = (timestamp - state.last_share) as f64;
        state.buffer.append(interval);
        state.last_share = timestamp;

        if timestamp - state.last_retarget < window {
            return SubmitOutcome::Sampled;
        }
        let Some(average) = state.buffer.average() else {
            return SubmitOutcome::Sampled;
        };

        state.last_retarget = timestamp;
        debug!(
            worker = %worker,
            difficulty = current_difficulty,
            average,
            band = %self.bounds,
            "Checking retarget"
        );

        if average < 1.0 {
            trace!(worker = %worker, average, "Average interval below one second, using 1");
        }
        let average = average.max(1.0);

        let Some(new_difficulty) = self.retarget(current_difficulty, average, timestamp) else {
            return match self.bounds.classify(average) {
                IntervalBand::Within => SubmitOutcome::WithinBounds,
                _ => SubmitOutcome::Unchanged,
            };
        };

        state.buffer.clear();
        drop(state);

        info!(
            worker = %worker,
            from = current_difficulty,
            to = new_difficulty,
            average,
            "Retargeting worker"
        );

        let job_id = job_id.to_string();
        session.update_session(&mut |s| {
            s.prev_difficulty = Some(s.difficulty);
            s.prev_job_id = Some(job_id.clone());
            s.difficulty = new_difficulty;
        });
        session.send_notification(Notification::SetDifficulty(new_difficulty));
        self.recorder.record(worker, new_difficulty);

        SubmitOutcome::Retargeted {
            from: current_difficulty,
            to: new_difficulty,
        }
    }

    /// New difficulty for a worker averaging `average` seconds per share, or
    /// `None` if no retarget applies.
    fn retarget(&self, current: f64, average: f64, now: Timestamp) -> Option<f64> {
        let min = self.config.min_difficulty;
        let proposed = current * (self.bounds.target() / average) - current;

        let new_difficulty = match self.bounds.classify(average) {
            IntervalBand::TooSlow if current > min => (current + proposed.min(-1.0)).max(min),
            // May land below `current` when the ceiling dropped under it.
            IntervalBand::TooFast => (current + proposed.max(1.0)).min(self.ceiling(now)),
            _ => return None,
        };

        Some(new_difficulty)
    }

    /// Highest difficulty a worker may be raised to.
    fn ceiling(&self, now: Timestamp) -> f64 {
        let max = self.config.max_difficulty;
        if !self.config.use_network_cap {
            return max;
        }
        let Some(network) = &self.network else {
            return max;
        };

        // This decision uses whatever is cached; a refresh only helps later ones.
        network.refresh_if_stale(now);
        match network.current() {
            Some(network_difficulty) => max.min(network_difficulty),
            None => max,
        }
    }

    fn worker_entry(&self, worker: &str, now: Timestamp) -> (Arc<Mutex<WorkerState>>, bool) {
        if let Some(state) = self.workers.read().get(worker) {
            return (state.clone(), false);
        }

        let mut workers = self.workers.write();
        let mut created = false;
        let state = workers
            .entry(worker.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(WorkerState::new(
                    now,
                    self.config.retarget_window as i64,
                    self.capacity,
                )))
            })
            .clone();
        (state, created)
    }

    /// Forget workers idle for longer than the idle expiry. Returns how many
    /// were removed.
    ///
    /// Workers held by an in-progress submit are left for the next sweep.
    pub fn evict_idle(&self, now: Timestamp) -> usize {
        let expiry = self.config.idle_expiry as i64;
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|_, state| {
            // Only the map holds it, and the map is write-locked.
            Arc::strong_count(state) > 1 || !state.lock().is_idle(now, expiry)
        });
        before - workers.len()
    }

    /// Periodically evict idle workers until `running` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, running: CancellationToken) {
        trace!("Sweeper started.");

        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = running.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = self.evict_idle(unix_now());
                    if evicted > 0 {
                        debug!(evicted, remaining = self.worker_count(), "Evicted idle workers");
                    }
                }
            }
        }

        trace!("Sweeper stopped.");
    }
}

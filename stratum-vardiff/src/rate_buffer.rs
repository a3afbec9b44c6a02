//! Moving average of inter-share intervals.
//!
//! A [`RateBuffer`] holds the most recent `capacity` samples. It appends
//! linearly until it fills, then overwrites the oldest sample in place, so
//! steady share traffic never reallocates.

/// Storage phase of a [`RateBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Fewer than `capacity` samples; new ones are pushed.
    Filling,
    /// Exactly `capacity` samples; `cursor` is the next slot to overwrite.
    Full { cursor: usize },
}

/// Fixed-capacity circular buffer of share intervals.
#[derive(Debug, Clone)]
pub struct RateBuffer {
    capacity: usize,
    samples: Vec<f64>,
    mode: Mode,
}

impl RateBuffer {
    /// Create an empty buffer holding at most `capacity` samples.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rate buffer capacity must be positive");
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            mode: Mode::Filling,
        }
    }

    /// Record a sample, evicting the oldest one once full.
    pub fn append(&mut self, value: f64) {
        match self.mode {
            Mode::Filling => {
                self.samples.push(value);
                if self.samples.len() == self.capacity {
                    self.mode = Mode::Full { cursor: 0 };
                }
            }
            Mode::Full { cursor } => {
                self.samples[cursor] = value;
                self.mode = Mode::Full {
                    cursor: (cursor + 1) % self.capacity,
                };
            }
        }
    }

    /// Arithmetic mean of the valid samples, or `None` if there are none.
    pub fn average(&self) -> Option<f64> {
        let count = self.size();
        if count == 0 {
            return None;
        }
        let sum: f64 = self.samples.iter().sum();
        Some(sum / count as f64)
    }

    /// Number of valid samples.
    pub fn size(&self) -> usize {
        match self.mode {
            Mode::Filling => self.samples.len(),
            Mode::Full { .. } => self.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        matches!(self.mode, Mode::Full { .. })
    }

    /// Drop all samples and start filling again from the beginning.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.mode = Mode::Filling;
    }
}

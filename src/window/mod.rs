pub mod metrics;

use std::collections::VecDeque;

pub use self::metrics::MetricWindows;

/// Errors raised when building or addressing sliding windows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window capacity must be at least 1")]
    ZeroCapacity,
    #[error("no metrics configured")]
    NoMetrics,
    #[error("metric {0:?} is configured more than once")]
    DuplicateMetric(String),
    #[error("unknown metric {0:?}")]
    UnknownMetric(String),
}

/// Fixed-capacity FIFO of scalar samples.
///
/// Pushing into a full window evicts the oldest sample first, so the window
/// always holds the most recent `capacity` pushes in arrival order. The
/// window does no locking of its own; owners that share it across tasks wrap
/// it in a mutex.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SlidingWindow {
    /// Creates an empty window. `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }

        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Appends a sample, dropping the oldest one if the window is full.
    #[inline]
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Returns a copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    /// Most recently pushed sample.
    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Admission planning for polling rounds
//!
//! Decides how many messages the subscriber may request and how to split
//! that number across concurrent receive calls.

/// Extra in-flight headroom above parallelism, in percent
///
/// Keeps the pool fed between polling rounds.
pub const IN_FLIGHT_OVERSHOOT_PERCENT: usize = 10;

/// Target number of admitted (queued + running) messages: `ceil(parallelism * 1.10)`
pub fn in_flight_ceiling(parallelism: usize) -> usize {
    let parallelism = parallelism.max(1);
    parallelism
        .saturating_mul(100 + IN_FLIGHT_OVERSHOOT_PERCENT)
        .div_ceil(100)
}

/// Per-round admission planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPlanner {
    ceiling: usize,
    max_batch_size: usize,
}

impl AdmissionPlanner {
    /// Create a planner for the given parallelism and backend batch limit
    pub fn new(parallelism: usize, max_batch_size: usize) -> Self {
        Self {
            ceiling: in_flight_ceiling(parallelism),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Target in-flight ceiling
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Largest batch requested from a single receive call
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Messages that can still be admitted given the current pool length
    pub fn idle_capacity(&self, pool_length: usize) -> usize {
        self.ceiling.saturating_sub(pool_length)
    }

    /// Split the idle capacity into per-request batch sizes
    ///
    /// Sizes are fixed before any request is issued: full batches first,
    /// then the remainder. Their sum equals the idle capacity, so running
    /// the requests concurrently can never overshoot the ceiling.
    pub fn plan(&self, pool_length: usize) -> Vec<usize> {
        let idle = self.idle_capacity(pool_length);
        let full = idle / self.max_batch_size;
        let remainder = idle % self.max_batch_size;

        let mut batches = vec![self.max_batch_size; full];
        if remainder > 0 {
            batches.push(remainder);
        }
        batches
    }
}

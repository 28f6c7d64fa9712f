use std::time::Duration;

/// Wall time spent in each phase of one training iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct IterationTiming {
    pub forward_backward: Duration,
    pub reduce: Duration,
    pub update: Duration,
}

impl IterationTiming {
    #[inline]
    pub fn total(&self) -> Duration {
        self.forward_backward + self.reduce + self.update
    }
}

/// Cumulative timings of a worker's training loop.
#[derive(Debug, Default, Clone)]
pub struct SolverMetrics {
    pub forward_backward_time: Duration,
    pub reduce_time: Duration,
    pub update_time: Duration,
    pub test_time: Duration,
    pub snapshot_time: Duration,

    pub iterations: u64,
    pub micro_batches: u64,
    pub test_runs: u64,
    pub snapshots: u64,
}

impl SolverMetrics {
    pub fn record_iteration(&mut self, timing: &IterationTiming, micro_batches: usize) {
        self.forward_backward_time += timing.forward_backward;
        self.reduce_time += timing.reduce;
        self.update_time += timing.update;
        self.iterations += 1;
        self.micro_batches += micro_batches as u64;
    }

    #[inline]
    pub fn record_test(&mut self, elapsed: Duration) {
        self.test_time += elapsed;
        self.test_runs += 1;
    }

    #[inline]
    pub fn record_snapshot(&mut self, elapsed: Duration) {
        self.snapshot_time += elapsed;
        self.snapshots += 1;
    }

    /// Mean time of a training iteration, zero before the first one.
    pub fn mean_iteration_time(&self) -> Duration {
        if self.iterations == 0 {
            return Duration::ZERO;
        }

        let total = self.forward_backward_time + self.reduce_time + self.update_time;
        Duration::from_nanos((total.as_nanos() / self.iterations as u128) as u64)
    }
}

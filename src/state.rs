use std::num::NonZeroUsize;

use comms::Scalar;

use crate::loss::SmoothedLoss;

/// Counters owned by the training loop, mutated only between iterations.
#[derive(Debug, Clone)]
pub struct TrainingState<T> {
    /// Amount of weight updates applied so far.
    pub iter: usize,

    /// The learning rate schedule's step, kept for the update rule.
    pub current_step: usize,

    pub loss: SmoothedLoss<T>,
}

impl<T: Scalar> TrainingState<T> {
    pub fn new(average_loss: NonZeroUsize) -> Self {
        Self {
            iter: 0,
            current_step: 0,
            loss: SmoothedLoss::new(average_loss),
        }
    }

    #[inline]
    pub fn inc_iter(&mut self) {
        self.iter += 1;
    }

    /// Moves the counters to a restored checkpoint, dropping the loss history.
    pub fn resume_at(&mut self, iter: usize, current_step: usize) {
        self.iter = iter;
        self.current_step = current_step;
        self.loss.reset();
    }
}

use std::num::NonZeroUsize;

use comms::Scalar;

/// Moving average of the training loss over the last `size` iterations.
#[derive(Debug, Clone)]
pub struct SmoothedLoss<T> {
    size: NonZeroUsize,
    window: Vec<T>,
    smoothed: T,
}

impl<T: Scalar> SmoothedLoss<T> {
    /// Creates a new `SmoothedLoss`.
    ///
    /// # Arguments
    /// * `size` - The amount of losses averaged together.
    ///
    /// # Returns
    /// A new empty `SmoothedLoss` instance.
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            size,
            window: Vec::with_capacity(size.get()),
            smoothed: T::default(),
        }
    }

    /// Feeds the loss of a new iteration.
    ///
    /// Until the window fills up the value is the mean of every loss seen, then
    /// it's the mean of the last `size` losses. The slot to replace is picked from
    /// the distance to `start_iter`, so a resumed run keeps its window aligned.
    ///
    /// # Arguments
    /// * `loss` - The loss of this iteration.
    /// * `iter` - The current iteration.
    /// * `start_iter` - The iteration the current run started at.
    ///
    /// # Returns
    /// The updated smoothed loss.
    pub fn update(&mut self, loss: T, iter: usize, start_iter: usize) -> T {
        let size = self.size.get();

        if self.window.len() < size {
            self.window.push(loss);
            let n = T::from_usize(self.window.len());
            self.smoothed = (self.smoothed * (n - T::from_usize(1)) + loss) / n;
        } else {
            let idx = (iter - start_iter) % size;
            self.smoothed += (loss - self.window[idx]) / T::from_usize(size);
            self.window[idx] = loss;
        }

        self.smoothed
    }

    /// The current smoothed value.
    #[inline]
    pub fn value(&self) -> T {
        self.smoothed
    }

    /// Forgets every loss seen.
    pub fn reset(&mut self) {
        self.window.clear();
        self.smoothed = T::default();
    }
}

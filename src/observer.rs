use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use comms::Scalar;
use log::warn;

use crate::{checkpoint::Checkpoint, evaluation::TestReport, metrics::IterationTiming};

/// Hooks the training loop calls into at fixed points of every iteration.
///
/// Every method does nothing by default.
#[allow(unused_variables)]
pub trait SolverObserver<T: Scalar>: Send {
    /// Before the forward and backward passes of iteration `iter`.
    fn on_start(&mut self, iter: usize) {}

    /// After the local gradients are computed, before they're reduced.
    fn on_gradients_ready(&mut self, iter: usize) {}

    /// On every display iteration, with the smoothed loss.
    fn on_display(&mut self, iter: usize, smoothed_loss: T) {}

    /// After a test run completes.
    fn on_test(&mut self, iter: usize, report: &TestReport<T>) {}

    /// After a checkpoint pair was written.
    fn on_snapshot(&mut self, checkpoint: &Checkpoint) {}

    /// After each iteration, with the time spent in each phase.
    fn on_timing(&mut self, iter: usize, timing: &IterationTiming) {}
}

/// Appends progress to `loss<rank>.txt` and `accuracy<rank>.txt`.
///
/// Each line holds the iteration and a value: the smoothed loss on display
/// iterations, the first score of every completed test run.
pub struct MetricsLog {
    loss: File,
    accuracy: File,
}

impl MetricsLog {
    /// Opens, or creates, the metrics files of `rank` inside `dir`.
    pub fn open(dir: impl AsRef<Path>, rank: usize) -> io::Result<Self> {
        let dir = dir.as_ref();
        let open = |name: String| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };

        Ok(Self {
            loss: open(format!("loss{rank}.txt"))?,
            accuracy: open(format!("accuracy{rank}.txt"))?,
        })
    }

    fn append(file: &mut File, iter: usize, value: impl std::fmt::Display) {
        if let Err(e) = writeln!(file, "{iter} {value}") {
            warn!(iter = iter; "failed to append metrics: {e}");
        }
    }
}

impl<T: Scalar> SolverObserver<T> for MetricsLog {
    fn on_display(&mut self, iter: usize, smoothed_loss: T) {
        Self::append(&mut self.loss, iter, smoothed_loss);
    }

    fn on_test(&mut self, iter: usize, report: &TestReport<T>) {
        if let Some(score) = report.scores.first() {
            Self::append(&mut self.accuracy, iter, score.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::evaluation::OutputScore;

    #[test]
    fn lines_are_appended_per_rank() {
        let dir = TempDir::new().unwrap();

        {
            let mut log = MetricsLog::open(dir.path(), 3).unwrap();
            SolverObserver::<f32>::on_display(&mut log, 10, 0.5);
            SolverObserver::<f32>::on_display(&mut log, 20, 0.25);

            let report = TestReport {
                net_id: 0,
                loss: None,
                scores: vec![OutputScore {
                    name: "accuracy".to_string(),
                    value: 0.75_f32,
                    loss_weight: 0.0,
                }],
            };
            log.on_test(20, &report);
        }

        let mut log = MetricsLog::open(dir.path(), 3).unwrap();
        SolverObserver::<f32>::on_display(&mut log, 30, 0.125);

        let loss = fs::read_to_string(dir.path().join("loss3.txt")).unwrap();
        assert_eq!(loss, "10 0.5\n20 0.25\n30 0.125\n");

        let accuracy = fs::read_to_string(dir.path().join("accuracy3.txt")).unwrap();
        assert_eq!(accuracy, "20 0.75\n");
    }
}

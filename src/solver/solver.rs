use std::{ops::ControlFlow, path::Path, time::Instant};

use comms::Scalar;
use log::{debug, info};

use crate::{
    checkpoint::{Checkpoint, CheckpointManager, Restored},
    collective::Collective,
    config::SolverConfig,
    control::{ControlRequest, ControlSource},
    error::{Result, SolverErr},
    evaluation::{EvalType, OutputScore, TestOutcome, TestReport, TestRunSpec, classify, detect},
    metrics::{IterationTiming, SolverMetrics},
    net::{ParamBlob, TestNet, TrainNet},
    observer::SolverObserver,
    params::{Field, ParamAggregator},
    state::TrainingState,
};

/// Where the training loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Testing,
    Snapshotting,
    Stopped,
}

/// How a call to `solve` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveOutcome {
    /// The amount of weight updates applied.
    pub iter: usize,
    pub requested_early_exit: bool,
}

/// The training loop of a single worker.
///
/// Every worker of the group runs one, they meet at each collective call: the
/// initial parameter broadcast, the gradient reduction of every iteration and
/// the score reduction of classification tests.
pub struct Solver<T: Scalar, C> {
    pub(super) config: SolverConfig,
    pub(super) net: Box<dyn TrainNet<T>>,
    pub(super) test_nets: Vec<Box<dyn TestNet<T>>>,
    pub(super) test_specs: Vec<TestRunSpec>,
    pub(super) collective: C,
    pub(super) control: Box<dyn ControlSource>,
    pub(super) observers: Vec<Box<dyn SolverObserver<T>>>,
    pub(super) checkpoints: CheckpointManager,
    pub(super) aggregator: ParamAggregator<T>,
    pub(super) state: TrainingState<T>,
    pub(super) start_iter: usize,
    pub(super) phase: Phase,
    pub(super) requested_early_exit: bool,
    pub(super) metrics: SolverMetrics,
}

impl<T: Scalar, C: Collective<T>> Solver<T, C> {
    /// Runs the optimization up to `max_iter` updates.
    ///
    /// A worker that stops early may leave its peers waiting on a collective
    /// call, for instance when the stop cut a classification test short on this
    /// worker only. After an early exit, drop the solver or shut down its
    /// collective (see `into_collective`) so the rest of the group fails instead
    /// of waiting.
    ///
    /// # Arguments
    /// * `resume` - A solver state artifact to resume from, every worker must
    ///   pass the same one.
    ///
    /// # Returns
    /// The amount of updates applied and whether a stop was requested, or the
    /// first fatal error.
    pub async fn solve(&mut self, resume: Option<&Path>) -> Result<SolveOutcome> {
        let rank = self.collective.rank();
        if rank == 0 {
            info!("solving {}", self.net.name());
        }

        self.requested_early_exit = false;

        if self.config.snapshot_interval > 0 {
            self.checkpoints.check_write_permissions(self.state.iter)?;
        }

        if let Some(path) = resume {
            self.restore(path)?;
        }

        self.broadcast_params().await?;
        self.phase = Phase::Running;

        let iters = self.config.max_iter.saturating_sub(self.state.iter);
        self.step(iters).await?;

        let iter = self.state.iter;
        let interval = self.config.snapshot_interval;
        if !self.requested_early_exit
            && self.config.snapshot_after_train
            && (interval == 0 || iter % interval != 0)
        {
            self.snapshot()?;
        }

        if self.requested_early_exit {
            if rank == 0 {
                info!("optimization stopped early at iteration {iter}");
            }
            return Ok(self.stop());
        }

        let display = self.config.display;
        if display > 0 && iter % display == 0 {
            let loss = self.net.forward()?;
            let smoothed = self.state.loss.update(loss, iter, self.start_iter);
            if rank == 0 {
                info!("Iteration {iter}, loss = {smoothed}");
            }
        }

        let test_interval = self.config.test_interval;
        if test_interval > 0 && iter % test_interval == 0 {
            self.test_all().await?;
        }

        if rank == 0 {
            info!("optimization done");
        }
        Ok(self.stop())
    }

    /// Runs `iters` training iterations, or fewer if a stop is requested.
    ///
    /// The smoothed loss starts over on every call.
    pub async fn step(&mut self, iters: usize) -> Result<()> {
        let start_iter = self.state.iter;
        let stop_iter = start_iter + iters;
        self.start_iter = start_iter;
        self.state.loss.reset();
        self.phase = Phase::Running;

        while self.state.iter < stop_iter {
            let iter = self.state.iter;

            if self.test_due(iter) {
                self.test_all().await?;
                if self.requested_early_exit {
                    break;
                }
            }

            for observer in &mut self.observers {
                observer.on_start(iter);
            }

            let mut timing = IterationTiming::default();
            let iter_size = self.config.iter_size.get();

            let now = Instant::now();
            self.net.clear_param_diffs();
            let mut loss = T::default();
            for _ in 0..iter_size {
                loss += self.net.forward_backward()?;
            }
            loss = loss / T::from_usize(iter_size);
            timing.forward_backward = now.elapsed();

            let smoothed = self.state.loss.update(loss, iter, start_iter);
            let display = self.config.display;
            if display > 0 && iter % display == 0 {
                self.display(iter, smoothed);
            }

            for observer in &mut self.observers {
                observer.on_gradients_ready(iter);
            }

            let now = Instant::now();
            self.reduce_gradients().await?;
            timing.reduce = now.elapsed();

            if !self.config.disabled_update {
                let now = Instant::now();
                self.net.apply_update(iter)?;
                timing.update = now.elapsed();
            }

            self.state.inc_iter();
            self.state.current_step = self.net.current_step();
            self.metrics.record_iteration(&timing, iter_size);
            for observer in &mut self.observers {
                observer.on_timing(iter, &timing);
            }

            let request = self.control.poll();
            let iter = self.state.iter;
            let interval = self.config.snapshot_interval;
            if request == ControlRequest::Snapshot || (interval > 0 && iter % interval == 0) {
                self.snapshot()?;
            }

            if request == ControlRequest::Stop {
                debug!(rank = self.collective.rank(); "stop requested after iteration {iter}");
                self.requested_early_exit = true;
                break;
            }
        }

        Ok(())
    }

    /// Runs every test net once, in id order.
    ///
    /// A stop request interrupts the current test net and skips the rest, a
    /// snapshot request is served once the test nets are done.
    pub async fn test_all(&mut self) -> Result<()> {
        let iter = self.state.iter;
        let rank = self.collective.rank();
        self.phase = Phase::Testing;
        let mut snapshot_requested = false;

        for id in 0..self.test_nets.len() {
            if self.requested_early_exit {
                break;
            }

            let spec = self.test_specs[id].clone();
            if rank == 0 {
                info!("Iteration {iter}, Testing net (#{id})");
            }

            let started = Instant::now();
            let net = self.test_nets[id].as_mut();
            net.share_trained_layers_with(self.net.params())?;

            let control = &mut self.control;
            let mut poll = || match control.poll() {
                ControlRequest::Stop => ControlFlow::Break(()),
                ControlRequest::Snapshot => {
                    snapshot_requested = true;
                    ControlFlow::Continue(())
                }
                ControlRequest::None => ControlFlow::Continue(()),
            };

            let outcome = match spec.eval_type {
                EvalType::Classification => {
                    classify(net, &spec, &mut self.collective, &mut poll).await?
                }
                EvalType::Detection => detect(net, &spec, &mut poll)?,
            };
            self.metrics.record_test(started.elapsed());

            match outcome {
                TestOutcome::Completed(report) => self.report_test(iter, &report),
                TestOutcome::Interrupted => {
                    if rank == 0 {
                        info!("test net (#{id}) interrupted at iteration {iter}");
                    }
                    self.requested_early_exit = true;
                }
            }
        }

        self.phase = Phase::Running;
        if snapshot_requested {
            self.snapshot()?;
        }

        Ok(())
    }

    /// Writes the current parameters and solver state, on the root worker only.
    ///
    /// # Returns
    /// The written pair, `None` if this worker doesn't write.
    pub fn snapshot(&mut self) -> Result<Option<Checkpoint>> {
        let previous = std::mem::replace(&mut self.phase, Phase::Snapshotting);
        let started = Instant::now();

        let written = self.checkpoints.snapshot(
            self.state.iter,
            self.state.current_step,
            self.net.params(),
            self.net.optimizer_state(),
        );
        self.phase = previous;

        let checkpoint = written?;
        if let Some(checkpoint) = &checkpoint {
            self.metrics.record_snapshot(started.elapsed());
            for observer in &mut self.observers {
                observer.on_snapshot(checkpoint);
            }
        }

        Ok(checkpoint)
    }

    /// Loads a checkpoint pair into the train net and moves the counters to it.
    ///
    /// # Arguments
    /// * `state_path` - The solver state artifact of the pair.
    pub fn restore(&mut self, state_path: &Path) -> Result<()> {
        let restored: Restored<T> = self.checkpoints.restore(state_path)?;

        load_params(self.net.params_mut(), &restored.params)?;
        self.net.restore_optimizer_state(restored.history)?;
        self.net.set_current_step(restored.current_step);
        self.state.resume_at(restored.iter, restored.current_step);

        if self.collective.rank() == 0 {
            info!(
                "resuming at iteration {} from {}",
                restored.iter,
                restored.model.display()
            );
        }

        Ok(())
    }

    pub fn iter(&self) -> usize {
        self.state.iter
    }

    pub fn current_step(&self) -> usize {
        self.state.current_step
    }

    pub fn smoothed_loss(&self) -> T {
        self.state.loss.value()
    }

    pub fn requested_early_exit(&self) -> bool {
        self.requested_early_exit
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metrics(&self) -> &SolverMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// The trained model.
    pub fn net(&self) -> &dyn TrainNet<T> {
        self.net.as_ref()
    }

    /// Gives back the worker group handle, e.g. to shut it down.
    pub fn into_collective(self) -> C {
        self.collective
    }

    fn test_due(&self, iter: usize) -> bool {
        let interval = self.config.test_interval;
        interval > 0
            && iter % interval == 0
            && (iter > 0 || self.config.test_initialization)
    }

    fn stop(&mut self) -> SolveOutcome {
        self.phase = Phase::Stopped;
        SolveOutcome {
            iter: self.state.iter,
            requested_early_exit: self.requested_early_exit,
        }
    }

    /// Makes every worker start from the root's parameters.
    async fn broadcast_params(&mut self) -> Result<()> {
        let flat = self.aggregator.flatten(self.net.params(), Field::Data)?;
        self.collective.broadcast(flat, 0).await?;
        self.aggregator.scatter(self.net.params_mut(), Field::Data)?;

        debug!(rank = self.collective.rank(); "parameters synchronized with the root");
        Ok(())
    }

    /// Replaces every worker's gradients with their sum over the group.
    async fn reduce_gradients(&mut self) -> Result<()> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }

        let flat = self.aggregator.flatten(self.net.params(), Field::Diff)?;
        self.collective.all_reduce_sum(flat).await?;
        self.aggregator.scatter(self.net.params_mut(), Field::Diff)
    }

    fn display(&mut self, iter: usize, smoothed: T) {
        if self.collective.rank() == 0 {
            info!("Iteration {iter}, loss = {smoothed}");

            let mut index = 0;
            for output in self.net.outputs() {
                for &value in &output.data {
                    let score = OutputScore {
                        name: output.name.clone(),
                        value,
                        loss_weight: output.loss_weight,
                    };
                    info!("    Train net output #{index}: {score}");
                    index += 1;
                }
            }
        }

        for observer in &mut self.observers {
            observer.on_display(iter, smoothed);
        }
    }

    fn report_test(&mut self, iter: usize, report: &TestReport<T>) {
        if self.collective.rank() == 0 {
            if let Some(loss) = report.loss {
                info!("Test loss: {loss}");
            }
            for (i, score) in report.scores.iter().enumerate() {
                info!("    Test net output #{i}: {score}");
            }
        }

        for observer in &mut self.observers {
            observer.on_test(iter, report);
        }
    }
}

/// Copies restored parameter values into the train net, blob by blob.
fn load_params<T: Scalar>(params: &mut [ParamBlob<T>], saved: &[ParamBlob<T>]) -> Result<()> {
    if params.len() != saved.len() {
        return Err(SolverErr::LayoutMismatch {
            blob: params.len().min(saved.len()),
            got: saved.len(),
            expected: params.len(),
        });
    }

    for (i, (blob, saved)) in params.iter_mut().zip(saved).enumerate() {
        if blob.count() != saved.count() {
            return Err(SolverErr::LayoutMismatch {
                blob: i,
                got: saved.count(),
                expected: blob.count(),
            });
        }

        blob.data.copy_from_slice(&saved.data);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restored_blobs_must_match_the_net() {
        let mut params = vec![
            ParamBlob::new("w", vec![0.0_f32; 3]),
            ParamBlob::new("b", vec![0.0_f32]),
        ];

        let saved = vec![
            ParamBlob {
                name: "w".to_string(),
                data: vec![1.0, 2.0, 3.0],
                diff: Vec::new(),
            },
            ParamBlob {
                name: "b".to_string(),
                data: vec![4.0],
                diff: Vec::new(),
            },
        ];
        load_params(&mut params, &saved).unwrap();
        assert_eq!(params[0].data, vec![1.0, 2.0, 3.0]);
        assert_eq!(params[1].data, vec![4.0]);
        assert_eq!(params[0].diff, vec![0.0; 3]);

        let short = &saved[..1];
        assert!(matches!(
            load_params(&mut params, short),
            Err(SolverErr::LayoutMismatch { got: 1, expected: 2, .. })
        ));

        let resized = vec![ParamBlob::new("w", vec![1.0_f32; 2]), saved[1].clone()];
        assert!(matches!(
            load_params(&mut params, &resized),
            Err(SolverErr::LayoutMismatch { blob: 0, .. })
        ));
    }
}

use comms::Scalar;
use log::info;

use super::{Phase, Solver};
use crate::{
    checkpoint::CheckpointManager,
    collective::Collective,
    config::SolverConfig,
    control::{ControlSource, NoControl},
    error::Result,
    metrics::SolverMetrics,
    net::NetFactory,
    observer::SolverObserver,
    params::ParamAggregator,
    state::TrainingState,
};

/// Assembles a `Solver` from its configuration and collaborators.
pub struct SolverBuilder<T: Scalar, C> {
    config: SolverConfig,
    collective: C,
    control: Box<dyn ControlSource>,
    observers: Vec<Box<dyn SolverObserver<T>>>,
}

impl<T: Scalar, C: Collective<T>> SolverBuilder<T, C> {
    /// Creates a new `SolverBuilder`.
    ///
    /// # Arguments
    /// * `config` - The solver's configuration, validated on `build`.
    /// * `collective` - This worker's handle on the worker group.
    ///
    /// # Returns
    /// A builder with no control source and no observers.
    pub fn new(config: SolverConfig, collective: C) -> Self {
        Self {
            config,
            collective,
            control: Box::new(NoControl),
            observers: Vec::new(),
        }
    }

    /// Sets the source of stop and snapshot requests.
    pub fn control(mut self, control: impl ControlSource + 'static) -> Self {
        self.control = Box::new(control);
        self
    }

    /// Adds an observer, observers are called in the order they were added.
    pub fn observer(mut self, observer: impl SolverObserver<T> + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Validates the configuration and builds every net.
    ///
    /// # Arguments
    /// * `factory` - Builds the train net and each test net from their sources.
    ///
    /// # Returns
    /// A solver ready to `solve`, or the first configuration or net error.
    pub fn build(self, factory: &mut dyn NetFactory<T>) -> Result<Solver<T, C>> {
        let config = self.config;
        config.validate()?;

        let rank = self.collective.rank();
        let is_root = rank == 0;

        let train_source = config.train_net_source()?;
        if is_root {
            info!("creating training net from {train_source}");
        }
        let net = factory.train_net(&train_source)?;

        let test_nets = config
            .test_net_sources()?
            .iter()
            .enumerate()
            .map(|(id, source)| {
                if is_root {
                    info!("creating test net (#{id}) from {source}");
                }
                factory.test_net(id, source)
            })
            .collect::<Result<Vec<_>>>()?;

        let test_specs = config.test_run_specs()?;

        let checkpoints = CheckpointManager::new(
            config.snapshot_prefix.clone(),
            config.snapshot_format,
            config.snapshot_diff,
            is_root,
        );

        let aggregator = ParamAggregator::new(net.params());
        let state = TrainingState::new(config.average_loss);

        if is_root {
            info!(
                world_size = self.collective.world_size();
                "solver scaffolding done, {} parameters in {} blobs",
                aggregator.len(),
                net.params().len()
            );
        }

        Ok(Solver {
            config,
            net,
            test_nets,
            test_specs,
            collective: self.collective,
            control: self.control,
            observers: self.observers,
            checkpoints,
            aggregator,
            state,
            start_iter: 0,
            phase: Phase::Init,
            requested_early_exit: false,
            metrics: SolverMetrics::default(),
        })
    }
}

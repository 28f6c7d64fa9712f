#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use solver::{
    Checkpoint, NetFactory, NetSource, OutputBlob, ParamBlob, Result, SolverConfig, SolverErr,
    SolverObserver, TestNet, TrainNet, evaluation::TestReport,
};

pub const DIMS: usize = 4;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mk_config(value: Value) -> SolverConfig {
    serde_json::from_value(value).unwrap()
}

pub fn bits(params: &[ParamBlob<f32>]) -> Vec<Vec<u32>> {
    params
        .iter()
        .map(|blob| blob.data.iter().map(|x| x.to_bits()).collect())
        .collect()
}

fn quadratic_loss(params: &[ParamBlob<f32>], targets: &[Vec<f32>]) -> f32 {
    params
        .iter()
        .zip(targets)
        .flat_map(|(blob, target)| blob.data.iter().zip(target))
        .map(|(x, t)| 0.5 * (x - t) * (x - t))
        .sum()
}

/// Pulls every parameter towards a per rank target, with momentum SGD.
pub struct QuadraticNet {
    params: Vec<ParamBlob<f32>>,
    targets: Vec<Vec<f32>>,
    velocity: Vec<Vec<f32>>,
    outputs: Vec<OutputBlob<f32>>,
    pub lr: f32,
    pub momentum: f32,
    pub stepsize: usize,
    current_step: usize,
}

impl QuadraticNet {
    pub fn new(rank: usize) -> Self {
        let scale = rank as f32 + 1.0;
        let weights: Vec<f32> = (0..DIMS).map(|i| scale * (i as f32 - 1.5)).collect();
        let params = vec![
            ParamBlob::new("ip/weight", weights),
            ParamBlob::new("ip/bias", vec![-scale]),
        ];

        let targets = vec![vec![1.0 + rank as f32; DIMS], vec![0.5]];
        let velocity = params.iter().map(|blob| vec![0.0; blob.count()]).collect();

        Self {
            params,
            targets,
            velocity,
            outputs: Vec::new(),
            lr: 0.1,
            momentum: 0.5,
            stepsize: 3,
            current_step: 0,
        }
    }

    fn evaluate(&mut self) -> f32 {
        let loss = quadratic_loss(&self.params, &self.targets);
        self.outputs = vec![OutputBlob::new("loss", vec![loss]).with_loss_weight(1.0)];
        loss
    }
}

impl TrainNet<f32> for QuadraticNet {
    fn name(&self) -> &str {
        "quadratic"
    }

    fn forward_backward(&mut self) -> Result<f32> {
        let loss = self.evaluate();
        for (blob, target) in self.params.iter_mut().zip(&self.targets) {
            for ((d, x), t) in blob.diff.iter_mut().zip(&blob.data).zip(target) {
                *d += x - t;
            }
        }
        Ok(loss)
    }

    fn forward(&mut self) -> Result<f32> {
        Ok(self.evaluate())
    }

    fn outputs(&self) -> &[OutputBlob<f32>] {
        &self.outputs
    }

    fn clear_param_diffs(&mut self) {
        for blob in &mut self.params {
            blob.diff.iter_mut().for_each(|d| *d = 0.0);
        }
    }

    fn params(&self) -> &[ParamBlob<f32>] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [ParamBlob<f32>] {
        &mut self.params
    }

    fn apply_update(&mut self, iter: usize) -> Result<()> {
        self.current_step = iter / self.stepsize;
        let rate = self.lr * 0.5_f32.powi(self.current_step as i32);

        for (blob, velocity) in self.params.iter_mut().zip(&mut self.velocity) {
            for ((x, d), v) in blob.data.iter_mut().zip(&blob.diff).zip(velocity.iter_mut()) {
                *v = self.momentum * *v + rate * d;
                *x -= *v;
            }
        }
        Ok(())
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_current_step(&mut self, step: usize) {
        self.current_step = step;
    }

    fn optimizer_state(&self) -> Vec<Vec<f32>> {
        self.velocity.clone()
    }

    fn restore_optimizer_state(&mut self, history: Vec<Vec<f32>>) -> Result<()> {
        let fits = history.len() == self.velocity.len()
            && history.iter().zip(&self.velocity).all(|(h, v)| h.len() == v.len());
        if !fits {
            return Err(SolverErr::Net("optimizer history doesn't fit the net".into()));
        }

        self.velocity = history;
        Ok(())
    }
}

/// Scores how far the shared parameters are from the rank's targets.
pub struct QuadraticTestNet {
    params: Vec<ParamBlob<f32>>,
    targets: Vec<Vec<f32>>,
    outputs: Vec<OutputBlob<f32>>,
    pub passes: Arc<Mutex<usize>>,
}

impl TestNet<f32> for QuadraticTestNet {
    fn share_trained_layers_with(&mut self, params: &[ParamBlob<f32>]) -> Result<()> {
        self.params = params.to_vec();
        Ok(())
    }

    fn forward(&mut self) -> Result<f32> {
        *self.passes.lock() += 1;

        let loss = quadratic_loss(&self.params, &self.targets);
        let distance: f32 = self
            .params
            .iter()
            .zip(&self.targets)
            .flat_map(|(blob, target)| blob.data.iter().zip(target))
            .map(|(x, t)| (x - t).abs())
            .sum();

        self.outputs = vec![
            OutputBlob::new("distance", vec![distance]),
            OutputBlob::new("loss", vec![loss]).with_loss_weight(1.0),
        ];
        Ok(loss)
    }

    fn outputs(&self) -> &[OutputBlob<f32>] {
        &self.outputs
    }
}

/// Builds quadratic nets for one rank, recording what it was asked for.
pub struct QuadraticFactory {
    rank: usize,
    pub sources: Vec<NetSource>,
    pub test_passes: Arc<Mutex<usize>>,
}

impl QuadraticFactory {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            sources: Vec::new(),
            test_passes: Arc::default(),
        }
    }
}

impl NetFactory<f32> for QuadraticFactory {
    fn train_net(&mut self, source: &NetSource) -> Result<Box<dyn TrainNet<f32>>> {
        self.sources.push(source.clone());
        Ok(Box::new(QuadraticNet::new(self.rank)))
    }

    fn test_net(&mut self, _id: usize, source: &NetSource) -> Result<Box<dyn TestNet<f32>>> {
        self.sources.push(source.clone());
        let net = QuadraticNet::new(self.rank);

        Ok(Box::new(QuadraticTestNet {
            params: net.params,
            targets: net.targets,
            outputs: Vec::new(),
            passes: self.test_passes.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(usize),
    GradientsReady(usize),
    Display(usize),
    Test { iter: usize, distance: f32 },
    Snapshot(usize),
    Timing(usize),
}

/// Records every observer call, the log is shared with the test.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn tests(&self) -> Vec<(usize, f32)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Test { iter, distance } => Some((iter, distance)),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Snapshot(iter) => Some(iter),
                _ => None,
            })
            .collect()
    }
}

impl SolverObserver<f32> for Recorder {
    fn on_start(&mut self, iter: usize) {
        self.events.lock().push(Event::Start(iter));
    }

    fn on_gradients_ready(&mut self, iter: usize) {
        self.events.lock().push(Event::GradientsReady(iter));
    }

    fn on_display(&mut self, iter: usize, _smoothed_loss: f32) {
        self.events.lock().push(Event::Display(iter));
    }

    fn on_test(&mut self, iter: usize, report: &TestReport<f32>) {
        let distance = report.scores.first().map_or(f32::NAN, |score| score.value);
        self.events.lock().push(Event::Test { iter, distance });
    }

    fn on_snapshot(&mut self, checkpoint: &Checkpoint) {
        self.events.lock().push(Event::Snapshot(checkpoint.iter));
    }

    fn on_timing(&mut self, iter: usize, _timing: &solver::metrics::IterationTiming) {
        self.events.lock().push(Event::Timing(iter));
    }
}

use std::{fmt, path::PathBuf};

use comms::Scalar;

use crate::error::Result;

/// A single named, trainable buffer of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBlob<T> {
    pub name: String,
    pub data: Vec<T>,
    pub diff: Vec<T>,
}

impl<T: Scalar> ParamBlob<T> {
    /// Creates a blob holding `data` with a zeroed gradient of the same size.
    pub fn new(name: impl Into<String>, data: Vec<T>) -> Self {
        let diff = vec![T::default(); data.len()];
        Self {
            name: name.into(),
            data,
            diff,
        }
    }

    /// The amount of elements of this blob.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.len()
    }
}

/// An output of a net after a forward pass.
///
/// `data` holds `data.len() / width` rows, detection outputs have a width of 5.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBlob<T> {
    pub name: String,
    pub loss_weight: T,
    pub width: usize,
    pub data: Vec<T>,
}

impl<T: Scalar> OutputBlob<T> {
    /// Creates a single row output with a zero loss weight.
    pub fn new(name: impl Into<String>, data: Vec<T>) -> Self {
        let width = data.len().max(1);
        Self {
            name: name.into(),
            loss_weight: T::default(),
            width,
            data,
        }
    }

    /// Sets the loss weight of this output.
    pub fn with_loss_weight(mut self, loss_weight: T) -> Self {
        self.loss_weight = loss_weight;
        self
    }

    /// Sets the row width of this output.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Iterates over the rows of this output.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks_exact(self.width.max(1))
    }
}

/// Where a network definition comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum NetSource {
    /// A definition file on disk.
    File(PathBuf),
    /// A definition embedded in the solver configuration.
    Inline(serde_json::Value),
}

impl fmt::Display for NetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetSource::File(path) => write!(f, "net file {}", path.display()),
            NetSource::Inline(_) => f.write_str("inline net definition"),
        }
    }
}

/// The trainable model, as seen by the solver.
///
/// Implementations own the numerics: layers, gradients and the weight update rule.
pub trait TrainNet<T: Scalar>: Send {
    /// The name of the network, used in logs.
    fn name(&self) -> &str;

    /// Runs one forward and backward pass, accumulating into the parameter diffs.
    ///
    /// # Returns
    /// The scalar loss of the pass.
    fn forward_backward(&mut self) -> Result<T>;

    /// Runs a forward pass only.
    fn forward(&mut self) -> Result<T>;

    /// The outputs produced by the last forward pass.
    fn outputs(&self) -> &[OutputBlob<T>];

    /// Zeroes every parameter diff.
    fn clear_param_diffs(&mut self);

    /// The ordered list of trainable buffers.
    fn params(&self) -> &[ParamBlob<T>];

    fn params_mut(&mut self) -> &mut [ParamBlob<T>];

    /// Applies the weight update for iteration `iter` using the current diffs.
    fn apply_update(&mut self, iter: usize) -> Result<()>;

    /// The step of the learning rate schedule, for rules that keep one.
    fn current_step(&self) -> usize {
        0
    }

    fn set_current_step(&mut self, step: usize) {
        let _ = step;
    }

    /// The optimizer history buffers, if the update rule keeps any.
    fn optimizer_state(&self) -> Vec<Vec<T>> {
        Vec::new()
    }

    /// Restores the optimizer history saved by `optimizer_state`.
    fn restore_optimizer_state(&mut self, history: Vec<Vec<T>>) -> Result<()> {
        let _ = history;
        Ok(())
    }
}

/// A held out evaluation network sharing the trained weights.
pub trait TestNet<T: Scalar>: Send {
    /// Copies the trained parameters into this net's layers.
    fn share_trained_layers_with(&mut self, params: &[ParamBlob<T>]) -> Result<()>;

    /// Runs a forward pass, returning its loss.
    fn forward(&mut self) -> Result<T>;

    /// The outputs produced by the last forward pass.
    fn outputs(&self) -> &[OutputBlob<T>];
}

/// Builds networks from their definitions.
pub trait NetFactory<T: Scalar> {
    fn train_net(&mut self, source: &NetSource) -> Result<Box<dyn TrainNet<T>>>;

    /// # Arguments
    /// * `id` - The index of the test net, in resolution order.
    /// * `source` - The definition to build it from.
    fn test_net(&mut self, id: usize, source: &NetSource) -> Result<Box<dyn TestNet<T>>>;
}

use std::{fs, num::NonZeroUsize, path::Path, path::PathBuf};

use serde::Deserialize;

use crate::{
    checkpoint::SnapshotFormat,
    error::{Result, SolverErr},
    evaluation::{ApVersion, EvalType, TestRunSpec},
    net::NetSource,
};

/// The solver's configuration, loaded from JSON.
///
/// Every field is optional in the document, missing ones take their default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Generic net definition file, used for training and to fill test nets.
    pub net: Option<PathBuf>,
    /// Generic inline net definition.
    pub net_param: Option<serde_json::Value>,
    pub train_net: Option<PathBuf>,
    pub train_net_param: Option<serde_json::Value>,
    pub test_net: Vec<PathBuf>,
    pub test_net_param: Vec<serde_json::Value>,

    /// Forward passes of each test net per test run.
    pub test_iter: Vec<usize>,
    /// Iterations between test runs, zero disables testing.
    pub test_interval: usize,
    pub test_compute_loss: bool,
    /// Whether to also test before the first update.
    pub test_initialization: bool,

    /// Window of the smoothed loss.
    pub average_loss: NonZeroUsize,
    /// Micro batches accumulated per update.
    pub iter_size: NonZeroUsize,
    pub max_iter: usize,
    /// Iterations between progress logs, zero disables them.
    pub display: usize,

    /// Iterations between snapshots, zero disables periodic snapshots.
    #[serde(alias = "snapshot")]
    pub snapshot_interval: usize,
    pub snapshot_prefix: Option<PathBuf>,
    pub snapshot_format: SnapshotFormat,
    pub snapshot_diff: bool,
    pub snapshot_after_train: bool,

    pub eval_type: String,
    pub ap_version: String,

    /// Skip the weight update, for debugging gradients.
    pub disabled_update: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            net: None,
            net_param: None,
            train_net: None,
            train_net_param: None,
            test_net: Vec::new(),
            test_net_param: Vec::new(),
            test_iter: Vec::new(),
            test_interval: 0,
            test_compute_loss: false,
            test_initialization: true,
            average_loss: NonZeroUsize::MIN,
            iter_size: NonZeroUsize::MIN,
            max_iter: 0,
            display: 0,
            snapshot_interval: 0,
            snapshot_prefix: None,
            snapshot_format: SnapshotFormat::Binary,
            snapshot_diff: false,
            snapshot_after_train: true,
            eval_type: "classification".to_string(),
            ap_version: ApVersion::Integral.to_string(),
            disabled_update: false,
        }
    }
}

impl SolverConfig {
    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// Relative net definition paths are left as they are, they're resolved
    /// against the working directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            SolverErr::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;

        Self::from_json_str(&json)
    }

    /// Checks every invariant the solver relies on.
    ///
    /// # Returns
    /// The first violation found, as an `InvalidConfig`, `UnknownEvalType` or
    /// `UnknownApVersion` error.
    pub fn validate(&self) -> Result<()> {
        self.train_net_source()?;
        let test_nets = self.test_net_sources()?;

        if !test_nets.is_empty() && self.test_interval == 0 {
            return Err(SolverErr::InvalidConfig(
                "test_interval must be greater than 0 when test nets are defined".into(),
            ));
        }

        if let Some(i) = self.test_iter.iter().position(|&iters| iters == 0) {
            return Err(SolverErr::InvalidConfig(format!(
                "test_iter[{i}] must be greater than 0"
            )));
        }

        if self.snapshot_interval > 0 && self.snapshot_prefix.is_none() {
            return Err(SolverErr::InvalidConfig(
                "snapshot_prefix is required when snapshot is greater than 0".into(),
            ));
        }

        self.eval_type()?;
        self.ap_version()?;
        Ok(())
    }

    pub fn eval_type(&self) -> Result<EvalType> {
        self.eval_type.parse()
    }

    pub fn ap_version(&self) -> Result<ApVersion> {
        self.ap_version.parse()
    }

    /// Picks the training net definition.
    ///
    /// Specific sources win over generic ones and inline definitions over files,
    /// but exactly one of `net`, `net_param`, `train_net` and `train_net_param`
    /// may be set.
    pub fn train_net_source(&self) -> Result<NetSource> {
        let sources = [
            self.train_net_param.clone().map(NetSource::Inline),
            self.train_net.clone().map(NetSource::File),
            self.net_param.clone().map(NetSource::Inline),
            self.net.clone().map(NetSource::File),
        ];

        let set = sources.iter().filter(|source| source.is_some()).count();
        if set != 1 {
            return Err(SolverErr::InvalidConfig(format!(
                "exactly one of net, net_param, train_net and train_net_param must be set, found {set}"
            )));
        }

        sources
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| SolverErr::InvalidConfig("no train net source".into()))
    }

    fn generic_net_source(&self) -> Option<NetSource> {
        self.net_param
            .clone()
            .map(NetSource::Inline)
            .or_else(|| self.net.clone().map(NetSource::File))
    }

    /// Resolves the test net definitions, in test net id order.
    ///
    /// Inline test nets come first, then test net files, then copies of the
    /// generic net fill every remaining `test_iter` entry.
    pub fn test_net_sources(&self) -> Result<Vec<NetSource>> {
        let mut sources: Vec<_> = self
            .test_net_param
            .iter()
            .cloned()
            .map(NetSource::Inline)
            .chain(self.test_net.iter().cloned().map(NetSource::File))
            .collect();

        let explicit = sources.len();
        let wanted = self.test_iter.len();

        match self.generic_net_source() {
            Some(generic) => {
                if wanted < explicit {
                    return Err(SolverErr::InvalidConfig(format!(
                        "test_iter must be specified for each test network: {wanted} given for {explicit} test nets"
                    )));
                }

                sources.extend(std::iter::repeat_n(generic, wanted - explicit));
            }
            None if wanted != explicit => {
                return Err(SolverErr::InvalidConfig(format!(
                    "test_iter must be specified for each test network: {wanted} given for {explicit} test nets"
                )));
            }
            None => {}
        }

        Ok(sources)
    }

    /// The test runs to perform, one per test net.
    pub fn test_run_specs(&self) -> Result<Vec<TestRunSpec>> {
        let eval_type = self.eval_type()?;
        let ap_version = self.ap_version()?;

        Ok(self
            .test_iter
            .iter()
            .enumerate()
            .map(|(net_id, &iterations)| TestRunSpec {
                net_id,
                iterations,
                compute_loss: self.test_compute_loss,
                eval_type,
                ap_version,
            })
            .collect())
    }
}

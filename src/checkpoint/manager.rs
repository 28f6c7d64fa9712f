use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use comms::Scalar;
use log::{info, warn};

use super::{ModelArtifact, SnapshotFormat, SolverState, binary, tensors};
use crate::{
    error::{Result, SolverErr},
    net::ParamBlob,
};

/// The paths of a written artifact pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub iter: usize,
    pub model: PathBuf,
    pub state: PathBuf,
}

/// Everything read back from an artifact pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored<T> {
    pub iter: usize,
    pub current_step: usize,
    pub params: Vec<ParamBlob<T>>,
    pub history: Vec<Vec<T>>,
    pub model: PathBuf,
}

/// Writes and reads checkpoint artifact pairs.
///
/// Only the root worker writes, every other worker's writes are no-ops.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    prefix: Option<PathBuf>,
    format: SnapshotFormat,
    snapshot_diff: bool,
    is_root: bool,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`.
    ///
    /// # Arguments
    /// * `prefix` - The path prefix of every artifact, none disables writing.
    /// * `format` - The layout to write artifacts with.
    /// * `snapshot_diff` - Whether gradients go into the model artifact.
    /// * `is_root` - Whether this worker is the one writing.
    ///
    /// # Returns
    /// A new `CheckpointManager` instance.
    pub fn new(
        prefix: Option<PathBuf>,
        format: SnapshotFormat,
        snapshot_diff: bool,
        is_root: bool,
    ) -> Self {
        Self {
            prefix,
            format,
            snapshot_diff,
            is_root,
        }
    }

    /// `<prefix>_iter_<iter><ext>`, if there's a prefix.
    pub fn filename(&self, iter: usize, ext: &str) -> Option<PathBuf> {
        let prefix = self.prefix.as_ref()?;
        let mut name = OsString::from(prefix.as_os_str());
        name.push(format!("_iter_{iter}{ext}"));
        Some(PathBuf::from(name))
    }

    /// Checks up front that artifacts for `iter` can be written.
    ///
    /// Writes and removes a `.tempfile` marker next to where the artifacts go.
    ///
    /// # Returns
    /// A checkpoint error if the marker couldn't be created.
    pub fn check_write_permissions(&self, iter: usize) -> Result<()> {
        if !self.is_root {
            return Ok(());
        }

        let Some(marker) = self.filename(iter, ".tempfile") else {
            return Ok(());
        };

        fs::write(&marker, b"").map_err(|e| {
            SolverErr::Checkpoint(format!(
                "cannot write to snapshot prefix, {} is not writable: {e}",
                marker.display()
            ))
        })?;

        fs::remove_file(&marker)?;
        Ok(())
    }

    /// Writes the model artifact and then the solver state artifact.
    ///
    /// # Arguments
    /// * `iter` - The amount of updates applied to `params`.
    /// * `current_step` - The learning rate schedule's step.
    /// * `params` - The trained parameters.
    /// * `history` - The optimizer history.
    ///
    /// # Returns
    /// The written pair, `None` on non root workers or without a prefix.
    pub fn snapshot<T: Scalar>(
        &self,
        iter: usize,
        current_step: usize,
        params: &[ParamBlob<T>],
        history: Vec<Vec<T>>,
    ) -> Result<Option<Checkpoint>> {
        if !self.is_root {
            return Ok(None);
        }

        let (Some(model), Some(state)) = (
            self.filename(iter, self.format.model_ext()),
            self.filename(iter, self.format.state_ext()),
        ) else {
            warn!(iter = iter; "no snapshot prefix configured, skipping snapshot");
            return Ok(None);
        };

        info!(iter = iter; "snapshotting to {:?} file {}", self.format, model.display());
        let bytes = match self.format {
            SnapshotFormat::Binary => binary::encode_model(iter, params, self.snapshot_diff),
            SnapshotFormat::Hdf5 => tensors::encode_model(iter, params, self.snapshot_diff)?,
        };
        write_atomic(&model, &bytes)?;

        let solver_state = SolverState {
            iter,
            current_step,
            learned_net: model.clone(),
            history,
        };

        info!(iter = iter; "snapshotting solver state to {:?} file {}", self.format, state.display());
        let bytes = match self.format {
            SnapshotFormat::Binary => binary::encode_state(&solver_state),
            SnapshotFormat::Hdf5 => tensors::encode_state(&solver_state)?,
        };
        write_atomic(&state, &bytes)?;

        Ok(Some(Checkpoint { iter, model, state }))
    }

    /// Reads back the pair a solver state artifact belongs to.
    ///
    /// The layout of each artifact is picked from its suffix, `.h5` being the
    /// keyed tensor layout.
    ///
    /// # Arguments
    /// * `state_path` - The solver state artifact.
    ///
    /// # Returns
    /// The restored training state, or a checkpoint error if an artifact is
    /// missing, malformed or the two disagree on the iteration.
    pub fn restore<T: Scalar>(&self, state_path: &Path) -> Result<Restored<T>> {
        info!("restoring previous solver status from {}", state_path.display());

        let bytes = read(state_path)?;
        let state: SolverState<T> = match SnapshotFormat::of_path(state_path) {
            SnapshotFormat::Binary => binary::decode_state(&bytes)?,
            SnapshotFormat::Hdf5 => tensors::decode_state(&bytes)?,
        };

        let bytes = read(&state.learned_net)?;
        let model: ModelArtifact<T> = match SnapshotFormat::of_path(&state.learned_net) {
            SnapshotFormat::Binary => binary::decode_model(&bytes)?,
            SnapshotFormat::Hdf5 => tensors::decode_model(&bytes)?,
        };

        if model.iter != state.iter {
            return Err(SolverErr::Checkpoint(format!(
                "{} is at iteration {} but {} is at iteration {}",
                state_path.display(),
                state.iter,
                state.learned_net.display(),
                model.iter
            )));
        }

        Ok(Restored {
            iter: state.iter,
            current_step: state.current_step,
            params: model.blobs,
            history: state.history,
            model: state.learned_net,
        })
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        SolverErr::Checkpoint(format!("cannot read artifact {}: {e}", path.display()))
    })
}

/// Writes `bytes` to a temporary sibling of `path` and renames it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

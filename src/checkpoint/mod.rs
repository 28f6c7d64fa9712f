mod binary;
mod manager;
mod tensors;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use manager::{Checkpoint, CheckpointManager, Restored};

use crate::net::ParamBlob;

/// The on disk layout of both checkpoint artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// Flat sections, `.caffemodel` and `.solverstate`.
    #[default]
    Binary,
    /// Keyed tensors, `.caffemodel.h5` and `.solverstate.h5`.
    Hdf5,
}

impl SnapshotFormat {
    pub fn model_ext(self) -> &'static str {
        match self {
            SnapshotFormat::Binary => ".caffemodel",
            SnapshotFormat::Hdf5 => ".caffemodel.h5",
        }
    }

    pub fn state_ext(self) -> &'static str {
        match self {
            SnapshotFormat::Binary => ".solverstate",
            SnapshotFormat::Hdf5 => ".solverstate.h5",
        }
    }

    /// Picks the format of an artifact from its file name.
    pub fn of_path(path: &std::path::Path) -> Self {
        match path.extension() {
            Some(ext) if ext == "h5" => SnapshotFormat::Hdf5,
            _ => SnapshotFormat::Binary,
        }
    }
}

/// The model artifact: the trained parameters at some iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact<T> {
    pub iter: usize,
    /// The blobs, with empty diffs unless they were written with gradients.
    pub blobs: Vec<ParamBlob<T>>,
}

/// The solver state artifact: what the loop needs to resume.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverState<T> {
    pub iter: usize,
    pub current_step: usize,
    /// The model artifact written alongside.
    pub learned_net: PathBuf,
    /// The optimizer history buffers.
    pub history: Vec<Vec<T>>,
}

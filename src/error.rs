use std::{error::Error, fmt, io};

use crate::collective::CollectiveErr;

/// The solver module's result type.
pub type Result<T> = std::result::Result<T, SolverErr>;

/// Solver failures. Every variant is fatal for the run that produced it.
#[derive(Debug)]
pub enum SolverErr {
    /// A configuration invariant was violated, caught before training starts.
    InvalidConfig(String),
    /// The `eval_type` option names no known evaluation algorithm.
    UnknownEvalType(String),
    /// The `ap_version` option names no known average precision policy.
    UnknownApVersion(String),
    /// The evaluation bookkeeping is corrupted.
    Consistency(String),
    /// The parameter buffers changed shape between two synchronization calls.
    LayoutMismatch {
        blob: usize,
        got: usize,
        expected: usize,
    },
    /// A flat buffer doesn't have the length of the parameter set.
    SizeMismatch { got: usize, expected: usize },
    /// The worker group failed during a collective call.
    Collective(CollectiveErr),
    /// A checkpoint artifact is malformed or the pair disagrees.
    Checkpoint(String),
    /// The model collaborator reported a failure.
    Net(String),
    Io(io::Error),
}

impl fmt::Display for SolverErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            SolverErr::UnknownEvalType(name) => write!(f, "unknown evaluation type: {name}"),
            SolverErr::UnknownApVersion(name) => write!(f, "unknown ap_version: {name}"),
            SolverErr::Consistency(msg) => write!(f, "inconsistent evaluation output: {msg}"),
            SolverErr::LayoutMismatch {
                blob,
                got,
                expected,
            } => write!(
                f,
                "parameter blob {blob} changed size: got {got}, expected {expected}"
            ),
            SolverErr::SizeMismatch { got, expected } => {
                write!(f, "flat buffer size mismatch: got {got}, expected {expected}")
            }
            SolverErr::Collective(e) => write!(f, "collective failure: {e}"),
            SolverErr::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            SolverErr::Net(msg) => write!(f, "net error: {msg}"),
            SolverErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for SolverErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SolverErr::Collective(e) => Some(e),
            SolverErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SolverErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CollectiveErr> for SolverErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<serde_json::Error> for SolverErr {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidConfig(value.to_string())
    }
}

impl From<safetensors::SafeTensorError> for SolverErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint(value.to_string())
    }
}

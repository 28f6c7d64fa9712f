use std::{error::Error, fmt, io};

/// The result type of every collective call.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Collective failures. None of them is recoverable, the group is assumed fail-stop.
#[derive(Debug)]
pub enum CollectiveErr {
    /// Some worker left the group, every later call fails.
    Aborted { reason: String },
    /// The buffers handed in by the workers don't have the same length.
    LengthMismatch {
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// The requested root isn't part of the group.
    InvalidRoot { root: usize, world_size: usize },
    /// A peer sent something the protocol doesn't allow at this point.
    UnexpectedMessage { rank: usize, got: &'static str },
    Io(io::Error),
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Aborted { reason } => write!(f, "worker group aborted: {reason}"),
            CollectiveErr::LengthMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "rank {rank} contributed {got} elements, expected {expected}"
            ),
            CollectiveErr::InvalidRoot { root, world_size } => {
                write!(f, "root {root} is out of a group of {world_size} workers")
            }
            CollectiveErr::UnexpectedMessage { rank, got } => {
                write!(f, "unexpected message from rank {rank}: got {got}")
            }
            CollectiveErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectiveErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

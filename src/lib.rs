pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod control;
pub mod error;
pub mod evaluation;
pub mod loss;
pub mod metrics;
pub mod net;
pub mod observer;
pub mod params;
pub mod solver;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointManager, SnapshotFormat};
pub use collective::{Collective, CollectiveErr, LocalCollective, LocalGroup, TcpCollective};
pub use comms::{Scalar, ScalarKind};
pub use config::SolverConfig;
pub use control::{ControlHandle, ControlRequest, ControlSource, NoControl, control_channel};
pub use error::{Result, SolverErr};
pub use net::{NetFactory, NetSource, OutputBlob, ParamBlob, TestNet, TrainNet};
pub use observer::{MetricsLog, SolverObserver};
pub use solver::{Phase, SolveOutcome, Solver, SolverBuilder};

mod builder;
mod solver;

pub use builder::SolverBuilder;
pub use solver::{Phase, SolveOutcome, Solver};

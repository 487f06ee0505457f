//! Error types for the solver

mod builders;
mod display;
mod types;

pub use builders::*;
pub use types::{Result, SolverError};

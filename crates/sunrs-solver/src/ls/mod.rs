//! The linear-solve interface used by the implicit integrators.

pub mod bandpre;
pub mod callbacks;
pub mod config;
pub mod dq;
pub mod interface;
pub mod mass;
mod operator;
pub mod stats;

pub use bandpre::BandPreconditioner;
pub use callbacks::{
    FnPreconditioner, JacFn, JacTimesFn, JacTimesSetupFn, JacTimesSource, JacobianSource,
    Preconditioner, RhsFn, Scratch, SystemState,
};
pub use config::{LsConfig, Package, SystemForm};
pub use interface::{
    ConvergenceFailure, LinearSolverInterface, SetupOutcome, SetupRequest, SolveRequest,
};
pub use mass::{MassFn, MassSolverInterface};
pub use operator::MassTimesFn;
pub use stats::{LsStats, MassStats};

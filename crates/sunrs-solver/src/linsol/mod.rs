//! Abstract linear solvers and their backends.

pub mod band;
pub mod config;
pub mod dense;
pub mod krylov;
pub mod pcg;
pub mod spgmr;
pub mod traits;

pub use band::BandLu;
pub use config::{GramSchmidt, KrylovConfig};
pub use dense::{DenseLu, SparseLu};
pub use pcg::Pcg;
pub use spgmr::Spgmr;
pub use traits::{
    LinearSolver, MatrixOperator, NoOperator, PrecSide, SolverId, SolverKind, SolverState,
    SolverStatus, SystemOperator,
};

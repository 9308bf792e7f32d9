//! Backend-independent vectors, matrices and linear solvers, and the
//! linear-solve interface shared by implicit time integrators and nonlinear
//! root finders.
//!
//! The layers stack bottom-up:
//!
//! - [`nvector`]: the [`NVector`] contract with serial and thread-pool
//!   backends.
//! - [`matrix`]: the object-safe [`SunMatrix`] contract with dense, band and
//!   compressed sparse storage.
//! - [`linsol`]: the [`LinearSolver`] contract with direct LU solvers and the
//!   SPGMR and PCG Krylov methods.
//! - [`ls`]: [`LinearSolverInterface`], which decides when Jacobians are
//!   refreshed, assembles `I - gamma J` and friends, and drives the solver
//!   from inside a Newton iteration.
//!
//! Every fallible call returns a `Result`; the numeric status codes of each
//! layer are kept on the error types in [`error`].

pub mod error;
pub mod linsol;
pub mod ls;
pub mod matrix;
pub mod nvector;

/// Floating-point type of every backend.
pub type Real = f64;

/// Unit roundoff of [`Real`].
pub const UNIT_ROUNDOFF: Real = f64::EPSILON;

pub use error::{
    CallbackError, CallbackResult, LinSolError, LsError, LsFlag, LsResult, MatrixError,
    VectorError, callback_status,
};
pub use linsol::{
    BandLu, DenseLu, KrylovConfig, LinearSolver, Pcg, PrecSide, SolverKind, SparseLu, Spgmr,
    SystemOperator,
};
pub use ls::{
    BandPreconditioner, ConvergenceFailure, JacTimesSource, JacobianSource, LinearSolverInterface,
    LsStats, MassSolverInterface, Package, SetupRequest, SolveRequest, SystemForm, SystemState,
};
pub use matrix::{BandMatrix, DenseMatrix, MatVec, MatrixId, SparseFormat, SparseMatrix, SunMatrix};
pub use nvector::{NVector, SerialVector, ThreadedVector};

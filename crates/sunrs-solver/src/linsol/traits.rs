//! The abstract linear solver contract.
//!
//! A solver works on `A x = b` where `A` is either an attached matrix, passed
//! by reference on every call, or only available through a
//! [`SystemOperator`]. Solvers never own the matrix.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::Real;
use crate::error::{CallbackError, CallbackResult, LinSolError, LinSolResult, sunls};
use crate::matrix::{MatVec, MatrixId, SunMatrix};
use crate::nvector::NVector;

/// How a solver relates to the system matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverKind {
    /// Factorizes an attached matrix; a matrix is required.
    Direct,
    /// Works through the operator; a matrix may be attached.
    Iterative,
    /// Works through the operator only; attaching a matrix is an error.
    MatrixFree,
}

/// Concrete solver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverId {
    DenseLu,
    BandLu,
    SparseLu,
    Spgmr,
    Pcg,
    Custom,
}

impl SolverId {
    pub fn name(&self) -> &'static str {
        match self {
            SolverId::DenseLu => "dense-lu",
            SolverId::BandLu => "band-lu",
            SolverId::SparseLu => "sparse-lu",
            SolverId::Spgmr => "spgmr",
            SolverId::Pcg => "pcg",
            SolverId::Custom => "custom",
        }
    }
}

/// Side on which a Krylov solver applies the preconditioner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrecSide {
    #[default]
    None,
    Left,
    Right,
    Both,
}

impl PrecSide {
    pub fn left(self) -> bool {
        matches!(self, PrecSide::Left | PrecSide::Both)
    }

    pub fn right(self) -> bool {
        matches!(self, PrecSide::Right | PrecSide::Both)
    }
}

/// Position in the solver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverState {
    Uninitialized,
    SetupStale,
    SetupCurrent,
    Solving,
    Solved,
    FailedRecoverable,
    FailedFatal,
}

/// Lifecycle state and diagnostics of the last call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverStatus {
    state: SolverState,
    last_flag: i32,
    num_iters: usize,
    res_norm: Real,
    setup_current: bool,
}

impl Default for SolverStatus {
    fn default() -> Self {
        Self {
            state: SolverState::Uninitialized,
            last_flag: sunls::SUCCESS,
            num_iters: 0,
            res_norm: 0.0,
            setup_current: false,
        }
    }
}

impl SolverStatus {
    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn last_flag(&self) -> i32 {
        self.last_flag
    }

    pub fn num_iters(&self) -> usize {
        self.num_iters
    }

    pub fn res_norm(&self) -> Real {
        self.res_norm
    }

    /// Whether a successful setup backs the next solve.
    pub fn is_setup_current(&self) -> bool {
        self.setup_current
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.state = SolverState::SetupStale;
        self.last_flag = sunls::SUCCESS;
        self.num_iters = 0;
        self.res_norm = 0.0;
        self.setup_current = false;
    }

    /// Staged settings changed: the next solve needs a new setup.
    pub(crate) fn mark_stale(&mut self) {
        if self.state != SolverState::Uninitialized {
            self.state = SolverState::SetupStale;
            self.setup_current = false;
        }
    }

    pub(crate) fn begin_setup(&mut self) -> LinSolResult<()> {
        if self.state == SolverState::Uninitialized {
            let err = LinSolError::IllInput("setup called before initialize".into());
            self.last_flag = err.code();
            return Err(err);
        }
        self.setup_current = false;
        Ok(())
    }

    pub(crate) fn finish_setup(&mut self, result: LinSolResult<()>) -> LinSolResult<()> {
        match &result {
            Ok(()) => {
                self.state = SolverState::SetupCurrent;
                self.last_flag = sunls::SUCCESS;
                self.setup_current = true;
            }
            Err(e) => self.record_failure(e),
        }
        result
    }

    pub(crate) fn begin_solve(&mut self) -> LinSolResult<()> {
        if !self.setup_current {
            let err = LinSolError::IllInput("solve called without a current setup".into());
            self.last_flag = err.code();
            return Err(err);
        }
        self.state = SolverState::Solving;
        self.num_iters = 0;
        self.res_norm = 0.0;
        Ok(())
    }

    /// Records the iteration count and residual of the running solve.
    pub(crate) fn set_progress(&mut self, num_iters: usize, res_norm: Real) {
        self.num_iters = num_iters;
        self.res_norm = res_norm;
    }

    pub(crate) fn finish_solve(&mut self, result: LinSolResult<()>) -> LinSolResult<()> {
        match &result {
            Ok(()) => {
                self.state = SolverState::Solved;
                self.last_flag = sunls::SUCCESS;
            }
            Err(e) => {
                self.record_failure(e);
                // A failed solve leaves a valid factorization or preconditioner.
                self.setup_current = !matches!(
                    e,
                    LinSolError::VectorOp(_) | LinSolError::Matrix(_) | LinSolError::IllInput(_)
                );
            }
        }
        result
    }

    fn record_failure(&mut self, e: &LinSolError) {
        self.last_flag = e.code();
        self.state = if e.is_recoverable() {
            SolverState::FailedRecoverable
        } else {
            SolverState::FailedFatal
        };
    }
}

/// The system operator and preconditioner seen by a solver.
///
/// The linear-solve interface implements this on top of the integrator's
/// Jacobian data; [`MatrixOperator`] adapts a plain matrix.
pub trait SystemOperator<V: NVector> {
    /// `z = A v`
    fn apply(&mut self, v: &V, z: &mut V) -> CallbackResult;

    fn has_preconditioner(&self) -> bool {
        false
    }

    fn precond_setup(&mut self) -> CallbackResult {
        Ok(())
    }

    /// Solve `P z = r` approximately, to tolerance `tol`, for the given side.
    fn precond_solve(&mut self, r: &V, z: &mut V, tol: Real, side: PrecSide) -> CallbackResult {
        let _ = (r, z, tol, side);
        Err(CallbackError::unrecoverable())
    }
}

/// Operator given by the product with a matrix, without preconditioning.
#[derive(Debug)]
pub struct MatrixOperator<'m> {
    matrix: &'m dyn SunMatrix,
}

impl<'m> MatrixOperator<'m> {
    pub fn new(matrix: &'m dyn SunMatrix) -> Self {
        Self { matrix }
    }
}

impl<V: NVector> SystemOperator<V> for MatrixOperator<'_> {
    fn apply(&mut self, v: &V, z: &mut V) -> CallbackResult {
        self.matrix
            .matvec(v, z)
            .map_err(|e| CallbackError::Unrecoverable(e.code()))
    }
}

/// Operator for direct solvers, which never apply `A`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOperator;

impl<V: NVector> SystemOperator<V> for NoOperator {
    fn apply(&mut self, _v: &V, _z: &mut V) -> CallbackResult {
        Err(CallbackError::unrecoverable())
    }
}

/// Abstract linear solver.
pub trait LinearSolver<V: NVector>: Send + Debug {
    fn id(&self) -> SolverId;

    fn kind(&self) -> SolverKind;

    /// Whether `setup`/`solve` can work with a matrix of this kind.
    fn accepts(&self, matrix: MatrixId) -> bool;

    fn status(&self) -> &SolverStatus;

    /// Prepare for use. Idempotent; leaves the solver needing a setup.
    fn initialize(&mut self) -> LinSolResult<()>;

    /// Stage a preconditioning side, effective from the next setup.
    fn set_preconditioner(&mut self, side: PrecSide) -> LinSolResult<()> {
        match side {
            PrecSide::None => Ok(()),
            _ => Err(LinSolError::IllInput(format!(
                "{} does not use a preconditioner",
                self.id().name()
            ))),
        }
    }

    /// Whether [`LinearSolver::set_scaling_vectors`] is honored.
    fn supports_scaling(&self) -> bool {
        false
    }

    /// Set the left (`s1`) and right (`s2`) scaling vectors for the
    /// following solves. `None` means no scaling on that side.
    fn set_scaling_vectors(&mut self, s1: Option<&V>, s2: Option<&V>) -> LinSolResult<()> {
        let _ = (s1, s2);
        Err(LinSolError::IllInput(format!(
            "{} does not support scaling",
            self.id().name()
        )))
    }

    /// Promise that the next solve starts from `x = 0`.
    fn set_zero_guess(&mut self, zero_guess: bool) {
        let _ = zero_guess;
    }

    /// Factorize or preprocess. Iterative solvers set up the preconditioner.
    fn setup(
        &mut self,
        a: Option<&dyn SunMatrix>,
        op: &mut dyn SystemOperator<V>,
    ) -> LinSolResult<()>;

    /// Solve `A x = b`. `x` holds the initial guess on entry. Direct solvers
    /// ignore `tol`.
    fn solve(
        &mut self,
        a: Option<&dyn SunMatrix>,
        op: &mut dyn SystemOperator<V>,
        x: &mut V,
        b: &V,
        tol: Real,
    ) -> LinSolResult<()>;

    fn num_iters(&self) -> usize {
        self.status().num_iters()
    }

    fn res_norm(&self) -> Real {
        self.status().res_norm()
    }

    fn last_flag(&self) -> i32 {
        self.status().last_flag()
    }

    fn state(&self) -> SolverState {
        self.status().state()
    }
}

/// Checks the matrix argument of `setup`/`solve` against the solver kind.
pub(crate) fn check_matrix_arg<V: NVector, S: LinearSolver<V> + ?Sized>(
    solver: &S,
    a: Option<&dyn SunMatrix>,
) -> LinSolResult<()> {
    match (solver.kind(), a) {
        (SolverKind::Direct, None) => Err(LinSolError::IllInput(format!(
            "{} requires a matrix",
            solver.id().name()
        ))),
        (SolverKind::MatrixFree, Some(_)) => Err(LinSolError::IllInput(format!(
            "{} is matrix-free and cannot use a matrix",
            solver.id().name()
        ))),
        (_, Some(m)) if !solver.accepts(m.id()) => Err(LinSolError::IllInput(format!(
            "{} cannot work with a {:?} matrix",
            solver.id().name(),
            m.id()
        ))),
        _ => Ok(()),
    }
}

/// Host slice of a vector, for backends that need direct access.
pub(crate) fn host_slice<V: NVector>(v: &V) -> LinSolResult<&[Real]> {
    v.as_slice()
        .ok_or_else(|| LinSolError::IllInput("vector has no host data".into()))
}

pub(crate) fn host_slice_mut<V: NVector>(v: &mut V) -> LinSolResult<&mut [Real]> {
    v.as_mut_slice()
        .ok_or_else(|| LinSolError::IllInput("vector has no host data".into()))
}

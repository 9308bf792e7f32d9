//! The linear-solve interface shared by the implicit packages.
//!
//! [`LinearSolverInterface`] sits between a package's Newton iteration and a
//! [`LinearSolver`]. It decides when the Jacobian is refreshed, assembles the
//! system matrix for the package's [`SystemForm`], wires the preconditioner
//! and `J v` product into matrix-free solvers, and translates every failure
//! into an [`LsError`] that keeps its recoverable or fatal classification.
//!
//! The integrator is never stored: its state reaches the interface through
//! [`SetupRequest`] and [`SolveRequest`] on each call.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::callbacks::{
    JacTimesSource, JacobianSource, Preconditioner, RhsFn, Scratch, SystemState,
};
use super::config::{DEFAULT_DGMAX_JBAD, DEFAULT_EPLIFAC, DEFAULT_MSBJ, LsConfig, Package, SystemForm};
use super::dq;
use super::operator::LinearSystemOperator;
use super::stats::LsStats;
use crate::Real;
use crate::error::{CallbackError, LinSolError, LsError, LsFlag, LsResult};
use crate::linsol::{LinearSolver, PrecSide, SolverKind};
use crate::matrix::{BandMatrix, DenseMatrix, MatrixId, SunMatrix};
use crate::nvector::NVector;

/// Why the previous nonlinear iteration failed, as reported by the package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceFailure {
    /// First setup of the step, or no failure.
    #[default]
    None,
    /// Newton failed to converge and the Jacobian may be stale.
    BadJacobian,
    /// Any other failure; the Jacobian is always refreshed.
    Other,
}

/// Arguments of [`LinearSolverInterface::setup`].
#[derive(Debug)]
pub struct SetupRequest<'s, V> {
    pub state: SystemState<'s, V>,
    pub conv_fail: ConvergenceFailure,
    /// Caller's hint that the saved Jacobian may be reused.
    pub reuse_allowed: bool,
}

impl<'s, V: NVector> SetupRequest<'s, V> {
    pub fn new(state: SystemState<'s, V>) -> Self {
        Self {
            state,
            conv_fail: ConvergenceFailure::None,
            reuse_allowed: true,
        }
    }

    pub fn with_conv_fail(mut self, conv_fail: ConvergenceFailure) -> Self {
        self.conv_fail = conv_fail;
        self
    }

    /// Forbid reuse of the saved Jacobian.
    pub fn fresh_jacobian(mut self) -> Self {
        self.reuse_allowed = false;
        self
    }
}

/// Arguments of [`LinearSolverInterface::solve`].
#[derive(Debug)]
pub struct SolveRequest<'s, V> {
    pub state: SystemState<'s, V>,
    /// Nonlinear tolerance the linear solve must respect, WRMS norm.
    pub tol: Real,
    /// Index of the Newton iteration within the current nonlinear solve.
    pub newton_iter: usize,
}

impl<'s, V: NVector> SolveRequest<'s, V> {
    pub fn new(state: SystemState<'s, V>, tol: Real) -> Self {
        Self {
            state,
            tol,
            newton_iter: 0,
        }
    }

    pub fn with_newton_iter(mut self, newton_iter: usize) -> Self {
        self.newton_iter = newton_iter;
        self
    }
}

/// Result of a successful setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
    /// Whether Jacobian data was recomputed during this setup.
    pub jacobian_refreshed: bool,
}

/// Checks a solver and its optional matrix before they are attached to a
/// system of size `n`.
pub(crate) fn check_attachment<V: NVector>(
    ls: &dyn LinearSolver<V>,
    matrix: Option<&dyn SunMatrix>,
    n: usize,
) -> LsResult<()> {
    let name = ls.id().name();
    match (ls.kind(), matrix) {
        (SolverKind::Direct, None) => Err(LsError::ill_input(format!("{name} requires a matrix"))),
        (SolverKind::MatrixFree, Some(_)) => Err(LsError::ill_input(format!(
            "{name} is matrix-free and cannot be attached with a matrix"
        ))),
        (_, Some(a)) if !ls.accepts(a.id()) => Err(LsError::ill_input(format!(
            "{name} cannot work with a {:?} matrix",
            a.id()
        ))),
        (_, Some(a)) if a.rows() != n || a.cols() != n => Err(LsError::ill_input(format!(
            "matrix is {}x{} but vectors have length {n}",
            a.rows(),
            a.cols()
        ))),
        _ => Ok(()),
    }
}

pub struct LinearSolverInterface<'a, V: NVector> {
    package: Package,
    form: SystemForm,
    config: LsConfig,
    ls: &'a mut dyn LinearSolver<V>,
    matrix: Option<&'a mut dyn SunMatrix>,
    saved_jac: Option<Box<dyn SunMatrix>>,
    mass: Option<Box<dyn SunMatrix>>,
    jacobian: Option<JacobianSource<'a, V>>,
    jtimes: JacTimesSource<'a, V>,
    rhs: Option<RhsFn<'a, V>>,
    precond: Option<Box<dyn Preconditioner<V> + 'a>>,
    scratch: Scratch<V>,
    x: V,
    work: V,
    jv: V,
    jac_current: bool,
    setups_since_eval: usize,
    jac_failures: usize,
    gamma_setup: Real,
    locked: bool,
    stats: LsStats,
}

impl<V: NVector> fmt::Debug for LinearSolverInterface<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearSolverInterface")
            .field("package", &self.package)
            .field("form", &self.form)
            .field("solver", &self.ls.id())
            .field("matrix", &self.matrix.as_ref().map(|a| a.id()))
            .field("jacobian", &self.jacobian)
            .field("jtimes", &self.jtimes)
            .field("has_preconditioner", &self.precond.is_some())
            .field("jac_current", &self.jac_current)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'a, V: NVector> LinearSolverInterface<'a, V> {
    /// Attach `ls`, and the system matrix `matrix` if any, for `package`.
    ///
    /// Fails with `ILL_INPUT` when the solver kind and the presence of a
    /// matrix disagree, or when the solver cannot use the matrix kind.
    /// `template` fixes the vector backend and length.
    pub fn attach(
        package: Package,
        ls: &'a mut dyn LinearSolver<V>,
        matrix: Option<&'a mut dyn SunMatrix>,
        template: &V,
    ) -> LsResult<Self> {
        check_attachment(&*ls, matrix.as_deref(), template.len())?;

        let saved_jac = matrix.as_deref().map(|a| a.clone_boxed());
        let jacobian = match matrix.as_deref().map(|a| a.id()) {
            Some(MatrixId::Dense | MatrixId::Band) if package.has_explicit_rhs() => {
                Some(JacobianSource::DifferenceQuotient)
            }
            _ => None,
        };
        ls.initialize()?;
        debug!(?package, solver = ls.id().name(), "linear solver attached");

        Ok(Self {
            package,
            form: package.default_form(),
            config: LsConfig::for_package(package),
            ls,
            matrix,
            saved_jac,
            mass: None,
            jacobian,
            jtimes: JacTimesSource::DifferenceQuotient,
            rhs: None,
            precond: None,
            scratch: Scratch::new(template),
            x: template.clone_empty(),
            work: template.clone_empty(),
            jv: template.clone_empty(),
            jac_current: false,
            setups_since_eval: 0,
            jac_failures: 0,
            gamma_setup: 0.0,
            locked: false,
            stats: LsStats::default(),
        })
    }

    pub fn package(&self) -> Package {
        self.package
    }

    pub fn form(&self) -> SystemForm {
        self.form
    }

    pub fn config(&self) -> &LsConfig {
        &self.config
    }

    pub fn stats(&self) -> &LsStats {
        &self.stats
    }

    pub fn last_flag(&self) -> LsFlag {
        self.stats.last_flag()
    }

    pub fn solver(&self) -> &dyn LinearSolver<V> {
        &*self.ls
    }

    /// The system matrix as last assembled.
    pub fn matrix(&self) -> Option<&dyn SunMatrix> {
        self.matrix.as_deref()
    }

    /// The Jacobian saved at the last successful evaluation.
    pub fn saved_jacobian(&self) -> Option<&dyn SunMatrix> {
        self.saved_jac.as_deref()
    }

    /// Whether a saved Jacobian (or preconditioner data) backs reuse.
    pub fn is_jacobian_current(&self) -> bool {
        self.jac_current
    }

    /// Re-arm the interface: counters cleared, Jacobian stale, setters
    /// unlocked, solver reinitialized.
    pub fn initialize(&mut self) -> LsResult<()> {
        let result = self.ls.initialize().map_err(LsError::from);
        if result.is_ok() {
            self.locked = false;
            self.jac_current = false;
            self.setups_since_eval = 0;
            self.jac_failures = 0;
            self.gamma_setup = 0.0;
            self.stats = LsStats::default();
        }
        self.finish(result)
    }

    // Configuration. Only allowed before the first setup or solve.

    fn configure(
        &mut self,
        what: &str,
        apply: impl FnOnce(&mut Self) -> LsResult<()>,
    ) -> LsResult<()> {
        let result = if self.locked {
            Err(LsError::ill_input(format!(
                "{what} cannot change after the first setup; call initialize() first"
            )))
        } else {
            apply(self)
        };
        self.finish(result)
    }

    /// Setup requests between Jacobian evaluations; zero restores the default.
    pub fn set_jac_eval_frequency(&mut self, msbj: usize) -> LsResult<()> {
        self.configure("Jacobian evaluation frequency", |ls| {
            ls.config.msbj = if msbj == 0 { DEFAULT_MSBJ } else { msbj };
            Ok(())
        })
    }

    /// Linear tolerance factor; zero restores the default.
    pub fn set_eps_lin(&mut self, eplifac: Real) -> LsResult<()> {
        self.configure("linear tolerance factor", |ls| {
            if eplifac < 0.0 || !eplifac.is_finite() {
                return Err(LsError::ill_input(format!("eplifac = {eplifac} must be >= 0")));
            }
            ls.config.eplifac = if eplifac == 0.0 { DEFAULT_EPLIFAC } else { eplifac };
            Ok(())
        })
    }

    /// WRMS to 2-norm factor; a non-positive value restores `sqrt(N)`.
    pub fn set_norm_factor(&mut self, nrmfac: Real) -> LsResult<()> {
        self.configure("norm factor", |ls| {
            ls.config.nrmfac = (nrmfac > 0.0).then_some(nrmfac);
            Ok(())
        })
    }

    /// Solution scaling after gamma changes. Matrix-based solvers only.
    pub fn set_linear_solution_scaling(&mut self, enabled: bool) -> LsResult<()> {
        self.configure("solution scaling", |ls| {
            if ls.matrix.is_none() {
                return Err(LsError::ill_input(
                    "solution scaling needs a matrix-based solver",
                ));
            }
            ls.config.scale_solution = enabled;
            Ok(())
        })
    }

    /// Pass error weights to the solver as scaling vectors.
    pub fn set_scaling(&mut self, enabled: bool) -> LsResult<()> {
        self.configure("scaling", |ls| {
            ls.config.scaling = enabled;
            Ok(())
        })
    }

    pub fn set_max_jac_retries(&mut self, retries: usize) -> LsResult<()> {
        self.configure("Jacobian retry limit", |ls| {
            ls.config.max_jac_retries = retries;
            Ok(())
        })
    }

    /// Relative gamma change bound for refreshing a possibly bad Jacobian;
    /// a non-positive value restores the default.
    pub fn set_dgmax_jbad(&mut self, dgmax: Real) -> LsResult<()> {
        self.configure("dgmax_jbad", |ls| {
            ls.config.dgmax_jbad = if dgmax > 0.0 { dgmax } else { DEFAULT_DGMAX_JBAD };
            Ok(())
        })
    }

    pub fn set_system_form(&mut self, form: SystemForm) -> LsResult<()> {
        self.configure("system form", |ls| {
            if !ls.package.supports_form(form) {
                return Err(LsError::ill_input(format!(
                    "{:?} cannot assemble {form:?}",
                    ls.package
                )));
            }
            ls.form = form;
            Ok(())
        })
    }

    /// Mass matrix used by [`SystemForm::MassMinusGammaJ`]. A copy is kept.
    pub fn set_mass_matrix(&mut self, mass: &dyn SunMatrix) -> LsResult<()> {
        self.configure("mass matrix", |ls| {
            let n = ls.x.len();
            if mass.rows() != n || mass.cols() != n {
                return Err(LsError::ill_input(format!(
                    "mass matrix is {}x{}, system size is {n}",
                    mass.rows(),
                    mass.cols()
                )));
            }
            if let Some(a) = ls.matrix.as_deref() {
                if a.id() != mass.id() {
                    return Err(LsError::ill_input(format!(
                        "mass matrix kind {:?} differs from system matrix kind {:?}",
                        mass.id(),
                        a.id()
                    )));
                }
            }
            ls.mass = Some(mass.clone_boxed());
            Ok(())
        })
    }

    pub fn set_jacobian(&mut self, source: JacobianSource<'a, V>) -> LsResult<()> {
        self.configure("Jacobian source", |ls| {
            let Some(kind) = ls.matrix.as_deref().map(|a| a.id()) else {
                return Err(LsError::ill_input(
                    "a Jacobian function needs a matrix-based solver",
                ));
            };
            if let JacobianSource::DifferenceQuotient = source {
                if !matches!(kind, MatrixId::Dense | MatrixId::Band) {
                    return Err(LsError::ill_input(format!(
                        "difference-quotient Jacobians need a dense or band matrix, not {kind:?}"
                    )));
                }
                if !ls.package.has_explicit_rhs() {
                    return Err(LsError::ill_input(format!(
                        "{:?} needs an analytic Jacobian",
                        ls.package
                    )));
                }
            }
            ls.jacobian = Some(source);
            Ok(())
        })
    }

    pub fn set_jac_times(&mut self, source: JacTimesSource<'a, V>) -> LsResult<()> {
        self.configure("Jacobian-times-vector source", |ls| {
            if matches!(source, JacTimesSource::DifferenceQuotient) && !ls.package.has_explicit_rhs()
            {
                return Err(LsError::ill_input(format!(
                    "{:?} needs an analytic Jacobian-times-vector function",
                    ls.package
                )));
            }
            ls.jtimes = source;
            Ok(())
        })
    }

    /// Attach a preconditioner applied on `side`.
    pub fn set_preconditioner(
        &mut self,
        precond: impl Preconditioner<V> + 'a,
        side: PrecSide,
    ) -> LsResult<()> {
        self.configure("preconditioner", |ls| {
            ls.ls
                .set_preconditioner(side)
                .map_err(|e| LsError::ill_input(e.to_string()))?;
            ls.precond = Some(Box::new(precond));
            Ok(())
        })
    }

    /// Right-hand side `f(t, y)` used by difference quotients. May be
    /// replaced at any time.
    pub fn set_rhs_fn(&mut self, rhs: RhsFn<'a, V>) {
        self.rhs = Some(rhs);
    }

    // Setup

    /// Decide on Jacobian reuse, assemble the system and set up the solver.
    pub fn setup(&mut self, req: &SetupRequest<'_, V>) -> LsResult<SetupOutcome> {
        self.locked = true;
        self.stats.nsetups += 1;
        let result = self.setup_system(req);
        self.finish(result)
    }

    fn setup_system(&mut self, req: &SetupRequest<'_, V>) -> LsResult<SetupOutcome> {
        let state = &req.state;
        if state.y.len() != self.x.len() {
            return Err(LsError::ill_input(format!(
                "state has length {}, interface was attached for {}",
                state.y.len(),
                self.x.len()
            )));
        }

        let dgamma = if self.gamma_setup != 0.0 {
            (state.gamma / self.gamma_setup - 1.0).abs()
        } else {
            Real::INFINITY
        };
        let jbad = !self.jac_current
            || self.setups_since_eval >= self.config.msbj
            || !req.reuse_allowed
            || req.conv_fail == ConvergenceFailure::Other
            || (req.conv_fail == ConvergenceFailure::BadJacobian
                && dgamma < self.config.dgmax_jbad);

        let mut refreshed = if self.matrix.is_some() {
            self.assemble(state, jbad)?
        } else {
            jbad
        };
        self.gamma_setup = state.gamma;

        let mut op = LinearSystemOperator {
            form: self.form,
            state,
            matrix: self.matrix.as_deref(),
            mass: self.mass.as_deref(),
            jtimes: &mut self.jtimes,
            rhs: &mut self.rhs,
            precond: &mut self.precond,
            jok: !jbad,
            jcur: false,
            work: &mut self.work,
            jv: &mut self.jv,
            stats: &mut self.stats,
        };
        let result = self.ls.setup(self.matrix.as_deref(), &mut op);
        let precond_refreshed = op.jcur;
        result?;

        if self.matrix.is_none() {
            if precond_refreshed {
                self.stats.npe += 1;
                self.setups_since_eval = 1;
            } else {
                self.setups_since_eval += 1;
            }
            self.jac_current = true;
            refreshed |= precond_refreshed;
        }

        Ok(SetupOutcome {
            jacobian_refreshed: refreshed,
        })
    }

    /// Refresh or restore the Jacobian into the system matrix and apply the
    /// package transform. Returns whether the Jacobian was evaluated.
    fn assemble(&mut self, state: &SystemState<'_, V>, jbad: bool) -> LsResult<bool> {
        let (Some(a), Some(saved)) = (self.matrix.as_deref_mut(), self.saved_jac.as_deref_mut())
        else {
            return Err(LsError::ill_input("no system matrix attached"));
        };

        let refreshed = if jbad {
            a.zero()?;
            let outcome = match self.jacobian.as_mut() {
                None => {
                    return Err(LsError::ill_input(format!(
                        "no Jacobian source for a {:?} matrix; set an analytic Jacobian",
                        a.id()
                    )));
                }
                Some(JacobianSource::Analytic(jac)) => jac(state, &mut *a, &mut self.scratch),
                Some(JacobianSource::DifferenceQuotient) => {
                    let rhs = self.rhs.as_mut().ok_or_else(|| {
                        LsError::ill_input(
                            "difference-quotient Jacobian needs the right-hand side function",
                        )
                    })?;
                    let Scratch { tmp1, tmp2, .. } = &mut self.scratch;
                    let nfe = &mut self.stats.nfe_dq;
                    if let Some(dense) = a.downcast_mut::<DenseMatrix>() {
                        dq::dense_jacobian(rhs, state, dense, tmp1, tmp2, nfe)
                    } else if let Some(band) = a.downcast_mut::<BandMatrix>() {
                        dq::band_jacobian(rhs, state, band, tmp1, tmp2, nfe)
                    } else {
                        return Err(LsError::ill_input(
                            "difference-quotient Jacobian needs a dense or band matrix",
                        ));
                    }
                }
            };

            if let Err(e) = outcome {
                self.jac_current = false;
                return Err(Self::jacobian_failure(
                    e,
                    &mut self.jac_failures,
                    self.config.max_jac_retries,
                    &mut self.stats,
                ));
            }
            saved.copy_from(&*a)?;
            self.stats.nje += 1;
            self.jac_failures = 0;
            self.jac_current = true;
            self.setups_since_eval = 1;
            debug!(nje = self.stats.nje, gamma = state.gamma, "Jacobian evaluated");
            true
        } else {
            a.copy_from(&*saved)?;
            self.setups_since_eval += 1;
            false
        };

        match self.form {
            SystemForm::IdentityMinusGammaJ => a.scale_add_identity(-state.gamma)?,
            SystemForm::MassMinusGammaJ => {
                let m = self.mass.as_deref().ok_or_else(|| {
                    LsError::ill_input("M - gamma J needs a mass matrix; call set_mass_matrix")
                })?;
                a.scale_add(-state.gamma, m)?;
            }
            SystemForm::Jacobian => {}
        }
        a.matvec_setup()?;
        Ok(refreshed)
    }

    fn jacobian_failure(
        e: CallbackError,
        failures: &mut usize,
        max_retries: usize,
        stats: &mut LsStats,
    ) -> LsError {
        if !e.is_recoverable() {
            stats.nje_unrecoverable += 1;
            return LsError::JacUnrecoverable(format!("Jacobian function returned {}", e.code()));
        }
        *failures += 1;
        if *failures > max_retries {
            stats.nje_unrecoverable += 1;
            LsError::JacUnrecoverable(format!(
                "{failures} consecutive recoverable Jacobian failures"
            ))
        } else {
            stats.nje_recoverable += 1;
            LsError::JacRecoverable
        }
    }

    // Solve

    /// Solve the Newton system for the right-hand side `b`, in place.
    pub fn solve(&mut self, b: &mut V, req: &SolveRequest<'_, V>) -> LsResult<()> {
        self.locked = true;
        self.stats.nsolves += 1;
        let result = self.solve_system(b, req);
        self.finish(result)
    }

    fn solve_system(&mut self, b: &mut V, req: &SolveRequest<'_, V>) -> LsResult<()> {
        let n = self.x.len();
        if b.len() != n || req.state.weight.len() != n {
            return Err(LsError::ill_input(format!(
                "right-hand side length {} and weight length {} must equal system size {n}",
                b.len(),
                req.state.weight.len()
            )));
        }
        let state = &req.state;
        let weight = state.weight;
        let iterative = self.ls.kind() != SolverKind::Direct;

        let deltar = self.config.eplifac * req.tol;
        let mut delta = deltar * self.config.norm_factor(b.len());
        if iterative {
            let bnorm = b.wrms_norm(weight)?;
            if bnorm <= deltar {
                if req.newton_iter > 0 {
                    b.fill(0.0);
                }
                return Ok(());
            }
        }

        if self.ls.supports_scaling() {
            if self.config.scaling {
                self.ls.set_scaling_vectors(Some(weight), Some(weight))?;
            } else {
                self.ls.set_scaling_vectors(None, None)?;
            }
        } else if iterative && self.config.scaling {
            // Assume homogeneous weights: |S r|_2 ~ w_mean |r|_2.
            self.work.fill(1.0);
            let w_mean = weight.wrms_norm(&self.work)?;
            if w_mean > 0.0 {
                delta /= w_mean;
            }
        }

        if self.matrix.is_none() {
            if matches!(self.jtimes, JacTimesSource::DifferenceQuotient) && self.rhs.is_none() {
                return Err(LsError::ill_input(
                    "difference-quotient J v needs the right-hand side function",
                ));
            }
            if let JacTimesSource::Analytic {
                setup: Some(jtsetup),
                ..
            } = &mut self.jtimes
            {
                self.stats.njtsetup += 1;
                jtsetup(state).map_err(|e| {
                    LsError::LinearSolver(if e.is_recoverable() {
                        LinSolError::AtimesFailRec
                    } else {
                        LinSolError::AtimesFailUnrec
                    })
                })?;
            }
        }

        self.x.fill(0.0);
        self.ls.set_zero_guess(true);
        let mut op = LinearSystemOperator {
            form: self.form,
            state,
            matrix: self.matrix.as_deref(),
            mass: self.mass.as_deref(),
            jtimes: &mut self.jtimes,
            rhs: &mut self.rhs,
            precond: &mut self.precond,
            jok: true,
            jcur: false,
            work: &mut self.work,
            jv: &mut self.jv,
            stats: &mut self.stats,
        };
        let result = self
            .ls
            .solve(self.matrix.as_deref(), &mut op, &mut self.x, b, delta);

        b.scale(1.0, &self.x)?;
        if self.matrix.is_some() && self.config.scale_solution && self.gamma_setup != 0.0 {
            let gamrat = state.gamma / self.gamma_setup;
            if gamrat != 1.0 {
                b.scale_in_place(2.0 / (1.0 + gamrat));
            }
        }

        self.stats.nli += self.ls.num_iters();
        if result.is_err() {
            self.stats.ncfl += 1;
        }
        match result {
            Ok(()) => Ok(()),
            Err(LinSolError::ResReduced { .. }) if req.newton_iter == 0 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the outcome in the last flag and log failures.
    fn finish<T>(&mut self, result: LsResult<T>) -> LsResult<T> {
        match &result {
            Ok(_) => self.stats.last_flag = LsFlag::Success.code(),
            Err(e) => {
                self.stats.last_flag = e.code();
                if e.is_recoverable() {
                    warn!(flag = e.code(), "{e}");
                } else {
                    error!(flag = e.code(), "{e}");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::CallbackResult;
    use crate::linsol::{DenseLu, KrylovConfig, Spgmr};
    use crate::ls::callbacks::{FnPreconditioner, JacFn};
    use crate::nvector::SerialVector;
    use approx::assert_relative_eq;

    const J: [[Real; 3]; 3] = [[-2.0, 1.0, 0.0], [1.0, -3.0, 1.0], [0.0, 1.0, -4.0]];

    fn linear_rhs() -> RhsFn<'static, SerialVector> {
        Box::new(|_t: Real, y: &SerialVector, f: &mut SerialVector| -> CallbackResult {
            let y = y.as_slice().ok_or_else(CallbackError::unrecoverable)?;
            let f = f.as_mut_slice().ok_or_else(CallbackError::unrecoverable)?;
            for (fi, row) in f.iter_mut().zip(J.iter()) {
                *fi = row.iter().zip(y).map(|(a, b)| a * b).sum();
            }
            Ok(())
        })
    }

    /// `(I - gamma J) x`
    fn newton_product(x: &[Real], gamma: Real) -> Vec<Real> {
        J.iter()
            .zip(x)
            .map(|(row, xi)| xi - gamma * row.iter().zip(x).map(|(a, b)| a * b).sum::<Real>())
            .collect()
    }

    fn fixture() -> (SerialVector, SerialVector, SerialVector) {
        let y = SerialVector::from_vec(vec![1.0, 0.5, -0.25]);
        let mut fy = y.clone_empty();
        linear_rhs()(0.0, &y, &mut fy).unwrap();
        let w = SerialVector::from_vec(vec![1.0; 3]);
        (y, fy, w)
    }

    fn dense_entry(iface: &LinearSolverInterface<'_, SerialVector>, i: usize, j: usize) -> Real {
        iface
            .matrix()
            .and_then(|a| a.downcast_ref::<DenseMatrix>())
            .map(|a| a.get(i, j))
            .unwrap()
    }

    #[test]
    fn attach_rejects_mismatched_solver_and_matrix() {
        let y = SerialVector::zeros(3);

        let mut lu = DenseLu::new();
        let err = LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, None, &y)
            .unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);

        let mut band = BandMatrix::new(3, 1, 1);
        let err = LinearSolverInterface::<SerialVector>::attach(
            Package::Multistep,
            &mut lu,
            Some(&mut band),
            &y,
        )
        .unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);

        let mut small = DenseMatrix::new(2, 2);
        let err = LinearSolverInterface::<SerialVector>::attach(
            Package::Multistep,
            &mut lu,
            Some(&mut small),
            &y,
        )
        .unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);

        let mut gmres = Spgmr::matrix_free(&y, KrylovConfig::default());
        let mut a = DenseMatrix::new(3, 3);
        let err = LinearSolverInterface::<SerialVector>::attach(
            Package::Multistep,
            &mut gmres,
            Some(&mut a),
            &y,
        )
        .unwrap_err();
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn dense_newton_system_is_solved() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        let outcome = iface.setup(&SetupRequest::new(state)).unwrap();
        assert!(outcome.jacobian_refreshed);
        assert_relative_eq!(dense_entry(&iface, 0, 0), 1.2, epsilon = 1e-6);
        assert_relative_eq!(dense_entry(&iface, 1, 0), -0.1, epsilon = 1e-6);

        let rhs = [1.0, 2.0, 3.0];
        let mut b = SerialVector::from_slice(&rhs);
        iface.solve(&mut b, &SolveRequest::new(state, 0.1)).unwrap();
        let back = newton_product(b.as_slice().unwrap(), 0.1);
        for (got, want) in back.iter().zip(rhs) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }

        let stats = iface.stats();
        assert_eq!(stats.nje, 1);
        assert_eq!(stats.nfe_dq, 3);
        assert_eq!(stats.nsetups, 1);
        assert_eq!(stats.nsolves, 1);
        assert_eq!(iface.last_flag(), LsFlag::Success);
    }

    #[test]
    fn mass_form_assembles_m_minus_gamma_j() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface = LinearSolverInterface::<SerialVector>::attach(
            Package::RungeKutta,
            &mut lu,
            Some(&mut a),
            &y,
        )
        .unwrap();
        iface.set_rhs_fn(linear_rhs());
        iface.set_system_form(SystemForm::MassMinusGammaJ).unwrap();
        let diag = [2.0, 3.0, 4.0];
        let mut mass = DenseMatrix::new(3, 3);
        for (i, d) in diag.iter().enumerate() {
            mass.set(i, i, *d);
        }
        iface.set_mass_matrix(&mass).unwrap();
        assert_eq!(iface.form(), SystemForm::MassMinusGammaJ);

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        iface.setup(&SetupRequest::new(state)).unwrap();
        assert_relative_eq!(dense_entry(&iface, 0, 0), 2.2, epsilon = 1e-6);
        assert_relative_eq!(dense_entry(&iface, 2, 2), 4.4, epsilon = 1e-6);
        assert_relative_eq!(dense_entry(&iface, 0, 1), -0.1, epsilon = 1e-6);

        let rhs = [1.0, -1.0, 0.5];
        let mut b = SerialVector::from_slice(&rhs);
        iface.solve(&mut b, &SolveRequest::new(state, 0.1)).unwrap();
        let x = b.as_slice().unwrap();
        for i in 0..3 {
            let jx: Real = J[i].iter().zip(x).map(|(a, b)| a * b).sum();
            assert_relative_eq!(diag[i] * x[i] - 0.1 * jx, rhs[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn saved_jacobian_is_reused_until_the_frequency_expires() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());
        iface.set_jac_eval_frequency(3).unwrap();

        let mut refreshed = Vec::new();
        for k in 0..5 {
            let gamma = 0.1 * (k + 1) as Real;
            let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(gamma);
            refreshed.push(iface.setup(&SetupRequest::new(state)).unwrap().jacobian_refreshed);
            // The reused Jacobian is combined with the current gamma.
            assert_relative_eq!(dense_entry(&iface, 0, 0), 1.0 + 2.0 * gamma, epsilon = 1e-6);
        }
        assert_eq!(refreshed, [true, false, false, true, false]);
        assert_eq!(iface.stats().nje, 2);
        assert_eq!(iface.stats().nfe_dq, 6);
    }

    #[test]
    fn convergence_failures_force_a_refresh() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        iface.setup(&SetupRequest::new(state)).unwrap();

        let other = SetupRequest::new(state).with_conv_fail(ConvergenceFailure::Other);
        assert!(iface.setup(&other).unwrap().jacobian_refreshed);

        // Gamma barely moved: the Jacobian itself is suspect.
        let bad = SetupRequest::new(state).with_conv_fail(ConvergenceFailure::BadJacobian);
        assert!(iface.setup(&bad).unwrap().jacobian_refreshed);

        // Gamma moved a lot: retry with the saved Jacobian first.
        let moved = SystemState::new(0.0, &y, &fy, &w).with_gamma(1.0);
        let bad = SetupRequest::new(moved).with_conv_fail(ConvergenceFailure::BadJacobian);
        assert!(!iface.setup(&bad).unwrap().jacobian_refreshed);

        let fresh = SetupRequest::new(moved).fresh_jacobian();
        assert!(iface.setup(&fresh).unwrap().jacobian_refreshed);
        assert_eq!(iface.stats().nje, 4);
    }

    #[test]
    fn jacobian_failures_keep_the_saved_copy() {
        let fail = Cell::new(false);
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        let jac: JacFn<'_, SerialVector> = Box::new(
            |_s: &SystemState<'_, SerialVector>,
             m: &mut dyn SunMatrix,
             _w: &mut Scratch<SerialVector>|
             -> CallbackResult {
                if fail.get() {
                    return Err(CallbackError::recoverable());
                }
                let d = m
                    .downcast_mut::<DenseMatrix>()
                    .ok_or_else(CallbackError::unrecoverable)?;
                for (i, row) in J.iter().enumerate() {
                    for (j, v) in row.iter().enumerate() {
                        d.set(i, j, *v);
                    }
                }
                Ok(())
            },
        );
        iface.set_jacobian(JacobianSource::Analytic(jac)).unwrap();
        iface.set_max_jac_retries(1).unwrap();

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.5);
        iface.setup(&SetupRequest::new(state)).unwrap();
        assert!(iface.is_jacobian_current());

        fail.set(true);
        let err = iface
            .setup(&SetupRequest::new(state).fresh_jacobian())
            .unwrap_err();
        assert_eq!(err, LsError::JacRecoverable);
        assert_eq!(iface.last_flag(), LsFlag::JacFuncRecvr);
        assert!(!iface.is_jacobian_current());
        let saved = iface
            .saved_jacobian()
            .and_then(|m| m.downcast_ref::<DenseMatrix>())
            .unwrap();
        assert_eq!(saved.get(0, 0), -2.0);
        assert_eq!(saved.get(2, 1), 1.0);

        // A second consecutive failure exceeds the retry limit.
        let err = iface.setup(&SetupRequest::new(state)).unwrap_err();
        assert_eq!(err.flag(), LsFlag::JacFuncUnrecvr);

        let stats = iface.stats();
        assert_eq!(stats.nje, 1);
        assert_eq!(stats.nje_recoverable, 1);
        assert_eq!(stats.nje_unrecoverable, 1);
    }

    #[test]
    fn iterative_refresh_starts_from_a_zero_matrix() {
        let (y, fy, w) = fixture();
        let mut gmres = Spgmr::new(&y, KrylovConfig::default());
        let mut a = DenseMatrix::new(3, 3);
        let mut iface = LinearSolverInterface::<SerialVector>::attach(
            Package::Multistep,
            &mut gmres,
            Some(&mut a),
            &y,
        )
        .unwrap();
        // Writes only the off-diagonal coupling; every other entry is zero.
        let jac: JacFn<'_, SerialVector> = Box::new(
            |_s: &SystemState<'_, SerialVector>,
             m: &mut dyn SunMatrix,
             _w: &mut Scratch<SerialVector>|
             -> CallbackResult {
                let d = m
                    .downcast_mut::<DenseMatrix>()
                    .ok_or_else(CallbackError::unrecoverable)?;
                d.set(0, 1, 1.0);
                d.set(1, 0, 1.0);
                Ok(())
            },
        );
        iface.set_jacobian(JacobianSource::Analytic(jac)).unwrap();

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        iface.setup(&SetupRequest::new(state)).unwrap();
        assert_relative_eq!(dense_entry(&iface, 0, 0), 1.0);
        assert_relative_eq!(dense_entry(&iface, 0, 1), -0.1);

        iface
            .setup(&SetupRequest::new(state).fresh_jacobian())
            .unwrap();
        let saved = iface
            .saved_jacobian()
            .and_then(|m| m.downcast_ref::<DenseMatrix>())
            .unwrap();
        assert_eq!(saved.get(0, 0), 0.0);
        assert_eq!(saved.get(2, 2), 0.0);
        assert_eq!(saved.get(0, 1), 1.0);
        assert_relative_eq!(dense_entry(&iface, 0, 0), 1.0);
        assert_relative_eq!(dense_entry(&iface, 1, 1), 1.0);
        assert_relative_eq!(dense_entry(&iface, 1, 0), -0.1);
        assert_eq!(iface.stats().nje, 2);
    }

    #[test]
    fn wrong_length_right_hand_side_is_ill_input() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());
        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        iface.setup(&SetupRequest::new(state)).unwrap();

        let mut b = SerialVector::from_vec(vec![1.0, 2.0]);
        let err = iface.solve(&mut b, &SolveRequest::new(state, 0.1)).unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);
        assert!(!err.is_recoverable());
        assert_eq!(iface.last_flag(), LsFlag::IllInput);
        assert_eq!(b.as_slice().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn configuration_is_locked_until_initialize() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());
        iface.set_eps_lin(0.1).unwrap();
        assert_eq!(iface.config().eplifac, 0.1);

        let state = SystemState::new(0.0, &y, &fy, &w);
        iface.setup(&SetupRequest::new(state)).unwrap();
        let err = iface.set_eps_lin(0.2).unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);
        assert_eq!(iface.last_flag(), LsFlag::IllInput);
        assert_eq!(iface.config().eplifac, 0.1);

        iface.initialize().unwrap();
        assert_eq!(iface.stats().nsetups, 0);
        assert!(!iface.is_jacobian_current());
        iface.set_eps_lin(0.0).unwrap();
        assert_eq!(iface.config().eplifac, DEFAULT_EPLIFAC);
    }

    #[test]
    fn option_checks() {
        let y = SerialVector::zeros(3);
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Dae, &mut lu, Some(&mut a), &y)
                .unwrap();
        // No explicit right-hand side for residual-based systems.
        assert!(iface.set_jacobian(JacobianSource::DifferenceQuotient).is_err());
        assert!(iface.set_jac_times(JacTimesSource::DifferenceQuotient).is_err());
        assert!(iface.set_system_form(SystemForm::IdentityMinusGammaJ).is_err());
        assert!(iface.set_eps_lin(-1.0).is_err());
        assert_eq!(iface.config().msbj, 1);

        let precond = FnPreconditioner::new(
            |_s: &SystemState<'_, SerialVector>, _jok: bool| Ok(false),
            |_s: &SystemState<'_, SerialVector>,
             r: &SerialVector,
             z: &mut SerialVector,
             _delta: Real,
             _side: PrecSide| z.scale(1.0, r).map_err(|_| CallbackError::unrecoverable()),
        );
        let err = iface.set_preconditioner(precond, PrecSide::Left).unwrap_err();
        assert_eq!(err.flag(), LsFlag::IllInput);

        let mass = BandMatrix::new(3, 0, 0);
        assert!(iface.set_mass_matrix(&mass).is_err());
    }

    #[test]
    fn solution_is_scaled_when_gamma_changes() {
        let (y, fy, w) = fixture();
        let mut lu = DenseLu::new();
        let mut a = DenseMatrix::new(3, 3);
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut lu, Some(&mut a), &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());

        let at_setup = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.1);
        iface.setup(&SetupRequest::new(at_setup)).unwrap();
        let mut x1 = SerialVector::from_slice(&[1.0, 2.0, 3.0]);
        iface.solve(&mut x1, &SolveRequest::new(at_setup, 0.1)).unwrap();

        let later = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.2);
        let mut x2 = SerialVector::from_slice(&[1.0, 2.0, 3.0]);
        iface.solve(&mut x2, &SolveRequest::new(later, 0.1)).unwrap();

        for (a, b) in x1.as_slice().unwrap().iter().zip(x2.as_slice().unwrap()) {
            assert_relative_eq!(*b, a * 2.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn matrix_free_gmres_uses_difference_quotient_products() {
        let setups = Cell::new(0);
        let (y, fy, w) = fixture();
        let mut gmres = Spgmr::matrix_free(&y, KrylovConfig::with_max_l(3));
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut gmres, None, &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());

        let precond = FnPreconditioner::new(
            |_s: &SystemState<'_, SerialVector>, jok: bool| {
                setups.set(setups.get() + 1);
                Ok(!jok)
            },
            |_s: &SystemState<'_, SerialVector>,
             r: &SerialVector,
             z: &mut SerialVector,
             _delta: Real,
             _side: PrecSide| z.scale(1.0, r).map_err(|_| CallbackError::unrecoverable()),
        );
        iface.set_preconditioner(precond, PrecSide::Left).unwrap();

        let state = SystemState::new(0.0, &y, &fy, &w).with_gamma(0.25);
        assert!(iface.setup(&SetupRequest::new(state)).unwrap().jacobian_refreshed);
        assert!(!iface.setup(&SetupRequest::new(state)).unwrap().jacobian_refreshed);

        let rhs = [1.0, -2.0, 0.5];
        let mut b = SerialVector::from_slice(&rhs);
        iface.solve(&mut b, &SolveRequest::new(state, 1e-6)).unwrap();
        let back = newton_product(b.as_slice().unwrap(), 0.25);
        for (got, want) in back.iter().zip(rhs) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }

        let stats = iface.stats();
        assert_eq!(stats.npe, 1);
        assert!(stats.nli > 0 && stats.nli <= 3);
        assert!(stats.njtimes >= stats.nli);
        assert_eq!(stats.nfe_dq, stats.njtimes);
        assert!(stats.nps > 0);
        assert_eq!(stats.ncfl, 0);
        assert_eq!(setups.get(), 2);
    }

    #[test]
    fn small_right_hand_sides_skip_the_iterative_solve() {
        let (y, fy, w) = fixture();
        let mut gmres = Spgmr::matrix_free(&y, KrylovConfig::default());
        let mut iface =
            LinearSolverInterface::<SerialVector>::attach(Package::Multistep, &mut gmres, None, &y)
                .unwrap();
        iface.set_rhs_fn(linear_rhs());
        let state = SystemState::new(0.0, &y, &fy, &w);
        iface.setup(&SetupRequest::new(state)).unwrap();

        let mut b = SerialVector::from_slice(&[1e-9, -1e-9, 1e-9]);
        iface.solve(&mut b, &SolveRequest::new(state, 1.0)).unwrap();
        assert_eq!(b.as_slice().unwrap(), &[1e-9, -1e-9, 1e-9]);

        iface
            .solve(&mut b, &SolveRequest::new(state, 1.0).with_newton_iter(1))
            .unwrap();
        assert_eq!(b.as_slice().unwrap(), &[0.0; 3]);
        assert_eq!(iface.stats().nli, 0);
        assert_eq!(iface.stats().njtimes, 0);
    }
}

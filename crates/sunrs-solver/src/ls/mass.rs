//! Mass-matrix solves `M x = b` for integrators with a non-identity mass
//! matrix.

use std::fmt;

use tracing::{debug, warn};

use super::callbacks::Scratch;
use super::config::DEFAULT_EPLIFAC;
use super::interface::check_attachment;
use super::operator::{MassOperator, MassTimesFn};
use super::stats::MassStats;
use crate::Real;
use crate::error::{CallbackError, CallbackResult, LinSolError, LsError, LsFlag, LsResult};
use crate::linsol::{LinearSolver, SolverKind, SystemOperator};
use crate::matrix::SunMatrix;
use crate::nvector::NVector;

/// Fills the mass matrix at time `t`.
pub type MassFn<'a, V> =
    Box<dyn FnMut(Real, &mut dyn SunMatrix, &mut Scratch<V>) -> CallbackResult + 'a>;

fn mass_failure(e: CallbackError) -> LsError {
    if e.is_recoverable() {
        LsError::MassRecoverable
    } else {
        LsError::MassUnrecoverable(format!("mass function returned {}", e.code()))
    }
}

pub struct MassSolverInterface<'a, V: NVector> {
    ls: &'a mut dyn LinearSolver<V>,
    matrix: Option<&'a mut dyn SunMatrix>,
    mass_fn: Option<MassFn<'a, V>>,
    mtimes: Option<MassTimesFn<'a, V>>,
    time_dependent: bool,
    /// Time of the last mass evaluation.
    evaluated_at: Option<Real>,
    setup_done: bool,
    eplifac: Real,
    nrmfac: Option<Real>,
    scratch: Scratch<V>,
    x: V,
    stats: MassStats,
}

impl<V: NVector> fmt::Debug for MassSolverInterface<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MassSolverInterface")
            .field("solver", &self.ls.id())
            .field("matrix", &self.matrix.as_ref().map(|m| m.id()))
            .field("time_dependent", &self.time_dependent)
            .field("evaluated_at", &self.evaluated_at)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'a, V: NVector> MassSolverInterface<'a, V> {
    /// Attach `ls` and the mass matrix storage, if any.
    ///
    /// A time-independent mass matrix is evaluated and set up once.
    pub fn attach(
        ls: &'a mut dyn LinearSolver<V>,
        matrix: Option<&'a mut dyn SunMatrix>,
        template: &V,
        time_dependent: bool,
    ) -> LsResult<Self> {
        check_attachment(&*ls, matrix.as_deref(), template.len())?;
        ls.initialize()?;
        debug!(solver = ls.id().name(), time_dependent, "mass solver attached");
        Ok(Self {
            ls,
            matrix,
            mass_fn: None,
            mtimes: None,
            time_dependent,
            evaluated_at: None,
            setup_done: false,
            eplifac: DEFAULT_EPLIFAC,
            nrmfac: None,
            scratch: Scratch::new(template),
            x: template.clone_empty(),
            stats: MassStats::default(),
        })
    }

    pub fn stats(&self) -> &MassStats {
        &self.stats
    }

    pub fn last_flag(&self) -> LsFlag {
        LsFlag::from_code(self.stats.last_flag).unwrap_or(LsFlag::IllInput)
    }

    pub fn matrix(&self) -> Option<&dyn SunMatrix> {
        self.matrix.as_deref()
    }

    pub fn set_mass_fn(&mut self, mass_fn: MassFn<'a, V>) {
        self.mass_fn = Some(mass_fn);
        self.evaluated_at = None;
        self.setup_done = false;
    }

    /// Product `M v` for solvers working without a mass matrix.
    pub fn set_mass_times(&mut self, mtimes: MassTimesFn<'a, V>) {
        self.mtimes = Some(mtimes);
    }

    pub fn set_eps_lin(&mut self, eplifac: Real) -> LsResult<()> {
        let result = if eplifac < 0.0 || !eplifac.is_finite() {
            Err(LsError::ill_input(format!("eplifac = {eplifac} must be >= 0")))
        } else {
            self.eplifac = if eplifac == 0.0 { DEFAULT_EPLIFAC } else { eplifac };
            Ok(())
        };
        self.finish(result)
    }

    pub fn set_norm_factor(&mut self, nrmfac: Real) {
        self.nrmfac = (nrmfac > 0.0).then_some(nrmfac);
    }

    /// Evaluate `M(t)` if needed and set up the solver.
    pub fn mass_setup(&mut self, t: Real) -> LsResult<()> {
        let result = self.setup_at(t);
        self.finish(result)
    }

    fn setup_at(&mut self, t: Real) -> LsResult<()> {
        if self.setup_done && !self.time_dependent {
            return Ok(());
        }

        let stale = match self.evaluated_at {
            None => true,
            Some(t0) => self.time_dependent && t0 != t,
        };
        if let Some(m) = self.matrix.as_deref_mut() {
            if stale {
                let mass_fn = self
                    .mass_fn
                    .as_mut()
                    .ok_or_else(|| LsError::ill_input("no mass matrix function set"))?;
                m.zero()?;
                self.stats.nmass_evals += 1;
                mass_fn(t, &mut *m, &mut self.scratch).map_err(mass_failure)?;
                m.matvec_setup()?;
                self.evaluated_at = Some(t);
            }
        } else if self.mtimes.is_none() {
            return Err(LsError::ill_input(
                "matrix-free mass solves need a mass-times-vector function",
            ));
        }

        let mut op = MassOperator {
            t,
            matrix: self.matrix.as_deref(),
            mtimes: &mut self.mtimes,
            stats: &mut self.stats,
        };
        self.ls.setup(self.matrix.as_deref(), &mut op)?;
        self.stats.nmass_setups += 1;
        self.setup_done = true;
        Ok(())
    }

    /// Solve `M x = b` in place, to the WRMS tolerance `tol` under `weight`.
    pub fn mass_solve(&mut self, t: Real, b: &mut V, weight: &V, tol: Real) -> LsResult<()> {
        self.stats.nmass_solves += 1;
        let result = self.solve_at(t, b, weight, tol);
        self.finish(result)
    }

    fn solve_at(&mut self, t: Real, b: &mut V, weight: &V, tol: Real) -> LsResult<()> {
        let n = self.x.len();
        if b.len() != n || weight.len() != n {
            return Err(LsError::ill_input(format!(
                "right-hand side length {} and weight length {} must equal system size {n}",
                b.len(),
                weight.len()
            )));
        }
        let deltar = self.eplifac * tol;
        let iterative = self.ls.kind() != SolverKind::Direct;
        if iterative && b.wrms_norm(weight)? <= deltar {
            return Ok(());
        }
        let delta = deltar * self.nrmfac.unwrap_or_else(|| (b.len() as Real).sqrt());
        if self.ls.supports_scaling() {
            self.ls.set_scaling_vectors(Some(weight), Some(weight))?;
        }

        self.x.fill(0.0);
        self.ls.set_zero_guess(true);
        let mut op = MassOperator {
            t,
            matrix: self.matrix.as_deref(),
            mtimes: &mut self.mtimes,
            stats: &mut self.stats,
        };
        let result = self
            .ls
            .solve(self.matrix.as_deref(), &mut op, &mut self.x, b, delta);
        self.stats.nli += self.ls.num_iters();
        if let Err(e) = result {
            self.stats.ncfl += 1;
            return Err(e.into());
        }
        b.scale(1.0, &self.x)?;
        Ok(())
    }

    /// `mv = M v` at time `t`.
    pub fn mass_mult(&mut self, t: Real, v: &V, mv: &mut V) -> LsResult<()> {
        let mut op = MassOperator {
            t,
            matrix: self.matrix.as_deref(),
            mtimes: &mut self.mtimes,
            stats: &mut self.stats,
        };
        let result = op.apply(v, mv).map_err(|e| {
            LsError::LinearSolver(if e.is_recoverable() {
                LinSolError::AtimesFailRec
            } else {
                LinSolError::AtimesFailUnrec
            })
        });
        self.finish(result)
    }

    fn finish<T>(&mut self, result: LsResult<T>) -> LsResult<T> {
        self.stats.last_flag = match &result {
            Ok(_) => LsFlag::Success.code(),
            Err(e) => {
                warn!(flag = e.code(), "mass solver: {e}");
                e.code()
            }
        };
        result
    }
}

//! System operators handed to the linear solvers by the interfaces.

use super::callbacks::{JacTimesSource, Preconditioner, RhsFn, SystemState};
use super::config::SystemForm;
use super::dq;
use super::stats::{LsStats, MassStats};
use crate::Real;
use crate::error::{CallbackError, CallbackResult};
use crate::linsol::{PrecSide, SystemOperator};
use crate::matrix::{MatVec, SunMatrix};
use crate::nvector::NVector;

/// Matrix-free mass product `mv = M v` at time `t`.
pub type MassTimesFn<'a, V> = Box<dyn FnMut(Real, &V, &mut V) -> CallbackResult + 'a>;

fn product<V: NVector>(m: &dyn SunMatrix, v: &V, z: &mut V) -> CallbackResult {
    m.matvec(v, z)
        .map_err(|e| CallbackError::Unrecoverable(e.code()))
}

fn vector_failure<E>(_: E) -> CallbackError {
    CallbackError::unrecoverable()
}

/// `A v` for the Newton system, plus the attached preconditioner.
pub(crate) struct LinearSystemOperator<'o, 'a, V: NVector> {
    pub form: SystemForm,
    pub state: &'o SystemState<'o, V>,
    /// Assembled system matrix, when one is attached.
    pub matrix: Option<&'o dyn SunMatrix>,
    pub mass: Option<&'o dyn SunMatrix>,
    pub jtimes: &'o mut JacTimesSource<'a, V>,
    pub rhs: &'o mut Option<RhsFn<'a, V>>,
    pub precond: &'o mut Option<Box<dyn Preconditioner<V> + 'a>>,
    /// Whether the preconditioner may reuse its Jacobian data.
    pub jok: bool,
    /// Set when the preconditioner setup reports recomputed Jacobian data.
    pub jcur: bool,
    pub work: &'o mut V,
    pub jv: &'o mut V,
    pub stats: &'o mut LsStats,
}

impl<V: NVector> LinearSystemOperator<'_, '_, V> {
    /// `jv = J v`
    fn jac_times(&mut self, v: &V) -> CallbackResult {
        self.stats.njtimes += 1;
        match self.jtimes {
            JacTimesSource::Analytic { times, .. } => {
                times(v, &mut *self.jv, self.state, &mut *self.work)
            }
            JacTimesSource::DifferenceQuotient => {
                let rhs = self.rhs.as_mut().ok_or_else(CallbackError::unrecoverable)?;
                dq::jac_times(rhs, self.state, v, self.jv, self.work, &mut self.stats.nfe_dq)
            }
        }
    }
}

impl<V: NVector> SystemOperator<V> for LinearSystemOperator<'_, '_, V> {
    fn apply(&mut self, v: &V, z: &mut V) -> CallbackResult {
        if let Some(a) = self.matrix {
            return product(a, v, z);
        }
        self.jac_times(v)?;
        let gamma = self.state.gamma;
        match self.form {
            SystemForm::IdentityMinusGammaJ => {
                z.linear_sum(1.0, v, -gamma, self.jv).map_err(vector_failure)
            }
            SystemForm::MassMinusGammaJ => {
                let m = self.mass.ok_or_else(CallbackError::unrecoverable)?;
                product(m, v, z)?;
                z.axpy(-gamma, self.jv).map_err(vector_failure)
            }
            SystemForm::Jacobian => z.scale(1.0, self.jv).map_err(vector_failure),
        }
    }

    fn has_preconditioner(&self) -> bool {
        self.precond.is_some()
    }

    fn precond_setup(&mut self) -> CallbackResult {
        match self.precond.as_mut() {
            Some(p) => {
                self.jcur = p.setup(self.state, self.jok)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn precond_solve(&mut self, r: &V, z: &mut V, tol: Real, side: PrecSide) -> CallbackResult {
        let p = self
            .precond
            .as_mut()
            .ok_or_else(CallbackError::unrecoverable)?;
        self.stats.nps += 1;
        p.solve(self.state, r, z, tol, side)
    }
}

/// `M v` for mass solves.
pub(crate) struct MassOperator<'o, 'a, V: NVector> {
    pub t: Real,
    pub matrix: Option<&'o dyn SunMatrix>,
    pub mtimes: &'o mut Option<MassTimesFn<'a, V>>,
    pub stats: &'o mut MassStats,
}

impl<V: NVector> SystemOperator<V> for MassOperator<'_, '_, V> {
    fn apply(&mut self, v: &V, z: &mut V) -> CallbackResult {
        self.stats.nmass_mults += 1;
        match (self.matrix, self.mtimes.as_mut()) {
            (Some(m), _) => product(m, v, z),
            (None, Some(f)) => f(self.t, v, z),
            (None, None) => Err(CallbackError::unrecoverable()),
        }
    }
}

//! Banded preconditioner for matrix-free Krylov solves.
//!
//! Approximates `J` by a band matrix from difference quotients of the
//! right-hand side and preconditions with the band LU factors of
//! `I - gamma J`. Useful when the Jacobian is dominated by a band around
//! the diagonal but the full system is too large to factor.

use tracing::debug;

use super::callbacks::{Preconditioner, RhsFn, SystemState, host_mut};
use super::dq;
use crate::Real;
use crate::error::{CallbackError, CallbackResult};
use crate::linsol::PrecSide;
use crate::linsol::band::{band_factor, band_solve};
use crate::matrix::{BandMatrix, SunMatrix};
use crate::nvector::NVector;

fn matrix_failure<E>(_: E) -> CallbackError {
    CallbackError::unrecoverable()
}

pub struct BandPreconditioner<'a, V: NVector> {
    saved_j: BandMatrix,
    saved_p: BandMatrix,
    pivots: Vec<usize>,
    has_jacobian: bool,
    rhs: RhsFn<'a, V>,
    ytemp: V,
    ftemp: V,
    nfe: usize,
}

impl<V: NVector> std::fmt::Debug for BandPreconditioner<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandPreconditioner")
            .field("n", &self.saved_j.size())
            .field("mu", &self.saved_j.upper_bandwidth())
            .field("ml", &self.saved_j.lower_bandwidth())
            .field("nfe", &self.nfe)
            .finish()
    }
}

impl<'a, V: NVector> BandPreconditioner<'a, V> {
    /// Bandwidths are clamped to `N - 1`.
    pub fn new(template: &V, mu: usize, ml: usize, rhs: RhsFn<'a, V>) -> Self {
        let n = template.len();
        let mu = mu.min(n.saturating_sub(1));
        let ml = ml.min(n.saturating_sub(1));
        Self {
            saved_j: BandMatrix::new(n, mu, ml),
            saved_p: BandMatrix::new(n, mu, ml),
            pivots: vec![0; n],
            has_jacobian: false,
            rhs,
            ytemp: template.clone_empty(),
            ftemp: template.clone_empty(),
            nfe: 0,
        }
    }

    /// Right-hand side evaluations spent on difference quotients.
    pub fn num_rhs_evals(&self) -> usize {
        self.nfe
    }

    pub fn bandwidths(&self) -> (usize, usize) {
        (
            self.saved_j.upper_bandwidth(),
            self.saved_j.lower_bandwidth(),
        )
    }
}

impl<V: NVector> Preconditioner<V> for BandPreconditioner<'_, V> {
    fn setup(&mut self, state: &SystemState<'_, V>, jok: bool) -> CallbackResult<bool> {
        let jcur = !jok || !self.has_jacobian;
        if jcur {
            self.saved_j.zero().map_err(matrix_failure)?;
            dq::band_jacobian(
                &mut self.rhs,
                state,
                &mut self.saved_j,
                &mut self.ytemp,
                &mut self.ftemp,
                &mut self.nfe,
            )?;
            self.has_jacobian = true;
        }

        self.saved_p
            .copy_from(&self.saved_j)
            .map_err(matrix_failure)?;
        self.saved_p
            .scale_add_identity(-state.gamma)
            .map_err(matrix_failure)?;
        band_factor(&mut self.saved_p, &mut self.pivots).map_err(|col| {
            debug!(column = col, "band preconditioner is singular");
            CallbackError::recoverable()
        })?;
        Ok(jcur)
    }

    fn solve(
        &mut self,
        _state: &SystemState<'_, V>,
        r: &V,
        z: &mut V,
        _delta: Real,
        _side: PrecSide,
    ) -> CallbackResult {
        z.scale(1.0, r).map_err(matrix_failure)?;
        band_solve(&self.saved_p, &self.pivots, host_mut(z)?);
        Ok(())
    }
}

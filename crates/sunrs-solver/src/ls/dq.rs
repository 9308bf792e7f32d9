//! Difference-quotient approximations of `J = df/dy` and `J v`.

use tracing::trace;

use super::callbacks::{RhsFn, SystemState, host, host_mut};
use crate::error::{CallbackError, CallbackResult};
use crate::matrix::{BandMatrix, DenseMatrix};
use crate::nvector::NVector;
use crate::{Real, UNIT_ROUNDOFF};

/// Scales the floor on increments relative to `|h| * uround * N * |f|`.
const MIN_INC_MULT: Real = 1000.0;

/// Recoverable RHS failures tolerated while shrinking the `J v` increment.
const MAX_DQ_ITERS: usize = 3;

fn vector_failure<E>(_: E) -> CallbackError {
    CallbackError::unrecoverable()
}

/// Smallest increment allowed, from the weighted size of `f(t, y)`.
fn min_increment<V: NVector>(state: &SystemState<'_, V>) -> CallbackResult<Real> {
    let fnorm = state.fy.wrms_norm(state.weight).map_err(vector_failure)?;
    let n = state.y.len() as Real;
    Ok(if fnorm != 0.0 {
        MIN_INC_MULT * state.h.abs() * UNIT_ROUNDOFF * n * fnorm
    } else {
        1.0
    })
}

#[inline]
fn increment(yj: Real, wj: Real, min_inc: Real) -> Real {
    (UNIT_ROUNDOFF.sqrt() * yj.abs()).max(min_inc / wj)
}

/// Dense Jacobian, one right-hand side evaluation per column.
///
/// `ytemp` and `ftemp` are work vectors; `nfe` counts the evaluations.
pub fn dense_jacobian<V: NVector>(
    rhs: &mut RhsFn<'_, V>,
    state: &SystemState<'_, V>,
    jac: &mut DenseMatrix,
    ytemp: &mut V,
    ftemp: &mut V,
    nfe: &mut usize,
) -> CallbackResult {
    let n = state.y.len();
    let min_inc = min_increment(state)?;
    ytemp.scale(1.0, state.y).map_err(vector_failure)?;
    let y = host(state.y)?;
    let w = host(state.weight)?;
    let fy = host(state.fy)?;

    for j in 0..n {
        let inc = increment(y[j], w[j], min_inc);
        host_mut(ytemp)?[j] = y[j] + inc;
        let result = rhs(state.t, ytemp, ftemp);
        *nfe += 1;
        host_mut(ytemp)?[j] = y[j];
        result?;

        let f = host(ftemp)?;
        for ((jij, fi), fyi) in jac.column_mut(j).iter_mut().zip(f).zip(fy) {
            *jij = (fi - fyi) / inc;
        }
    }
    trace!(n, "dense difference-quotient Jacobian");
    Ok(())
}

/// Band Jacobian with `min(mu + ml + 1, N)` right-hand side evaluations:
/// columns further apart than the bandwidth are perturbed together.
pub fn band_jacobian<V: NVector>(
    rhs: &mut RhsFn<'_, V>,
    state: &SystemState<'_, V>,
    jac: &mut BandMatrix,
    ytemp: &mut V,
    ftemp: &mut V,
    nfe: &mut usize,
) -> CallbackResult {
    let n = state.y.len();
    let (mu, ml) = (jac.upper_bandwidth(), jac.lower_bandwidth());
    let width = mu + ml + 1;
    let min_inc = min_increment(state)?;
    ytemp.scale(1.0, state.y).map_err(vector_failure)?;
    let y = host(state.y)?;
    let w = host(state.weight)?;
    let fy = host(state.fy)?;

    for group in 0..width.min(n) {
        {
            let yt = host_mut(ytemp)?;
            for j in (group..n).step_by(width) {
                yt[j] += increment(y[j], w[j], min_inc);
            }
        }
        let result = rhs(state.t, ytemp, ftemp);
        *nfe += 1;
        {
            let yt = host_mut(ytemp)?;
            for j in (group..n).step_by(width) {
                yt[j] = y[j];
            }
        }
        result?;

        let f = host(ftemp)?;
        for j in (group..n).step_by(width) {
            let inc_inv = 1.0 / increment(y[j], w[j], min_inc);
            for i in jac.column_rows(j) {
                jac.set(i, j, inc_inv * (f[i] - fy[i]))
                    .map_err(vector_failure)?;
            }
        }
    }
    trace!(n, mu, ml, "band difference-quotient Jacobian");
    Ok(())
}

/// `jv ~ (f(t, y + sigma v) - f(t, y)) / sigma` with `sigma = 1 / |v|_wrms`.
///
/// A recoverable RHS failure shrinks `sigma` by four and retries, up to
/// [`MAX_DQ_ITERS`] attempts.
pub fn jac_times<V: NVector>(
    rhs: &mut RhsFn<'_, V>,
    state: &SystemState<'_, V>,
    v: &V,
    jv: &mut V,
    work: &mut V,
    nfe: &mut usize,
) -> CallbackResult {
    let vnorm = v.wrms_norm(state.weight).map_err(vector_failure)?;
    if vnorm == 0.0 {
        jv.fill(0.0);
        return Ok(());
    }

    let mut sig = 1.0 / vnorm;
    let mut last = Ok(());
    for _ in 0..MAX_DQ_ITERS {
        work.linear_sum(sig, v, 1.0, state.y).map_err(vector_failure)?;
        last = rhs(state.t, work, jv);
        *nfe += 1;
        match last {
            Ok(()) => break,
            Err(e) if e.is_recoverable() => sig *= 0.25,
            Err(e) => return Err(e),
        }
    }
    last?;

    let siginv = 1.0 / sig;
    work.scale(1.0, jv).map_err(vector_failure)?;
    jv.linear_sum(siginv, work, -siginv, state.fy)
        .map_err(vector_failure)
}

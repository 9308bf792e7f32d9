//! The abstract vector contract.
//!
//! Every backend implements the required operations of [`NVector`]. The fused
//! operations have default implementations built from the required ones; a
//! backend may override them for speed but must produce bit-identical results,
//! which in practice means keeping the same per-element evaluation order.
//!
//! Every fallible operation validates all operand lengths before writing
//! anything, so an `Err` always leaves the output vector untouched.

use serde::{Deserialize, Serialize};

use crate::Real;
use crate::error::{VectorError, VectorResult};

/// Backend family tag, usable for dispatch without a trait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorId {
    Serial,
    Threaded,
    Custom,
}

/// Returns an error unless `actual == expected`.
#[inline]
pub fn check_len(expected: usize, actual: usize) -> VectorResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(VectorError::LengthMismatch { expected, actual })
    }
}

#[inline]
fn check_count(expected: usize, actual: usize) -> VectorResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(VectorError::ArrayMismatch { expected, actual })
    }
}

/// A linear combination needs one coefficient per vector and at least one term.
#[inline]
pub(crate) fn check_combination_shape(coeffs: usize, vectors: usize) -> VectorResult<()> {
    check_count(coeffs, vectors)?;
    if vectors == 0 {
        return Err(VectorError::ArrayMismatch {
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}

/// Abstract vector operations.
///
/// Operations writing a result take the output as `&mut self`. Unless noted,
/// operands are distinct values; in-place variants (`axpy`,
/// `scale_in_place`) are the documented aliasing forms.
pub trait NVector: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn id(&self) -> VectorId;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// New vector of the same backend, length and configuration, zero filled.
    fn clone_empty(&self) -> Self;

    /// Host view of the data, when the backend keeps it in host memory.
    fn as_slice(&self) -> Option<&[Real]>;

    fn as_mut_slice(&mut self) -> Option<&mut [Real]>;

    /// `self = a*x + b*y`
    fn linear_sum(&mut self, a: Real, x: &Self, b: Real, y: &Self) -> VectorResult<()>;

    /// `self = a*x + self`
    fn axpy(&mut self, a: Real, x: &Self) -> VectorResult<()>;

    /// `self_i = c`
    fn fill(&mut self, c: Real);

    /// `self = c*x`
    fn scale(&mut self, c: Real, x: &Self) -> VectorResult<()>;

    /// `self = c*self`
    fn scale_in_place(&mut self, c: Real);

    /// `self_i = x_i * y_i`
    fn prod(&mut self, x: &Self, y: &Self) -> VectorResult<()>;

    /// `self_i = x_i / y_i`, without testing `y_i` for zero.
    fn div(&mut self, x: &Self, y: &Self) -> VectorResult<()>;

    /// `self_i = |x_i|`
    fn abs(&mut self, x: &Self) -> VectorResult<()>;

    /// `self_i = 1 / x_i`, without testing `x_i` for zero.
    fn inv(&mut self, x: &Self) -> VectorResult<()>;

    /// `self_i = x_i + b`
    fn add_const(&mut self, x: &Self, b: Real) -> VectorResult<()>;

    fn dot(&self, y: &Self) -> VectorResult<Real>;

    /// `max_i |x_i|`, zero for an empty vector.
    fn max_norm(&self) -> Real;

    /// `sqrt(sum (x_i w_i)^2 / n)`
    fn wrms_norm(&self, w: &Self) -> VectorResult<Real>;

    /// Weighted RMS norm over the entries where `id_i > 0`, still divided by
    /// the full length.
    fn wrms_norm_mask(&self, w: &Self, id: &Self) -> VectorResult<Real>;

    /// `min_i x_i`, `Real::MAX` for an empty vector.
    fn min(&self) -> Real;

    /// `sqrt(sum (x_i w_i)^2)`
    fn wl2_norm(&self, w: &Self) -> VectorResult<Real>;

    /// `sum |x_i|`
    fn l1_norm(&self) -> Real;

    /// `self_i = 1` if `|x_i| >= c`, else `0`.
    fn compare(&mut self, c: Real, x: &Self) -> VectorResult<()>;

    /// `self_i = 1 / x_i` for every nonzero `x_i`; returns `false` if some
    /// `x_i` is zero.
    fn inv_test(&mut self, x: &Self) -> VectorResult<bool>;

    /// Constraint test of `x` against codes `c` (`2: x>0`, `1: x>=0`,
    /// `-1: x<=0`, `-2: x<0`, `0: none`). Sets `self_i = 1` where the test
    /// fails and `0` elsewhere; returns `true` when every test passes.
    fn constr_mask(&mut self, c: &Self, x: &Self) -> VectorResult<bool>;

    /// `min_i self_i / denom_i` over entries with `denom_i != 0`,
    /// `Real::MAX` when there are none.
    fn min_quotient(&self, denom: &Self) -> VectorResult<Real>;

    // Fused operations.

    /// `self = sum_k c_k * xs_k`
    fn linear_combination(&mut self, c: &[Real], xs: &[&Self]) -> VectorResult<()> {
        check_combination_shape(c.len(), xs.len())?;
        for x in xs {
            check_len(self.len(), x.len())?;
        }
        self.scale(c[0], xs[0])?;
        for (ck, xk) in c.iter().zip(xs).skip(1) {
            self.axpy(*ck, xk)?;
        }
        Ok(())
    }

    /// `zs_k = a_k * x + ys_k`
    fn scale_add_multi(a: &[Real], x: &Self, ys: &[Self], zs: &mut [Self]) -> VectorResult<()> {
        check_count(a.len(), ys.len())?;
        check_count(a.len(), zs.len())?;
        for (y, z) in ys.iter().zip(zs.iter()) {
            check_len(x.len(), y.len())?;
            check_len(x.len(), z.len())?;
        }
        for ((ak, y), z) in a.iter().zip(ys).zip(zs.iter_mut()) {
            z.linear_sum(*ak, x, 1.0, y)?;
        }
        Ok(())
    }

    /// `out_k = self . ys_k`
    fn dot_multi(&self, ys: &[&Self], out: &mut [Real]) -> VectorResult<()> {
        check_count(ys.len(), out.len())?;
        for y in ys {
            check_len(self.len(), y.len())?;
        }
        for (y, o) in ys.iter().zip(out.iter_mut()) {
            *o = self.dot(y)?;
        }
        Ok(())
    }

    /// `zs_k = a * xs_k + b * ys_k`
    fn linear_sum_array(
        a: Real,
        xs: &[Self],
        b: Real,
        ys: &[Self],
        zs: &mut [Self],
    ) -> VectorResult<()> {
        check_count(xs.len(), ys.len())?;
        check_count(xs.len(), zs.len())?;
        for ((x, y), z) in xs.iter().zip(ys).zip(zs.iter()) {
            check_len(z.len(), x.len())?;
            check_len(z.len(), y.len())?;
        }
        for ((x, y), z) in xs.iter().zip(ys).zip(zs.iter_mut()) {
            z.linear_sum(a, x, b, y)?;
        }
        Ok(())
    }

    /// `zs_k = c_k * zs_k`
    fn scale_array(c: &[Real], zs: &mut [Self]) -> VectorResult<()> {
        check_count(c.len(), zs.len())?;
        for (ck, z) in c.iter().zip(zs.iter_mut()) {
            z.scale_in_place(*ck);
        }
        Ok(())
    }

    fn fill_array(c: Real, zs: &mut [Self]) {
        for z in zs.iter_mut() {
            z.fill(c);
        }
    }

    /// `out_k = ||xs_k||_wrms(ws_k)`
    fn wrms_norm_array(xs: &[Self], ws: &[Self], out: &mut [Real]) -> VectorResult<()> {
        check_count(xs.len(), ws.len())?;
        check_count(xs.len(), out.len())?;
        for (x, w) in xs.iter().zip(ws) {
            check_len(x.len(), w.len())?;
        }
        for ((x, w), o) in xs.iter().zip(ws).zip(out.iter_mut()) {
            *o = x.wrms_norm(w)?;
        }
        Ok(())
    }
}

/// Constraint test for a single entry, shared by the host backends.
#[inline]
pub(crate) fn constraint_violated(c: Real, x: Real) -> bool {
    if c == 0.0 {
        return false;
    }
    let strict = c.abs() > 1.5;
    let positive = c > 0.0;
    match (positive, strict) {
        (true, true) => x <= 0.0,
        (true, false) => x < 0.0,
        (false, true) => x >= 0.0,
        (false, false) => x > 0.0,
    }
}

//! Building blocks shared by the Krylov solvers: Gram-Schmidt
//! orthogonalization, the Givens QR factorization of the Hessenberg matrix,
//! and the mapping of callback failures onto solver errors.

use nalgebra::DMatrix;

use crate::Real;
use crate::error::{CallbackError, LinSolError, LinSolResult};
use crate::nvector::NVector;

/// A second orthogonalization pass runs when the norm drops by more than
/// this factor.
const REORTH_FACTOR: Real = 1000.0;

pub(crate) fn atimes_error(e: CallbackError) -> LinSolError {
    if e.is_recoverable() {
        LinSolError::AtimesFailRec
    } else {
        LinSolError::AtimesFailUnrec
    }
}

pub(crate) fn psolve_error(e: CallbackError) -> LinSolError {
    if e.is_recoverable() {
        LinSolError::PsolveFailRec
    } else {
        LinSolError::PsolveFailUnrec
    }
}

pub(crate) fn pset_error(e: CallbackError) -> LinSolError {
    if e.is_recoverable() {
        LinSolError::PsetFailRec
    } else {
        LinSolError::PsetFailUnrec
    }
}

/// Copies `src` into `slot`, reusing its storage when the lengths agree.
pub(crate) fn store_scaling<V: NVector>(slot: &mut Option<V>, src: Option<&V>) -> LinSolResult<()> {
    if let (Some(dst), Some(src)) = (slot.as_mut(), src) {
        if dst.len() == src.len() {
            dst.scale(1.0, src)?;
            return Ok(());
        }
    }
    *slot = src.cloned();
    Ok(())
}

fn norm<V: NVector>(v: &V) -> LinSolResult<Real> {
    Ok(v.dot(v)?.sqrt())
}

/// Orthogonalizes `basis[k]` against `basis[i0..k]` with modified
/// Gram-Schmidt, storing the projections in column `k - 1` of `h`.
/// Returns the norm of the orthogonalized vector.
pub fn modified_gs<V: NVector>(
    basis: &mut [V],
    h: &mut DMatrix<Real>,
    k: usize,
    p: usize,
) -> LinSolResult<Real> {
    let i0 = k.saturating_sub(p);
    let (head, tail) = basis.split_at_mut(k);
    let vk = &mut tail[0];
    let vk_norm = norm(vk)?;

    for (i, vi) in head.iter().enumerate().skip(i0) {
        let hik = vi.dot(vk)?;
        h[(i, k - 1)] = hik;
        vk.axpy(-hik, vi)?;
    }
    let mut new_norm = norm(vk)?;

    if REORTH_FACTOR * new_norm < vk_norm {
        for (i, vi) in head.iter().enumerate().skip(i0) {
            let temp = vi.dot(vk)?;
            if temp == 0.0 {
                continue;
            }
            h[(i, k - 1)] += temp;
            vk.axpy(-temp, vi)?;
        }
        new_norm = norm(vk)?;
    }
    if !new_norm.is_finite() {
        return Err(LinSolError::GsFail);
    }
    Ok(new_norm)
}

/// Classical Gram-Schmidt variant of [`modified_gs`]: all projections are
/// computed against the unmodified vector, then subtracted at once.
pub fn classical_gs<V: NVector>(
    basis: &mut [V],
    h: &mut DMatrix<Real>,
    k: usize,
    p: usize,
) -> LinSolResult<Real> {
    let i0 = k.saturating_sub(p);
    let (head, tail) = basis.split_at_mut(k);
    let vk = &mut tail[0];
    let vk_norm = norm(vk)?;

    let project = |vk: &mut V, h: &mut DMatrix<Real>| -> LinSolResult<()> {
        let prev: Vec<&V> = head[i0..].iter().collect();
        let mut dots = vec![0.0; prev.len()];
        vk.dot_multi(&prev, &mut dots)?;
        for (offset, (&d, vi)) in dots.iter().zip(&prev).enumerate() {
            h[(i0 + offset, k - 1)] += d;
            vk.axpy(-d, vi)?;
        }
        Ok(())
    };

    for i in i0..k {
        h[(i, k - 1)] = 0.0;
    }
    project(vk, h)?;
    let mut new_norm = norm(vk)?;

    if REORTH_FACTOR * new_norm < vk_norm {
        project(vk, h)?;
        new_norm = norm(vk)?;
    }
    if !new_norm.is_finite() {
        return Err(LinSolError::GsFail);
    }
    Ok(new_norm)
}

/// Givens rotation zeroing `b` against `a`.
fn givens(a: Real, b: Real) -> (Real, Real) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if b.abs() >= a.abs() {
        let t = a / b;
        let s = -1.0 / (1.0 + t * t).sqrt();
        (-s * t, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, -c * t)
    }
}

/// Extends the QR factorization of the `(n+1) x n` Hessenberg matrix `h`
/// after column `n - 1` was added. `q` holds `(c, s)` pairs of the
/// rotations. Returns the column whose diagonal became exactly zero.
pub fn qr_update(n: usize, h: &mut DMatrix<Real>, q: &mut [Real]) -> Result<(), usize> {
    let col = n - 1;
    for k in 0..col {
        let (c, s) = (q[2 * k], q[2 * k + 1]);
        let t1 = h[(k, col)];
        let t2 = h[(k + 1, col)];
        h[(k, col)] = c * t1 - s * t2;
        h[(k + 1, col)] = s * t1 + c * t2;
    }
    let t1 = h[(col, col)];
    let t2 = h[(n, col)];
    let (c, s) = givens(t1, t2);
    q[2 * col] = c;
    q[2 * col + 1] = s;
    h[(col, col)] = c * t1 - s * t2;
    if h[(col, col)] == 0.0 {
        Err(col)
    } else {
        Ok(())
    }
}

/// Solves the least-squares problem `min |b - H y|` from the factors of
/// [`qr_update`]. `b` has length `n + 1`; the solution overwrites `b[..n]`.
pub fn qr_solve(n: usize, h: &DMatrix<Real>, q: &[Real], b: &mut [Real]) -> Result<(), usize> {
    for k in 0..n {
        let (c, s) = (q[2 * k], q[2 * k + 1]);
        let t1 = b[k];
        let t2 = b[k + 1];
        b[k] = c * t1 - s * t2;
        b[k + 1] = s * t1 + c * t2;
    }
    for k in (0..n).rev() {
        if h[(k, k)] == 0.0 {
            return Err(k);
        }
        b[k] /= h[(k, k)];
        for i in 0..k {
            b[i] -= b[k] * h[(i, k)];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvector::SerialVector;
    use approx::assert_relative_eq;

    fn basis() -> Vec<SerialVector> {
        vec![
            SerialVector::from_vec(vec![1.0, 0.0, 0.0]),
            SerialVector::from_vec(vec![0.0, 1.0, 0.0]),
            SerialVector::from_vec(vec![3.0, 4.0, 5.0]),
        ]
    }

    #[test]
    fn both_gram_schmidt_variants_orthogonalize() {
        for classical in [false, true] {
            let mut v = basis();
            let mut h = DMatrix::zeros(3, 2);
            let norm = if classical {
                classical_gs(&mut v, &mut h, 2, 2).unwrap()
            } else {
                modified_gs(&mut v, &mut h, 2, 2).unwrap()
            };
            assert_relative_eq!(norm, 5.0, epsilon = 1e-14);
            assert_relative_eq!(h[(0, 1)], 3.0, epsilon = 1e-14);
            assert_relative_eq!(h[(1, 1)], 4.0, epsilon = 1e-14);
            assert_eq!(v[2].as_slice().unwrap(), &[0.0, 0.0, 5.0]);
        }
    }

    #[test]
    fn givens_qr_solves_least_squares() {
        // H = [[2, 1], [1, 3], [0, 1]], b = H * [1, 1]
        let mut h = DMatrix::from_row_slice(3, 2, &[2.0, 1.0, 1.0, 3.0, 0.0, 1.0]);
        let mut q = vec![0.0; 4];
        qr_update(1, &mut h, &mut q).unwrap();
        qr_update(2, &mut h, &mut q).unwrap();
        let mut b = vec![3.0, 4.0, 1.0];
        qr_solve(2, &h, &q, &mut b).unwrap();
        assert_relative_eq!(b[0], 1.0, epsilon = 1e-13);
        assert_relative_eq!(b[1], 1.0, epsilon = 1e-13);
        assert!(b[2].abs() < 1e-13);
    }

    #[test]
    fn scaling_slot_reuses_storage() {
        let mut slot: Option<SerialVector> = None;
        let w = SerialVector::from_vec(vec![2.0, 3.0]);
        store_scaling(&mut slot, Some(&w)).unwrap();
        assert_eq!(slot.as_ref(), Some(&w));
        store_scaling(&mut slot, None).unwrap();
        assert!(slot.is_none());
    }
}

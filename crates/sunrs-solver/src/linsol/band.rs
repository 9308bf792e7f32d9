//! Band LU with partial pivoting, in the band storage of [`BandMatrix`].

use tracing::debug;

use super::traits::{
    LinearSolver, SolverId, SolverKind, SolverStatus, SystemOperator, check_matrix_arg,
    host_slice, host_slice_mut,
};
use crate::Real;
use crate::error::{LinSolError, LinSolResult};
use crate::matrix::{BandMatrix, MatrixId, SunMatrix};
use crate::nvector::NVector;

/// In-place band LU factorization.
///
/// On success `lu` holds `U` in its upper band (up to `smu`) and the
/// negated multipliers of `L` below the diagonal; `pivots[k]` is the row
/// swapped with row `k`. Returns the first column with a zero pivot.
pub fn band_factor(lu: &mut BandMatrix, pivots: &mut [usize]) -> Result<(), usize> {
    let n = lu.size();
    let ml = lu.lower_bandwidth();
    let mu = lu.upper_bandwidth();
    let smu = lu.storage_upper_bandwidth();
    let ldim = lu.ldim();
    let a = lu.data_mut();
    let at = |i: usize, j: usize| j * ldim + i + smu - j;

    if n == 0 {
        return Ok(());
    }

    // Clear the fill rows above the logical band.
    for j in 0..n {
        a[j * ldim..j * ldim + (smu - mu)].fill(0.0);
    }

    for k in 0..n - 1 {
        let last_row = (k + ml).min(n - 1);

        let mut l = k;
        let mut max = a[at(k, k)].abs();
        for i in k + 1..=last_row {
            if a[at(i, k)].abs() > max {
                l = i;
                max = a[at(i, k)].abs();
            }
        }
        pivots[k] = l;
        if a[at(l, k)] == 0.0 {
            return Err(k);
        }

        let swap = l != k;
        if swap {
            a.swap(at(l, k), at(k, k));
        }

        let mult = -1.0 / a[at(k, k)];
        for i in k + 1..=last_row {
            a[at(i, k)] *= mult;
        }

        let last_col = (k + smu).min(n - 1);
        for j in k + 1..=last_col {
            let a_kj = a[at(l, j)];
            if swap {
                a[at(l, j)] = a[at(k, j)];
                a[at(k, j)] = a_kj;
            }
            if a_kj != 0.0 {
                for i in k + 1..=last_row {
                    a[at(i, j)] += a_kj * a[at(i, k)];
                }
            }
        }
    }

    pivots[n - 1] = n - 1;
    if a[at(n - 1, n - 1)] == 0.0 {
        return Err(n - 1);
    }
    Ok(())
}

/// Solves `A x = b` in place in `b` from the factors of [`band_factor`].
pub fn band_solve(lu: &BandMatrix, pivots: &[usize], b: &mut [Real]) {
    let n = lu.size();
    let ml = lu.lower_bandwidth();
    let smu = lu.storage_upper_bandwidth();
    let ldim = lu.ldim();
    let a = lu.data();
    let at = |i: usize, j: usize| j * ldim + i + smu - j;

    if n == 0 {
        return;
    }

    for k in 0..n - 1 {
        let l = pivots[k];
        let mult = b[l];
        if l != k {
            b[l] = b[k];
            b[k] = mult;
        }
        for i in k + 1..=(k + ml).min(n - 1) {
            b[i] += mult * a[at(i, k)];
        }
    }

    for k in (0..n).rev() {
        b[k] /= a[at(k, k)];
        let mult = -b[k];
        for i in k.saturating_sub(smu)..k {
            b[i] += mult * a[at(i, k)];
        }
    }
}

/// Direct solver for [`BandMatrix`] systems.
///
/// Factors a private copy whose storage upper bandwidth is widened to
/// `mu + ml`, so the caller's matrix needs no extra room for fill.
#[derive(Debug, Clone, Default)]
pub struct BandLu {
    status: SolverStatus,
    factors: Option<BandMatrix>,
    pivots: Vec<usize>,
}

impl BandLu {
    pub fn new() -> Self {
        Self::default()
    }

    fn factor(&mut self, a: &BandMatrix) -> LinSolResult<()> {
        let n = a.size();
        let mut lu = BandMatrix::new(n, a.upper_bandwidth(), a.lower_bandwidth());
        lu.copy_from(a)?;
        self.pivots.resize(n, 0);
        match band_factor(&mut lu, &mut self.pivots) {
            Ok(()) => {
                self.factors = Some(lu);
                Ok(())
            }
            Err(col) => {
                debug!(column = col, "zero pivot in band LU factorization");
                self.factors = None;
                Err(LinSolError::LuFactFail(col))
            }
        }
    }

    fn solve_host<V: NVector>(&self, x: &mut V, b: &V) -> LinSolResult<()> {
        let lu = self
            .factors
            .as_ref()
            .ok_or_else(|| LinSolError::IllInput("no factorization available".into()))?;
        let rhs = host_slice(b)?;
        let out = host_slice_mut(x)?;
        if rhs.len() != lu.size() || out.len() != lu.size() {
            return Err(LinSolError::IllInput(format!(
                "vector lengths {}/{} do not match system size {}",
                rhs.len(),
                out.len(),
                lu.size()
            )));
        }
        out.copy_from_slice(rhs);
        band_solve(lu, &self.pivots, out);
        Ok(())
    }
}

impl<V: NVector> LinearSolver<V> for BandLu {
    fn id(&self) -> SolverId {
        SolverId::BandLu
    }

    fn kind(&self) -> SolverKind {
        SolverKind::Direct
    }

    fn accepts(&self, matrix: MatrixId) -> bool {
        matrix == MatrixId::Band
    }

    fn status(&self) -> &SolverStatus {
        &self.status
    }

    fn initialize(&mut self) -> LinSolResult<()> {
        self.factors = None;
        self.status.mark_initialized();
        Ok(())
    }

    fn setup(
        &mut self,
        a: Option<&dyn SunMatrix>,
        _op: &mut dyn SystemOperator<V>,
    ) -> LinSolResult<()> {
        self.status.begin_setup()?;
        let result = check_matrix_arg::<V, _>(self, a).and_then(|()| {
            let band = a
                .and_then(|m| m.downcast_ref::<BandMatrix>())
                .ok_or_else(|| LinSolError::IllInput("expected a band matrix".into()))?;
            self.factor(band)
        });
        if result.is_err() {
            self.factors = None;
        }
        self.status.finish_setup(result)
    }

    fn solve(
        &mut self,
        _a: Option<&dyn SunMatrix>,
        _op: &mut dyn SystemOperator<V>,
        x: &mut V,
        b: &V,
        _tol: Real,
    ) -> LinSolResult<()> {
        self.status.begin_solve()?;
        let result = self.solve_host(x, b);
        self.status.finish_solve(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linsol::NoOperator;
    use crate::matrix::MatVec;
    use crate::nvector::SerialVector;
    use approx::assert_relative_eq;

    fn pentadiag(n: usize) -> BandMatrix {
        let mut a = BandMatrix::new(n, 2, 1);
        for i in 0..n {
            a.set(i, i, 1.0 + i as Real * 0.1).unwrap();
            if i + 1 < n {
                a.set(i, i + 1, 3.0).unwrap();
                a.set(i + 1, i, -2.0).unwrap();
            }
            if i + 2 < n {
                a.set(i, i + 2, 0.5).unwrap();
            }
        }
        a
    }

    #[test]
    fn band_lu_reproduces_rhs() {
        let n = 8;
        let a = pentadiag(n);
        let x_true = SerialVector::from_vec((0..n).map(|i| (i as Real).cos()).collect());
        let mut b = SerialVector::zeros(n);
        a.matvec(&x_true, &mut b).unwrap();

        let mut lu = BandLu::new();
        let mut op = NoOperator;
        LinearSolver::<SerialVector>::initialize(&mut lu).unwrap();
        LinearSolver::<SerialVector>::setup(&mut lu, Some(&a), &mut op).unwrap();
        let mut x = SerialVector::zeros(n);
        LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut op, &mut x, &b, 0.0)
            .unwrap();

        for (xi, ti) in x.as_slice().unwrap().iter().zip(x_true.as_slice().unwrap()) {
            assert_relative_eq!(*xi, *ti, epsilon = 1e-10);
        }
    }

    #[test]
    fn pivoting_uses_fill_storage() {
        // Small diagonal forces a row swap in every column.
        let n = 5;
        let mut a = BandMatrix::new(n, 1, 1);
        for i in 0..n {
            a.set(i, i, 1e-3).unwrap();
            if i + 1 < n {
                a.set(i, i + 1, 1.0).unwrap();
                a.set(i + 1, i, 2.0).unwrap();
            }
        }
        let ones = SerialVector::from_vec(vec![1.0; n]);
        let mut b = SerialVector::zeros(n);
        a.matvec(&ones, &mut b).unwrap();

        let mut lu = BandLu::new();
        LinearSolver::<SerialVector>::initialize(&mut lu).unwrap();
        LinearSolver::<SerialVector>::setup(&mut lu, Some(&a), &mut NoOperator).unwrap();
        let mut x = SerialVector::zeros(n);
        LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut NoOperator, &mut x, &b, 0.0)
            .unwrap();
        for xi in x.as_slice().unwrap() {
            assert_relative_eq!(*xi, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_column_reports_lu_failure() {
        let mut a = BandMatrix::new(3, 1, 1);
        a.set(0, 0, 1.0).unwrap();
        a.set(2, 2, 1.0).unwrap();
        let mut lu = BandLu::new();
        LinearSolver::<SerialVector>::initialize(&mut lu).unwrap();
        let err = LinearSolver::<SerialVector>::setup(&mut lu, Some(&a), &mut NoOperator)
            .unwrap_err();
        assert_eq!(err, LinSolError::LuFactFail(1));
        assert!(err.is_recoverable());
    }
}

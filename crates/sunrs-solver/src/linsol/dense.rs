//! Direct LU solvers on dense storage: [`DenseLu`] for dense matrices and
//! [`SparseLu`], which densifies small sparse systems.

use nalgebra::{DMatrix, DVector, Dyn, LU};
use tracing::debug;

use super::traits::{
    LinearSolver, SolverId, SolverKind, SolverStatus, SystemOperator, check_matrix_arg,
    host_slice, host_slice_mut,
};
use crate::Real;
use crate::error::{LinSolError, LinSolResult};
use crate::matrix::{DenseMatrix, MatrixId, SparseMatrix, SunMatrix};
use crate::nvector::NVector;

/// LU factors of a square matrix, with partial pivoting.
#[derive(Debug, Clone)]
struct DenseFactors {
    n: usize,
    lu: LU<Real, Dyn, Dyn>,
}

impl DenseFactors {
    /// Factorizes `a`, failing on the first exactly zero pivot.
    fn factor(a: DMatrix<Real>) -> LinSolResult<Self> {
        if !a.is_square() {
            return Err(LinSolError::IllInput(format!(
                "LU needs a square matrix, got {}x{}",
                a.nrows(),
                a.ncols()
            )));
        }
        let n = a.nrows();
        let lu = a.lu();
        if let Some(col) = lu.u().diagonal().iter().position(|&d| d == 0.0) {
            debug!(column = col, "zero pivot in LU factorization");
            return Err(LinSolError::LuFactFail(col));
        }
        Ok(Self { n, lu })
    }

    fn solve<V: NVector>(&self, x: &mut V, b: &V) -> LinSolResult<()> {
        let n = self.n;
        let rhs = host_slice(b)?;
        if rhs.len() != n || x.len() != n {
            return Err(LinSolError::IllInput(format!(
                "vector lengths ({}, {}) do not match system size {n}",
                x.len(),
                rhs.len()
            )));
        }
        let mut sol = DVector::from_column_slice(rhs);
        if !self.lu.solve_mut(&mut sol) {
            return Err(LinSolError::PackageFailUnrec(
                "triangular solve hit a zero pivot".into(),
            ));
        }
        host_slice_mut(x)?.copy_from_slice(sol.as_slice());
        Ok(())
    }
}

/// Dense LU factorization of a [`DenseMatrix`].
#[derive(Debug, Clone, Default)]
pub struct DenseLu {
    status: SolverStatus,
    factors: Option<DenseFactors>,
}

impl DenseLu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: NVector> LinearSolver<V> for DenseLu {
    fn id(&self) -> SolverId {
        SolverId::DenseLu
    }

    fn kind(&self) -> SolverKind {
        SolverKind::Direct
    }

    fn accepts(&self, matrix: MatrixId) -> bool {
        matrix == MatrixId::Dense
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
        let factors = check_matrix_arg::<V, _>(self, a).and_then(|()| {
            let dense = a
                .and_then(|m| m.downcast_ref::<DenseMatrix>())
                .ok_or_else(|| LinSolError::IllInput("expected a dense matrix".into()))?;
            DenseFactors::factor(dense.data().clone())
        });
        let result = factors.map(|f| self.factors = Some(f));
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
        let result = match &self.factors {
            Some(f) => f.solve(x, b),
            None => Err(LinSolError::IllInput("no factorization available".into())),
        };
        self.status.finish_solve(result)
    }
}

/// Direct solver for [`SparseMatrix`] systems that factors a dense copy.
/// Meant for small systems and tests.
#[derive(Debug, Clone, Default)]
pub struct SparseLu {
    status: SolverStatus,
    factors: Option<DenseFactors>,
}

impl SparseLu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: NVector> LinearSolver<V> for SparseLu {
    fn id(&self) -> SolverId {
        SolverId::SparseLu
    }

    fn kind(&self) -> SolverKind {
        SolverKind::Direct
    }

    fn accepts(&self, matrix: MatrixId) -> bool {
        matrix == MatrixId::Sparse
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
        let factors = check_matrix_arg::<V, _>(self, a).and_then(|()| {
            let sparse = a
                .and_then(|m| m.downcast_ref::<SparseMatrix>())
                .ok_or_else(|| LinSolError::IllInput("expected a sparse matrix".into()))?;
            DenseFactors::factor(sparse.to_dense().data().clone())
        });
        let result = factors.map(|f| self.factors = Some(f));
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
        let result = match &self.factors {
            Some(f) => f.solve(x, b),
            None => Err(LinSolError::IllInput("no factorization available".into())),
        };
        self.status.finish_solve(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linsol::{NoOperator, SolverState};
    use crate::matrix::{BandMatrix, SparseFormat};
    use crate::nvector::SerialVector;
    use approx::assert_relative_eq;

    fn ready(solver: &mut dyn LinearSolver<SerialVector>, a: &dyn SunMatrix) -> LinSolResult<()> {
        solver.initialize()?;
        solver.setup(Some(a), &mut NoOperator)
    }

    #[test]
    fn solves_small_dense_system() {
        let a = DenseMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0])
            .unwrap();
        let mut lu = DenseLu::new();
        ready(&mut lu, &a).unwrap();

        let b = SerialVector::from_vec(vec![5.0, 5.0, 3.0]);
        let mut x = SerialVector::zeros(3);
        LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut NoOperator, &mut x, &b, 0.0)
            .unwrap();
        for xi in x.as_slice().unwrap() {
            assert_relative_eq!(*xi, 1.0, epsilon = 1e-12);
        }
        assert_eq!(LinearSolver::<SerialVector>::state(&lu), SolverState::Solved);
    }

    #[test]
    fn zero_row_is_recoverable_lu_failure() {
        let a = DenseMatrix::from_row_slice(3, 3, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 4.0, 5.0, 7.0])
            .unwrap();
        let mut lu = DenseLu::new();
        let err = ready(&mut lu, &a).unwrap_err();
        assert!(matches!(err, LinSolError::LuFactFail(_)));
        assert!(err.is_recoverable());
        assert_eq!(err.code(), 808);
        assert_eq!(
            LinearSolver::<SerialVector>::state(&lu),
            SolverState::FailedRecoverable
        );

        // No factorization to solve with.
        let b = SerialVector::zeros(3);
        let mut x = SerialVector::zeros(3);
        let err =
            LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut NoOperator, &mut x, &b, 0.0)
                .unwrap_err();
        assert!(matches!(err, LinSolError::IllInput(_)));
    }

    #[test]
    fn rejects_missing_or_wrong_matrix() {
        let mut lu = DenseLu::new();
        LinearSolver::<SerialVector>::initialize(&mut lu).unwrap();
        let err = LinearSolver::<SerialVector>::setup(&mut lu, None, &mut NoOperator).unwrap_err();
        assert_eq!(err.code(), -802);

        let band = BandMatrix::new(3, 1, 1);
        let err = ready(&mut lu, &band).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn solve_before_setup_is_ill_input() {
        let mut lu = DenseLu::new();
        LinearSolver::<SerialVector>::initialize(&mut lu).unwrap();
        let b = SerialVector::zeros(2);
        let mut x = SerialVector::zeros(2);
        let err = LinearSolver::<SerialVector>::solve(&mut lu, None, &mut NoOperator, &mut x, &b, 0.0)
            .unwrap_err();
        assert!(matches!(err, LinSolError::IllInput(_)));
    }

    #[test]
    fn wrong_length_right_hand_side_is_ill_input() {
        let a = DenseMatrix::identity(3);
        let mut lu = DenseLu::new();
        ready(&mut lu, &a).unwrap();

        let b = SerialVector::from_vec(vec![1.0, 2.0]);
        let mut x = SerialVector::zeros(3);
        let err = LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut NoOperator, &mut x, &b, 0.0)
            .unwrap_err();
        assert!(matches!(err, LinSolError::IllInput(_)));
        assert_eq!(x.as_slice().unwrap(), &[0.0, 0.0, 0.0]);

        let b = SerialVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut x = SerialVector::zeros(4);
        let err = LinearSolver::<SerialVector>::solve(&mut lu, Some(&a), &mut NoOperator, &mut x, &b, 0.0)
            .unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn sparse_lu_matches_dense() {
        let s = SparseMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 2.0), (1, 1, 4.0), (2, 2, 8.0), (0, 2, 1.0)],
            SparseFormat::Csc,
        )
        .unwrap();
        let mut lu = SparseLu::new();
        ready(&mut lu, &s).unwrap();
        let b = SerialVector::from_vec(vec![3.0, 4.0, 8.0]);
        let mut x = SerialVector::zeros(3);
        LinearSolver::<SerialVector>::solve(&mut lu, Some(&s), &mut NoOperator, &mut x, &b, 0.0)
            .unwrap();
        let xs = x.as_slice().unwrap();
        assert_relative_eq!(xs[0], 1.0, epsilon = 1e-14);
        assert_relative_eq!(xs[1], 1.0, epsilon = 1e-14);
        assert_relative_eq!(xs[2], 1.0, epsilon = 1e-14);
    }
}

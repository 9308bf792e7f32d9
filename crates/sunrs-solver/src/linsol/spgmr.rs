//! Scaled, preconditioned, restarted GMRES.
//!
//! Solves `A x = b` by minimizing `|s1 P1^{-1} (b - A x)|_2` over a Krylov
//! subspace of the operator `s1 P1^{-1} A P2^{-1} s2^{-1}`, where `P1`/`P2`
//! are the left/right preconditioners and `s1`/`s2` diagonal scalings.
//! Convergence is declared when that norm drops to `tol`.
//!
//! When the iteration limit is exhausted, the best iterate is still returned
//! as `ResReduced` if the residual went down, otherwise `x` is left at the
//! initial guess and `ConvFail` is reported.

use nalgebra::DMatrix;
use tracing::{debug, trace};

use super::config::{GramSchmidt, KrylovConfig};
use super::krylov::{
    atimes_error, classical_gs, modified_gs, pset_error, psolve_error, qr_solve, qr_update,
    store_scaling,
};
use super::traits::{
    LinearSolver, PrecSide, SolverId, SolverKind, SolverStatus, SystemOperator, check_matrix_arg,
};
use crate::Real;
use crate::error::{LinSolError, LinSolResult};
use crate::matrix::{MatrixId, SunMatrix};
use crate::nvector::NVector;

#[derive(Debug, Clone)]
pub struct Spgmr<V: NVector> {
    config: KrylovConfig,
    kind: SolverKind,
    status: SolverStatus,
    /// Side in effect since the last setup.
    side: PrecSide,
    s1: Option<V>,
    s2: Option<V>,
    zero_guess: bool,
    basis: Vec<V>,
    hes: DMatrix<Real>,
    givens: Vec<Real>,
    yg: Vec<Real>,
    xcor: V,
    vtemp: V,
}

impl<V: NVector> Spgmr<V> {
    /// GMRES that may be used with or without a matrix. Work vectors are
    /// cloned from `template`.
    pub fn new(template: &V, config: KrylovConfig) -> Self {
        let max_l = config.effective_max_l();
        let config = KrylovConfig { max_l, ..config };
        Self {
            kind: SolverKind::Iterative,
            status: SolverStatus::default(),
            side: config.prec_side,
            s1: None,
            s2: None,
            zero_guess: false,
            basis: (0..=max_l).map(|_| template.clone_empty()).collect(),
            hes: DMatrix::zeros(max_l + 1, max_l),
            givens: vec![0.0; 2 * max_l],
            yg: vec![0.0; max_l + 1],
            xcor: template.clone_empty(),
            vtemp: template.clone_empty(),
            config,
        }
    }

    /// GMRES that refuses any attached matrix.
    pub fn matrix_free(template: &V, config: KrylovConfig) -> Self {
        Self {
            kind: SolverKind::MatrixFree,
            ..Self::new(template, config)
        }
    }

    pub fn config(&self) -> &KrylovConfig {
        &self.config
    }

    fn gram_schmidt(&mut self, k: usize) -> LinSolResult<Real> {
        let p = self.config.max_l;
        match self.config.gram_schmidt {
            GramSchmidt::Modified => modified_gs(&mut self.basis, &mut self.hes, k, p),
            GramSchmidt::Classical => classical_gs(&mut self.basis, &mut self.hes, k, p),
        }
    }

    /// `vtemp = P2^{-1} s2^{-1} xcor`, consuming `xcor`.
    fn unscale_correction(
        &mut self,
        op: &mut dyn SystemOperator<V>,
        pre_right: bool,
        delta: Real,
    ) -> LinSolResult<()> {
        if let Some(s2) = &self.s2 {
            let xcor = self.xcor.clone();
            self.xcor.div(&xcor, s2)?;
        }
        if pre_right {
            op.precond_solve(&self.xcor, &mut self.vtemp, delta, PrecSide::Right)
                .map_err(psolve_error)?;
        } else {
            self.vtemp.scale(1.0, &self.xcor)?;
        }
        Ok(())
    }

    fn add_correction(&self, x: &mut V) -> LinSolResult<()> {
        if self.zero_guess {
            x.scale(1.0, &self.vtemp)?;
        } else {
            x.axpy(1.0, &self.vtemp)?;
        }
        Ok(())
    }

    fn iterate(
        &mut self,
        op: &mut dyn SystemOperator<V>,
        x: &mut V,
        b: &V,
        delta: Real,
    ) -> LinSolResult<()> {
        let max_l = self.config.max_l;
        let pre_left = self.side.left() && op.has_preconditioner();
        let pre_right = self.side.right() && op.has_preconditioner();
        let mut nli = 0;

        // vtemp = r0 = b - A x0
        if self.zero_guess {
            self.vtemp.scale(1.0, b)?;
        } else {
            op.apply(x, &mut self.vtemp).map_err(atimes_error)?;
            let ax = self.vtemp.clone();
            self.vtemp.linear_sum(1.0, b, -1.0, &ax)?;
        }

        // basis[0] = s1 P1^{-1} r0
        if pre_left {
            op.precond_solve(&self.vtemp, &mut self.basis[0], delta, PrecSide::Left)
                .map_err(psolve_error)?;
        } else {
            self.basis[0].scale(1.0, &self.vtemp)?;
        }
        if let Some(s1) = &self.s1 {
            let v0 = self.basis[0].clone();
            self.basis[0].prod(s1, &v0)?;
        }

        let beta = self.basis[0].dot(&self.basis[0])?.sqrt();
        let mut r_norm = beta;
        self.status.set_progress(0, beta);
        if r_norm <= delta {
            if self.zero_guess {
                x.fill(0.0);
            }
            return Ok(());
        }

        let mut rho = beta;
        let mut converged = false;
        self.xcor.fill(0.0);

        for ntries in 0..=self.config.max_restarts {
            self.hes.fill(0.0);
            let mut rotation_product = 1.0;
            self.basis[0].scale_in_place(1.0 / r_norm);

            let mut krydim = 0;
            for l in 0..max_l {
                nli += 1;
                krydim = l + 1;

                // vtemp = s2^{-1} basis[l]
                match &self.s2 {
                    Some(s2) => self.vtemp.div(&self.basis[l], s2)?,
                    None => self.vtemp.scale(1.0, &self.basis[l])?,
                }
                if pre_right {
                    self.basis[l + 1].scale(1.0, &self.vtemp)?;
                    op.precond_solve(&self.basis[l + 1], &mut self.vtemp, delta, PrecSide::Right)
                        .map_err(psolve_error)?;
                }
                op.apply(&self.vtemp, &mut self.basis[l + 1])
                    .map_err(atimes_error)?;
                if pre_left {
                    op.precond_solve(&self.basis[l + 1], &mut self.vtemp, delta, PrecSide::Left)
                        .map_err(psolve_error)?;
                } else {
                    self.vtemp.scale(1.0, &self.basis[l + 1])?;
                }
                match &self.s1 {
                    Some(s1) => self.basis[l + 1].prod(s1, &self.vtemp)?,
                    None => self.basis[l + 1].scale(1.0, &self.vtemp)?,
                }

                let new_norm = self.gram_schmidt(l + 1)?;
                self.hes[(l + 1, l)] = new_norm;

                if let Err(col) = qr_update(krydim, &mut self.hes, &mut self.givens) {
                    self.status.set_progress(nli, rho);
                    return Err(LinSolError::QrFactFail(col));
                }

                rotation_product *= self.givens[2 * l + 1];
                rho = (rotation_product * r_norm).abs();
                self.status.set_progress(nli, rho);
                trace!(iter = nli, res = rho, "gmres iteration");
                if rho <= delta {
                    converged = true;
                    break;
                }

                self.basis[l + 1].scale_in_place(1.0 / new_norm);
            }

            // Correction from the least-squares solution.
            self.yg.fill(0.0);
            self.yg[0] = r_norm;
            if let Err(col) = qr_solve(krydim, &self.hes, &self.givens, &mut self.yg) {
                return Err(LinSolError::QrSolFail(col));
            }
            for k in 0..krydim {
                self.xcor.axpy(self.yg[k], &self.basis[k])?;
            }

            if converged {
                self.unscale_correction(op, pre_right, delta)?;
                self.add_correction(x)?;
                debug!(iters = nli, res = rho, "gmres converged");
                return Ok(());
            }

            if ntries == self.config.max_restarts {
                break;
            }

            // Last residual vector for the restart.
            let mut s_product = 1.0;
            for i in (1..=krydim).rev() {
                self.yg[i] = s_product * self.givens[2 * i - 2];
                s_product *= self.givens[2 * i - 1];
            }
            self.yg[0] = s_product;
            r_norm *= s_product;
            for y in &mut self.yg[..=krydim] {
                *y *= r_norm;
            }
            r_norm = r_norm.abs();

            let combo: Vec<&V> = self.basis[..=krydim].iter().collect();
            let mut v0 = self.vtemp.clone_empty();
            v0.linear_combination(&self.yg[..=krydim], &combo)?;
            self.basis[0] = v0;
            debug!(restart = ntries + 1, res = r_norm, "gmres restart");
        }

        if rho < beta {
            self.unscale_correction(op, pre_right, delta)?;
            self.add_correction(x)?;
            Err(LinSolError::ResReduced {
                iters: nli,
                res_norm: rho,
            })
        } else {
            Err(LinSolError::ConvFail {
                iters: nli,
                res_norm: rho,
            })
        }
    }
}

impl<V: NVector> LinearSolver<V> for Spgmr<V> {
    fn id(&self) -> SolverId {
        SolverId::Spgmr
    }

    fn kind(&self) -> SolverKind {
        self.kind
    }

    fn accepts(&self, _matrix: MatrixId) -> bool {
        self.kind == SolverKind::Iterative
    }

    fn status(&self) -> &SolverStatus {
        &self.status
    }

    fn initialize(&mut self) -> LinSolResult<()> {
        self.side = self.config.prec_side;
        self.zero_guess = false;
        self.status.mark_initialized();
        Ok(())
    }

    fn set_preconditioner(&mut self, side: PrecSide) -> LinSolResult<()> {
        self.config.prec_side = side;
        self.status.mark_stale();
        Ok(())
    }

    fn supports_scaling(&self) -> bool {
        true
    }

    fn set_scaling_vectors(&mut self, s1: Option<&V>, s2: Option<&V>) -> LinSolResult<()> {
        store_scaling(&mut self.s1, s1)?;
        store_scaling(&mut self.s2, s2)
    }

    fn set_zero_guess(&mut self, zero_guess: bool) {
        self.zero_guess = zero_guess;
    }

    fn setup(
        &mut self,
        a: Option<&dyn SunMatrix>,
        op: &mut dyn SystemOperator<V>,
    ) -> LinSolResult<()> {
        self.status.begin_setup()?;
        let result = check_matrix_arg::<V, _>(self, a).and_then(|()| {
            self.side = self.config.prec_side;
            if self.side != PrecSide::None && op.has_preconditioner() {
                op.precond_setup().map_err(pset_error)?;
            }
            Ok(())
        });
        self.status.finish_setup(result)
    }

    fn solve(
        &mut self,
        a: Option<&dyn SunMatrix>,
        op: &mut dyn SystemOperator<V>,
        x: &mut V,
        b: &V,
        tol: Real,
    ) -> LinSolResult<()> {
        self.status.begin_solve()?;
        let result = check_matrix_arg::<V, _>(self, a).and_then(|()| self.iterate(op, x, b, tol));
        self.zero_guess = false;
        self.status.finish_solve(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallbackError, CallbackResult};
    use crate::linsol::MatrixOperator;
    use crate::matrix::{BandMatrix, DenseMatrix, MatVec};
    use crate::nvector::SerialVector;
    use approx::assert_relative_eq;

    fn laplacian(n: usize) -> BandMatrix {
        let mut a = BandMatrix::new(n, 1, 1);
        for i in 0..n {
            a.set(i, i, 2.0).unwrap();
            if i + 1 < n {
                a.set(i, i + 1, -1.0).unwrap();
                a.set(i + 1, i, -1.0).unwrap();
            }
        }
        a
    }

    fn run(
        solver: &mut Spgmr<SerialVector>,
        a: &dyn SunMatrix,
        b: &SerialVector,
        tol: Real,
    ) -> (SerialVector, LinSolResult<()>) {
        let mut op = MatrixOperator::new(a);
        solver.initialize().unwrap();
        solver.setup(Some(a), &mut op).unwrap();
        let mut x = b.clone_empty();
        solver.set_zero_guess(true);
        let r = solver.solve(Some(a), &mut op, &mut x, b, tol);
        (x, r)
    }

    #[test]
    fn converges_on_small_nonsymmetric_system() {
        let a = DenseMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 2.0, 5.0, 1.0, 0.0, 3.0, 6.0])
            .unwrap();
        let b = SerialVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut gmres = Spgmr::new(&b, KrylovConfig::with_max_l(3));
        let (x, r) = run(&mut gmres, &a, &b, 1e-12);
        r.unwrap();

        let mut ax = b.clone_empty();
        a.matvec(&x, &mut ax).unwrap();
        for (l, r) in ax.as_slice().unwrap().iter().zip(b.as_slice().unwrap()) {
            assert_relative_eq!(*l, *r, epsilon = 1e-10);
        }
        assert!(gmres.num_iters() <= 3);
    }

    #[test]
    fn iteration_limit_is_recoverable() {
        let n = 100;
        let a = laplacian(n);
        let b = SerialVector::from_vec(vec![1.0; n]);
        let mut gmres = Spgmr::new(&b, KrylovConfig::with_max_l(10));
        let (_, r) = run(&mut gmres, &a, &b, 1e-12);
        let err = r.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            LinSolError::ResReduced { .. } | LinSolError::ConvFail { .. }
        ));
        assert_eq!(gmres.num_iters(), 10);
        assert!(gmres.res_norm() > 1e-12);
    }

    #[test]
    fn restarts_reach_the_solution() {
        let n = 20;
        let a = laplacian(n);
        let b = SerialVector::from_vec((0..n).map(|i| (i as Real * 0.3).sin()).collect());
        let mut gmres = Spgmr::new(&b, KrylovConfig::restarted(10, 100));
        let (x, r) = run(&mut gmres, &a, &b, 1e-10);
        r.unwrap();
        let mut ax = b.clone_empty();
        a.matvec(&x, &mut ax).unwrap();
        let mut diff = b.clone_empty();
        diff.linear_sum(1.0, &ax, -1.0, &b).unwrap();
        assert!(diff.max_norm() < 1e-8);
    }

    #[test]
    fn classical_gs_matches_modified() {
        let n = 12;
        let a = laplacian(n);
        let b = SerialVector::from_vec(vec![1.0; n]);
        let mut mgs = Spgmr::new(&b, KrylovConfig::with_max_l(n));
        let mut cgs = Spgmr::new(&b, KrylovConfig::with_max_l(n).classical_gs());
        let (x1, r1) = run(&mut mgs, &a, &b, 1e-10);
        let (x2, r2) = run(&mut cgs, &a, &b, 1e-10);
        r1.unwrap();
        r2.unwrap();
        for (u, v) in x1.as_slice().unwrap().iter().zip(x2.as_slice().unwrap()) {
            assert_relative_eq!(*u, *v, epsilon = 1e-8);
        }
    }

    struct JacobiOperator<'m> {
        inner: MatrixOperator<'m>,
        diag: Vec<Real>,
        setups: usize,
    }

    impl SystemOperator<SerialVector> for JacobiOperator<'_> {
        fn apply(&mut self, v: &SerialVector, z: &mut SerialVector) -> CallbackResult {
            self.inner.apply(v, z)
        }

        fn has_preconditioner(&self) -> bool {
            true
        }

        fn precond_setup(&mut self) -> CallbackResult {
            self.setups += 1;
            Ok(())
        }

        fn precond_solve(
            &mut self,
            r: &SerialVector,
            z: &mut SerialVector,
            _tol: Real,
            _side: PrecSide,
        ) -> CallbackResult {
            let r = r.as_slice().ok_or(CallbackError::unrecoverable())?;
            let z = z.as_mut_slice().ok_or(CallbackError::unrecoverable())?;
            for ((zi, ri), di) in z.iter_mut().zip(r).zip(&self.diag) {
                *zi = ri / di;
            }
            Ok(())
        }
    }

    #[test]
    fn preconditioning_on_either_side_converges() {
        let n = 10;
        let mut a = laplacian(n);
        for i in 0..n {
            a.set(i, i, 2.0 + i as Real).unwrap();
        }
        let b = SerialVector::from_vec(vec![1.0; n]);
        for side in [PrecSide::Left, PrecSide::Right, PrecSide::Both] {
            let mut op = JacobiOperator {
                inner: MatrixOperator::new(&a),
                diag: (0..n).map(|i| 2.0 + i as Real).collect(),
                setups: 0,
            };
            let mut gmres = Spgmr::new(&b, KrylovConfig::with_max_l(n).preconditioned(side));
            gmres.initialize().unwrap();
            gmres.setup(Some(&a), &mut op).unwrap();
            assert_eq!(op.setups, 1);
            let mut x = b.clone_empty();
            gmres.solve(Some(&a), &mut op, &mut x, &b, 1e-10).unwrap();

            let mut ax = b.clone_empty();
            a.matvec(&x, &mut ax).unwrap();
            for v in ax.as_slice().unwrap() {
                assert_relative_eq!(*v, 1.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn matrix_free_solver_refuses_a_matrix() {
        let a = laplacian(4);
        let b = SerialVector::zeros(4);
        let mut gmres = Spgmr::matrix_free(&b, KrylovConfig::default());
        gmres.initialize().unwrap();
        let mut op = MatrixOperator::new(&a);
        let err = gmres.setup(Some(&a), &mut op).unwrap_err();
        assert_eq!(err.code(), -802);
    }
}

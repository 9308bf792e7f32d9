//! Scaled, preconditioned conjugate gradients for symmetric positive
//! definite systems.
//!
//! Only one scaling vector is used: CG needs the scaled operator to stay
//! symmetric, so `s1` weights the residual norm and `s2` is ignored. The
//! preconditioner is applied as a whole (`P^{-1} r`) and must be SPD too.

use tracing::{debug, trace};

use super::config::KrylovConfig;
use super::krylov::{atimes_error, pset_error, psolve_error, store_scaling};
use super::traits::{
    LinearSolver, PrecSide, SolverId, SolverKind, SolverStatus, SystemOperator, check_matrix_arg,
};
use crate::Real;
use crate::error::{LinSolError, LinSolResult};
use crate::matrix::{MatrixId, SunMatrix};
use crate::nvector::NVector;

#[derive(Debug, Clone)]
pub struct Pcg<V: NVector> {
    config: KrylovConfig,
    kind: SolverKind,
    status: SolverStatus,
    side: PrecSide,
    s: Option<V>,
    zero_guess: bool,
    r: V,
    p: V,
    z: V,
    ap: V,
}

impl<V: NVector> Pcg<V> {
    /// CG with at most `config.max_l` iterations.
    pub fn new(template: &V, config: KrylovConfig) -> Self {
        let config = KrylovConfig {
            max_l: config.effective_max_l(),
            ..config
        };
        Self {
            kind: SolverKind::Iterative,
            status: SolverStatus::default(),
            side: config.prec_side,
            s: None,
            zero_guess: false,
            r: template.clone_empty(),
            p: template.clone_empty(),
            z: template.clone_empty(),
            ap: template.clone_empty(),
            config,
        }
    }

    pub fn matrix_free(template: &V, config: KrylovConfig) -> Self {
        Self {
            kind: SolverKind::MatrixFree,
            ..Self::new(template, config)
        }
    }

    pub fn config(&self) -> &KrylovConfig {
        &self.config
    }

    fn scaled_norm(&mut self) -> LinSolResult<Real> {
        match &self.s {
            Some(s) => {
                self.ap.prod(s, &self.r)?;
                Ok(self.ap.dot(&self.ap)?.sqrt())
            }
            None => Ok(self.r.dot(&self.r)?.sqrt()),
        }
    }

    fn precondition(
        &mut self,
        op: &mut dyn SystemOperator<V>,
        use_prec: bool,
        delta: Real,
    ) -> LinSolResult<()> {
        if use_prec {
            op.precond_solve(&self.r, &mut self.z, delta, PrecSide::Left)
                .map_err(psolve_error)
        } else {
            self.z.scale(1.0, &self.r)?;
            Ok(())
        }
    }

    fn iterate(
        &mut self,
        op: &mut dyn SystemOperator<V>,
        x: &mut V,
        b: &V,
        delta: Real,
    ) -> LinSolResult<()> {
        let use_prec = self.side != PrecSide::None && op.has_preconditioner();

        // r = b - A x
        if self.zero_guess {
            x.fill(0.0);
            self.r.scale(1.0, b)?;
        } else {
            op.apply(x, &mut self.r).map_err(atimes_error)?;
            let ax = self.r.clone();
            self.r.linear_sum(1.0, b, -1.0, &ax)?;
        }

        let r0_norm = self.scaled_norm()?;
        let mut res = r0_norm;
        self.status.set_progress(0, res);
        if res <= delta {
            return Ok(());
        }

        self.precondition(op, use_prec, delta)?;
        let mut rho = self.z.dot(&self.r)?;
        self.p.scale(1.0, &self.z)?;

        let mut nli = 0;
        let mut converged = false;
        for l in 0..self.config.max_l {
            nli += 1;

            op.apply(&self.p, &mut self.ap).map_err(atimes_error)?;
            let p_ap = self.ap.dot(&self.p)?;
            if p_ap == 0.0 {
                break;
            }
            let alpha = rho / p_ap;
            x.axpy(alpha, &self.p)?;
            self.r.axpy(-alpha, &self.ap)?;

            res = self.scaled_norm()?;
            self.status.set_progress(nli, res);
            trace!(iter = nli, res, "pcg iteration");
            if res <= delta {
                converged = true;
                break;
            }
            if l + 1 == self.config.max_l {
                break;
            }

            self.precondition(op, use_prec, delta)?;
            let rho_prev = rho;
            rho = self.z.dot(&self.r)?;
            let beta = rho / rho_prev;
            let p_old = self.p.clone();
            self.p.linear_sum(1.0, &self.z, beta, &p_old)?;
        }

        if converged {
            debug!(iters = nli, res, "pcg converged");
            Ok(())
        } else if res < r0_norm {
            Err(LinSolError::ResReduced {
                iters: nli,
                res_norm: res,
            })
        } else {
            Err(LinSolError::ConvFail {
                iters: nli,
                res_norm: res,
            })
        }
    }
}

impl<V: NVector> LinearSolver<V> for Pcg<V> {
    fn id(&self) -> SolverId {
        SolverId::Pcg
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

    fn set_scaling_vectors(&mut self, s1: Option<&V>, _s2: Option<&V>) -> LinSolResult<()> {
        store_scaling(&mut self.s, s1)
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
    use crate::linsol::{MatrixOperator, SolverState};
    use crate::matrix::{BandMatrix, MatVec};
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

    fn ready(pcg: &mut Pcg<SerialVector>, a: &BandMatrix) {
        pcg.initialize().unwrap();
        pcg.setup(Some(a), &mut MatrixOperator::new(a)).unwrap();
    }

    #[test]
    fn solves_spd_system_within_dimension_iterations() {
        let n = 16;
        let a = laplacian(n);
        let b = SerialVector::from_vec((0..n).map(|i| 1.0 + i as Real).collect());
        let mut pcg = Pcg::new(&b, KrylovConfig::with_max_l(n));
        ready(&mut pcg, &a);

        let mut x = b.clone_empty();
        pcg.set_zero_guess(true);
        pcg.solve(Some(&a), &mut MatrixOperator::new(&a), &mut x, &b, 1e-10)
            .unwrap();
        assert!(pcg.num_iters() <= n);
        assert_eq!(pcg.state(), SolverState::Solved);

        let mut ax = b.clone_empty();
        a.matvec(&x, &mut ax).unwrap();
        for (l, r) in ax.as_slice().unwrap().iter().zip(b.as_slice().unwrap()) {
            assert_relative_eq!(*l, *r, epsilon = 1e-8);
        }
    }

    #[test]
    fn iteration_limit_is_recoverable() {
        let n = 100;
        let a = laplacian(n);
        let b = SerialVector::from_vec(vec![1.0; n]);
        let mut pcg = Pcg::new(&b, KrylovConfig::with_max_l(10));
        ready(&mut pcg, &a);

        let mut x = b.clone_empty();
        let err = pcg
            .solve(Some(&a), &mut MatrixOperator::new(&a), &mut x, &b, 1e-12)
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(pcg.num_iters(), 10);
        assert_eq!(pcg.state(), SolverState::FailedRecoverable);
        // The preconditioner is still usable.
        assert!(pcg.status().is_setup_current());
    }

    #[test]
    fn scaling_weights_the_stopping_test() {
        let a = laplacian(4);
        let b = SerialVector::from_vec(vec![1.0, 0.0, 0.0, 1.0]);

        // |b| = sqrt(2) already meets the tolerance.
        let mut plain = Pcg::new(&b, KrylovConfig::with_max_l(1));
        ready(&mut plain, &a);
        let mut x = b.clone_empty();
        plain
            .solve(Some(&a), &mut MatrixOperator::new(&a), &mut x, &b, 2.0)
            .unwrap();
        assert_eq!(plain.num_iters(), 0);
        assert_eq!(x.max_norm(), 0.0);

        // |2 b| = 2 sqrt(2) does not.
        let s = SerialVector::from_vec(vec![2.0; 4]);
        let mut scaled = Pcg::new(&b, KrylovConfig::with_max_l(1));
        ready(&mut scaled, &a);
        scaled.set_scaling_vectors(Some(&s), None).unwrap();
        let mut y = b.clone_empty();
        let _ = scaled.solve(Some(&a), &mut MatrixOperator::new(&a), &mut y, &b, 2.0);
        assert_eq!(scaled.num_iters(), 1);
        assert!(y.max_norm() > 0.0);
    }
}

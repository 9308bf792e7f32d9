//! Host vector whose element-wise kernels run on a rayon pool.
//!
//! Each vector carries a shared [`ThreadedContext`] holding its configuration
//! and, optionally, a dedicated thread pool. There is no process-global state:
//! two vectors built from different contexts never share a pool.
//!
//! Element-wise results are identical to [`SerialVector`](super::SerialVector).
//! Reductions are split into chunks, so `dot` and the norms may differ from the
//! serial backend in the last bits once the vector is longer than
//! `min_parallel_len`.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{
    NVector, VectorId, check_combination_shape, check_len, constraint_violated,
};
use crate::Real;
use crate::error::{VectorError, VectorResult};

/// Threading options for [`ThreadedVector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadedConfig {
    /// Below this length every kernel runs sequentially.
    pub min_parallel_len: usize,
    /// Size of a dedicated pool; `None` uses rayon's global pool.
    pub num_threads: Option<usize>,
}

impl Default for ThreadedConfig {
    fn default() -> Self {
        Self {
            min_parallel_len: 4096,
            num_threads: None,
        }
    }
}

impl ThreadedConfig {
    /// Force parallel kernels at every length. Mostly useful in tests.
    pub fn always_parallel(num_threads: usize) -> Self {
        Self {
            min_parallel_len: 0,
            num_threads: Some(num_threads),
        }
    }
}

/// Shared execution context of a family of threaded vectors.
#[derive(Debug)]
pub struct ThreadedContext {
    config: ThreadedConfig,
    pool: Option<ThreadPool>,
}

impl ThreadedContext {
    pub fn new(config: ThreadedConfig) -> VectorResult<Arc<Self>> {
        let pool = match config.num_threads {
            Some(n) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| VectorError::Backend(e.to_string()))?;
                debug!(threads = n, "created vector thread pool");
                Some(pool)
            }
            None => None,
        };
        Ok(Arc::new(Self { config, pool }))
    }

    pub fn config(&self) -> &ThreadedConfig {
        &self.config
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

/// Rayon-parallel host vector.
#[derive(Debug, Clone)]
pub struct ThreadedVector {
    data: Vec<Real>,
    ctx: Arc<ThreadedContext>,
}

impl PartialEq for ThreadedVector {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl ThreadedVector {
    pub fn zeros(len: usize, ctx: &Arc<ThreadedContext>) -> Self {
        Self {
            data: vec![0.0; len],
            ctx: Arc::clone(ctx),
        }
    }

    pub fn from_vec(values: Vec<Real>, ctx: &Arc<ThreadedContext>) -> Self {
        Self {
            data: values,
            ctx: Arc::clone(ctx),
        }
    }

    pub fn context(&self) -> &Arc<ThreadedContext> {
        &self.ctx
    }

    pub fn into_inner(self) -> Vec<Real> {
        self.data
    }

    fn parallel(&self) -> bool {
        self.data.len() >= self.ctx.config.min_parallel_len
    }

    fn map1(&mut self, x: &Self, f: impl Fn(Real) -> Real + Sync + Send) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| {
                self.data
                    .par_iter_mut()
                    .zip(x.data.par_iter())
                    .for_each(|(z, &xi)| *z = f(xi));
            });
        } else {
            for (z, &xi) in self.data.iter_mut().zip(&x.data) {
                *z = f(xi);
            }
        }
        Ok(())
    }

    fn map2(
        &mut self,
        x: &Self,
        y: &Self,
        f: impl Fn(Real, Real, Real) -> Real + Sync + Send,
    ) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        check_len(self.len(), y.len())?;
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| {
                self.data
                    .par_iter_mut()
                    .zip(x.data.par_iter())
                    .zip(y.data.par_iter())
                    .for_each(|((z, &xi), &yi)| *z = f(*z, xi, yi));
            });
        } else {
            for ((z, &xi), &yi) in self.data.iter_mut().zip(&x.data).zip(&y.data) {
                *z = f(*z, xi, yi);
            }
        }
        Ok(())
    }

    fn reduce(&self, other: &[Real], f: impl Fn(Real, Real) -> Real + Sync + Send) -> Real {
        if self.parallel() {
            self.ctx.install(|| {
                self.data
                    .par_iter()
                    .zip(other.par_iter())
                    .map(|(&a, &b)| f(a, b))
                    .sum::<Real>()
            })
        } else {
            let mut sum = 0.0;
            for (&a, &b) in self.data.iter().zip(other) {
                sum += f(a, b);
            }
            sum
        }
    }
}

impl NVector for ThreadedVector {
    fn id(&self) -> VectorId {
        VectorId::Threaded
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn clone_empty(&self) -> Self {
        Self::zeros(self.len(), &self.ctx)
    }

    fn as_slice(&self) -> Option<&[Real]> {
        Some(&self.data)
    }

    fn as_mut_slice(&mut self) -> Option<&mut [Real]> {
        Some(&mut self.data)
    }

    fn linear_sum(&mut self, a: Real, x: &Self, b: Real, y: &Self) -> VectorResult<()> {
        self.map2(x, y, move |_, xi, yi| a * xi + b * yi)
    }

    fn axpy(&mut self, a: Real, x: &Self) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| {
                self.data
                    .par_iter_mut()
                    .zip(x.data.par_iter())
                    .for_each(|(z, &xi)| *z = a * xi + *z);
            });
        } else {
            for (z, &xi) in self.data.iter_mut().zip(&x.data) {
                *z = a * xi + *z;
            }
        }
        Ok(())
    }

    fn fill(&mut self, c: Real) {
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| self.data.par_iter_mut().for_each(|z| *z = c));
        } else {
            self.data.fill(c);
        }
    }

    fn scale(&mut self, c: Real, x: &Self) -> VectorResult<()> {
        self.map1(x, move |xi| c * xi)
    }

    fn scale_in_place(&mut self, c: Real) {
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| self.data.par_iter_mut().for_each(|z| *z *= c));
        } else {
            for z in &mut self.data {
                *z *= c;
            }
        }
    }

    fn prod(&mut self, x: &Self, y: &Self) -> VectorResult<()> {
        self.map2(x, y, |_, xi, yi| xi * yi)
    }

    fn div(&mut self, x: &Self, y: &Self) -> VectorResult<()> {
        self.map2(x, y, |_, xi, yi| xi / yi)
    }

    fn abs(&mut self, x: &Self) -> VectorResult<()> {
        self.map1(x, Real::abs)
    }

    fn inv(&mut self, x: &Self) -> VectorResult<()> {
        self.map1(x, |xi| 1.0 / xi)
    }

    fn add_const(&mut self, x: &Self, b: Real) -> VectorResult<()> {
        self.map1(x, move |xi| xi + b)
    }

    fn dot(&self, y: &Self) -> VectorResult<Real> {
        check_len(self.len(), y.len())?;
        Ok(self.reduce(&y.data, |a, b| a * b))
    }

    fn max_norm(&self) -> Real {
        if self.parallel() {
            self.ctx
                .install(|| self.data.par_iter().map(|v| v.abs()).reduce(|| 0.0, Real::max))
        } else {
            self.data.iter().fold(0.0, |m: Real, v| m.max(v.abs()))
        }
    }

    fn wrms_norm(&self, w: &Self) -> VectorResult<Real> {
        check_len(self.len(), w.len())?;
        if self.is_empty() {
            return Ok(0.0);
        }
        let sum = self.reduce(&w.data, |x, w| (x * w) * (x * w));
        Ok((sum / self.len() as Real).sqrt())
    }

    fn wrms_norm_mask(&self, w: &Self, id: &Self) -> VectorResult<Real> {
        check_len(self.len(), w.len())?;
        check_len(self.len(), id.len())?;
        if self.is_empty() {
            return Ok(0.0);
        }
        let term = |((&x, &w), &m): ((&Real, &Real), &Real)| {
            if m > 0.0 { (x * w) * (x * w) } else { 0.0 }
        };
        let sum: Real = if self.parallel() {
            self.ctx.install(|| {
                self.data
                    .par_iter()
                    .zip(w.data.par_iter())
                    .zip(id.data.par_iter())
                    .map(term)
                    .sum()
            })
        } else {
            self.data.iter().zip(&w.data).zip(&id.data).map(term).sum()
        };
        Ok((sum / self.len() as Real).sqrt())
    }

    fn min(&self) -> Real {
        if self.parallel() {
            self.ctx
                .install(|| self.data.par_iter().copied().reduce(|| Real::MAX, Real::min))
        } else {
            self.data.iter().fold(Real::MAX, |m: Real, &v| m.min(v))
        }
    }

    fn wl2_norm(&self, w: &Self) -> VectorResult<Real> {
        check_len(self.len(), w.len())?;
        Ok(self.reduce(&w.data, |x, w| (x * w) * (x * w)).sqrt())
    }

    fn l1_norm(&self) -> Real {
        if self.parallel() {
            self.ctx
                .install(|| self.data.par_iter().map(|v| v.abs()).sum::<Real>())
        } else {
            self.data.iter().map(|v| v.abs()).sum()
        }
    }

    fn compare(&mut self, c: Real, x: &Self) -> VectorResult<()> {
        self.map1(x, move |xi| if xi.abs() >= c { 1.0 } else { 0.0 })
    }

    fn inv_test(&mut self, x: &Self) -> VectorResult<bool> {
        check_len(self.len(), x.len())?;
        let mut all_nonzero = true;
        for (z, &xi) in self.data.iter_mut().zip(&x.data) {
            if xi == 0.0 {
                all_nonzero = false;
            } else {
                *z = 1.0 / xi;
            }
        }
        Ok(all_nonzero)
    }

    fn constr_mask(&mut self, c: &Self, x: &Self) -> VectorResult<bool> {
        self.map2(c, x, |_, ci, xi| {
            if constraint_violated(ci, xi) { 1.0 } else { 0.0 }
        })?;
        Ok(self.data.iter().all(|&m| m == 0.0))
    }

    fn min_quotient(&self, denom: &Self) -> VectorResult<Real> {
        check_len(self.len(), denom.len())?;
        let quotient = |(&n, &d): (&Real, &Real)| if d != 0.0 { n / d } else { Real::MAX };
        let min = if self.parallel() {
            self.ctx.install(|| {
                self.data
                    .par_iter()
                    .zip(denom.data.par_iter())
                    .map(quotient)
                    .reduce(|| Real::MAX, Real::min)
            })
        } else {
            self.data
                .iter()
                .zip(&denom.data)
                .map(quotient)
                .fold(Real::MAX, Real::min)
        };
        Ok(min)
    }

    fn linear_combination(&mut self, c: &[Real], xs: &[&Self]) -> VectorResult<()> {
        check_combination_shape(c.len(), xs.len())?;
        for x in xs {
            check_len(self.len(), x.len())?;
        }
        let entry = |i: usize| {
            let mut acc = c[0] * xs[0].data[i];
            for (ck, xk) in c.iter().zip(xs).skip(1) {
                acc = *ck * xk.data[i] + acc;
            }
            acc
        };
        if self.parallel() {
            let ctx = Arc::clone(&self.ctx);
            ctx.install(|| {
                self.data
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(i, z)| *z = entry(i));
            });
        } else {
            for (i, z) in self.data.iter_mut().enumerate() {
                *z = entry(i);
            }
        }
        Ok(())
    }
}

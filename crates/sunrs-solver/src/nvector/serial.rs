//! Serial host-memory vector backed by `nalgebra::DVector`.

use nalgebra::DVector;

use super::traits::{
    NVector, VectorId, check_combination_shape, check_len, constraint_violated,
};
use crate::Real;
use crate::error::VectorResult;

/// Single-threaded host vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialVector {
    data: DVector<Real>,
}

impl SerialVector {
    pub fn zeros(len: usize) -> Self {
        Self {
            data: DVector::zeros(len),
        }
    }

    pub fn from_vec(values: Vec<Real>) -> Self {
        Self {
            data: DVector::from_vec(values),
        }
    }

    pub fn from_slice(values: &[Real]) -> Self {
        Self {
            data: DVector::from_column_slice(values),
        }
    }

    pub fn from_dvector(data: DVector<Real>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &DVector<Real> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DVector<Real> {
        &mut self.data
    }

    pub fn into_inner(self) -> DVector<Real> {
        self.data
    }

    fn zip_assign(&mut self, x: &Self, f: impl Fn(Real) -> Real) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        for (z, &xi) in self.data.iter_mut().zip(x.data.iter()) {
            *z = f(xi);
        }
        Ok(())
    }

    fn zip2_assign(
        &mut self,
        x: &Self,
        y: &Self,
        f: impl Fn(Real, Real) -> Real,
    ) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        check_len(self.len(), y.len())?;
        for ((z, &xi), &yi) in self.data.iter_mut().zip(x.data.iter()).zip(y.data.iter()) {
            *z = f(xi, yi);
        }
        Ok(())
    }
}

impl From<Vec<Real>> for SerialVector {
    fn from(values: Vec<Real>) -> Self {
        Self::from_vec(values)
    }
}

impl NVector for SerialVector {
    fn id(&self) -> VectorId {
        VectorId::Serial
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn clone_empty(&self) -> Self {
        Self::zeros(self.len())
    }

    fn as_slice(&self) -> Option<&[Real]> {
        Some(self.data.as_slice())
    }

    fn as_mut_slice(&mut self) -> Option<&mut [Real]> {
        Some(self.data.as_mut_slice())
    }

    fn linear_sum(&mut self, a: Real, x: &Self, b: Real, y: &Self) -> VectorResult<()> {
        self.zip2_assign(x, y, |xi, yi| a * xi + b * yi)
    }

    fn axpy(&mut self, a: Real, x: &Self) -> VectorResult<()> {
        check_len(self.len(), x.len())?;
        for (z, &xi) in self.data.iter_mut().zip(x.data.iter()) {
            *z = a * xi + *z;
        }
        Ok(())
    }

    fn fill(&mut self, c: Real) {
        self.data.fill(c);
    }

    fn scale(&mut self, c: Real, x: &Self) -> VectorResult<()> {
        self.zip_assign(x, |xi| c * xi)
    }

    fn scale_in_place(&mut self, c: Real) {
        for z in self.data.iter_mut() {
            *z *= c;
        }
    }

    fn prod(&mut self, x: &Self, y: &Self) -> VectorResult<()> {
        self.zip2_assign(x, y, |xi, yi| xi * yi)
    }

    fn div(&mut self, x: &Self, y: &Self) -> VectorResult<()> {
        self.zip2_assign(x, y, |xi, yi| xi / yi)
    }

    fn abs(&mut self, x: &Self) -> VectorResult<()> {
        self.zip_assign(x, Real::abs)
    }

    fn inv(&mut self, x: &Self) -> VectorResult<()> {
        self.zip_assign(x, |xi| 1.0 / xi)
    }

    fn add_const(&mut self, x: &Self, b: Real) -> VectorResult<()> {
        self.zip_assign(x, |xi| xi + b)
    }

    fn dot(&self, y: &Self) -> VectorResult<Real> {
        check_len(self.len(), y.len())?;
        let mut sum = 0.0;
        for (&xi, &yi) in self.data.iter().zip(y.data.iter()) {
            sum += xi * yi;
        }
        Ok(sum)
    }

    fn max_norm(&self) -> Real {
        self.data.iter().fold(0.0, |m: Real, v| m.max(v.abs()))
    }

    fn wrms_norm(&self, w: &Self) -> VectorResult<Real> {
        if self.is_empty() {
            check_len(0, w.len())?;
            return Ok(0.0);
        }
        Ok((self.wl2_norm(w)?.powi(2) / self.len() as Real).sqrt())
    }

    fn wrms_norm_mask(&self, w: &Self, id: &Self) -> VectorResult<Real> {
        check_len(self.len(), w.len())?;
        check_len(self.len(), id.len())?;
        if self.is_empty() {
            return Ok(0.0);
        }
        let mut sum = 0.0;
        for ((&xi, &wi), &idi) in self.data.iter().zip(w.data.iter()).zip(id.data.iter()) {
            if idi > 0.0 {
                let p = xi * wi;
                sum += p * p;
            }
        }
        Ok((sum / self.len() as Real).sqrt())
    }

    fn min(&self) -> Real {
        self.data.iter().fold(Real::MAX, |m: Real, &v| m.min(v))
    }

    fn wl2_norm(&self, w: &Self) -> VectorResult<Real> {
        check_len(self.len(), w.len())?;
        let mut sum = 0.0;
        for (&xi, &wi) in self.data.iter().zip(w.data.iter()) {
            let p = xi * wi;
            sum += p * p;
        }
        Ok(sum.sqrt())
    }

    fn l1_norm(&self) -> Real {
        self.data.iter().map(|v| v.abs()).sum()
    }

    fn compare(&mut self, c: Real, x: &Self) -> VectorResult<()> {
        self.zip_assign(x, |xi| if xi.abs() >= c { 1.0 } else { 0.0 })
    }

    fn inv_test(&mut self, x: &Self) -> VectorResult<bool> {
        check_len(self.len(), x.len())?;
        let mut all_nonzero = true;
        for (z, &xi) in self.data.iter_mut().zip(x.data.iter()) {
            if xi == 0.0 {
                all_nonzero = false;
            } else {
                *z = 1.0 / xi;
            }
        }
        Ok(all_nonzero)
    }

    fn constr_mask(&mut self, c: &Self, x: &Self) -> VectorResult<bool> {
        check_len(self.len(), c.len())?;
        check_len(self.len(), x.len())?;
        let mut passed = true;
        for ((m, &ci), &xi) in self.data.iter_mut().zip(c.data.iter()).zip(x.data.iter()) {
            let violated = constraint_violated(ci, xi);
            *m = if violated { 1.0 } else { 0.0 };
            passed &= !violated;
        }
        Ok(passed)
    }

    fn min_quotient(&self, denom: &Self) -> VectorResult<Real> {
        check_len(self.len(), denom.len())?;
        let mut min = Real::MAX;
        for (&n, &d) in self.data.iter().zip(denom.data.iter()) {
            if d != 0.0 {
                min = min.min(n / d);
            }
        }
        Ok(min)
    }

    fn linear_combination(&mut self, c: &[Real], xs: &[&Self]) -> VectorResult<()> {
        check_combination_shape(c.len(), xs.len())?;
        for x in xs {
            check_len(self.len(), x.len())?;
        }
        // Same per-entry order as scale followed by repeated axpy.
        for (i, z) in self.data.iter_mut().enumerate() {
            let mut acc = c[0] * xs[0].data[i];
            for (ck, xk) in c.iter().zip(xs).skip(1) {
                acc = *ck * xk.data[i] + acc;
            }
            *z = acc;
        }
        Ok(())
    }
}

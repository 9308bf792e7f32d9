//! Square band matrix in column-major band storage.
//!
//! Column `j` holds rows `j - smu ..= j + ml`, where the storage upper
//! bandwidth `smu >= mu` leaves room for the fill produced by partial
//! pivoting in the band LU factorization. Entry `(i, j)` lives at
//! `data[j * ldim + i + smu - j]` with `ldim = smu + ml + 1`.

use std::any::Any;

use super::traits::{MatrixId, MatrixSpace, SunMatrix, same_kind};
use crate::Real;
use crate::error::{MatrixError, MatrixResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BandMatrix {
    n: usize,
    mu: usize,
    ml: usize,
    smu: usize,
    ldim: usize,
    data: Vec<Real>,
}

impl BandMatrix {
    /// Band matrix with storage upper bandwidth `min(n - 1, mu + ml)`, the
    /// room needed to factor it in place.
    pub fn new(n: usize, mu: usize, ml: usize) -> Self {
        let smu = (mu + ml).min(n.saturating_sub(1)).max(mu);
        Self::alloc(n, mu, ml, smu)
    }

    /// Band matrix with an explicit storage upper bandwidth.
    pub fn with_storage(n: usize, mu: usize, ml: usize, smu: usize) -> MatrixResult<Self> {
        if smu < mu {
            return Err(MatrixError::IllInput(format!(
                "storage upper bandwidth {smu} is smaller than upper bandwidth {mu}"
            )));
        }
        Ok(Self::alloc(n, mu, ml, smu))
    }

    fn alloc(n: usize, mu: usize, ml: usize, smu: usize) -> Self {
        let ldim = smu + ml + 1;
        Self {
            n,
            mu,
            ml,
            smu,
            ldim,
            data: vec![0.0; n * ldim],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn upper_bandwidth(&self) -> usize {
        self.mu
    }

    pub fn lower_bandwidth(&self) -> usize {
        self.ml
    }

    pub fn storage_upper_bandwidth(&self) -> usize {
        self.smu
    }

    pub fn ldim(&self) -> usize {
        self.ldim
    }

    pub fn data(&self) -> &[Real] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Real] {
        &mut self.data
    }

    /// Whether `(i, j)` has a storage slot.
    pub fn in_storage(&self, i: usize, j: usize) -> bool {
        i < self.n && j < self.n && j <= i + self.smu && i <= j + self.ml
    }

    /// Whether `(i, j)` lies inside the logical band.
    pub fn in_band(&self, i: usize, j: usize) -> bool {
        i < self.n && j < self.n && j <= i + self.mu && i <= j + self.ml
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        j * self.ldim + i + self.smu - j
    }

    /// Entry `(i, j)`, zero outside the stored band.
    pub fn get(&self, i: usize, j: usize) -> Real {
        if self.in_storage(i, j) {
            self.data[self.index(i, j)]
        } else {
            0.0
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: Real) -> MatrixResult<()> {
        if !self.in_storage(i, j) {
            return Err(MatrixError::IllInput(format!(
                "entry ({i}, {j}) is outside the band (mu = {}, ml = {})",
                self.mu, self.ml
            )));
        }
        let k = self.index(i, j);
        self.data[k] = value;
        Ok(())
    }

    /// Entry inside the logical band, zero elsewhere.
    fn get_band(&self, i: usize, j: usize) -> Real {
        if self.in_band(i, j) {
            self.data[self.index(i, j)]
        } else {
            0.0
        }
    }

    /// Row range of the logical band in column `j`.
    pub fn column_rows(&self, j: usize) -> std::ops::RangeInclusive<usize> {
        j.saturating_sub(self.mu)..=(j + self.ml).min(self.n.saturating_sub(1))
    }

    /// Copy of `self` with bandwidths at least `mu`/`ml`, values preserved.
    fn widened(&self, mu: usize, ml: usize, smu: usize) -> Self {
        let mu = mu.max(self.mu);
        let ml = ml.max(self.ml);
        let smu = smu.max(self.smu).max(mu);
        let mut wide = Self::alloc(self.n, mu, ml, smu);
        for j in 0..self.n {
            for i in j.saturating_sub(self.smu)..=(j + self.ml).min(self.n.saturating_sub(1)) {
                let k = wide.index(i, j);
                wide.data[k] = self.data[self.index(i, j)];
            }
        }
        wide
    }
}

impl SunMatrix for BandMatrix {
    fn id(&self) -> MatrixId {
        MatrixId::Band
    }

    fn rows(&self) -> usize {
        self.n
    }

    fn cols(&self) -> usize {
        self.n
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_boxed(&self) -> Box<dyn SunMatrix> {
        Box::new(self.clone())
    }

    fn zero(&mut self) -> MatrixResult<()> {
        self.data.fill(0.0);
        Ok(())
    }

    fn copy_from(&mut self, src: &dyn SunMatrix) -> MatrixResult<()> {
        let src = same_kind(self, src)?;
        if src.mu > self.mu || src.ml > self.ml {
            *self = Self::alloc(
                self.n,
                src.mu.max(self.mu),
                src.ml.max(self.ml),
                src.smu.max(self.smu).max(src.mu.max(self.mu)),
            );
        } else {
            self.data.fill(0.0);
        }
        for j in 0..self.n {
            for i in src.column_rows(j) {
                let k = self.index(i, j);
                self.data[k] = src.data[src.index(i, j)];
            }
        }
        Ok(())
    }

    fn scale_add(&mut self, c: Real, b: &dyn SunMatrix) -> MatrixResult<()> {
        let b = same_kind(self, b)?;
        if b.mu > self.mu || b.ml > self.ml {
            *self = self.widened(b.mu, b.ml, b.smu);
        }
        for j in 0..self.n {
            for i in self.column_rows(j) {
                let k = self.index(i, j);
                self.data[k] = c * self.data[k] + b.get_band(i, j);
            }
        }
        Ok(())
    }

    fn scale_add_identity(&mut self, c: Real) -> MatrixResult<()> {
        for j in 0..self.n {
            for i in self.column_rows(j) {
                let k = self.index(i, j);
                self.data[k] *= c;
            }
            let k = self.index(j, j);
            self.data[k] += 1.0;
        }
        Ok(())
    }

    fn matvec_host(&self, x: &[Real], y: &mut [Real]) -> MatrixResult<()> {
        y.fill(0.0);
        for (j, &xj) in x.iter().enumerate() {
            for i in self.column_rows(j) {
                y[i] += self.data[self.index(i, j)] * xj;
            }
        }
        Ok(())
    }

    fn space(&self) -> MatrixSpace {
        MatrixSpace {
            reals: self.data.len(),
            indices: 7 + self.n,
        }
    }
}

//! Dense column-major matrix backed by `nalgebra::DMatrix`.

use std::any::Any;

use nalgebra::DMatrix;

use super::traits::{MatrixId, MatrixSpace, SunMatrix, require_square, same_kind};
use crate::Real;
use crate::error::{MatrixError, MatrixResult};

#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    data: DMatrix<Real>,
}

impl DenseMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: DMatrix::zeros(rows, cols),
        }
    }

    pub fn identity(n: usize) -> Self {
        Self {
            data: DMatrix::identity(n, n),
        }
    }

    /// Builds a matrix from entries listed row by row.
    pub fn from_row_slice(rows: usize, cols: usize, values: &[Real]) -> MatrixResult<Self> {
        if values.len() != rows * cols {
            return Err(MatrixError::IllInput(format!(
                "{} values cannot fill a {}x{} matrix",
                values.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            data: DMatrix::from_row_slice(rows, cols, values),
        })
    }

    pub fn from_dmatrix(data: DMatrix<Real>) -> Self {
        Self { data }
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &DMatrix<Real> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DMatrix<Real> {
        &mut self.data
    }

    pub fn get(&self, i: usize, j: usize) -> Real {
        self.data[(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, value: Real) {
        self.data[(i, j)] = value;
    }

    /// Contiguous storage of column `j`.
    pub fn column(&self, j: usize) -> &[Real] {
        let m = self.nrows();
        &self.data.as_slice()[j * m..(j + 1) * m]
    }

    pub fn column_mut(&mut self, j: usize) -> &mut [Real] {
        let m = self.nrows();
        &mut self.data.as_mut_slice()[j * m..(j + 1) * m]
    }
}

impl SunMatrix for DenseMatrix {
    fn id(&self) -> MatrixId {
        MatrixId::Dense
    }

    fn rows(&self) -> usize {
        self.nrows()
    }

    fn cols(&self) -> usize {
        self.ncols()
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
        self.data.copy_from(&src.data);
        Ok(())
    }

    fn scale_add(&mut self, c: Real, b: &dyn SunMatrix) -> MatrixResult<()> {
        let b = same_kind(self, b)?;
        for (a, &bij) in self.data.iter_mut().zip(b.data.iter()) {
            *a = c * *a + bij;
        }
        Ok(())
    }

    fn scale_add_identity(&mut self, c: Real) -> MatrixResult<()> {
        require_square(self)?;
        self.data.scale_mut(c);
        for i in 0..self.nrows() {
            self.data[(i, i)] += 1.0;
        }
        Ok(())
    }

    fn matvec_host(&self, x: &[Real], y: &mut [Real]) -> MatrixResult<()> {
        y.fill(0.0);
        for (j, &xj) in x.iter().enumerate() {
            for (yi, &aij) in y.iter_mut().zip(self.column(j)) {
                *yi += aij * xj;
            }
        }
        Ok(())
    }

    fn space(&self) -> MatrixSpace {
        MatrixSpace {
            reals: self.nrows() * self.ncols(),
            indices: 3,
        }
    }
}

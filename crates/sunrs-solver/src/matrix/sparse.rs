//! Compressed sparse matrix in CSR or CSC layout.
//!
//! Storage is the usual `(offsets, indices, values)` triple over the major
//! dimension (rows for CSR, columns for CSC), with sorted, unique minor
//! indices per major slice. Assembly goes through `nalgebra_sparse`'s COO
//! format, which sums duplicate entries.
//!
//! `scale_add` and `scale_add_identity` may grow the pattern. A matrix built
//! with a fixed pattern refuses any such change, and a matrix whose pattern
//! did change refuses products until [`SunMatrix::matvec_setup`] has
//! revalidated it.

use std::any::Any;
use std::cmp::Ordering;

use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::band::BandMatrix;
use super::dense::DenseMatrix;
use super::traits::{MatrixId, MatrixSpace, SunMatrix, require_square, same_kind};
use crate::Real;
use crate::error::{MatrixError, MatrixResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SparseFormat {
    /// Compressed sparse row
    Csr,
    /// Compressed sparse column
    Csc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    format: SparseFormat,
    /// Start of each major slice in `indices`/`values`, plus the end marker.
    offsets: Vec<usize>,
    /// Minor index of each stored entry.
    indices: Vec<usize>,
    values: Vec<Real>,
    /// Number of entries storage is reserved for.
    capacity: usize,
    fixed_pattern: bool,
    structure_changed: bool,
}

impl SparseMatrix {
    /// Empty matrix with room for `capacity` entries.
    pub fn new(rows: usize, cols: usize, capacity: usize, format: SparseFormat) -> Self {
        let major = match format {
            SparseFormat::Csr => rows,
            SparseFormat::Csc => cols,
        };
        Self {
            rows,
            cols,
            format,
            offsets: vec![0; major + 1],
            indices: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            fixed_pattern: false,
            structure_changed: false,
        }
    }

    /// Assembles a matrix from `(row, col, value)` triplets. Duplicates are
    /// summed.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: &[(usize, usize, Real)],
        format: SparseFormat,
    ) -> MatrixResult<Self> {
        let row_indices = triplets.iter().map(|t| t.0).collect();
        let col_indices = triplets.iter().map(|t| t.1).collect();
        let values = triplets.iter().map(|t| t.2).collect();
        let coo = CooMatrix::try_from_triplets(rows, cols, row_indices, col_indices, values)
            .map_err(|e| MatrixError::IllInput(e.to_string()))?;

        let (offsets, indices, values) = match format {
            SparseFormat::Csr => CsrMatrix::from(&coo).disassemble(),
            SparseFormat::Csc => CscMatrix::from(&coo).disassemble(),
        };
        let capacity = values.len();
        Ok(Self {
            rows,
            cols,
            format,
            offsets,
            indices,
            values,
            capacity,
            fixed_pattern: false,
            structure_changed: false,
        })
    }

    pub fn identity(n: usize, format: SparseFormat) -> Self {
        Self {
            rows: n,
            cols: n,
            format,
            offsets: (0..=n).collect(),
            indices: (0..n).collect(),
            values: vec![1.0; n],
            capacity: n,
            fixed_pattern: false,
            structure_changed: false,
        }
    }

    /// Sparse copy of the entries of `a` with magnitude above `droptol`.
    pub fn from_dense(a: &DenseMatrix, droptol: Real, format: SparseFormat) -> MatrixResult<Self> {
        let mut triplets = Vec::new();
        for j in 0..a.ncols() {
            for (i, &v) in a.column(j).iter().enumerate() {
                if v.abs() > droptol {
                    triplets.push((i, j, v));
                }
            }
        }
        Self::from_triplets(a.nrows(), a.ncols(), &triplets, format)
    }

    /// Sparse copy of the logical band of `a` with magnitude above `droptol`.
    pub fn from_band(a: &BandMatrix, droptol: Real, format: SparseFormat) -> MatrixResult<Self> {
        let n = a.size();
        let mut triplets = Vec::new();
        for j in 0..n {
            for i in a.column_rows(j) {
                let v = a.get(i, j);
                if v.abs() > droptol {
                    triplets.push((i, j, v));
                }
            }
        }
        Self::from_triplets(n, n, &triplets, format)
    }

    /// Freezes the current pattern: later structural changes fail.
    pub fn with_fixed_pattern(mut self) -> Self {
        self.fixed_pattern = true;
        self
    }

    pub fn set_fixed_pattern(&mut self, fixed: bool) {
        self.fixed_pattern = fixed;
    }

    pub fn is_fixed_pattern(&self) -> bool {
        self.fixed_pattern
    }

    /// Whether a structural change is waiting for `matvec_setup`.
    pub fn structure_changed(&self) -> bool {
        self.structure_changed
    }

    pub fn format(&self) -> SparseFormat {
        self.format
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[Real] {
        &self.values
    }

    /// Mutable stored values. The pattern cannot change through this view.
    pub fn values_mut(&mut self) -> &mut [Real] {
        &mut self.values
    }

    fn major_dim(&self) -> usize {
        match self.format {
            SparseFormat::Csr => self.rows,
            SparseFormat::Csc => self.cols,
        }
    }

    fn minor_dim(&self) -> usize {
        match self.format {
            SparseFormat::Csr => self.cols,
            SparseFormat::Csc => self.rows,
        }
    }

    /// Position of `(major, minor)` in the storage arrays.
    fn position(&self, major: usize, minor: usize) -> Option<usize> {
        let (start, end) = (self.offsets[major], self.offsets[major + 1]);
        self.indices[start..end]
            .binary_search(&minor)
            .ok()
            .map(|k| start + k)
    }

    /// Entry `(i, j)`, zero when it is not stored.
    pub fn get(&self, i: usize, j: usize) -> Real {
        if i >= self.rows || j >= self.cols {
            return 0.0;
        }
        let (major, minor) = match self.format {
            SparseFormat::Csr => (i, j),
            SparseFormat::Csc => (j, i),
        };
        self.position(major, minor).map_or(0.0, |k| self.values[k])
    }

    /// Replaces the pattern and values. The arrays are validated here and
    /// the matrix needs `matvec_setup` before the next product.
    pub fn set_structure(
        &mut self,
        offsets: Vec<usize>,
        indices: Vec<usize>,
        values: Vec<Real>,
    ) -> MatrixResult<()> {
        if self.fixed_pattern {
            return Err(MatrixError::FixedPattern("set_structure".into()));
        }
        if values.len() != indices.len() {
            return Err(MatrixError::IllInput(format!(
                "{} values for {} indices",
                values.len(),
                indices.len()
            )));
        }
        let pattern = SparsityPattern::try_from_offsets_and_indices(
            self.major_dim(),
            self.minor_dim(),
            offsets,
            indices,
        )
        .map_err(|e| MatrixError::IllInput(e.to_string()))?;
        let (offsets, indices) = pattern.disassemble();
        self.offsets = offsets;
        self.indices = indices;
        self.values = values;
        self.capacity = self.capacity.max(self.values.len());
        self.structure_changed = true;
        Ok(())
    }

    /// Changes the reserved storage to `capacity` entries. Shrinking below
    /// the current number of stored entries is rejected.
    pub fn reallocate(&mut self, capacity: usize) -> MatrixResult<()> {
        if capacity < self.nnz() {
            return Err(MatrixError::IllInput(format!(
                "cannot shrink storage to {capacity} below {} stored entries",
                self.nnz()
            )));
        }
        if capacity > self.indices.capacity() {
            self.indices.reserve_exact(capacity - self.indices.len());
            self.values.reserve_exact(capacity - self.values.len());
        } else {
            self.indices.shrink_to(capacity);
            self.values.shrink_to(capacity);
        }
        self.capacity = capacity;
        Ok(())
    }

    pub fn to_dense(&self) -> DenseMatrix {
        let mut dense = DenseMatrix::new(self.rows, self.cols);
        for major in 0..self.major_dim() {
            for k in self.offsets[major]..self.offsets[major + 1] {
                let minor = self.indices[k];
                match self.format {
                    SparseFormat::Csr => dense.set(major, minor, self.values[k]),
                    SparseFormat::Csc => dense.set(minor, major, self.values[k]),
                }
            }
        }
        dense
    }

    fn check_format(&self, other: &SparseMatrix) -> MatrixResult<()> {
        if self.format == other.format {
            Ok(())
        } else {
            Err(MatrixError::IllInput(format!(
                "sparse format mismatch: {:?} vs {:?}",
                self.format, other.format
            )))
        }
    }

    fn same_pattern(&self, other: &SparseMatrix) -> bool {
        self.offsets == other.offsets && self.indices == other.indices
    }

    /// Storage positions in `self` of every entry of `other`, or `None`
    /// when `other` has an entry outside the pattern of `self`.
    fn embedding_of(&self, other: &SparseMatrix) -> Option<Vec<usize>> {
        let mut positions = Vec::with_capacity(other.nnz());
        for major in 0..self.major_dim() {
            let mut p = self.offsets[major];
            let end = self.offsets[major + 1];
            for q in other.offsets[major]..other.offsets[major + 1] {
                let target = other.indices[q];
                while p < end && self.indices[p] < target {
                    p += 1;
                }
                if p == end || self.indices[p] != target {
                    return None;
                }
                positions.push(p);
            }
        }
        Some(positions)
    }

    /// `self = c*self + b` over the union of both patterns.
    fn merge_scaled(&mut self, c: Real, b: &SparseMatrix) {
        let major_dim = self.major_dim();
        let mut offsets = Vec::with_capacity(major_dim + 1);
        let mut indices = Vec::with_capacity(self.nnz() + b.nnz());
        let mut values = Vec::with_capacity(self.nnz() + b.nnz());
        offsets.push(0);
        for major in 0..major_dim {
            let (mut p, pe) = (self.offsets[major], self.offsets[major + 1]);
            let (mut q, qe) = (b.offsets[major], b.offsets[major + 1]);
            while p < pe || q < qe {
                let ia = if p < pe { self.indices[p] } else { usize::MAX };
                let ib = if q < qe { b.indices[q] } else { usize::MAX };
                match ia.cmp(&ib) {
                    Ordering::Less => {
                        indices.push(ia);
                        values.push(c * self.values[p]);
                        p += 1;
                    }
                    Ordering::Greater => {
                        indices.push(ib);
                        values.push(b.values[q]);
                        q += 1;
                    }
                    Ordering::Equal => {
                        indices.push(ia);
                        values.push(c * self.values[p] + b.values[q]);
                        p += 1;
                        q += 1;
                    }
                }
            }
            offsets.push(indices.len());
        }
        trace!(
            old_nnz = self.nnz(),
            new_nnz = values.len(),
            "sparse pattern grew"
        );
        self.capacity = self.capacity.max(values.len());
        self.offsets = offsets;
        self.indices = indices;
        self.values = values;
        self.structure_changed = true;
    }
}

impl SunMatrix for SparseMatrix {
    fn id(&self) -> MatrixId {
        MatrixId::Sparse
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
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
        self.values.fill(0.0);
        Ok(())
    }

    fn copy_from(&mut self, src: &dyn SunMatrix) -> MatrixResult<()> {
        let src = same_kind(self, src)?;
        self.check_format(src)?;
        if self.same_pattern(src) {
            self.values.copy_from_slice(&src.values);
        } else if let Some(positions) = self.embedding_of(src) {
            self.values.fill(0.0);
            for (&p, &v) in positions.iter().zip(&src.values) {
                self.values[p] = v;
            }
        } else if self.fixed_pattern {
            return Err(MatrixError::FixedPattern(
                "source pattern is not contained in the fixed pattern".into(),
            ));
        } else {
            self.offsets.clone_from(&src.offsets);
            self.indices.clone_from(&src.indices);
            self.values.clone_from(&src.values);
            self.capacity = self.capacity.max(self.values.len());
            self.structure_changed = true;
        }
        Ok(())
    }

    fn scale_add(&mut self, c: Real, b: &dyn SunMatrix) -> MatrixResult<()> {
        let b = same_kind(self, b)?;
        self.check_format(b)?;
        if let Some(positions) = self.embedding_of(b) {
            for v in &mut self.values {
                *v *= c;
            }
            for (&p, &v) in positions.iter().zip(&b.values) {
                self.values[p] += v;
            }
            Ok(())
        } else if self.fixed_pattern {
            Err(MatrixError::FixedPattern(
                "scale_add would add entries outside the fixed pattern".into(),
            ))
        } else {
            self.merge_scaled(c, b);
            Ok(())
        }
    }

    fn scale_add_identity(&mut self, c: Real) -> MatrixResult<()> {
        require_square(self)?;
        let diagonal: Option<Vec<usize>> =
            (0..self.rows).map(|i| self.position(i, i)).collect();
        match diagonal {
            Some(diagonal) => {
                for v in &mut self.values {
                    *v *= c;
                }
                for p in diagonal {
                    self.values[p] += 1.0;
                }
                Ok(())
            }
            None if self.fixed_pattern => Err(MatrixError::FixedPattern(
                "missing diagonal entries cannot be inserted".into(),
            )),
            None => {
                let eye = SparseMatrix::identity(self.rows, self.format);
                self.merge_scaled(c, &eye);
                Ok(())
            }
        }
    }

    fn matvec_setup(&mut self) -> MatrixResult<()> {
        if !self.structure_changed {
            return Ok(());
        }
        SparsityPattern::try_from_offsets_and_indices(
            self.major_dim(),
            self.minor_dim(),
            self.offsets.clone(),
            self.indices.clone(),
        )
        .map_err(|e| MatrixError::OperationFail(e.to_string()))?;
        self.structure_changed = false;
        Ok(())
    }

    fn matvec_host(&self, x: &[Real], y: &mut [Real]) -> MatrixResult<()> {
        if self.structure_changed {
            return Err(MatrixError::MatvecSetupRequired);
        }
        match self.format {
            SparseFormat::Csr => {
                for (row, yi) in y.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for k in self.offsets[row]..self.offsets[row + 1] {
                        sum += self.values[k] * x[self.indices[k]];
                    }
                    *yi = sum;
                }
            }
            SparseFormat::Csc => {
                y.fill(0.0);
                for (col, &xj) in x.iter().enumerate() {
                    for k in self.offsets[col]..self.offsets[col + 1] {
                        y[self.indices[k]] += self.values[k] * xj;
                    }
                }
            }
        }
        Ok(())
    }

    fn space(&self) -> MatrixSpace {
        MatrixSpace {
            reals: self.capacity.max(self.nnz()),
            indices: self.capacity.max(self.nnz()) + self.offsets.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::sunmat;
    use crate::matrix::MatVec;
    use crate::nvector::{NVector, SerialVector};

    fn sample(format: SparseFormat) -> SparseMatrix {
        // [ 4 0 1 ]
        // [ 0 3 0 ]
        // [ 2 0 5 ]
        SparseMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 4.0), (0, 2, 1.0), (1, 1, 3.0), (2, 0, 2.0), (2, 2, 5.0)],
            format,
        )
        .unwrap()
    }

    #[test]
    fn triplet_duplicates_are_summed() {
        let a = SparseMatrix::from_triplets(
            2,
            2,
            &[(0, 0, 1.0), (0, 0, 2.0), (1, 1, 1.0)],
            SparseFormat::Csr,
        )
        .unwrap();
        assert_eq!(a.nnz(), 2);
        assert_eq!(a.get(0, 0), 3.0);
    }

    #[test]
    fn csr_and_csc_products_agree() {
        let x = SerialVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut y_csr = SerialVector::zeros(3);
        let mut y_csc = SerialVector::zeros(3);
        sample(SparseFormat::Csr).matvec(&x, &mut y_csr).unwrap();
        sample(SparseFormat::Csc).matvec(&x, &mut y_csc).unwrap();
        assert_eq!(y_csr.as_slice().unwrap(), &[7.0, 6.0, 17.0]);
        assert_eq!(y_csr, y_csc);
    }

    #[test]
    fn zero_keeps_pattern() {
        let mut a = sample(SparseFormat::Csr);
        a.zero().unwrap();
        assert_eq!(a.nnz(), 5);
        assert!(a.values().iter().all(|&v| v == 0.0));
        assert!(!a.structure_changed());
    }

    #[test]
    fn scale_add_identity_inserts_diagonal_and_requires_setup() {
        let mut a = SparseMatrix::from_triplets(
            3,
            3,
            &[(0, 1, 1.0), (1, 1, 2.0), (2, 0, 1.0)],
            SparseFormat::Csr,
        )
        .unwrap();
        a.scale_add_identity(2.0).unwrap();
        assert_eq!(a.nnz(), 5);
        assert_eq!(a.get(0, 0), 1.0);
        assert_eq!(a.get(1, 1), 5.0);
        assert_eq!(a.get(0, 1), 2.0);

        let x = SerialVector::from_vec(vec![1.0, 1.0, 1.0]);
        let mut y = SerialVector::zeros(3);
        let err = a.matvec(&x, &mut y).unwrap_err();
        assert_eq!(err.code(), sunmat::MATVEC_SETUP_REQUIRED);

        a.matvec_setup().unwrap();
        a.matvec_setup().unwrap();
        a.matvec(&x, &mut y).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[3.0, 5.0, 3.0]);
    }

    #[test]
    fn fixed_pattern_rejects_growth_and_keeps_values() {
        let mut a = SparseMatrix::from_triplets(2, 2, &[(0, 1, 1.0)], SparseFormat::Csc)
            .unwrap()
            .with_fixed_pattern();
        let before = a.clone();
        let err = a.scale_add_identity(1.0).unwrap_err();
        assert_eq!(err.code(), sunmat::OPERATION_FAIL);
        assert_eq!(a, before);

        let b = SparseMatrix::identity(2, SparseFormat::Csc);
        assert!(matches!(a.scale_add(1.0, &b), Err(MatrixError::FixedPattern(_))));
        assert!(matches!(a.copy_from(&b), Err(MatrixError::FixedPattern(_))));
        assert_eq!(a, before);
    }

    #[test]
    fn scale_add_within_pattern_is_in_place() {
        let mut a = sample(SparseFormat::Csr).with_fixed_pattern();
        let eye = SparseMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0)],
            SparseFormat::Csr,
        )
        .unwrap();
        a.scale_add(-1.0, &eye).unwrap();
        assert_eq!(a.get(0, 0), -3.0);
        assert_eq!(a.get(2, 0), -2.0);
        assert!(!a.structure_changed());
    }

    #[test]
    fn copy_from_subset_scatters() {
        let mut a = sample(SparseFormat::Csr);
        let d = SparseMatrix::identity(3, SparseFormat::Csr);
        a.copy_from(&d).unwrap();
        assert_eq!(a.nnz(), 5);
        assert_eq!(a.get(0, 2), 0.0);
        assert_eq!(a.get(1, 1), 1.0);

        let mut e = SparseMatrix::identity(3, SparseFormat::Csr);
        e.copy_from(&sample(SparseFormat::Csr)).unwrap();
        assert_eq!(e.nnz(), 5);
        assert!(e.structure_changed());
    }

    #[test]
    fn format_and_shape_mismatch_are_ill_input() {
        let mut a = sample(SparseFormat::Csr);
        let b = sample(SparseFormat::Csc);
        assert!(matches!(a.scale_add(1.0, &b), Err(MatrixError::IllInput(_))));
        let c = crate::matrix::DenseMatrix::identity(3);
        assert_eq!(a.copy_from(&c).unwrap_err().code(), sunmat::ILL_INPUT);
    }

    #[test]
    fn reallocate_cannot_drop_entries() {
        let mut a = sample(SparseFormat::Csr);
        assert!(a.reallocate(2).is_err());
        a.reallocate(20).unwrap();
        assert_eq!(a.capacity(), 20);
        assert_eq!(a.space().reals, 20);
    }

    #[test]
    fn dense_round_trip_preserves_entries() {
        let a = sample(SparseFormat::Csc);
        let back = SparseMatrix::from_dense(&a.to_dense(), 0.0, SparseFormat::Csc).unwrap();
        assert_eq!(back.values(), a.values());
        assert_eq!(back.indices(), a.indices());
    }
}

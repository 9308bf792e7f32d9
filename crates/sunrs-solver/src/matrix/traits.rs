//! The abstract matrix contract.
//!
//! Matrices work on host data. The product with an abstract vector goes
//! through [`MatVec::matvec`], which borrows the vectors' host slices and
//! fails with `IllInput` when a vector has none.

use std::any::Any;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::Real;
use crate::error::{MatrixError, MatrixResult};
use crate::nvector::NVector;

/// Storage family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixId {
    Dense,
    Band,
    Sparse,
    Custom,
}

/// Storage footprint reported by [`SunMatrix::space`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSpace {
    /// Number of `Real` words held.
    pub reals: usize,
    /// Number of index words held.
    pub indices: usize,
}

/// Abstract matrix.
///
/// The trait is object safe; the linear-solve layer handles matrices as
/// `dyn SunMatrix` and downcasts to a concrete backend after checking
/// [`SunMatrix::id`].
pub trait SunMatrix: Send + Debug + 'static {
    fn id(&self) -> MatrixId;

    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Deep copy with identical structure and values.
    fn clone_boxed(&self) -> Box<dyn SunMatrix>;

    /// Set every stored entry to zero. Sparse structure is kept.
    fn zero(&mut self) -> MatrixResult<()>;

    /// `self = src`. Both matrices must be of the same kind and dimensions.
    fn copy_from(&mut self, src: &dyn SunMatrix) -> MatrixResult<()>;

    /// `self = c*self + b`
    fn scale_add(&mut self, c: Real, b: &dyn SunMatrix) -> MatrixResult<()>;

    /// `self = c*self + I`
    fn scale_add_identity(&mut self, c: Real) -> MatrixResult<()>;

    /// Prepare internal data for a product after a structural change.
    /// Idempotent.
    fn matvec_setup(&mut self) -> MatrixResult<()> {
        Ok(())
    }

    /// `y = self * x` on host slices whose lengths were already checked
    /// against [`SunMatrix::cols`] and [`SunMatrix::rows`].
    fn matvec_host(&self, x: &[Real], y: &mut [Real]) -> MatrixResult<()>;

    fn space(&self) -> MatrixSpace;
}

impl dyn SunMatrix + '_ {
    pub fn downcast_ref<M: SunMatrix>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    pub fn downcast_mut<M: SunMatrix>(&mut self) -> Option<&mut M> {
        self.as_any_mut().downcast_mut::<M>()
    }
}

impl Clone for Box<dyn SunMatrix> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Product of a matrix with abstract vectors.
pub trait MatVec {
    /// `y = self * x`
    fn matvec<V: NVector>(&self, x: &V, y: &mut V) -> MatrixResult<()>;
}

impl<M: SunMatrix + ?Sized> MatVec for M {
    fn matvec<V: NVector>(&self, x: &V, y: &mut V) -> MatrixResult<()> {
        let xs = x
            .as_slice()
            .ok_or_else(|| MatrixError::IllInput("input vector has no host data".into()))?;
        if xs.len() != self.cols() {
            return Err(MatrixError::IllInput(format!(
                "input vector length {} does not match {} columns",
                xs.len(),
                self.cols()
            )));
        }
        let ys = y
            .as_mut_slice()
            .ok_or_else(|| MatrixError::IllInput("output vector has no host data".into()))?;
        if ys.len() != self.rows() {
            return Err(MatrixError::IllInput(format!(
                "output vector length {} does not match {} rows",
                ys.len(),
                self.rows()
            )));
        }
        self.matvec_host(xs, ys)
    }
}

/// Downcasts `src` to the backend of `this`, checking kind and dimensions.
pub(crate) fn same_kind<'s, M: SunMatrix>(this: &M, src: &'s dyn SunMatrix) -> MatrixResult<&'s M> {
    if src.id() != this.id() {
        return Err(MatrixError::IllInput(format!(
            "incompatible matrix kinds {:?} and {:?}",
            this.id(),
            src.id()
        )));
    }
    if src.rows() != this.rows() || src.cols() != this.cols() {
        return Err(MatrixError::IllInput(format!(
            "dimension mismatch: {}x{} vs {}x{}",
            this.rows(),
            this.cols(),
            src.rows(),
            src.cols()
        )));
    }
    src.downcast_ref::<M>()
        .ok_or_else(|| MatrixError::IllInput("matrix content type mismatch".into()))
}

pub(crate) fn require_square(m: &dyn SunMatrix) -> MatrixResult<()> {
    if m.rows() == m.cols() {
        Ok(())
    } else {
        Err(MatrixError::IllInput(format!(
            "operation requires a square matrix, got {}x{}",
            m.rows(),
            m.cols()
        )))
    }
}

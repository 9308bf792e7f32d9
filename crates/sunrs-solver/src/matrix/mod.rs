//! Abstract matrices and their dense, band and sparse backends.

pub mod band;
pub mod dense;
pub mod sparse;
pub mod traits;

pub use band::BandMatrix;
pub use dense::DenseMatrix;
pub use sparse::{SparseFormat, SparseMatrix};
pub use traits::{MatVec, MatrixId, MatrixSpace, SunMatrix};

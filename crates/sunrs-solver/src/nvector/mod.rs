//! Abstract vectors and their host backends.

pub mod serial;
pub mod threaded;
pub mod traits;

pub use serial::SerialVector;
pub use threaded::{ThreadedConfig, ThreadedContext, ThreadedVector};
pub use traits::{NVector, VectorId, check_len};

//! Status codes and error types for every layer.
//!
//! All layers share one numeric convention: `0` is success, positive codes
//! are recoverable (the caller may retry with a smaller step or a fresher
//! Jacobian) and negative codes are fatal. Existing callers compare raw codes,
//! so the values below must not change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Real;

/// Matrix-layer status codes.
pub mod sunmat {
    pub const SUCCESS: i32 = 0;
    pub const ILL_INPUT: i32 = -701;
    pub const MEM_FAIL: i32 = -702;
    pub const OPERATION_FAIL: i32 = -703;
    pub const MATVEC_SETUP_REQUIRED: i32 = -704;
}

/// Linear-solver-layer status codes.
pub mod sunls {
    pub const SUCCESS: i32 = 0;

    pub const MEM_NULL: i32 = -801;
    pub const ILL_INPUT: i32 = -802;
    pub const MEM_FAIL: i32 = -803;
    pub const ATIMES_NULL: i32 = -804;
    pub const ATIMES_FAIL_UNREC: i32 = -805;
    pub const PSET_FAIL_UNREC: i32 = -806;
    pub const PSOLVE_NULL: i32 = -807;
    pub const PSOLVE_FAIL_UNREC: i32 = -808;
    pub const PACKAGE_FAIL_UNREC: i32 = -809;
    pub const GS_FAIL: i32 = -810;
    pub const QRSOL_FAIL: i32 = -811;
    pub const VECTOROP_ERR: i32 = -812;

    pub const RES_REDUCED: i32 = 801;
    pub const CONV_FAIL: i32 = 802;
    pub const ATIMES_FAIL_REC: i32 = 803;
    pub const PSET_FAIL_REC: i32 = 804;
    pub const PSOLVE_FAIL_REC: i32 = 805;
    pub const PACKAGE_FAIL_REC: i32 = 806;
    pub const QRFACT_FAIL: i32 = 807;
    pub const LUFACT_FAIL: i32 = 808;
}

/// Errors raised by vector operations. Always fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    #[error("vector length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("vector array size mismatch: expected {expected}, got {actual}")]
    ArrayMismatch { expected: usize, actual: usize },

    #[error("vector allocation failed: {0}")]
    Allocation(String),

    #[error("vector backend error: {0}")]
    Backend(String),
}

pub type VectorResult<T> = std::result::Result<T, VectorError>;

/// Errors raised by matrix operations. Always fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatrixError {
    #[error("illegal matrix input: {0}")]
    IllInput(String),

    #[error("matrix allocation failed: {0}")]
    MemFail(String),

    #[error("matrix operation failed: {0}")]
    OperationFail(String),

    #[error("structure of a fixed-pattern matrix cannot change: {0}")]
    FixedPattern(String),

    #[error("matvec setup required after a structural change")]
    MatvecSetupRequired,

    #[error(transparent)]
    Vector(#[from] VectorError),
}

impl MatrixError {
    pub fn code(&self) -> i32 {
        match self {
            MatrixError::IllInput(_) | MatrixError::Vector(_) => sunmat::ILL_INPUT,
            MatrixError::MemFail(_) => sunmat::MEM_FAIL,
            MatrixError::OperationFail(_) | MatrixError::FixedPattern(_) => {
                sunmat::OPERATION_FAIL
            }
            MatrixError::MatvecSetupRequired => sunmat::MATVEC_SETUP_REQUIRED,
        }
    }
}

pub type MatrixResult<T> = std::result::Result<T, MatrixError>;

/// Errors raised by linear solvers.
///
/// The variants split into recoverable ones (positive codes) and fatal ones
/// (negative codes); see [`LinSolError::is_recoverable`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinSolError {
    #[error("residual reduced but not converged after {iters} iterations (res = {res_norm:.3e})")]
    ResReduced { iters: usize, res_norm: Real },

    #[error("failed to converge in {iters} iterations (res = {res_norm:.3e})")]
    ConvFail { iters: usize, res_norm: Real },

    #[error("system operator failed recoverably")]
    AtimesFailRec,

    #[error("preconditioner setup failed recoverably")]
    PsetFailRec,

    #[error("preconditioner solve failed recoverably")]
    PsolveFailRec,

    #[error("external package failed recoverably: {0}")]
    PackageFailRec(String),

    #[error("QR factorization failed: zero diagonal in column {0}")]
    QrFactFail(usize),

    #[error("LU factorization failed: zero pivot in column {0}")]
    LuFactFail(usize),

    #[error("illegal linear solver input: {0}")]
    IllInput(String),

    #[error("linear solver allocation failed: {0}")]
    MemFail(String),

    #[error("no system operator available")]
    AtimesNull,

    #[error("system operator failed unrecoverably")]
    AtimesFailUnrec,

    #[error("preconditioner setup failed unrecoverably")]
    PsetFailUnrec,

    #[error("no preconditioner solve available")]
    PsolveNull,

    #[error("preconditioner solve failed unrecoverably")]
    PsolveFailUnrec,

    #[error("external package failed unrecoverably: {0}")]
    PackageFailUnrec(String),

    #[error("Gram-Schmidt orthogonalization failed")]
    GsFail,

    #[error("QR solve failed: singular triangular factor at column {0}")]
    QrSolFail(usize),

    #[error("vector operation failed: {0}")]
    VectorOp(#[from] VectorError),

    #[error("matrix operation failed: {0}")]
    Matrix(#[from] MatrixError),
}

impl LinSolError {
    pub fn code(&self) -> i32 {
        match self {
            LinSolError::ResReduced { .. } => sunls::RES_REDUCED,
            LinSolError::ConvFail { .. } => sunls::CONV_FAIL,
            LinSolError::AtimesFailRec => sunls::ATIMES_FAIL_REC,
            LinSolError::PsetFailRec => sunls::PSET_FAIL_REC,
            LinSolError::PsolveFailRec => sunls::PSOLVE_FAIL_REC,
            LinSolError::PackageFailRec(_) => sunls::PACKAGE_FAIL_REC,
            LinSolError::QrFactFail(_) => sunls::QRFACT_FAIL,
            LinSolError::LuFactFail(_) => sunls::LUFACT_FAIL,
            LinSolError::IllInput(_) => sunls::ILL_INPUT,
            LinSolError::MemFail(_) => sunls::MEM_FAIL,
            LinSolError::AtimesNull => sunls::ATIMES_NULL,
            LinSolError::AtimesFailUnrec => sunls::ATIMES_FAIL_UNREC,
            LinSolError::PsetFailUnrec => sunls::PSET_FAIL_UNREC,
            LinSolError::PsolveNull => sunls::PSOLVE_NULL,
            LinSolError::PsolveFailUnrec => sunls::PSOLVE_FAIL_UNREC,
            LinSolError::PackageFailUnrec(_) => sunls::PACKAGE_FAIL_UNREC,
            LinSolError::GsFail => sunls::GS_FAIL,
            LinSolError::QrSolFail(_) => sunls::QRSOL_FAIL,
            LinSolError::VectorOp(_) => sunls::VECTOROP_ERR,
            LinSolError::Matrix(_) => sunls::PACKAGE_FAIL_UNREC,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code() > 0
    }
}

pub type LinSolResult<T> = std::result::Result<T, LinSolError>;

/// Failure reported by a user or backend callback (Jacobian, preconditioner,
/// right-hand side, mass matrix).
///
/// Callbacks written against the integer convention can return
/// [`callback_status`] of their code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("callback failed recoverably (code {0})")]
    Recoverable(i32),

    #[error("callback failed unrecoverably (code {0})")]
    Unrecoverable(i32),
}

impl CallbackError {
    pub fn recoverable() -> Self {
        CallbackError::Recoverable(1)
    }

    pub fn unrecoverable() -> Self {
        CallbackError::Unrecoverable(-1)
    }

    pub fn code(&self) -> i32 {
        match *self {
            CallbackError::Recoverable(c) | CallbackError::Unrecoverable(c) => c,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, CallbackError::Recoverable(_))
    }
}

pub type CallbackResult<T = ()> = std::result::Result<T, CallbackError>;

/// Converts a ternary callback return code (zero, positive, negative).
pub fn callback_status(code: i32) -> CallbackResult {
    match code {
        0 => Ok(()),
        c if c > 0 => Err(CallbackError::Recoverable(c)),
        c => Err(CallbackError::Unrecoverable(c)),
    }
}

/// Status codes returned by the linear-solve interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum LsFlag {
    Success = 0,
    JacFuncRecvr = 1,
    MassFuncRecvr = 2,
    SunLsRecvr = 3,
    IllInput = -3,
    MemFail = -4,
    JacFuncUnrecvr = -7,
    MassFuncUnrecvr = -8,
    SunMatFail = -9,
    SunLsFail = -10,
}

impl LsFlag {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_recoverable(self) -> bool {
        self.code() > 0
    }

    pub fn is_fatal(self) -> bool {
        self.code() < 0
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let flag = match code {
            0 => LsFlag::Success,
            1 => LsFlag::JacFuncRecvr,
            2 => LsFlag::MassFuncRecvr,
            3 => LsFlag::SunLsRecvr,
            -3 => LsFlag::IllInput,
            -4 => LsFlag::MemFail,
            -7 => LsFlag::JacFuncUnrecvr,
            -8 => LsFlag::MassFuncUnrecvr,
            -9 => LsFlag::SunMatFail,
            -10 => LsFlag::SunLsFail,
            _ => return None,
        };
        Some(flag)
    }
}

/// Errors returned by the linear-solve interface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LsError {
    #[error("illegal input: {0}")]
    IllInput(String),

    #[error("memory allocation failed: {0}")]
    MemFail(String),

    #[error("Jacobian evaluation failed recoverably")]
    JacRecoverable,

    #[error("Jacobian evaluation failed unrecoverably: {0}")]
    JacUnrecoverable(String),

    #[error("mass matrix evaluation failed recoverably")]
    MassRecoverable,

    #[error("mass matrix evaluation failed unrecoverably: {0}")]
    MassUnrecoverable(String),

    #[error("matrix operation failed: {0}")]
    Matrix(#[from] MatrixError),

    #[error("linear solver failed: {0}")]
    LinearSolver(#[from] LinSolError),

    #[error("vector operation failed: {0}")]
    Vector(#[from] VectorError),
}

impl LsError {
    pub fn ill_input(msg: impl Into<String>) -> Self {
        LsError::IllInput(msg.into())
    }

    pub fn flag(&self) -> LsFlag {
        match self {
            LsError::IllInput(_) => LsFlag::IllInput,
            LsError::MemFail(_) => LsFlag::MemFail,
            LsError::JacRecoverable => LsFlag::JacFuncRecvr,
            LsError::JacUnrecoverable(_) => LsFlag::JacFuncUnrecvr,
            LsError::MassRecoverable => LsFlag::MassFuncRecvr,
            LsError::MassUnrecoverable(_) => LsFlag::MassFuncUnrecvr,
            LsError::Matrix(_) => LsFlag::SunMatFail,
            LsError::LinearSolver(e) if e.is_recoverable() => LsFlag::SunLsRecvr,
            LsError::LinearSolver(_) => LsFlag::SunLsFail,
            LsError::Vector(VectorError::Allocation(_)) => LsFlag::MemFail,
            LsError::Vector(_) => LsFlag::IllInput,
        }
    }

    pub fn code(&self) -> i32 {
        self.flag().code()
    }

    pub fn is_recoverable(&self) -> bool {
        self.flag().is_recoverable()
    }
}

pub type LsResult<T> = std::result::Result<T, LsError>;

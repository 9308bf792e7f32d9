//! Counters kept by the interfaces.

use serde::{Deserialize, Serialize};

use crate::error::LsFlag;

/// Linear-solve interface counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsStats {
    /// Successful Jacobian evaluations.
    pub nje: usize,
    /// Jacobian evaluations that failed recoverably.
    pub nje_recoverable: usize,
    /// Jacobian evaluations that failed unrecoverably, escalations included.
    pub nje_unrecoverable: usize,
    /// Right-hand side evaluations spent in difference quotients.
    pub nfe_dq: usize,
    /// Preconditioner evaluations that recomputed Jacobian data.
    pub npe: usize,
    /// Linear iterations.
    pub nli: usize,
    /// Preconditioner solves.
    pub nps: usize,
    /// Linear convergence failures.
    pub ncfl: usize,
    /// `J v` setup calls.
    pub njtsetup: usize,
    /// `J v` evaluations.
    pub njtimes: usize,
    pub nsetups: usize,
    pub nsolves: usize,
    pub last_flag: i32,
}

impl LsStats {
    pub fn last_flag(&self) -> LsFlag {
        LsFlag::from_code(self.last_flag).unwrap_or(LsFlag::IllInput)
    }
}

/// Mass-matrix interface counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MassStats {
    pub nmass_evals: usize,
    pub nmass_setups: usize,
    pub nmass_solves: usize,
    pub nmass_mults: usize,
    /// Linear iterations in mass solves.
    pub nli: usize,
    pub ncfl: usize,
    pub last_flag: i32,
}

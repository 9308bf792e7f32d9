//! Tunables of the linear-solve interface.
//!
//! Every threshold the interface applies lives here rather than in the
//! code, with per-package presets.

use serde::{Deserialize, Serialize};

use crate::Real;

/// The implicit package driving the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Package {
    /// Linear multistep ODE integrator.
    Multistep,
    /// Implicit Runge-Kutta ODE integrator.
    RungeKutta,
    /// Implicit DAE integrator, `F(t, y, y') = 0`.
    Dae,
    /// Nonlinear root finder, `F(u) = 0`.
    NonlinearRoot,
}

/// How the linear system matrix is built from the Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemForm {
    /// `A = I - gamma J`
    IdentityMinusGammaJ,
    /// `A = M - gamma J`, `M` a mass matrix.
    MassMinusGammaJ,
    /// `A = J`. For DAEs the Jacobian callback forms
    /// `dF/dy + cj dF/dy'` itself, with `cj` passed as `gamma`.
    Jacobian,
}

impl Package {
    pub fn default_form(self) -> SystemForm {
        match self {
            Package::Multistep | Package::RungeKutta => SystemForm::IdentityMinusGammaJ,
            Package::Dae | Package::NonlinearRoot => SystemForm::Jacobian,
        }
    }

    /// Forms the package can assemble.
    pub fn supports_form(self, form: SystemForm) -> bool {
        match self {
            Package::RungeKutta => form != SystemForm::Jacobian,
            _ => form == self.default_form(),
        }
    }

    /// Whether the package has `y' = f(t, y)` available for difference
    /// quotients.
    pub fn has_explicit_rhs(self) -> bool {
        self != Package::Dae
    }
}

/// Interface settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsConfig {
    /// Setup requests between Jacobian evaluations.
    pub msbj: usize,
    /// Linear tolerance factor relative to the nonlinear tolerance.
    pub eplifac: Real,
    /// Factor converting WRMS tolerances to 2-norm ones; `sqrt(N)` if unset.
    pub nrmfac: Option<Real>,
    /// Scale matrix-based solutions by `2 / (1 + gamma ratio)`.
    pub scale_solution: bool,
    /// Pass the error weights to solvers as scaling vectors.
    pub scaling: bool,
    /// Consecutive recoverable Jacobian failures tolerated before the next
    /// one is reported as unrecoverable.
    pub max_jac_retries: usize,
    /// After a convergence failure with a possibly bad Jacobian, refresh it
    /// only if `gamma` changed by less than this relative amount.
    pub dgmax_jbad: Real,
}

pub const DEFAULT_MSBJ: usize = 51;
pub const DEFAULT_EPLIFAC: Real = 0.05;
pub const DEFAULT_DGMAX_JBAD: Real = 0.2;
pub const DEFAULT_MAX_JAC_RETRIES: usize = 5;

impl Default for LsConfig {
    fn default() -> Self {
        Self {
            msbj: DEFAULT_MSBJ,
            eplifac: DEFAULT_EPLIFAC,
            nrmfac: None,
            scale_solution: true,
            scaling: true,
            max_jac_retries: DEFAULT_MAX_JAC_RETRIES,
            dgmax_jbad: DEFAULT_DGMAX_JBAD,
        }
    }
}

impl LsConfig {
    pub fn for_package(package: Package) -> Self {
        match package {
            Package::Multistep | Package::RungeKutta => Self::default(),
            // Fresh Jacobian at every setup.
            Package::Dae => Self {
                msbj: 1,
                ..Self::default()
            },
            Package::NonlinearRoot => Self {
                msbj: 10,
                scale_solution: false,
                ..Self::default()
            },
        }
    }

    /// The 2-norm factor for vectors of length `n`.
    pub fn norm_factor(&self, n: usize) -> Real {
        self.nrmfac.unwrap_or_else(|| (n as Real).sqrt())
    }
}

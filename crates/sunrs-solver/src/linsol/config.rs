//! Krylov solver configuration.

use serde::{Deserialize, Serialize};

use super::traits::PrecSide;

/// Orthogonalization used to build the Krylov basis.
///
/// Modified Gram-Schmidt is more robust; classical Gram-Schmidt needs fewer
/// reductions per iteration and is preferable when dot products are costly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GramSchmidt {
    #[default]
    Modified,
    Classical,
}

/// Settings shared by the Krylov solvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KrylovConfig {
    /// Krylov subspace dimension for GMRES; iteration limit for PCG.
    pub max_l: usize,
    /// GMRES restarts after the first cycle.
    pub max_restarts: usize,
    pub gram_schmidt: GramSchmidt,
    /// Preconditioning side staged at construction.
    pub prec_side: PrecSide,
}

/// Subspace dimension used when zero is requested.
pub const DEFAULT_MAX_L: usize = 5;

impl Default for KrylovConfig {
    fn default() -> Self {
        Self {
            max_l: DEFAULT_MAX_L,
            max_restarts: 0,
            gram_schmidt: GramSchmidt::default(),
            prec_side: PrecSide::default(),
        }
    }
}

impl KrylovConfig {
    /// Restarted GMRES with subspace dimension `max_l`.
    pub fn restarted(max_l: usize, max_restarts: usize) -> Self {
        Self {
            max_l,
            max_restarts,
            ..Default::default()
        }
    }

    /// Iteration limit of `max_l` without restarts.
    pub fn with_max_l(max_l: usize) -> Self {
        Self {
            max_l,
            ..Default::default()
        }
    }

    pub fn preconditioned(mut self, side: PrecSide) -> Self {
        self.prec_side = side;
        self
    }

    pub fn classical_gs(mut self) -> Self {
        self.gram_schmidt = GramSchmidt::Classical;
        self
    }

    /// `max_l` with zero replaced by the default.
    pub fn effective_max_l(&self) -> usize {
        if self.max_l == 0 {
            DEFAULT_MAX_L
        } else {
            self.max_l
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimension_falls_back_to_default() {
        assert_eq!(KrylovConfig::with_max_l(0).effective_max_l(), DEFAULT_MAX_L);
        assert_eq!(KrylovConfig::restarted(30, 2).effective_max_l(), 30);
    }

    #[test]
    fn defaults_are_unpreconditioned_modified_gs() {
        assert_eq!(PrecSide::default(), PrecSide::None);
        assert_eq!(GramSchmidt::default(), GramSchmidt::Modified);
        let cfg = KrylovConfig::default();
        assert_eq!(cfg.prec_side, PrecSide::None);
        assert_eq!(cfg.gram_schmidt, GramSchmidt::Modified);
        assert!(!cfg.prec_side.left());
    }

    #[test]
    fn builder_methods_compose() {
        let cfg = KrylovConfig::restarted(10, 1)
            .preconditioned(PrecSide::Left)
            .classical_gs();
        assert_eq!(cfg.max_restarts, 1);
        assert_eq!(cfg.gram_schmidt, GramSchmidt::Classical);
        assert_eq!(cfg.prec_side, PrecSide::Left);
    }
}

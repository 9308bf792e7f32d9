//! Callback types the integrator hands to the interface.
//!
//! User data is whatever the closures capture. Every callback reports
//! failure through [`CallbackError`], recoverable or not.

use std::marker::PhantomData;

use crate::Real;
use crate::error::{CallbackError, CallbackResult};
use crate::linsol::PrecSide;
use crate::matrix::SunMatrix;
use crate::nvector::NVector;

/// Integrator state at the point where the linear system is formed.
///
/// Borrowed for the duration of one interface call; the interface never
/// keeps it.
#[derive(Debug)]
pub struct SystemState<'s, V> {
    pub t: Real,
    pub y: &'s V,
    /// `f(t, y)` for ODEs, `F(t, y, y')` for DAEs, `F(u)` for root finding.
    pub fy: &'s V,
    /// `y'` for DAEs.
    pub yp: Option<&'s V>,
    /// Error weights.
    pub weight: &'s V,
    /// Coefficient of the Jacobian term (`cj` for DAEs).
    pub gamma: Real,
    /// Current step size.
    pub h: Real,
}

impl<V> Clone for SystemState<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for SystemState<'_, V> {}

impl<'s, V: NVector> SystemState<'s, V> {
    pub fn new(t: Real, y: &'s V, fy: &'s V, weight: &'s V) -> Self {
        Self {
            t,
            y,
            fy,
            yp: None,
            weight,
            gamma: 1.0,
            h: 1.0,
        }
    }

    pub fn with_gamma(mut self, gamma: Real) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_step(mut self, h: Real) -> Self {
        self.h = h;
        self
    }

    pub fn with_derivative(mut self, yp: &'s V) -> Self {
        self.yp = Some(yp);
        self
    }
}

/// Scratch vectors lent to Jacobian callbacks.
#[derive(Debug, Clone)]
pub struct Scratch<V> {
    pub tmp1: V,
    pub tmp2: V,
    pub tmp3: V,
}

impl<V: NVector> Scratch<V> {
    pub fn new(template: &V) -> Self {
        Self {
            tmp1: template.clone_empty(),
            tmp2: template.clone_empty(),
            tmp3: template.clone_empty(),
        }
    }
}

/// `ydot = f(t, y)`
pub type RhsFn<'a, V> = Box<dyn FnMut(Real, &V, &mut V) -> CallbackResult + 'a>;

/// Fills the matrix with the Jacobian at the given state.
pub type JacFn<'a, V> =
    Box<dyn FnMut(&SystemState<'_, V>, &mut dyn SunMatrix, &mut Scratch<V>) -> CallbackResult + 'a>;

/// Prepares data for [`JacTimesFn`] at a new state.
pub type JacTimesSetupFn<'a, V> = Box<dyn FnMut(&SystemState<'_, V>) -> CallbackResult + 'a>;

/// `jv = J v`, with one scratch vector.
pub type JacTimesFn<'a, V> =
    Box<dyn FnMut(&V, &mut V, &SystemState<'_, V>, &mut V) -> CallbackResult + 'a>;

/// Where the interface gets Jacobian matrices from.
pub enum JacobianSource<'a, V> {
    Analytic(JacFn<'a, V>),
    /// Column-wise difference quotients of the right-hand side. Dense and
    /// band matrices only.
    DifferenceQuotient,
}

impl<V> std::fmt::Debug for JacobianSource<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JacobianSource::Analytic(_) => f.write_str("Analytic"),
            JacobianSource::DifferenceQuotient => f.write_str("DifferenceQuotient"),
        }
    }
}

/// Where matrix-free solvers get `J v` from.
pub enum JacTimesSource<'a, V> {
    Analytic {
        setup: Option<JacTimesSetupFn<'a, V>>,
        times: JacTimesFn<'a, V>,
    },
    DifferenceQuotient,
}

impl<V> std::fmt::Debug for JacTimesSource<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JacTimesSource::Analytic { setup, .. } => f
                .debug_struct("Analytic")
                .field("has_setup", &setup.is_some())
                .finish(),
            JacTimesSource::DifferenceQuotient => f.write_str("DifferenceQuotient"),
        }
    }
}

/// Preconditioner attached to the interface, used by iterative solvers.
pub trait Preconditioner<V: NVector> {
    /// Prepare `P` for the state. `jok` tells whether saved Jacobian data may
    /// be reused. Returns whether Jacobian data was recomputed.
    fn setup(&mut self, state: &SystemState<'_, V>, jok: bool) -> CallbackResult<bool>;

    /// Solve `P z = r` to tolerance `delta` on the given side.
    fn solve(
        &mut self,
        state: &SystemState<'_, V>,
        r: &V,
        z: &mut V,
        delta: Real,
        side: PrecSide,
    ) -> CallbackResult;
}

/// Preconditioner made of a setup closure and a solve closure.
pub struct FnPreconditioner<V, S, P> {
    setup: S,
    solve: P,
    _vector: PhantomData<fn(&V)>,
}

impl<V, S, P> FnPreconditioner<V, S, P>
where
    V: NVector,
    S: FnMut(&SystemState<'_, V>, bool) -> CallbackResult<bool>,
    P: FnMut(&SystemState<'_, V>, &V, &mut V, Real, PrecSide) -> CallbackResult,
{
    pub fn new(setup: S, solve: P) -> Self {
        Self {
            setup,
            solve,
            _vector: PhantomData,
        }
    }
}

impl<V, S, P> Preconditioner<V> for FnPreconditioner<V, S, P>
where
    V: NVector,
    S: FnMut(&SystemState<'_, V>, bool) -> CallbackResult<bool>,
    P: FnMut(&SystemState<'_, V>, &V, &mut V, Real, PrecSide) -> CallbackResult,
{
    fn setup(&mut self, state: &SystemState<'_, V>, jok: bool) -> CallbackResult<bool> {
        (self.setup)(state, jok)
    }

    fn solve(
        &mut self,
        state: &SystemState<'_, V>,
        r: &V,
        z: &mut V,
        delta: Real,
        side: PrecSide,
    ) -> CallbackResult {
        (self.solve)(state, r, z, delta, side)
    }
}

/// Host view of a vector inside a callback.
pub(crate) fn host<V: NVector>(v: &V) -> CallbackResult<&[Real]> {
    v.as_slice().ok_or_else(CallbackError::unrecoverable)
}

pub(crate) fn host_mut<V: NVector>(v: &mut V) -> CallbackResult<&mut [Real]> {
    v.as_mut_slice().ok_or_else(CallbackError::unrecoverable)
}

//! Newton corrector shared by equilibrium solves, the PALC corrector, the
//! codim-2 trackers and the periodic orbit discretizations.

use crate::error::ContinuationError;
use crate::linalg::LinearSolver;
use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    /// Convergence threshold on `‖F‖`.
    pub tolerance: f64,
    /// Relative update size below which a non-converged iteration is stagnant.
    pub step_tolerance: f64,
    /// Fixed damping factor applied to every update.
    pub damping: f64,
    /// Backtrack the update while the residual does not decrease.
    pub line_search: bool,
    pub max_line_search_steps: usize,
    pub line_search_factor: f64,
    /// Residual growth (relative to the initial residual) treated as divergence.
    pub divergence_factor: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            tolerance: 1e-9,
            step_tolerance: 1e-13,
            damping: 1.0,
            line_search: false,
            max_line_search_steps: 10,
            line_search_factor: 0.5,
            divergence_factor: 1e8,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            bail!(ContinuationError::invalid(
                "max_steps must be greater than zero."
            ));
        }
        if self.damping <= 0.0 || self.damping > 1.0 {
            bail!(ContinuationError::invalid("damping must lie in (0, 1]."));
        }
        if self.tolerance <= 0.0 {
            bail!(ContinuationError::invalid("tolerance must be positive."));
        }
        if self.line_search && !(0.0 < self.line_search_factor && self.line_search_factor < 1.0) {
            bail!(ContinuationError::invalid(
                "line_search_factor must lie in (0, 1)."
            ));
        }
        Ok(())
    }
}

/// A square nonlinear system `G(x) = 0` solved by [`correct`].
pub trait NewtonSystem {
    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>>;
    fn jacobian(&mut self, x: &DVector<f64>) -> Result<DMatrix<f64>>;
}

/// Closure pair adapter for [`NewtonSystem`].
pub struct FnSystem<R, J> {
    residual: R,
    jacobian: J,
}

impl<R, J> FnSystem<R, J>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    J: FnMut(&DVector<f64>) -> Result<DMatrix<f64>>,
{
    pub fn new(residual: R, jacobian: J) -> Self {
        Self { residual, jacobian }
    }
}

impl<R, J> NewtonSystem for FnSystem<R, J>
where
    R: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    J: FnMut(&DVector<f64>) -> Result<DMatrix<f64>>,
{
    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
        (self.residual)(x)
    }

    fn jacobian(&mut self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        (self.jacobian)(x)
    }
}

#[derive(Debug, Clone)]
pub struct NewtonOutcome {
    pub state: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Newton iteration from `x0`.
///
/// Returns the converged state or fails with
/// [`ContinuationError::NonConvergence`] (budget exhausted, stagnation or
/// divergence) or [`ContinuationError::SingularJacobian`] (from the oracle).
/// Never retries on its own.
pub fn correct<S: NewtonSystem + ?Sized>(
    system: &mut S,
    x0: DVector<f64>,
    settings: &NewtonSettings,
    solver: &dyn LinearSolver,
) -> Result<NewtonOutcome> {
    let mut state = x0;
    let mut residual = system.residual(&state)?;
    let mut residual_norm = residual.norm();
    let initial_norm = residual_norm.max(1.0);
    let mut iterations = 0usize;

    loop {
        if !residual_norm.is_finite() {
            bail!(ContinuationError::NonConvergence {
                iterations,
                residual_norm,
            });
        }
        if residual_norm < settings.tolerance {
            return Ok(NewtonOutcome {
                state,
                iterations,
                residual_norm,
            });
        }
        if iterations >= settings.max_steps {
            bail!(ContinuationError::NonConvergence {
                iterations,
                residual_norm,
            });
        }

        let jacobian = system.jacobian(&state)?;
        let delta = solver
            .solve(&jacobian, &(-&residual))
            .with_context(|| format!("Newton iteration {iterations}"))?;

        let mut alpha = settings.damping;
        let mut candidate = &state + &delta * alpha;
        let mut candidate_residual = system.residual(&candidate)?;
        let mut candidate_norm = candidate_residual.norm();
        if settings.line_search {
            let mut backtracks = 0;
            while !(candidate_norm < residual_norm) && backtracks < settings.max_line_search_steps
            {
                alpha *= settings.line_search_factor;
                candidate = &state + &delta * alpha;
                candidate_residual = system.residual(&candidate)?;
                candidate_norm = candidate_residual.norm();
                backtracks += 1;
            }
        }

        iterations += 1;
        trace!(iterations, residual_norm = candidate_norm, alpha, "Newton step");

        let step_norm = delta.norm() * alpha;
        state = candidate;
        residual = candidate_residual;
        residual_norm = candidate_norm;

        if residual_norm > settings.divergence_factor * initial_norm {
            bail!(ContinuationError::NonConvergence {
                iterations,
                residual_norm,
            });
        }
        if residual_norm >= settings.tolerance
            && step_norm <= settings.step_tolerance * (1.0 + state.norm())
        {
            // Update vanished without reaching the tolerance.
            bail!(ContinuationError::NonConvergence {
                iterations,
                residual_norm,
            });
        }
    }
}

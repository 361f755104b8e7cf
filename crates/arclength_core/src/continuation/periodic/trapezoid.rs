//! Trapezoidal finite differences on a uniform time grid.
//!
//! ```text
//! x_{i+1} - x_i - T/(2M) (f(x_i) + f(x_{i+1})) = 0,   i = 0..M, x_M = x_0
//! (1/M) Σ ⟨x_i - x̂_i, f(x̂_i)⟩ = 0
//! ```
//! where `x̂` is the previous accepted orbit.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{
    cycle_diagnostics, cycle_point_data, iterate_period, CycleContext, OrbitGuess,
    OrbitSamples, PeriodicOrbitProblem,
};
use crate::continuation::codim1_curves::TwoParameterProblem;
use crate::continuation::problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate,
};
use crate::continuation::{BifurcationType, BranchType, ContinuationPoint, SpecialPointData};
use crate::error::ContinuationError;
use crate::traits::{SystemKind, VectorField};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapezoidConfig {
    /// Number of time samples `M`.
    pub intervals: usize,
}

impl Default for TrapezoidConfig {
    fn default() -> Self {
        Self { intervals: 40 }
    }
}

pub struct TrapezoidProblem<'a, F> {
    ctx: CycleContext<'a, F>,
    intervals: usize,
    reference: Vec<DVector<f64>>,
    reference_velocity: Vec<DVector<f64>>,
}

impl<F> Clone for TrapezoidProblem<'_, F> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            intervals: self.intervals,
            reference: self.reference.clone(),
            reference_velocity: self.reference_velocity.clone(),
        }
    }
}

impl<'a, F: VectorField> TrapezoidProblem<'a, F> {
    pub(crate) fn new(ctx: CycleContext<'a, F>, config: TrapezoidConfig) -> Result<Self> {
        if config.intervals < 3 {
            bail!(ContinuationError::invalid(
                "Trapezoid discretization needs at least 3 intervals"
            ));
        }
        Ok(Self {
            ctx,
            intervals: config.intervals,
            reference: Vec::new(),
            reference_velocity: Vec::new(),
        })
    }

    fn n(&self) -> usize {
        self.ctx.dim()
    }

    fn period_index(&self) -> usize {
        1 + self.n() * self.intervals
    }

    fn sample<'b>(&self, aug: &'b DVector<f64>, i: usize) -> &'b [f64] {
        let n = self.n();
        let start = 1 + (i % self.intervals) * n;
        &aug.as_slice()[start..start + n]
    }

    fn check(&self, aug: &DVector<f64>) -> Result<f64> {
        if aug.len() != self.period_index() + 1 {
            bail!(ContinuationError::invalid(format!(
                "Trapezoid state has length {}, expected {}",
                aug.len(),
                self.period_index() + 1
            )));
        }
        iterate_period(aug[self.period_index()])
    }

    fn set_reference(&mut self, samples: Vec<DVector<f64>>, param: f64) {
        let params = self.ctx.params_at(param);
        self.reference_velocity = samples
            .iter()
            .map(|x| self.ctx.evaluate(x.as_slice(), &params))
            .collect();
        self.reference = samples;
    }

    fn samples_of(&self, aug: &DVector<f64>) -> Vec<DVector<f64>> {
        (0..self.intervals)
            .map(|i| DVector::from_column_slice(self.sample(aug, i)))
            .collect()
    }
}

impl<F: VectorField> ContinuationProblem for TrapezoidProblem<'_, F> {
    fn dimension(&self) -> usize {
        self.period_index()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let period = self.check(aug_state)?;
        let n = self.n();
        let m = self.intervals;
        let params = self.ctx.params_at(aug_state[0]);
        let h = period / m as f64;
        let velocities: Vec<DVector<f64>> = (0..m)
            .map(|i| self.ctx.evaluate(self.sample(aug_state, i), &params))
            .collect();
        for i in 0..m {
            let next = (i + 1) % m;
            for r in 0..n {
                out[i * n + r] = self.sample(aug_state, next)[r]
                    - self.sample(aug_state, i)[r]
                    - 0.5 * h * (velocities[i][r] + velocities[next][r]);
            }
        }
        let mut phase = 0.0;
        for i in 0..m {
            let x = self.sample(aug_state, i);
            for r in 0..n {
                phase += (x[r] - self.reference[i][r]) * self.reference_velocity[i][r];
            }
        }
        out[m * n] = phase / m as f64;
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let n = self.n();
        let m = self.intervals;
        let params = self.ctx.params_at(aug_state[0]);
        let h = period / m as f64;
        let t_col = self.period_index();

        let mut velocities = Vec::with_capacity(m);
        let mut jacobians = Vec::with_capacity(m);
        let mut sensitivities = Vec::with_capacity(m);
        for i in 0..m {
            let x = self.sample(aug_state, i);
            velocities.push(self.ctx.evaluate(x, &params));
            jacobians.push(self.ctx.jacobian(x, &params));
            sensitivities.push(self.ctx.dp(x, &params));
        }

        let mut jac = DMatrix::zeros(m * n + 1, m * n + 2);
        for i in 0..m {
            let next = (i + 1) % m;
            let row = i * n;
            for r in 0..n {
                jac[(row + r, 0)] = -0.5 * h * (sensitivities[i][r] + sensitivities[next][r]);
                jac[(row + r, t_col)] =
                    -0.5 / m as f64 * (velocities[i][r] + velocities[next][r]);
                jac[(row + r, 1 + i * n + r)] -= 1.0;
                jac[(row + r, 1 + next * n + r)] += 1.0;
                for c in 0..n {
                    jac[(row + r, 1 + i * n + c)] -= 0.5 * h * jacobians[i][(r, c)];
                    jac[(row + r, 1 + next * n + c)] -= 0.5 * h * jacobians[next][(r, c)];
                }
            }
        }
        for i in 0..m {
            for r in 0..n {
                jac[(m * n, 1 + i * n + r)] = self.reference_velocity[i][r] / m as f64;
            }
        }
        Ok(jac)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        let monodromy = self.monodromy(aug_state)?;
        cycle_diagnostics(&monodromy, monitor)
    }

    fn update_after_step(
        &mut self,
        aug_state: &DVector<f64>,
        _tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        let samples = self.samples_of(aug_state);
        self.set_reference(samples, aug_state[0]);
        Ok(StepUpdate::Unchanged)
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        cycle_point_data(self, aug_state, kind, monitor)
    }

    fn branch_type(&self) -> BranchType {
        BranchType::PeriodicOrbit {
            discretization: "trapezoid".to_string(),
        }
    }
}

impl<F: VectorField> TwoParameterProblem for TrapezoidProblem<'_, F> {
    fn secondary_parameter(&self) -> Option<f64> {
        self.ctx.secondary_parameter()
    }

    fn set_secondary_parameter(&mut self, value: f64) {
        self.ctx.set_secondary_parameter(value);
    }

    fn system_kind(&self) -> Option<SystemKind> {
        None
    }
}

impl<F: VectorField> PeriodicOrbitProblem for TrapezoidProblem<'_, F> {
    fn state_dim(&self) -> usize {
        self.n()
    }

    fn period(&self, aug_state: &DVector<f64>) -> f64 {
        aug_state[self.period_index()]
    }

    fn orbit(&self, aug_state: &DVector<f64>) -> OrbitSamples {
        let period = self.period(aug_state);
        OrbitSamples {
            times: (0..self.intervals)
                .map(|i| period * i as f64 / self.intervals as f64)
                .collect(),
            states: (0..self.intervals)
                .map(|i| self.sample(aug_state, i).to_vec())
                .collect(),
        }
    }

    /// Product of the one-step trapezoid propagators
    /// `(I - h/2 J_{i+1})⁻¹ (I + h/2 J_i)`.
    fn monodromy(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let n = self.n();
        let m = self.intervals;
        let params = self.ctx.params_at(aug_state[0]);
        let h = period / m as f64;
        let jacobians: Vec<DMatrix<f64>> = (0..m)
            .map(|i| self.ctx.jacobian(self.sample(aug_state, i), &params))
            .collect();
        let identity = DMatrix::<f64>::identity(n, n);
        let mut monodromy = identity.clone();
        for i in 0..m {
            let next = (i + 1) % m;
            let lhs = &identity - &jacobians[next] * (0.5 * h);
            let rhs = &identity + &jacobians[i] * (0.5 * h);
            let step = lhs.lu().solve(&rhs).ok_or_else(|| {
                ContinuationError::singular("Trapezoid step matrix is singular")
            })?;
            monodromy = step * monodromy;
        }
        Ok(monodromy)
    }

    fn initial_point(&mut self, guess: &OrbitGuess) -> Result<ContinuationPoint> {
        guess.validate(self.n())?;
        let samples: Vec<DVector<f64>> = (0..self.intervals)
            .map(|i| DVector::from_vec(guess.sample(i as f64 / self.intervals as f64)))
            .collect();
        let mut state: Vec<f64> = samples.iter().flat_map(|x| x.iter().copied()).collect();
        state.push(guess.period);
        self.set_reference(samples, guess.param_value);
        Ok(ContinuationPoint::new(state, guess.param_value))
    }

    fn reset_from(&mut self, point: &ContinuationPoint) -> Result<()> {
        let mut aug = DVector::zeros(point.state.len() + 1);
        aug[0] = point.param_value;
        aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
        self.check(&aug)?;
        let samples = self.samples_of(&aug);
        self.set_reference(samples, point.param_value);
        Ok(())
    }
}

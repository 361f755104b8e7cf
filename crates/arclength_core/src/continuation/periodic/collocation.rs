//! Orthogonal collocation at Gauss-Legendre points on an adaptive mesh.
//!
//! On interval `i` of the normalized mesh `0 = τ_0 < ... < τ_M = 1`, with
//! `h_i = T (τ_{i+1} - τ_i)`:
//!
//! ```text
//! Z_is    - x_i - h_i Σ_k a_sk f(Z_ik) = 0      (stages)
//! x_{i+1} - x_i - h_i Σ_k b_k  f(Z_ik) = 0      (continuity, x_M = x_0)
//! ⟨x_0 - anchor, direction⟩ = 0                 (Poincaré plane)
//! ```

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

use super::{
    cycle_diagnostics, cycle_point_data, iterate_period, plane_normal, CycleContext, OrbitGuess,
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
pub struct CollocationConfig {
    pub mesh_intervals: usize,
    /// Number of Gauss points per interval.
    pub degree: usize,
    /// Redistribute the mesh after this many accepted steps (`0` = never).
    pub adapt_mesh_every: usize,
}

impl Default for CollocationConfig {
    fn default() -> Self {
        Self {
            mesh_intervals: 20,
            degree: 4,
            adapt_mesh_every: 5,
        }
    }
}

/// Butcher-style weights of Gauss-Legendre collocation on `[0, 1]`.
#[derive(Debug, Clone)]
struct GaussTableau {
    nodes: Vec<f64>,
    /// `a[s][k] = ∫_0^{c_s} ℓ_k`.
    a: Vec<Vec<f64>>,
    /// `b[k] = ∫_0^1 ℓ_k`.
    b: Vec<f64>,
}

impl GaussTableau {
    fn new(degree: usize) -> Result<Self> {
        if degree == 0 {
            bail!(ContinuationError::invalid(
                "Collocation degree must be at least 1"
            ));
        }
        let nodes = gauss_legendre_nodes(degree);
        let basis = monomial_lagrange_basis(&nodes)?;
        let b = basis.iter().map(|l| integrate_monomials(l, 1.0)).collect();
        let a = nodes
            .iter()
            .map(|&c| basis.iter().map(|l| integrate_monomials(l, c)).collect())
            .collect();
        Ok(Self { nodes, a, b })
    }
}

/// Gauss-Legendre points mapped to `[0, 1]`, ascending.
fn gauss_legendre_nodes(degree: usize) -> Vec<f64> {
    let n = degree;
    let mut nodes = vec![0.0; n];
    for i in 0..n.div_ceil(2) {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        for _ in 0..50 {
            let (p, dp) = legendre(n, x);
            let dx = -p / dp;
            x += dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        nodes[i] = 0.5 * (1.0 - x);
        nodes[n - 1 - i] = 0.5 * (1.0 + x);
    }
    nodes
}

/// `(P_n(x), P_n'(x))` by the three-term recurrence.
fn legendre(n: usize, x: f64) -> (f64, f64) {
    let (mut prev, mut cur) = (1.0, x);
    if n == 0 {
        return (1.0, 0.0);
    }
    for k in 2..=n {
        let k = k as f64;
        let next = ((2.0 * k - 1.0) * x * cur - (k - 1.0) * prev) / k;
        prev = cur;
        cur = next;
    }
    (cur, n as f64 * (x * cur - prev) / (x * x - 1.0))
}

/// Monomial coefficients of the Lagrange polynomials on `nodes`.
fn monomial_lagrange_basis(nodes: &[f64]) -> Result<Vec<Vec<f64>>> {
    let m = nodes.len();
    let vandermonde = DMatrix::from_fn(m, m, |i, j| nodes[i].powi(j as i32));
    let inverse = vandermonde.try_inverse().ok_or_else(|| {
        ContinuationError::singular("Vandermonde matrix of the collocation nodes is singular")
    })?;
    Ok((0..m).map(|k| inverse.column(k).iter().copied().collect()).collect())
}

fn integrate_monomials(coeffs: &[f64], upper: f64) -> f64 {
    coeffs
        .iter()
        .enumerate()
        .map(|(d, c)| c * upper.powi(d as i32 + 1) / (d as f64 + 1.0))
        .sum()
}

/// Lagrange weights of the points `0, c_1, ..., c_m` evaluated at `s`.
fn interval_weights(nodes: &[f64], s: f64) -> Vec<f64> {
    let points: Vec<f64> = std::iter::once(0.0).chain(nodes.iter().copied()).collect();
    (0..points.len())
        .map(|j| {
            points
                .iter()
                .enumerate()
                .filter(|&(k, _)| k != j)
                .map(|(_, &pk)| (s - pk) / (points[j] - pk))
                .product()
        })
        .collect()
}

/// Places `mesh.len() - 1` intervals so each carries the same share of
/// `∫ density`, with `density[i]` constant on interval `i`.
pub(crate) fn equidistribute(mesh: &[f64], density: &[f64]) -> Vec<f64> {
    let intervals = mesh.len() - 1;
    let mut cumulative = vec![0.0; mesh.len()];
    for i in 0..intervals {
        cumulative[i + 1] = cumulative[i] + density[i] * (mesh[i + 1] - mesh[i]);
    }
    let total = cumulative[intervals];
    let mut new_mesh = Vec::with_capacity(mesh.len());
    new_mesh.push(0.0);
    let mut i = 0;
    for k in 1..intervals {
        let target = total * k as f64 / intervals as f64;
        while cumulative[i + 1] < target {
            i += 1;
        }
        let span = cumulative[i + 1] - cumulative[i];
        let frac = if span > 0.0 {
            (target - cumulative[i]) / span
        } else {
            0.0
        };
        new_mesh.push(mesh[i] + frac * (mesh[i + 1] - mesh[i]));
    }
    new_mesh.push(1.0);
    new_mesh
}

pub struct CollocationProblem<'a, F> {
    ctx: CycleContext<'a, F>,
    intervals: usize,
    degree: usize,
    tableau: GaussTableau,
    mesh: Vec<f64>,
    adapt_every: usize,
    steps_since_adapt: usize,
    anchor: DVector<f64>,
    direction: DVector<f64>,
}

impl<F> Clone for CollocationProblem<'_, F> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            intervals: self.intervals,
            degree: self.degree,
            tableau: self.tableau.clone(),
            mesh: self.mesh.clone(),
            adapt_every: self.adapt_every,
            steps_since_adapt: self.steps_since_adapt,
            anchor: self.anchor.clone(),
            direction: self.direction.clone(),
        }
    }
}

impl<'a, F: VectorField> CollocationProblem<'a, F> {
    pub(crate) fn new(ctx: CycleContext<'a, F>, config: CollocationConfig) -> Result<Self> {
        if config.mesh_intervals < 2 {
            bail!(ContinuationError::invalid(
                "Collocation mesh must have at least 2 intervals"
            ));
        }
        let tableau = GaussTableau::new(config.degree)?;
        let n = ctx.dim();
        let m = config.mesh_intervals;
        Ok(Self {
            ctx,
            intervals: m,
            degree: config.degree,
            tableau,
            mesh: (0..=m).map(|i| i as f64 / m as f64).collect(),
            adapt_every: config.adapt_mesh_every,
            steps_since_adapt: 0,
            anchor: DVector::zeros(n),
            direction: DVector::zeros(n),
        })
    }

    pub fn mesh(&self) -> &[f64] {
        &self.mesh
    }

    fn n(&self) -> usize {
        self.ctx.dim()
    }

    fn stage_offset(&self) -> usize {
        1 + self.intervals * self.n()
    }

    fn period_index(&self) -> usize {
        self.stage_offset() + self.intervals * self.degree * self.n()
    }

    fn width(&self, i: usize) -> f64 {
        self.mesh[i + 1] - self.mesh[i]
    }

    fn mesh_col(&self, i: usize) -> usize {
        1 + (i % self.intervals) * self.n()
    }

    fn stage_col(&self, i: usize, s: usize) -> usize {
        self.stage_offset() + (i * self.degree + s) * self.n()
    }

    fn mesh_state<'b>(&self, aug: &'b DVector<f64>, i: usize) -> &'b [f64] {
        let start = self.mesh_col(i);
        &aug.as_slice()[start..start + self.n()]
    }

    fn stage_state<'b>(&self, aug: &'b DVector<f64>, i: usize, s: usize) -> &'b [f64] {
        let start = self.stage_col(i, s);
        &aug.as_slice()[start..start + self.n()]
    }

    fn check(&self, aug: &DVector<f64>) -> Result<f64> {
        if aug.len() != self.period_index() + 1 {
            bail!(ContinuationError::invalid(format!(
                "Collocation state has length {}, expected {}",
                aug.len(),
                self.period_index() + 1
            )));
        }
        iterate_period(aug[self.period_index()])
    }

    fn set_anchor(&mut self, aug: &DVector<f64>) -> Result<()> {
        let x0 = self.mesh_state(aug, 0);
        let params = self.ctx.params_at(aug[0]);
        self.direction = plane_normal(&self.ctx.evaluate(x0, &params))?;
        self.anchor = DVector::from_column_slice(x0);
        Ok(())
    }

    /// Value of the collocation polynomial at normalized time `tau`.
    fn evaluate_at(&self, aug: &DVector<f64>, tau: f64) -> DVector<f64> {
        let tau = tau.rem_euclid(1.0);
        let i = self
            .mesh
            .partition_point(|&t| t <= tau)
            .saturating_sub(1)
            .min(self.intervals - 1);
        let s = (tau - self.mesh[i]) / self.width(i);
        let weights = interval_weights(&self.tableau.nodes, s);
        let mut value = DVector::from_column_slice(self.mesh_state(aug, i)) * weights[0];
        for (k, w) in weights.iter().enumerate().skip(1) {
            value.axpy(*w, &DVector::from_column_slice(self.stage_state(aug, i, k - 1)), 1.0);
        }
        value
    }

    /// Re-expresses the orbit part of `v` on `new_mesh`; the first and last
    /// entries (`p` and `T`) are copied.
    fn interpolate_onto(&self, v: &DVector<f64>, new_mesh: &[f64]) -> DVector<f64> {
        let n = self.n();
        let mut out = DVector::zeros(v.len());
        out[0] = v[0];
        out[self.period_index()] = v[self.period_index()];
        for i in 0..self.intervals {
            let x = self.evaluate_at(v, new_mesh[i]);
            out.rows_mut(self.mesh_col(i), n).copy_from(&x);
            let width = new_mesh[i + 1] - new_mesh[i];
            for (s, &c) in self.tableau.nodes.iter().enumerate() {
                let z = self.evaluate_at(v, new_mesh[i] + c * width);
                out.rows_mut(self.stage_col(i, s), n).copy_from(&z);
            }
        }
        out
    }

    /// Equidistributes `(κ_i + κ̄)^{1/(m+1)}`, `κ_i` the change of `f` across
    /// interval `i` per unit time.
    fn adapted_mesh(&self, aug: &DVector<f64>) -> Option<Vec<f64>> {
        let period = aug[self.period_index()];
        let params = self.ctx.params_at(aug[0]);
        let velocities: Vec<DVector<f64>> = (0..self.intervals)
            .map(|i| self.ctx.evaluate(self.mesh_state(aug, i), &params))
            .collect();
        let curvature: Vec<f64> = (0..self.intervals)
            .map(|i| {
                let next = &velocities[(i + 1) % self.intervals];
                (next - &velocities[i]).norm() / (period * self.width(i))
            })
            .collect();
        let mean = curvature.iter().sum::<f64>() / self.intervals as f64;
        if !(mean > 1e-12) {
            return None;
        }
        let exponent = 1.0 / (self.degree as f64 + 1.0);
        let density: Vec<f64> = curvature.iter().map(|k| (k + mean).powf(exponent)).collect();
        Some(equidistribute(&self.mesh, &density))
    }

    fn stage_jacobians(
        &self,
        aug: &DVector<f64>,
        params: &[f64],
    ) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>, Vec<DVector<f64>>) {
        let count = self.intervals * self.degree;
        let mut values = Vec::with_capacity(count);
        let mut jacobians = Vec::with_capacity(count);
        let mut sensitivities = Vec::with_capacity(count);
        for i in 0..self.intervals {
            for s in 0..self.degree {
                let z = self.stage_state(aug, i, s);
                values.push(self.ctx.evaluate(z, params));
                jacobians.push(self.ctx.jacobian(z, params));
                sensitivities.push(self.ctx.dp(z, params));
            }
        }
        (values, jacobians, sensitivities)
    }
}

impl<F: VectorField> ContinuationProblem for CollocationProblem<'_, F> {
    fn dimension(&self) -> usize {
        self.period_index()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let period = self.check(aug_state)?;
        let (n, m, deg) = (self.n(), self.intervals, self.degree);
        let params = self.ctx.params_at(aug_state[0]);
        let stage_f: Vec<DVector<f64>> = (0..m * deg)
            .map(|idx| {
                self.ctx
                    .evaluate(self.stage_state(aug_state, idx / deg, idx % deg), &params)
            })
            .collect();
        let continuity = m * deg * n;

        for i in 0..m {
            let h = period * self.width(i);
            let x = self.mesh_state(aug_state, i);
            let next = self.mesh_state(aug_state, i + 1);
            for r in 0..n {
                for s in 0..deg {
                    let sum: f64 = (0..deg)
                        .map(|k| self.tableau.a[s][k] * stage_f[i * deg + k][r])
                        .sum();
                    out[(i * deg + s) * n + r] =
                        self.stage_state(aug_state, i, s)[r] - x[r] - h * sum;
                }
                let sum: f64 = (0..deg)
                    .map(|k| self.tableau.b[k] * stage_f[i * deg + k][r])
                    .sum();
                out[continuity + i * n + r] = next[r] - x[r] - h * sum;
            }
        }

        let x0 = self.mesh_state(aug_state, 0);
        out[continuity + m * n] = (0..n)
            .map(|r| (x0[r] - self.anchor[r]) * self.direction[r])
            .sum();
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let (n, m, deg) = (self.n(), self.intervals, self.degree);
        let params = self.ctx.params_at(aug_state[0]);
        let (values, jacobians, sensitivities) = self.stage_jacobians(aug_state, &params);
        let t_col = self.period_index();
        let continuity = m * deg * n;
        let mut jac = DMatrix::zeros(continuity + m * n + 1, t_col + 1);

        for i in 0..m {
            let width = self.width(i);
            let h = period * width;
            for r in 0..n {
                for s in 0..deg {
                    let row = (i * deg + s) * n + r;
                    let mut dp_sum = 0.0;
                    let mut t_sum = 0.0;
                    for k in 0..deg {
                        let idx = i * deg + k;
                        let a = self.tableau.a[s][k];
                        dp_sum += a * sensitivities[idx][r];
                        t_sum += a * values[idx][r];
                        let col = self.stage_col(i, k);
                        for c in 0..n {
                            jac[(row, col + c)] -= h * a * jacobians[idx][(r, c)];
                        }
                    }
                    jac[(row, 0)] = -h * dp_sum;
                    jac[(row, t_col)] = -width * t_sum;
                    jac[(row, self.mesh_col(i) + r)] -= 1.0;
                    jac[(row, self.stage_col(i, s) + r)] += 1.0;
                }

                let row = continuity + i * n + r;
                let mut dp_sum = 0.0;
                let mut t_sum = 0.0;
                for k in 0..deg {
                    let idx = i * deg + k;
                    let b = self.tableau.b[k];
                    dp_sum += b * sensitivities[idx][r];
                    t_sum += b * values[idx][r];
                    let col = self.stage_col(i, k);
                    for c in 0..n {
                        jac[(row, col + c)] -= h * b * jacobians[idx][(r, c)];
                    }
                }
                jac[(row, 0)] = -h * dp_sum;
                jac[(row, t_col)] = -width * t_sum;
                jac[(row, self.mesh_col(i) + r)] -= 1.0;
                jac[(row, self.mesh_col(i + 1) + r)] += 1.0;
            }
        }

        let phase_row = continuity + m * n;
        for r in 0..n {
            jac[(phase_row, 1 + r)] = self.direction[r];
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
        tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        self.steps_since_adapt += 1;
        let due = self.adapt_every > 0 && self.steps_since_adapt >= self.adapt_every;
        let new_mesh = if due { self.adapted_mesh(aug_state) } else { None };
        let Some(new_mesh) = new_mesh else {
            self.set_anchor(aug_state)?;
            return Ok(StepUpdate::Unchanged);
        };
        self.steps_since_adapt = 0;
        let remapped = self.interpolate_onto(aug_state, &new_mesh);
        let mut remapped_tangent = self.interpolate_onto(tangent, &new_mesh);
        let norm = remapped_tangent.norm();
        if norm > 0.0 {
            remapped_tangent /= norm;
        }
        let smallest = new_mesh
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min);
        debug!(
            param = aug_state[0],
            smallest_interval = smallest,
            "Redistributed collocation mesh"
        );
        self.mesh = new_mesh;
        self.set_anchor(&remapped)?;
        Ok(StepUpdate::Remapped {
            aug_state: remapped,
            tangent: remapped_tangent,
        })
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
            discretization: "collocation".to_string(),
        }
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        Some(self.mesh.clone())
    }
}

impl<F: VectorField> TwoParameterProblem for CollocationProblem<'_, F> {
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

impl<F: VectorField> PeriodicOrbitProblem for CollocationProblem<'_, F> {
    fn state_dim(&self) -> usize {
        self.n()
    }

    fn period(&self, aug_state: &DVector<f64>) -> f64 {
        aug_state[self.period_index()]
    }

    fn orbit(&self, aug_state: &DVector<f64>) -> OrbitSamples {
        let period = self.period(aug_state);
        let mut samples = OrbitSamples::default();
        for i in 0..self.intervals {
            samples.times.push(period * self.mesh[i]);
            samples.states.push(self.mesh_state(aug_state, i).to_vec());
            for (s, &c) in self.tableau.nodes.iter().enumerate() {
                samples
                    .times
                    .push(period * (self.mesh[i] + c * self.width(i)));
                samples.states.push(self.stage_state(aug_state, i, s).to_vec());
            }
        }
        samples
    }

    /// Composes the exact linearization of each interval's collocation step:
    /// `Z = S x_i` from the stage block, then `x_{i+1} = (I + h Σ b_k J_k S_k) x_i`.
    fn monodromy(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let (n, deg) = (self.n(), self.degree);
        let params = self.ctx.params_at(aug_state[0]);
        let (_, jacobians, _) = self.stage_jacobians(aug_state, &params);
        let mut monodromy = DMatrix::<f64>::identity(n, n);
        for i in 0..self.intervals {
            let h = period * self.width(i);
            let mut block = DMatrix::<f64>::identity(deg * n, deg * n);
            let mut rhs = DMatrix::zeros(deg * n, n);
            for s in 0..deg {
                for k in 0..deg {
                    let scaled = &jacobians[i * deg + k] * (h * self.tableau.a[s][k]);
                    let mut view = block.view_mut((s * n, k * n), (n, n));
                    view -= scaled;
                }
                rhs.view_mut((s * n, 0), (n, n)).fill_with_identity();
            }
            let stages = block.lu().solve(&rhs).ok_or_else(|| {
                ContinuationError::singular("Collocation stage block is singular")
            })?;
            let mut step = DMatrix::<f64>::identity(n, n);
            for k in 0..deg {
                step += &jacobians[i * deg + k]
                    * stages.view((k * n, 0), (n, n))
                    * (h * self.tableau.b[k]);
            }
            monodromy = step * monodromy;
        }
        Ok(monodromy)
    }

    fn initial_point(&mut self, guess: &OrbitGuess) -> Result<ContinuationPoint> {
        guess.validate(self.n())?;
        let mut aug = DVector::zeros(self.period_index() + 1);
        aug[0] = guess.param_value;
        aug[self.period_index()] = guess.period;
        let n = self.n();
        for i in 0..self.intervals {
            let x = guess.sample(self.mesh[i]);
            aug.rows_mut(self.mesh_col(i), n).copy_from_slice(&x);
            for (s, &c) in self.tableau.nodes.iter().enumerate() {
                let z = guess.sample(self.mesh[i] + c * self.width(i));
                aug.rows_mut(self.stage_col(i, s), n).copy_from_slice(&z);
            }
        }
        self.set_anchor(&aug)?;
        let mut point = ContinuationPoint::new(aug.iter().skip(1).copied().collect(), aug[0]);
        point.mesh = Some(self.mesh.clone());
        Ok(point)
    }

    fn reset_from(&mut self, point: &ContinuationPoint) -> Result<()> {
        if let Some(mesh) = &point.mesh {
            if mesh.len() != self.intervals + 1 {
                bail!(ContinuationError::invalid(format!(
                    "Stored mesh has {} nodes, expected {}",
                    mesh.len(),
                    self.intervals + 1
                )));
            }
            self.mesh = mesh.clone();
        }
        let mut aug = DVector::zeros(point.state.len() + 1);
        aug[0] = point.param_value;
        aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
        self.check(&aug)?;
        self.steps_since_adapt = 0;
        self.set_anchor(&aug)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{continue_periodic_orbit, PeriodicOrbit, PeriodicOrbitFamily};
    use super::*;

    #[test]
    fn gauss_tableau_integrates_polynomials_exactly() {
        let tableau = GaussTableau::new(3).expect("tableau");
        let b_sum: f64 = tableau.b.iter().sum();
        assert!((b_sum - 1.0).abs() < 1e-14);
        // ∫_0^1 t^5 = 1/6 is exact for 3 Gauss points.
        let quad: f64 = tableau
            .nodes
            .iter()
            .zip(&tableau.b)
            .map(|(c, b)| b * c.powi(5))
            .sum();
        assert!((quad - 1.0 / 6.0).abs() < 1e-14);
        for (s, &c) in tableau.nodes.iter().enumerate() {
            let row: f64 = tableau.a[s].iter().sum();
            assert!((row - c).abs() < 1e-14);
        }
        assert!((tableau.nodes[1] - 0.5).abs() < 1e-14);
    }

    #[test]
    fn equidistribution_clusters_where_density_is_high() {
        let mesh: Vec<f64> = (0..=4).map(|i| i as f64 / 4.0).collect();
        let uniform = equidistribute(&mesh, &[1.0; 4]);
        for (a, b) in uniform.iter().zip(&mesh) {
            assert!((a - b).abs() < 1e-14);
        }
        let clustered = equidistribute(&mesh, &[7.0, 1.0, 1.0, 1.0]);
        assert_eq!(clustered.len(), 5);
        // Total 2.5; the first interval carries 1.75 of it.
        assert!((clustered[1] - 0.625 / 7.0).abs() < 1e-12);
        assert!((clustered[2] - 1.25 / 7.0).abs() < 1e-12);
        assert!(clustered.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn interpolation_reproduces_the_collocation_polynomial() {
        let problem = hopf_oscillator();
        let family = PeriodicOrbitFamily::Collocation(CollocationConfig::default());
        let PeriodicOrbit::Collocation(mut colloc) =
            PeriodicOrbit::new(&problem, &family, None).expect("orbit")
        else {
            unreachable!("collocation family");
        };
        let start = colloc.initial_point(&circle_guess(0.25, 200)).expect("start");
        let mut aug = DVector::zeros(start.state.len() + 1);
        aug[0] = 0.25;
        aug.rows_mut(1, start.state.len()).copy_from_slice(&start.state);
        let same = colloc.interpolate_onto(&aug, &colloc.mesh.clone());
        assert!((same - &aug).norm() < 1e-10);
        let x = colloc.evaluate_at(&aug, 0.5);
        assert!((x.norm() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn circles_are_reproduced_with_mesh_adaptation() {
        let problem = hopf_oscillator();
        let family = PeriodicOrbitFamily::Collocation(CollocationConfig {
            mesh_intervals: 16,
            degree: 4,
            adapt_mesh_every: 1,
        });
        let branch = continue_periodic_orbit(
            &problem,
            &family,
            &circle_guess(0.25, 100),
            &settings(),
            true,
        )
        .expect("branch");
        assert!(branch.len() > 3);
        for point in &branch.points {
            let mesh = point.mesh.as_ref().expect("mesh stored with every point");
            assert_eq!(mesh.len(), 17);
            let period = *point.state.last().expect("period");
            assert!((period - 2.0 * PI).abs() < 1e-5);
            let radius = point.param_value.sqrt();
            let mut orbit = PeriodicOrbit::new(&problem, &family, None).expect("orbit");
            orbit.reset_from(point).expect("reset");
            let mut aug = DVector::zeros(point.state.len() + 1);
            aug[0] = point.param_value;
            aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
            for r in radii(&orbit.orbit(&aug)) {
                assert!((r - radius).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn jacobian_matches_finite_differences_on_a_nonuniform_mesh() {
        let problem = hopf_oscillator();
        let family = PeriodicOrbitFamily::Collocation(CollocationConfig {
            mesh_intervals: 5,
            degree: 2,
            adapt_mesh_every: 0,
        });
        let mut orbit = PeriodicOrbit::new(&problem, &family, None).expect("orbit");
        let mut point = orbit.initial_point(&circle_guess(0.3, 50)).expect("start");
        point.mesh = Some(vec![0.0, 0.1, 0.35, 0.5, 0.8, 1.0]);
        orbit.reset_from(&point).expect("reset");
        let mut aug = DVector::zeros(point.state.len() + 1);
        aug[0] = 0.3;
        aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
        aug[4] += 0.02;
        let dim = orbit.dimension();
        let jac = orbit.extended_jacobian(&aug).expect("jacobian");
        for col in 0..=dim {
            let h = 1e-6;
            let mut plus = aug.clone();
            plus[col] += h;
            let mut minus = aug.clone();
            minus[col] -= h;
            let mut rp = DVector::zeros(dim);
            let mut rm = DVector::zeros(dim);
            orbit.residual(&plus, &mut rp).expect("residual");
            orbit.residual(&minus, &mut rm).expect("residual");
            let fd = (rp - rm) / (2.0 * h);
            assert!((fd - jac.column(col)).norm() < 1e-6, "column {col}");
        }
    }
}

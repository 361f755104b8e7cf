//! Multiple shooting over `M` sections of equal duration `T/M`.
//!
//! Unknowns are the section start states; residual rows close each section
//! onto the next, `φ_{T/M}(x_i) - x_{i+1} = 0` with `x_M = x_0`, plus the
//! Poincaré plane `⟨x_0 - anchor, normal⟩ = 0`.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{
    cycle_diagnostics, cycle_point_data, iterate_period, plane_normal, CycleContext, OrbitGuess,
    OrbitSamples, PeriodicOrbitProblem,
};
use crate::continuation::codim1_curves::TwoParameterProblem;
use crate::continuation::problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate,
};
use crate::continuation::util::critical_ns_multiplier;
use crate::continuation::{BifurcationType, BranchType, ContinuationPoint, SpecialPointData};
use crate::error::ContinuationError;
use crate::linalg::complex_null_vector;
use crate::solvers::FlowMap;
use crate::traits::{SystemKind, VectorField};

const PARAM_STEP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShootingConfig {
    pub sections: usize,
    /// Integrator steps per section.
    pub integrator_steps: usize,
    /// Integrate sections on the rayon pool.
    pub parallel: bool,
}

impl Default for ShootingConfig {
    fn default() -> Self {
        Self {
            sections: 8,
            integrator_steps: 50,
            parallel: true,
        }
    }
}

/// One integrated section.
struct Section {
    end: DVector<f64>,
    sensitivity: Option<DMatrix<f64>>,
}

pub struct ShootingProblem<'a, F, Fl> {
    ctx: CycleContext<'a, F>,
    flow: Fl,
    config: ShootingConfig,
    anchor: DVector<f64>,
    normal: DVector<f64>,
}

impl<F, Fl: Clone> Clone for ShootingProblem<'_, F, Fl> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            flow: self.flow.clone(),
            config: self.config.clone(),
            anchor: self.anchor.clone(),
            normal: self.normal.clone(),
        }
    }
}

impl<'a, F: VectorField, Fl: FlowMap> ShootingProblem<'a, F, Fl> {
    pub(crate) fn new(ctx: CycleContext<'a, F>, flow: Fl, config: ShootingConfig) -> Result<Self> {
        if config.sections == 0 {
            bail!(ContinuationError::invalid(
                "Shooting needs at least one section"
            ));
        }
        if flow.dimension() != ctx.dim() {
            bail!(ContinuationError::invalid(format!(
                "Flow dimension {} does not match the system dimension {}",
                flow.dimension(),
                ctx.dim()
            )));
        }
        let n = ctx.dim();
        Ok(Self {
            ctx,
            flow,
            config,
            anchor: DVector::zeros(n),
            normal: DVector::zeros(n),
        })
    }

    fn n(&self) -> usize {
        self.ctx.dim()
    }

    fn period_index(&self) -> usize {
        1 + self.config.sections * self.n()
    }

    fn start<'b>(&self, aug: &'b DVector<f64>, i: usize) -> &'b [f64] {
        let n = self.n();
        let begin = 1 + (i % self.config.sections) * n;
        &aug.as_slice()[begin..begin + n]
    }

    fn check(&self, aug: &DVector<f64>) -> Result<f64> {
        if aug.len() != self.period_index() + 1 {
            bail!(ContinuationError::invalid(format!(
                "Shooting state has length {}, expected {}",
                aug.len(),
                self.period_index() + 1
            )));
        }
        iterate_period(aug[self.period_index()])
    }

    fn set_anchor(&mut self, aug: &DVector<f64>) -> Result<()> {
        let x0 = self.start(aug, 0);
        let params = self.ctx.params_at(aug[0]);
        self.normal = plane_normal(&self.ctx.evaluate(x0, &params))?;
        self.anchor = DVector::from_column_slice(x0);
        Ok(())
    }

    /// Applies `job` to every section index, in section order.
    fn map_sections<T, J>(&self, job: J) -> Result<Vec<T>>
    where
        T: Send,
        J: Fn(usize) -> Result<T> + Sync + Send,
    {
        if self.config.parallel {
            (0..self.config.sections).into_par_iter().map(job).collect()
        } else {
            (0..self.config.sections).map(job).collect()
        }
    }

    fn integrate_sections(
        &self,
        aug: &DVector<f64>,
        params: &[f64],
        duration: f64,
        with_sensitivity: bool,
    ) -> Result<Vec<Section>> {
        let flow = &self.flow;
        self.map_sections(|i| {
            let x = self.start(aug, i);
            if with_sensitivity {
                let (end, phi) = flow.integrate_with_jacobian(x, duration, params)?;
                Ok(Section {
                    end,
                    sensitivity: Some(phi),
                })
            } else {
                Ok(Section {
                    end: flow.integrate(x, duration, params)?,
                    sensitivity: None,
                })
            }
        })
    }

    /// `∂φ_{T/M}(x_i)/∂p` for every section, by central differences.
    fn param_sensitivities(
        &self,
        aug: &DVector<f64>,
        duration: f64,
    ) -> Result<Vec<DVector<f64>>> {
        let p = aug[0];
        let h = PARAM_STEP * (1.0 + p.abs());
        let plus = self.ctx.params_at(p + h);
        let minus = self.ctx.params_at(p - h);
        let flow = &self.flow;
        self.map_sections(|i| {
            let x = self.start(aug, i);
            let forward = flow.integrate(x, duration, &plus)?;
            let backward = flow.integrate(x, duration, &minus)?;
            Ok((forward - backward) / (2.0 * h))
        })
    }

    /// State block of the shooting Jacobian with the closing `-I` block
    /// scaled by `e^{iθ}`. Its null vectors are Floquet vectors for the
    /// multiplier `e^{iθ}` sampled at the section starts.
    pub fn rotated_jacobian(
        &self,
        aug: &DVector<f64>,
        theta: f64,
    ) -> Result<DMatrix<Complex<f64>>> {
        let period = self.check(aug)?;
        let (n, m) = (self.n(), self.config.sections);
        let params = self.ctx.params_at(aug[0]);
        let sections = self.integrate_sections(aug, &params, period / m as f64, true)?;
        let rotation = Complex::from_polar(1.0, theta);
        let mut jac = DMatrix::zeros(m * n, m * n);
        for (i, section) in sections.iter().enumerate() {
            let Some(phi) = &section.sensitivity else {
                continue;
            };
            let next = (i + 1) % m;
            let closing = if next == 0 { rotation } else { Complex::new(1.0, 0.0) };
            for r in 0..n {
                for c in 0..n {
                    jac[(i * n + r, i * n + c)] += Complex::new(phi[(r, c)], 0.0);
                }
                jac[(i * n + r, next * n + r)] -= closing;
            }
        }
        Ok(jac)
    }
}

impl<F: VectorField, Fl: FlowMap> ContinuationProblem for ShootingProblem<'_, F, Fl> {
    fn dimension(&self) -> usize {
        self.period_index()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let period = self.check(aug_state)?;
        let (n, m) = (self.n(), self.config.sections);
        let params = self.ctx.params_at(aug_state[0]);
        let sections = self.integrate_sections(aug_state, &params, period / m as f64, false)?;
        for (i, section) in sections.iter().enumerate() {
            let next = self.start(aug_state, i + 1);
            for r in 0..n {
                out[i * n + r] = section.end[r] - next[r];
            }
        }
        let x0 = self.start(aug_state, 0);
        out[m * n] = (0..n)
            .map(|r| (x0[r] - self.anchor[r]) * self.normal[r])
            .sum();
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let (n, m) = (self.n(), self.config.sections);
        let params = self.ctx.params_at(aug_state[0]);
        let duration = period / m as f64;
        let sections = self.integrate_sections(aug_state, &params, duration, true)?;
        let sensitivities = self.param_sensitivities(aug_state, duration)?;
        let t_col = self.period_index();
        let mut jac = DMatrix::zeros(m * n + 1, t_col + 1);
        for (i, section) in sections.iter().enumerate() {
            let next = (i + 1) % m;
            let velocity = self.ctx.evaluate(section.end.as_slice(), &params);
            if let Some(phi) = &section.sensitivity {
                jac.view_mut((i * n, 1 + i * n), (n, n)).copy_from(phi);
            }
            for r in 0..n {
                jac[(i * n + r, 0)] = sensitivities[i][r];
                jac[(i * n + r, 1 + next * n + r)] -= 1.0;
                jac[(i * n + r, t_col)] = velocity[r] / m as f64;
            }
        }
        for r in 0..n {
            jac[(m * n, 1 + r)] = self.normal[r];
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
        self.set_anchor(aug_state)?;
        Ok(StepUpdate::Unchanged)
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        if kind != BifurcationType::NeimarkSacker {
            return cycle_point_data(self, aug_state, kind, monitor);
        }
        let monodromy = self.monodromy(aug_state)?;
        let multipliers = monitor.eigen.eigenvalues(&monodromy, 0)?;
        let Some(mu) = critical_ns_multiplier(&multipliers, monitor.imag_tolerance) else {
            return Ok(None);
        };
        let rotated = self.rotated_jacobian(aug_state, mu.arg())?;
        let right = complex_null_vector(rotated.clone())?;
        let left = complex_null_vector(rotated.adjoint())?;
        Ok(Some(SpecialPointData {
            right_null: right.iter().copied().collect(),
            left_null: left.iter().copied().collect(),
            normal_form: None,
        }))
    }

    fn branch_type(&self) -> BranchType {
        BranchType::PeriodicOrbit {
            discretization: "shooting".to_string(),
        }
    }
}

impl<F: VectorField, Fl: FlowMap> TwoParameterProblem for ShootingProblem<'_, F, Fl> {
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

impl<F: VectorField, Fl: FlowMap> PeriodicOrbitProblem for ShootingProblem<'_, F, Fl> {
    fn state_dim(&self) -> usize {
        self.n()
    }

    fn period(&self, aug_state: &DVector<f64>) -> f64 {
        aug_state[self.period_index()]
    }

    fn orbit(&self, aug_state: &DVector<f64>) -> OrbitSamples {
        let period = self.period(aug_state);
        let m = self.config.sections;
        OrbitSamples {
            times: (0..m).map(|i| period * i as f64 / m as f64).collect(),
            states: (0..m).map(|i| self.start(aug_state, i).to_vec()).collect(),
        }
    }

    fn monodromy(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let period = self.check(aug_state)?;
        let m = self.config.sections;
        let params = self.ctx.params_at(aug_state[0]);
        let sections = self.integrate_sections(aug_state, &params, period / m as f64, true)?;
        let n = self.n();
        Ok(sections
            .into_iter()
            .filter_map(|s| s.sensitivity)
            .fold(DMatrix::identity(n, n), |acc, phi| phi * acc))
    }

    fn initial_point(&mut self, guess: &OrbitGuess) -> Result<ContinuationPoint> {
        guess.validate(self.n())?;
        let m = self.config.sections;
        let mut state: Vec<f64> = (0..m)
            .flat_map(|i| guess.sample(i as f64 / m as f64))
            .collect();
        state.push(guess.period);
        let point = ContinuationPoint::new(state, guess.param_value);
        self.reset_from(&point)?;
        Ok(point)
    }

    fn reset_from(&mut self, point: &ContinuationPoint) -> Result<()> {
        let mut aug = DVector::zeros(point.state.len() + 1);
        aug[0] = point.param_value;
        aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
        self.check(&aug)?;
        self.set_anchor(&aug)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{continue_periodic_orbit, PeriodicOrbitFamily};
    use super::*;
    use crate::solvers::Rk4Flow;
    use std::f64::consts::PI;

    fn shooting<'a, F: VectorField>(
        problem: &'a crate::problem::BifurcationProblem<F>,
        parallel: bool,
    ) -> ShootingProblem<'a, F, Rk4Flow<&'a F>> {
        let config = ShootingConfig {
            sections: 6,
            integrator_steps: 40,
            parallel,
        };
        let ctx = CycleContext::new(problem, None).expect("context");
        ShootingProblem::new(ctx, Rk4Flow::new(problem.field(), 40), config).expect("shooting")
    }

    fn start_aug<P: PeriodicOrbitProblem>(problem: &mut P, beta: f64) -> DVector<f64> {
        let start = problem.initial_point(&circle_guess(beta, 90)).expect("start");
        let mut aug = DVector::zeros(start.state.len() + 1);
        aug[0] = beta;
        aug.rows_mut(1, start.state.len()).copy_from_slice(&start.state);
        aug
    }

    #[test]
    fn parallel_sections_match_sequential_ones() {
        let problem = hopf_oscillator();
        let mut par = shooting(&problem, true);
        let mut seq = shooting(&problem, false);
        let mut aug = start_aug(&mut par, 0.3);
        start_aug(&mut seq, 0.3);
        aug[3] += 0.01;
        let dim = par.dimension();
        let mut r_par = DVector::zeros(dim);
        let mut r_seq = DVector::zeros(dim);
        par.residual(&aug, &mut r_par).expect("residual");
        seq.residual(&aug, &mut r_seq).expect("residual");
        assert_eq!(r_par, r_seq);
        assert_eq!(
            par.extended_jacobian(&aug).expect("jacobian"),
            seq.extended_jacobian(&aug).expect("jacobian")
        );
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let problem = hopf_oscillator();
        let mut shoot = shooting(&problem, false);
        let mut aug = start_aug(&mut shoot, 0.3);
        aug[2] -= 0.02;
        let dim = shoot.dimension();
        let jac = shoot.extended_jacobian(&aug).expect("jacobian");
        for col in 0..=dim {
            let h = 1e-6;
            let mut plus = aug.clone();
            plus[col] += h;
            let mut minus = aug.clone();
            minus[col] -= h;
            let mut rp = DVector::zeros(dim);
            let mut rm = DVector::zeros(dim);
            shoot.residual(&plus, &mut rp).expect("residual");
            shoot.residual(&minus, &mut rm).expect("residual");
            let fd = (rp - rm) / (2.0 * h);
            assert!((fd - jac.column(col)).norm() < 1e-5, "column {col}");
        }
    }

    #[test]
    fn circles_and_multipliers_are_reproduced() {
        let problem = hopf_oscillator();
        let family = PeriodicOrbitFamily::Shooting(ShootingConfig::default());
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
            let period = *point.state.last().expect("period");
            assert!((period - 2.0 * PI).abs() < 1e-5);
            let radius = point.param_value.sqrt();
            for pair in point.state[..point.state.len() - 1].chunks(2) {
                let r = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
                assert!((r - radius).abs() < 1e-5);
            }
            assert!(point.stable);
            let expected = (-4.0 * PI * point.param_value).exp();
            assert_eq!(point.eigenvalues.len(), 1);
            assert!((point.eigenvalues[0].re - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn trivial_floquet_vector_follows_the_flow() {
        let problem = hopf_oscillator();
        let mut shoot = shooting(&problem, true);
        let aug = start_aug(&mut shoot, 0.25);
        let rotated = shoot.rotated_jacobian(&aug, 0.0).expect("rotated");
        let v = complex_null_vector(rotated).expect("null vector");
        let params = shoot.ctx.params_at(0.25);
        let velocity: Vec<f64> = (0..6)
            .flat_map(|i| {
                let v = shoot.ctx.evaluate(shoot.start(&aug, i), &params);
                v.iter().copied().collect::<Vec<_>>()
            })
            .collect();
        let velocity = DVector::from_vec(velocity).map(|x| Complex::new(x, 0.0));
        let overlap = velocity.dotc(&v).norm() / velocity.norm();
        assert!((overlap - 1.0).abs() < 1e-4);
    }
}

//! Neimark-Sacker curves of map fixed points in two parameters.
//!
//! Unknowns `[p1, p2, x, θ]`. With `J = Df - I` the residual Jacobian,
//! `σ` borders `J + (1 - e^{iθ}) I = Df - e^{iθ} I`.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use std::f64::consts::PI;

use super::{
    complex_sigma_gradient, full_jacobian, inner_aug, lift_update, state_jacobian,
    Codim2Settings, ComplexBorders, TwoParameterProblem,
};
use crate::continuation::equilibrium::EquilibriumProblem;
use crate::continuation::normal_form::critical_eigenvectors;
use crate::continuation::problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate, TestFunctionValues,
};
use crate::continuation::util::{closest_to, critical_ns_multiplier, multiplier_diagnostics};
use crate::continuation::{
    continue_bothside, BifurcationType, BranchType, ContinuationBranch, ContinuationHooks,
    ContinuationPoint, ContinuationSettings, NormalForm, SpecialPoint, SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{to_complex, DenseEigen, EigenSolver, Oracles};
use crate::problem::BifurcationProblem;
use crate::traits::{SystemKind, VectorField};

/// `J + (1 - e^{iθ}) I` for the residual Jacobian `J`.
fn shifted(jac: &DMatrix<f64>, theta: f64) -> DMatrix<Complex<f64>> {
    let shift = Complex::new(1.0, 0.0) - Complex::from_polar(1.0, theta);
    let mut m = to_complex(jac);
    for i in 0..jac.nrows() {
        m[(i, i)] += shift;
    }
    m
}

/// Map Jacobian `Df` from the residual Jacobian `Df - I`.
fn map_jacobian(jac: &DMatrix<f64>) -> DMatrix<f64> {
    let mut df = jac.clone();
    for i in 0..df.nrows() {
        df[(i, i)] += 1.0;
    }
    df
}

#[derive(Clone)]
pub struct NeimarkSackerCurveProblem<P> {
    inner: P,
    borders: ComplexBorders,
    settings: Codim2Settings,
}

impl<P: TwoParameterProblem> NeimarkSackerCurveProblem<P> {
    pub fn new(
        mut inner: P,
        p1: f64,
        state: &[f64],
        theta: f64,
        settings: Codim2Settings,
    ) -> Result<Self> {
        if inner.system_kind() != Some(SystemKind::Map) {
            bail!(ContinuationError::invalid(
                "Neimark-Sacker curves are only defined for fixed points of maps"
            ));
        }
        let n = inner.dimension();
        if state.len() != n {
            bail!(ContinuationError::invalid(format!(
                "Neimark-Sacker state dimension mismatch. Expected {}, got {}.",
                n,
                state.len()
            )));
        }
        let p2 = inner.secondary_parameter().ok_or_else(|| {
            ContinuationError::invalid(
                "Neimark-Sacker curve continuation needs a secondary parameter",
            )
        })?;
        if !(theta > 0.0 && theta < PI) {
            bail!(ContinuationError::invalid(format!(
                "Neimark-Sacker angle must lie in (0, π), got {theta}"
            )));
        }
        let mut aug = DVector::zeros(n + 1);
        aug[0] = p1;
        aug.rows_mut(1, n).copy_from_slice(state);
        let jac = state_jacobian(&mut inner, &aug, p2)?;
        let borders = initial_borders(&jac, theta)?;
        Ok(Self {
            inner,
            borders,
            settings,
        })
    }

    /// Curve start point: `param_value = p1`, `state = [p2, x..., θ]`.
    pub fn initial_point(&self, p1: f64, state: &[f64], theta: f64) -> Result<ContinuationPoint> {
        let p2 = self
            .inner
            .secondary_parameter()
            .ok_or_else(|| ContinuationError::invalid("No secondary parameter selected"))?;
        let mut curve_state = Vec::with_capacity(state.len() + 2);
        curve_state.push(p2);
        curve_state.extend_from_slice(state);
        curve_state.push(theta);
        Ok(ContinuationPoint::new(curve_state, p1))
    }

    fn n(&self) -> usize {
        self.inner.dimension()
    }

    fn split(&self, aug_state: &DVector<f64>) -> (DVector<f64>, f64, f64) {
        let n = self.n();
        let (inner_state, p2) = inner_aug(aug_state, n);
        (inner_state, p2, aug_state[n + 2])
    }

    fn codim2_tests(
        &mut self,
        inner_state: &DVector<f64>,
        jac: &DMatrix<f64>,
        theta: f64,
        multipliers: &[Complex<f64>],
        imag_tol: f64,
    ) -> TestFunctionValues {
        let mut tests = TestFunctionValues::new();
        tests.push(BifurcationType::Resonance1_1, theta);
        tests.push(BifurcationType::Resonance1_2, theta - PI);
        tests.push(BifurcationType::Resonance1_3, theta.cos() + 0.5);
        tests.push(BifurcationType::Resonance1_4, theta.cos());

        let n = jac.nrows();
        tests.push(BifurcationType::FoldNeimarkSacker, jac.determinant());
        let flip = jac + DMatrix::<f64>::identity(n, n) * 2.0;
        tests.push(BifurcationType::FlipNeimarkSacker, flip.determinant());

        let mut rest = multipliers.to_vec();
        for target in [
            Complex::from_polar(1.0, theta),
            Complex::from_polar(1.0, -theta),
        ] {
            if let Some(idx) = closest_to(&rest, target) {
                rest.remove(idx);
            }
        }
        let others = multiplier_diagnostics(rest, imag_tol, BifurcationType::Fold);
        if let Some(ns) = others.test_values.get(BifurcationType::NeimarkSacker) {
            tests.push_with_signature(
                BifurcationType::DoubleNeimarkSacker,
                ns.value,
                ns.signature,
            );
        }

        let df = map_jacobian(jac);
        let d = critical_eigenvectors(&df, Complex::from_polar(1.0, theta)).and_then(|(q, p)| {
            self.inner
                .neimark_sacker_coefficient(inner_state, theta, &q, &p)
        });
        if let Ok(Some(d)) = d {
            tests.push(BifurcationType::Chenciner, d);
        }
        tests
    }
}

fn initial_borders(jac: &DMatrix<f64>, theta: f64) -> Result<ComplexBorders> {
    let (q, p) = critical_eigenvectors(&map_jacobian(jac), Complex::from_polar(1.0, theta))
        .context("Failed to initialize Neimark-Sacker borders")?;
    let p_norm = p.norm();
    Ok(ComplexBorders {
        c: q,
        b: p.unscale(p_norm),
    })
}

impl<P: TwoParameterProblem> ContinuationProblem for NeimarkSackerCurveProblem<P> {
    fn dimension(&self) -> usize {
        self.n() + 2
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let n = self.n();
        if aug_state.len() != n + 3 {
            bail!(ContinuationError::invalid(
                "Augmented state has wrong dimension for Neimark-Sacker curve"
            ));
        }
        let (inner_state, p2, theta) = self.split(aug_state);
        self.inner.set_secondary_parameter(p2);
        let mut f_val = DVector::zeros(n);
        self.inner.residual(&inner_state, &mut f_val)?;
        out.rows_mut(0, n).copy_from(&f_val);

        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let sigma = self.borders.solve(&shifted(&jac, theta))?.sigma;
        out[n] = sigma.re;
        out[n + 1] = sigma.im;
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.n();
        let (inner_state, p2, theta) = self.split(aug_state);
        let full = full_jacobian(&mut self.inner, &inner_state, p2)?;
        let jac = full.columns(2, n).into_owned();
        let solution = self.borders.solve(&shifted(&jac, theta))?;
        let gradient =
            complex_sigma_gradient(&mut self.inner, &inner_state, p2, &solution.q, &solution.psi)?;
        let sigma_theta = Complex::<f64>::i()
            * Complex::<f64>::from_polar(1.0, theta)
            * solution.psi.dotc(&solution.q);

        let mut j_ext = DMatrix::zeros(n + 2, n + 3);
        j_ext.view_mut((0, 0), (n, n + 2)).copy_from(&full);
        for (k, g) in gradient.iter().enumerate() {
            j_ext[(n, k)] = g.re;
            j_ext[(n + 1, k)] = g.im;
        }
        j_ext[(n, n + 2)] = sigma_theta.re;
        j_ext[(n + 1, n + 2)] = sigma_theta.im;
        Ok(j_ext)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        let (inner_state, p2, theta) = self.split(aug_state);
        self.inner.set_secondary_parameter(p2);
        let inner_diag = self.inner.diagnostics(&inner_state, monitor)?;
        let test_values = if self.settings.detect_codim2_bifurcation {
            let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
            self.codim2_tests(
                &inner_state,
                &jac,
                theta,
                &inner_diag.eigenvalues,
                monitor.imag_tolerance,
            )
        } else {
            TestFunctionValues::new()
        };
        Ok(PointDiagnostics {
            test_values,
            eigenvalues: inner_diag.eigenvalues,
            stable: inner_diag.stable,
        })
    }

    fn update_after_step(
        &mut self,
        aug_state: &DVector<f64>,
        tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        let n = self.n();
        let (inner_state, p2, theta) = self.split(aug_state);
        let (inner_tangent, _) = inner_aug(tangent, n);
        self.inner.set_secondary_parameter(p2);
        let update = self.inner.update_after_step(&inner_state, &inner_tangent)?;
        match lift_update(update, aug_state, tangent, n) {
            Some((lifted, lifted_tangent)) => {
                let (new_inner, _) = inner_aug(&lifted, self.n());
                let jac = state_jacobian(&mut self.inner, &new_inner, p2)?;
                self.borders = initial_borders(&jac, theta)?;
                Ok(StepUpdate::Remapped {
                    aug_state: lifted,
                    tangent: lifted_tangent,
                })
            }
            None => {
                if self.settings.update_minaug_every_step {
                    let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
                    self.borders.update(&shifted(&jac, theta))?;
                }
                Ok(StepUpdate::Unchanged)
            }
        }
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        _kind: BifurcationType,
        _monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        let (inner_state, p2, theta) = self.split(aug_state);
        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let critical = Complex::from_polar(1.0, theta);
        let (q, p) = match critical_eigenvectors(&map_jacobian(&jac), critical) {
            Ok(pair) => pair,
            Err(_) => {
                let solution = self.borders.solve(&shifted(&jac, theta))?;
                (solution.q, solution.psi)
            }
        };
        let d = self
            .inner
            .neimark_sacker_coefficient(&inner_state, theta, &q, &p)
            .ok()
            .flatten();
        Ok(Some(SpecialPointData {
            right_null: q.iter().copied().collect(),
            left_null: p.iter().copied().collect(),
            normal_form: d.map(|d| NormalForm::NeimarkSacker { theta, d }),
        }))
    }

    fn branch_type(&self) -> BranchType {
        BranchType::NeimarkSackerCurve
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        self.inner.current_mesh()
    }
}

/// Continues a Neimark-Sacker curve of `inner` in both directions from
/// `(p1, state)` with critical multipliers `e^{±iθ}`.
#[allow(clippy::too_many_arguments)]
pub fn continue_ns_curve_with_problem<P: TwoParameterProblem + Clone>(
    inner: P,
    p1: f64,
    state: &[f64],
    theta: f64,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let curve = NeimarkSackerCurveProblem::new(inner, p1, state, theta, codim2)?;
    let start = curve.initial_point(p1, state, theta)?;
    continue_bothside(&curve, start, settings, oracles, hooks)
}

fn ns_angle<F: VectorField>(
    problem: &BifurcationProblem<F>,
    point: &SpecialPoint,
    imag_tol: f64,
) -> Result<f64> {
    if let Some(SpecialPointData {
        normal_form: Some(NormalForm::NeimarkSacker { theta, .. }),
        ..
    }) = &point.data
    {
        return Ok(theta.abs());
    }
    let df = problem.field_jacobian(&point.state, point.param_value);
    let multipliers = DenseEigen.eigenvalues(&df, 0)?;
    critical_ns_multiplier(&multipliers, imag_tol)
        .map(|mu| mu.arg())
        .ok_or_else(|| {
            ContinuationError::invalid("No complex multiplier pair at the Neimark-Sacker point")
                .into()
        })
}

/// Continues the Neimark-Sacker point `ns` of a map in the lens parameter
/// and the named second parameter. Points store `[p2, x..., θ]`.
pub fn continue_ns_curve<F: VectorField>(
    problem: &BifurcationProblem<F>,
    ns: &SpecialPoint,
    secondary: &str,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
) -> Result<ContinuationBranch> {
    if ns.kind != BifurcationType::NeimarkSacker {
        bail!(ContinuationError::invalid(format!(
            "Expected a Neimark-Sacker point, got {:?}",
            ns.kind
        )));
    }
    let theta = ns_angle(problem, ns, settings.corrector.tolerance)?;
    let inner = EquilibriumProblem::with_secondary(problem, secondary)?;
    continue_ns_curve_with_problem(
        inner,
        ns.param_value,
        &ns.state,
        theta,
        settings,
        codim2,
        Oracles::default(),
        &mut ContinuationHooks::new(),
    )
}

//! Fold curves in two parameters.
//!
//! ```text
//! F(x, p1, p2) = 0
//! σ(x, p1, p2) = 0,   [J  w_b; v_bᵀ 0] [v; σ] = [0; 1]
//! ```
//!
//! The inner problem may be an equilibrium, a fixed point or a discretized
//! periodic orbit; for the latter the curve is a fold of cycles.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::{
    directional_hessian, full_jacobian, inner_aug, lift_update, state_jacobian, Borders,
    Codim2Settings, TwoParameterProblem,
};
use crate::continuation::equilibrium::EquilibriumProblem;
use crate::continuation::problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate, TestFunctionValues,
};
use crate::continuation::util::{closest_to, equilibrium_diagnostics, multiplier_diagnostics};
use crate::continuation::{
    continue_bothside, BifurcationType, BranchType, ContinuationBranch, ContinuationHooks,
    ContinuationPoint, ContinuationSettings, NormalForm, SpecialPoint, SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{bordered_null_vectors, Oracles};
use crate::problem::BifurcationProblem;
use crate::traits::{SystemKind, VectorField};

#[derive(Clone)]
pub struct FoldCurveProblem<P> {
    inner: P,
    borders: Borders,
    settings: Codim2Settings,
}

impl<P: TwoParameterProblem> FoldCurveProblem<P> {
    /// Sets up the curve through the fold `(p1, x)` of `inner`, with the
    /// second parameter at its current value.
    pub fn new(mut inner: P, p1: f64, state: &[f64], settings: Codim2Settings) -> Result<Self> {
        let n = inner.dimension();
        if state.len() != n {
            bail!(ContinuationError::invalid(format!(
                "Fold state dimension mismatch. Expected {}, got {}.",
                n,
                state.len()
            )));
        }
        if inner.secondary_parameter().is_none() {
            bail!(ContinuationError::invalid(
                "Fold curve continuation needs a secondary parameter"
            ));
        }
        let mut aug = DVector::zeros(n + 1);
        aug[0] = p1;
        aug.rows_mut(1, n).copy_from_slice(state);
        let j_ext = inner.extended_jacobian(&aug)?;
        let (v, w) = bordered_null_vectors(&j_ext.columns(1, n).into_owned())
            .context("Failed to initialize fold borders")?;
        Ok(Self {
            inner,
            borders: Borders::new(v, w),
            settings,
        })
    }

    /// Curve start point: `param_value = p1`, `state = [p2, x...]`.
    pub fn initial_point(&self, p1: f64, state: &[f64]) -> Result<ContinuationPoint> {
        let p2 = self
            .inner
            .secondary_parameter()
            .ok_or_else(|| ContinuationError::invalid("No secondary parameter selected"))?;
        let mut curve_state = Vec::with_capacity(state.len() + 1);
        curve_state.push(p2);
        curve_state.extend_from_slice(state);
        Ok(ContinuationPoint::new(curve_state, p1))
    }

    pub fn borders(&self) -> &Borders {
        &self.borders
    }

    fn n(&self) -> usize {
        self.inner.dimension()
    }

    fn codim2_tests(
        &mut self,
        inner_state: &DVector<f64>,
        v: &DVector<f64>,
        w: &DVector<f64>,
        eigenvalues: &[Complex<f64>],
        imag_tol: f64,
    ) -> TestFunctionValues {
        let mut tests = TestFunctionValues::new();
        // Scaled by ⟨w, v⟩ so the test stays finite at Bogdanov-Takens points.
        if let Ok(Some(a)) = self.inner.fold_coefficient(inner_state, v, w) {
            tests.push(BifurcationType::Cusp, a * w.dot(v));
        }
        let wv = w.normalize().dot(&v.normalize());
        match self.inner.system_kind() {
            Some(SystemKind::Flow) => {
                tests.push(BifurcationType::BogdanovTakens, wv);
                let mut rest = eigenvalues.to_vec();
                if let Some(idx) = closest_to(&rest, Complex::new(0.0, 0.0)) {
                    rest.remove(idx);
                }
                let others = equilibrium_diagnostics(rest, imag_tol);
                if let Some(hopf) = others.test_values.get(BifurcationType::Hopf) {
                    tests.push_with_signature(
                        BifurcationType::FoldHopf,
                        hopf.value,
                        hopf.signature,
                    );
                }
            }
            Some(SystemKind::Map) | None => {
                tests.push(BifurcationType::Resonance1_1, wv);
                let mut rest = eigenvalues.to_vec();
                if let Some(idx) = closest_to(&rest, Complex::new(1.0, 0.0)) {
                    rest.remove(idx);
                }
                let others = multiplier_diagnostics(rest, imag_tol, BifurcationType::Fold);
                if let Some(flip) = others.test_values.get(BifurcationType::PeriodDoubling) {
                    tests.push(BifurcationType::FoldFlip, flip.value);
                }
                if let Some(ns) = others.test_values.get(BifurcationType::NeimarkSacker) {
                    tests.push_with_signature(
                        BifurcationType::FoldNeimarkSacker,
                        ns.value,
                        ns.signature,
                    );
                }
            }
        }
        tests
    }
}

impl<P: TwoParameterProblem> ContinuationProblem for FoldCurveProblem<P> {
    fn dimension(&self) -> usize {
        self.n() + 1
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let n = self.n();
        if aug_state.len() != n + 2 {
            bail!(ContinuationError::invalid(
                "Augmented state has wrong dimension for fold curve"
            ));
        }
        let (inner_state, p2) = inner_aug(aug_state, n);
        self.inner.set_secondary_parameter(p2);
        let mut f_val = DVector::zeros(n);
        self.inner.residual(&inner_state, &mut f_val)?;
        out.rows_mut(0, n).copy_from(&f_val);

        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let (_, sigma, _) = self.borders.solve(&jac)?;
        out[n] = sigma;
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.n();
        let (inner_state, p2) = inner_aug(aug_state, n);
        let full = full_jacobian(&mut self.inner, &inner_state, p2)?;
        let jac = full.columns(2, n).into_owned();
        let (v, _, w) = self.borders.solve(&jac)?;
        // σ_z = -wᵀ (∂_z J) v
        let hessian = directional_hessian(&mut self.inner, &inner_state, p2, &v)?;
        let sigma_row = -(w.transpose() * hessian);

        let mut j_ext = DMatrix::zeros(n + 1, n + 2);
        j_ext.view_mut((0, 0), (n, n + 2)).copy_from(&full);
        j_ext.row_mut(n).copy_from(&sigma_row);
        Ok(j_ext)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        let n = self.n();
        let (inner_state, p2) = inner_aug(aug_state, n);
        self.inner.set_secondary_parameter(p2);
        let inner_diag = self.inner.diagnostics(&inner_state, monitor)?;
        let test_values = if self.settings.detect_codim2_bifurcation {
            let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
            let (v, _, w) = self.borders.solve(&jac)?;
            self.codim2_tests(
                &inner_state,
                &v,
                &w,
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
        let (inner_state, p2) = inner_aug(aug_state, n);
        let (inner_tangent, _) = inner_aug(tangent, n);
        self.inner.set_secondary_parameter(p2);
        let update = self.inner.update_after_step(&inner_state, &inner_tangent)?;
        match lift_update(update, aug_state, tangent, n) {
            Some((lifted, lifted_tangent)) => {
                // The discretization changed size; start the borders afresh.
                let (new_inner, _) = inner_aug(&lifted, self.n());
                let jac = state_jacobian(&mut self.inner, &new_inner, p2)?;
                let (v, w) = bordered_null_vectors(&jac)?;
                self.borders = Borders::new(v, w);
                Ok(StepUpdate::Remapped {
                    aug_state: lifted,
                    tangent: lifted_tangent,
                })
            }
            None => {
                if self.settings.update_minaug_every_step {
                    let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
                    self.borders.update(&jac)?;
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
        let n = self.n();
        let (inner_state, p2) = inner_aug(aug_state, n);
        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let (v, _, w) = self.borders.solve(&jac)?;
        let (v, w) = (v.normalize(), w.normalize());
        let mut data = SpecialPointData::real(v.as_slice(), w.as_slice());
        data.normal_form = self
            .inner
            .fold_coefficient(&inner_state, &v, &w)
            .ok()
            .flatten()
            .map(|a| NormalForm::Fold { a });
        Ok(Some(data))
    }

    fn branch_type(&self) -> BranchType {
        BranchType::FoldCurve
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        self.inner.current_mesh()
    }
}

/// Continues a fold curve of `inner` in both directions from `(p1, state)`.
pub fn continue_fold_curve_with_problem<P: TwoParameterProblem + Clone>(
    inner: P,
    p1: f64,
    state: &[f64],
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let curve = FoldCurveProblem::new(inner, p1, state, codim2)?;
    let start = curve.initial_point(p1, state)?;
    continue_bothside(&curve, start, settings, oracles, hooks)
}

/// Continues the equilibrium fold `fold` in the lens parameter and the named
/// second parameter. Points store `[p2, x...]` with `p1` as `param_value`.
pub fn continue_fold_curve<F: VectorField>(
    problem: &BifurcationProblem<F>,
    fold: &SpecialPoint,
    secondary: &str,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
) -> Result<ContinuationBranch> {
    if !matches!(
        fold.kind,
        BifurcationType::Fold | BifurcationType::BranchPoint
    ) {
        bail!(ContinuationError::invalid(format!(
            "Expected a fold point, got {:?}",
            fold.kind
        )));
    }
    let inner = EquilibriumProblem::with_secondary(problem, secondary)?;
    continue_fold_curve_with_problem(
        inner,
        fold.param_value,
        &fold.state,
        settings,
        codim2,
        Oracles::default(),
        &mut ContinuationHooks::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::continue_parameter;
    use crate::problem::ParameterSet;
    use crate::traits::FnVectorField;

    /// `ẋ = β1 + β2 x - x³`: folds on `β1 = -2s³, β2 = 3s²`, cusp at 0.
    fn cusp_problem() -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] + p[1] * x[0] - x[0] * x[0] * x[0];
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("beta1", 2.0), ("beta2", 3.0)]),
            "beta1",
            vec![2.0],
        )
        .expect("problem")
    }

    fn settings() -> ContinuationSettings {
        ContinuationSettings {
            step_size: 0.02,
            max_step_size: 0.05,
            max_steps: 150,
            param_min: Some(-3.0),
            param_max: Some(3.0),
            ..ContinuationSettings::default()
        }
    }

    fn located_fold(problem: &BifurcationProblem<impl VectorField>) -> SpecialPoint {
        first_fold(problem, false)
    }

    fn first_fold(problem: &BifurcationProblem<impl VectorField>, forward: bool) -> SpecialPoint {
        let branch = continue_parameter(problem, &settings(), forward).expect("branch");
        let point = branch
            .special_points_of(BifurcationType::Fold)
            .next()
            .cloned()
            .expect("fold on the equilibrium branch");
        point
    }

    #[test]
    fn fold_curve_starts_at_the_codim1_fold() {
        let problem = cusp_problem();
        let fold = located_fold(&problem);
        assert!((fold.param_value + 2.0).abs() < 1e-6);
        assert!((fold.state[0] - 1.0).abs() < 1e-5);

        let mut s = settings();
        s.max_steps = 3;
        let curve =
            continue_fold_curve(&problem, &fold, "beta2", &s, Codim2Settings::default())
                .expect("curve");
        assert_eq!(curve.branch_type, BranchType::FoldCurve);
        let origin = curve.indices.iter().position(|&i| i == 0).expect("start point");
        let start = &curve.points[origin];
        assert!((start.param_value - fold.param_value).abs() < 1e-8);
        assert!((start.state[0] - 3.0).abs() < 1e-12);
        for point in &curve.points {
            let (b1, b2, x) = (point.param_value, point.state[0], point.state[1]);
            assert!((b1 + b2 * x - x * x * x).abs() < 1e-8);
            assert!((b2 - 3.0 * x * x).abs() < 1e-6);
        }
    }

    #[test]
    fn cusp_is_detected_where_the_fold_coefficient_vanishes() {
        let problem = cusp_problem();
        let fold = located_fold(&problem);
        let mut s = settings();
        s.max_step_size = 0.1;
        s.max_steps = 300;
        let curve = continue_fold_curve(&problem, &fold, "beta2", &s, Codim2Settings::default())
            .expect("curve");
        let cusps: Vec<_> = curve.special_points_of(BifurcationType::Cusp).collect();
        assert_eq!(cusps.len(), 1);
        let cusp = cusps[0];
        assert!(cusp.param_value.abs() < 1e-5);
        assert!(cusp.state[0].abs() < 1e-4);
        assert!(cusp.state[1].abs() < 1e-3);
        assert!(curve
            .special_points_of(BifurcationType::BogdanovTakens)
            .next()
            .is_none());
    }

    #[test]
    fn frozen_borders_trace_the_same_curve() {
        let problem = cusp_problem();
        let fold = located_fold(&problem);
        let mut s = settings();
        s.max_steps = 10;
        let frozen = Codim2Settings {
            update_minaug_every_step: false,
            detect_codim2_bifurcation: false,
        };
        let curve = continue_fold_curve(&problem, &fold, "beta2", &s, frozen).expect("curve");
        assert!(curve.special_points.is_empty());
        for point in &curve.points {
            let (b2, x) = (point.state[0], point.state[1]);
            assert!((b2 - 3.0 * x * x).abs() < 1e-6);
        }
    }

    /// `ẋ = y`, `ẏ = b1 + b2 y + x² + xy`: folds along `b1 = 0` with
    /// `⟨w, v⟩` changing sign at the Bogdanov-Takens point `b2 = 0`.
    fn bogdanov_takens_problem() -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(2, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = x[1];
            out[1] = p[0] + p[1] * x[1] + x[0] * x[0] + x[0] * x[1];
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("b1", -0.25), ("b2", -0.5)]),
            "b1",
            vec![-0.5, 0.0],
        )
        .expect("problem")
    }

    #[test]
    fn bogdanov_takens_on_the_fold_curve() {
        let problem = bogdanov_takens_problem();
        let fold = first_fold(&problem, true);
        assert!(fold.param_value.abs() < 1e-6);
        assert!(fold.state[0].abs() < 1e-4);

        let mut s = settings();
        s.max_steps = 40;
        let curve = continue_fold_curve(&problem, &fold, "b2", &s, Codim2Settings::default())
            .expect("curve");
        let bt: Vec<_> = curve
            .special_points_of(BifurcationType::BogdanovTakens)
            .collect();
        assert_eq!(bt.len(), 1);
        assert!(bt[0].param_value.abs() < 1e-6, "b1 = {}", bt[0].param_value);
        assert!(bt[0].state[0].abs() < 1e-5, "b2 = {}", bt[0].state[0]);
        assert!(bt[0].state[1].abs() < 1e-6, "x = {}", bt[0].state[1]);
        // The quadratic coefficient stays away from zero through the point.
        assert!(curve
            .special_points_of(BifurcationType::Cusp)
            .next()
            .is_none());
        for point in &curve.points {
            assert!(point.param_value.abs() < 1e-7);
            assert!(point.state[1].abs() < 1e-6);
        }
    }

    /// `ż = β1 + z²` next to a cubic oscillator with real part `β2 + z`:
    /// folds along `β1 = 0`, and the pair `β2 ± i` crosses the axis at the
    /// zero-Hopf point `β2 = 0`.
    fn zero_hopf_problem() -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(3, |x: &[f64], p: &[f64], out: &mut [f64]| {
            let (z, u, v) = (x[0], x[1], x[2]);
            let r2 = u * u + v * v;
            out[0] = p[0] + z * z;
            out[1] = (p[1] + z) * u - v - u * r2;
            out[2] = u + (p[1] + z) * v - v * r2;
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("beta1", -0.25), ("beta2", -0.5)]),
            "beta1",
            vec![-0.5, 0.0, 0.0],
        )
        .expect("problem")
    }

    #[test]
    fn zero_hopf_on_the_fold_curve() {
        let problem = zero_hopf_problem();
        let fold = first_fold(&problem, true);
        assert!(fold.param_value.abs() < 1e-6);

        let mut s = settings();
        s.max_steps = 40;
        let curve = continue_fold_curve(&problem, &fold, "beta2", &s, Codim2Settings::default())
            .expect("curve");
        let zh: Vec<_> = curve.special_points_of(BifurcationType::FoldHopf).collect();
        assert_eq!(zh.len(), 1);
        assert!(zh[0].param_value.abs() < 1e-6, "β1 = {}", zh[0].param_value);
        assert!(zh[0].state[0].abs() < 1e-5, "β2 = {}", zh[0].state[0]);
        assert!(zh[0].state[1].abs() < 1e-4, "z = {}", zh[0].state[1]);
        assert!(curve
            .special_points_of(BifurcationType::BogdanovTakens)
            .next()
            .is_none());
        assert!(curve
            .special_points_of(BifurcationType::Cusp)
            .next()
            .is_none());
    }

    #[test]
    fn rejects_non_fold_points() {
        let problem = cusp_problem();
        let mut fold = located_fold(&problem);
        fold.kind = BifurcationType::Hopf;
        assert!(continue_fold_curve(
            &problem,
            &fold,
            "beta2",
            &settings(),
            Codim2Settings::default()
        )
        .is_err());
    }
}

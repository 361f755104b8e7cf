//! Hopf curves of equilibria in two parameters.
//!
//! Unknowns `[p1, p2, x, ω]` with residual `[F; Re σ; Im σ]`, where `σ`
//! borders `J - iωI`. At a Bogdanov-Takens point `ω` reaches zero and the
//! system continues onto the mirror solution `-ω`, which retraces the same
//! Hopf points, so a curve ends at its first Bogdanov-Takens point.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::{
    complex_sigma_gradient, full_jacobian, inner_aug, lift_update, state_jacobian,
    Codim2Settings, ComplexBorders, TwoParameterProblem,
};
use crate::continuation::equilibrium::EquilibriumProblem;
use crate::continuation::normal_form::critical_eigenvectors;
use crate::continuation::problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate, TestFunctionValues,
};
use crate::continuation::util::{closest_to, critical_hopf_eigenvalue, equilibrium_diagnostics};
use crate::continuation::{
    continue_bothside, BifurcationType, BranchType, ContinuationBranch, ContinuationHooks,
    ContinuationPoint, ContinuationSettings, NormalForm, SpecialPoint, SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{to_complex, EigenSolver, DenseEigen, Oracles};
use crate::problem::BifurcationProblem;
use crate::traits::{SystemKind, VectorField};

fn shifted(jac: &DMatrix<f64>, omega: f64) -> DMatrix<Complex<f64>> {
    let mut m = to_complex(jac);
    for i in 0..jac.nrows() {
        m[(i, i)] -= Complex::new(0.0, omega);
    }
    m
}

#[derive(Clone)]
pub struct HopfCurveProblem<P> {
    inner: P,
    borders: ComplexBorders,
    settings: Codim2Settings,
}

impl<P: TwoParameterProblem> HopfCurveProblem<P> {
    pub fn new(
        mut inner: P,
        p1: f64,
        state: &[f64],
        omega: f64,
        settings: Codim2Settings,
    ) -> Result<Self> {
        if inner.system_kind() != Some(SystemKind::Flow) {
            bail!(ContinuationError::invalid(
                "Hopf curves are only defined for equilibria of flows"
            ));
        }
        let n = inner.dimension();
        if state.len() != n {
            bail!(ContinuationError::invalid(format!(
                "Hopf state dimension mismatch. Expected {}, got {}.",
                n,
                state.len()
            )));
        }
        let p2 = inner.secondary_parameter().ok_or_else(|| {
            ContinuationError::invalid("Hopf curve continuation needs a secondary parameter")
        })?;
        if !(omega.is_finite() && omega > 0.0) {
            bail!(ContinuationError::invalid(format!(
                "Hopf frequency must be positive, got {omega}"
            )));
        }
        let mut aug = DVector::zeros(n + 1);
        aug[0] = p1;
        aug.rows_mut(1, n).copy_from_slice(state);
        let jac = state_jacobian(&mut inner, &aug, p2)?;
        let borders = initial_borders(&jac, omega)?;
        Ok(Self {
            inner,
            borders,
            settings,
        })
    }

    /// Curve start point: `param_value = p1`, `state = [p2, x..., ω]`.
    pub fn initial_point(&self, p1: f64, state: &[f64], omega: f64) -> Result<ContinuationPoint> {
        let p2 = self
            .inner
            .secondary_parameter()
            .ok_or_else(|| ContinuationError::invalid("No secondary parameter selected"))?;
        let mut curve_state = Vec::with_capacity(state.len() + 2);
        curve_state.push(p2);
        curve_state.extend_from_slice(state);
        curve_state.push(omega);
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
        omega: f64,
        eigenvalues: &[Complex<f64>],
        imag_tol: f64,
    ) -> TestFunctionValues {
        let mut tests = TestFunctionValues::new();
        tests.push(BifurcationType::BogdanovTakens, omega);
        tests.push(BifurcationType::FoldHopf, jac.determinant());

        let mut rest = eigenvalues.to_vec();
        for target in [Complex::new(0.0, omega), Complex::new(0.0, -omega)] {
            if let Some(idx) = closest_to(&rest, target) {
                rest.remove(idx);
            }
        }
        let others = equilibrium_diagnostics(rest, imag_tol);
        if let Some(hopf) = others.test_values.get(BifurcationType::Hopf) {
            tests.push_with_signature(BifurcationType::HopfHopf, hopf.value, hopf.signature);
        }

        if omega > imag_tol {
            let l1 = critical_eigenvectors(jac, Complex::new(0.0, omega))
                .and_then(|(q, p)| self.inner.first_lyapunov(inner_state, omega, &q, &p));
            if let Ok(Some(l1)) = l1 {
                tests.push(BifurcationType::Bautin, l1);
            }
        }
        tests
    }
}

/// Borders from the critical eigenvectors at `iω`.
fn initial_borders(jac: &DMatrix<f64>, omega: f64) -> Result<ComplexBorders> {
    let (q, p) = critical_eigenvectors(jac, Complex::new(0.0, omega))
        .context("Failed to initialize Hopf borders")?;
    let p_norm = p.norm();
    Ok(ComplexBorders {
        c: q,
        b: p.unscale(p_norm),
    })
}

impl<P: TwoParameterProblem> ContinuationProblem for HopfCurveProblem<P> {
    fn dimension(&self) -> usize {
        self.n() + 2
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let n = self.n();
        if aug_state.len() != n + 3 {
            bail!(ContinuationError::invalid(
                "Augmented state has wrong dimension for Hopf curve"
            ));
        }
        let (inner_state, p2, omega) = self.split(aug_state);
        self.inner.set_secondary_parameter(p2);
        let mut f_val = DVector::zeros(n);
        self.inner.residual(&inner_state, &mut f_val)?;
        out.rows_mut(0, n).copy_from(&f_val);

        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let sigma = self.borders.solve(&shifted(&jac, omega))?.sigma;
        out[n] = sigma.re;
        out[n + 1] = sigma.im;
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        let n = self.n();
        let (inner_state, p2, omega) = self.split(aug_state);
        let full = full_jacobian(&mut self.inner, &inner_state, p2)?;
        let jac = full.columns(2, n).into_owned();
        let solution = self.borders.solve(&shifted(&jac, omega))?;
        let gradient =
            complex_sigma_gradient(&mut self.inner, &inner_state, p2, &solution.q, &solution.psi)?;
        let sigma_omega = Complex::<f64>::i() * solution.psi.dotc(&solution.q);

        let mut j_ext = DMatrix::zeros(n + 2, n + 3);
        j_ext.view_mut((0, 0), (n, n + 2)).copy_from(&full);
        for (k, g) in gradient.iter().enumerate() {
            j_ext[(n, k)] = g.re;
            j_ext[(n + 1, k)] = g.im;
        }
        j_ext[(n, n + 2)] = sigma_omega.re;
        j_ext[(n + 1, n + 2)] = sigma_omega.im;
        Ok(j_ext)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        let (inner_state, p2, omega) = self.split(aug_state);
        self.inner.set_secondary_parameter(p2);
        let inner_diag = self.inner.diagnostics(&inner_state, monitor)?;
        let test_values = if self.settings.detect_codim2_bifurcation {
            let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
            self.codim2_tests(
                &inner_state,
                &jac,
                omega,
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
        let (inner_state, p2, omega) = self.split(aug_state);
        let (inner_tangent, _) = inner_aug(tangent, n);
        self.inner.set_secondary_parameter(p2);
        let update = self.inner.update_after_step(&inner_state, &inner_tangent)?;
        match lift_update(update, aug_state, tangent, n) {
            Some((lifted, lifted_tangent)) => {
                let (new_inner, _) = inner_aug(&lifted, self.n());
                let jac = state_jacobian(&mut self.inner, &new_inner, p2)?;
                self.borders = initial_borders(&jac, omega.abs())?;
                Ok(StepUpdate::Remapped {
                    aug_state: lifted,
                    tangent: lifted_tangent,
                })
            }
            None => {
                if self.settings.update_minaug_every_step {
                    let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
                    self.borders.update(&shifted(&jac, omega))?;
                }
                Ok(StepUpdate::Unchanged)
            }
        }
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        let (inner_state, p2, omega) = self.split(aug_state);
        let jac = state_jacobian(&mut self.inner, &inner_state, p2)?;
        let (q, p) = match critical_eigenvectors(&jac, Complex::new(0.0, omega.abs())) {
            Ok(pair) => pair,
            Err(_) => {
                let solution = self.borders.solve(&shifted(&jac, omega))?;
                (solution.q, solution.psi)
            }
        };
        // No Hopf normal form once the pair has merged on the real axis.
        let l1 = if kind == BifurcationType::BogdanovTakens
            || omega.abs() <= monitor.imag_tolerance
        {
            None
        } else {
            self.inner
                .first_lyapunov(&inner_state, omega.abs(), &q, &p)
                .ok()
                .flatten()
        };
        Ok(Some(SpecialPointData {
            right_null: q.iter().copied().collect(),
            left_null: p.iter().copied().collect(),
            normal_form: l1.map(|l1| NormalForm::Hopf { omega, l1 }),
        }))
    }

    fn branch_type(&self) -> BranchType {
        BranchType::HopfCurve
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        self.inner.current_mesh()
    }

    fn ends_at(&self, kind: BifurcationType) -> bool {
        kind == BifurcationType::BogdanovTakens
    }
}

/// Continues a Hopf curve of `inner` in both directions from `(p1, state)`
/// with frequency `omega`.
#[allow(clippy::too_many_arguments)]
pub fn continue_hopf_curve_with_problem<P: TwoParameterProblem + Clone>(
    inner: P,
    p1: f64,
    state: &[f64],
    omega: f64,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let curve = HopfCurveProblem::new(inner, p1, state, omega, codim2)?;
    let start = curve.initial_point(p1, state, omega)?;
    continue_bothside(&curve, start, settings, oracles, hooks)
}

/// Frequency of a located Hopf point: taken from its normal form when one
/// was computed, otherwise from the eigenvalue closest to the imaginary axis.
pub(crate) fn hopf_frequency<F: VectorField>(
    problem: &BifurcationProblem<F>,
    hopf: &SpecialPoint,
    imag_tol: f64,
) -> Result<f64> {
    if let Some(SpecialPointData {
        normal_form: Some(NormalForm::Hopf { omega, .. }),
        ..
    }) = &hopf.data
    {
        return Ok(omega.abs());
    }
    let jac = problem.jacobian(&hopf.state, hopf.param_value);
    let eigenvalues = DenseEigen.eigenvalues(&jac, 0)?;
    critical_hopf_eigenvalue(&eigenvalues, imag_tol)
        .map(|lambda| lambda.im)
        .ok_or_else(|| {
            ContinuationError::invalid("No complex pair found at the Hopf point").into()
        })
}

/// Continues the equilibrium Hopf point `hopf` in the lens parameter and the
/// named second parameter. Points store `[p2, x..., ω]`.
pub fn continue_hopf_curve<F: VectorField>(
    problem: &BifurcationProblem<F>,
    hopf: &SpecialPoint,
    secondary: &str,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
) -> Result<ContinuationBranch> {
    if hopf.kind != BifurcationType::Hopf {
        bail!(ContinuationError::invalid(format!(
            "Expected a Hopf point, got {:?}",
            hopf.kind
        )));
    }
    let omega = hopf_frequency(problem, hopf, settings.corrector.tolerance)?;
    let inner = EquilibriumProblem::with_secondary(problem, secondary)?;
    continue_hopf_curve_with_problem(
        inner,
        hopf.param_value,
        &hopf.state,
        omega,
        settings,
        codim2,
        Oracles::default(),
        &mut ContinuationHooks::new(),
    )
}

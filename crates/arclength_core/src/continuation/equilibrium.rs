//! Equilibria of flows and fixed points of maps as a continuation problem.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::codim1_curves::TwoParameterProblem;
use super::normal_form::{
    critical_eigenvectors, first_lyapunov_coefficient, fold_coefficient,
    neimark_sacker_coefficient, MultilinearForms,
};
use super::problem::{ContinuationProblem, PointDiagnostics, SpectralMonitor};
use super::util::{
    aug_to_parts, critical_hopf_eigenvalue, critical_ns_multiplier, equilibrium_diagnostics,
    multiplier_diagnostics,
};
use super::{
    continue_bothside, continue_with_problem, extend_branch_with_problem, BifurcationType,
    ContinuationBranch, ContinuationHooks, ContinuationPoint, ContinuationSettings, NormalForm,
    SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{bordered_null_vectors, Oracles};
use crate::newton::{correct, FnSystem, NewtonSettings};
use crate::problem::BifurcationProblem;
use crate::traits::{SystemKind, VectorField};

/// `F(x, p) = f(x, p)` (flows) or `f(x, p) - x` (maps) in the augmented
/// layout `[p, x...]`.
pub struct EquilibriumProblem<'a, F> {
    problem: &'a BifurcationProblem<F>,
    params: Vec<f64>,
    secondary: Option<usize>,
}

impl<F> Clone for EquilibriumProblem<'_, F> {
    fn clone(&self) -> Self {
        Self {
            problem: self.problem,
            params: self.params.clone(),
            secondary: self.secondary,
        }
    }
}

impl<'a, F: VectorField> EquilibriumProblem<'a, F> {
    pub fn new(problem: &'a BifurcationProblem<F>) -> Self {
        Self {
            problem,
            params: problem.params().values.clone(),
            secondary: None,
        }
    }

    /// Also exposes the named parameter as the second curve parameter.
    pub fn with_secondary(problem: &'a BifurcationProblem<F>, name: &str) -> Result<Self> {
        let index = problem.params().lens(name)?.index;
        if index == problem.lens().index {
            bail!(ContinuationError::invalid(format!(
                "Secondary parameter '{name}' is already the continuation parameter"
            )));
        }
        Ok(Self {
            secondary: Some(index),
            ..Self::new(problem)
        })
    }

    pub fn problem(&self) -> &BifurcationProblem<F> {
        self.problem
    }

    fn params_at(&self, p: f64) -> Vec<f64> {
        let mut values = self.params.clone();
        values[self.problem.lens().index] = p;
        values
    }

    /// Jacobian of `f` itself: the matrix whose spectrum is monitored.
    fn field_jacobian(&self, x: &[f64], params: &[f64]) -> DMatrix<f64> {
        self.problem.field().jacobian(x, params)
    }

    fn check_state(&self, aug: &DVector<f64>) -> Result<()> {
        if aug.len() != self.problem.dimension() + 1 {
            bail!(ContinuationError::invalid(format!(
                "Augmented state has length {}, expected {}",
                aug.len(),
                self.problem.dimension() + 1
            )));
        }
        Ok(())
    }

    fn fold_data(&self, x: &[f64], params: &[f64], shift: f64) -> Result<SpecialPointData> {
        let mut jac = self.problem.jacobian_with(x, params);
        for i in 0..x.len() {
            jac[(i, i)] += shift;
        }
        let (v, w) = bordered_null_vectors(&jac)?;
        let mut data = SpecialPointData::real(v.as_slice(), w.as_slice());
        if shift == 0.0 {
            let forms = MultilinearForms::new(self.problem.field(), x, params);
            data.normal_form = fold_coefficient(&forms, &v, &w)
                .ok()
                .map(|a| NormalForm::Fold { a });
        }
        Ok(data)
    }

    fn hopf_data(
        &self,
        x: &[f64],
        params: &[f64],
        monitor: &SpectralMonitor<'_>,
    ) -> Result<SpecialPointData> {
        let jac = self.field_jacobian(x, params);
        let eigenvalues = monitor.eigen.eigenvalues(&jac, 0)?;
        let lambda = critical_hopf_eigenvalue(&eigenvalues, monitor.imag_tolerance)
            .ok_or_else(|| ContinuationError::singular("No complex pair at the Hopf point"))?;
        let (q, p) = critical_eigenvectors(&jac, lambda)?;
        let forms = MultilinearForms::new(self.problem.field(), x, params);
        let l1 = first_lyapunov_coefficient(&forms, &jac, lambda.im, &q, &p)?;
        Ok(SpecialPointData {
            right_null: q.iter().copied().collect(),
            left_null: p.iter().copied().collect(),
            normal_form: Some(NormalForm::Hopf {
                omega: lambda.im,
                l1,
            }),
        })
    }

    fn neimark_sacker_data(
        &self,
        x: &[f64],
        params: &[f64],
        monitor: &SpectralMonitor<'_>,
    ) -> Result<SpecialPointData> {
        let jac = self.field_jacobian(x, params);
        let multipliers = monitor.eigen.eigenvalues(&jac, 0)?;
        let mu = critical_ns_multiplier(&multipliers, monitor.imag_tolerance)
            .ok_or_else(|| ContinuationError::singular("No complex multiplier pair"))?;
        let theta = mu.arg();
        let (q, p) = critical_eigenvectors(&jac, mu)?;
        let forms = MultilinearForms::new(self.problem.field(), x, params);
        let d = neimark_sacker_coefficient(&forms, &jac, theta, &q, &p)?;
        Ok(SpecialPointData {
            right_null: q.iter().copied().collect(),
            left_null: p.iter().copied().collect(),
            normal_form: Some(NormalForm::NeimarkSacker { theta, d }),
        })
    }
}

impl<F: VectorField> ContinuationProblem for EquilibriumProblem<'_, F> {
    fn dimension(&self) -> usize {
        self.problem.dimension()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        self.check_state(aug_state)?;
        let (p, x) = aug_to_parts(aug_state);
        out.copy_from(&self.problem.residual_with(&x, &self.params_at(p)));
        Ok(())
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        self.check_state(aug_state)?;
        let (p, x) = aug_to_parts(aug_state);
        let params = self.params_at(p);
        let n = x.len();
        let mut j_ext = DMatrix::zeros(n, n + 1);
        j_ext.set_column(
            0,
            &self.problem.dp_with(&x, &params, self.problem.lens().index),
        );
        j_ext
            .view_mut((0, 1), (n, n))
            .copy_from(&self.problem.jacobian_with(&x, &params));
        Ok(j_ext)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        let (p, x) = aug_to_parts(aug_state);
        let jac = self.field_jacobian(&x, &self.params_at(p));
        let values = monitor.eigen.eigenvalues(&jac, monitor.eigen_count)?;
        Ok(match self.problem.kind() {
            SystemKind::Flow => equilibrium_diagnostics(values, monitor.imag_tolerance),
            SystemKind::Map => {
                multiplier_diagnostics(values, monitor.imag_tolerance, BifurcationType::Fold)
            }
        })
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        let (p, x) = aug_to_parts(aug_state);
        let params = self.params_at(p);
        let data = match (kind, self.problem.kind()) {
            (BifurcationType::Fold | BifurcationType::BranchPoint, _) => {
                self.fold_data(&x, &params, 0.0)?
            }
            (BifurcationType::Hopf, SystemKind::Flow) => self.hopf_data(&x, &params, monitor)?,
            // Null vectors of Df + I; the residual Jacobian is Df - I.
            (BifurcationType::PeriodDoubling, SystemKind::Map) => {
                self.fold_data(&x, &params, 2.0)?
            }
            (BifurcationType::NeimarkSacker, SystemKind::Map) => {
                self.neimark_sacker_data(&x, &params, monitor)?
            }
            _ => return Ok(None),
        };
        Ok(Some(data))
    }
}

impl<F: VectorField> TwoParameterProblem for EquilibriumProblem<'_, F> {
    fn secondary_parameter(&self) -> Option<f64> {
        self.secondary.map(|index| self.params[index])
    }

    fn set_secondary_parameter(&mut self, value: f64) {
        if let Some(index) = self.secondary {
            self.params[index] = value;
        }
    }

    fn system_kind(&self) -> Option<SystemKind> {
        Some(self.problem.kind())
    }

    fn secondary_derivative(&mut self, aug_state: &DVector<f64>) -> Result<DVector<f64>> {
        let index = self
            .secondary
            .ok_or_else(|| ContinuationError::invalid("No secondary parameter selected"))?;
        let (p, x) = aug_to_parts(aug_state);
        Ok(self.problem.dp_with(&x, &self.params_at(p), index))
    }

    fn fold_coefficient(
        &mut self,
        aug_state: &DVector<f64>,
        v: &DVector<f64>,
        w: &DVector<f64>,
    ) -> Result<Option<f64>> {
        let (p, x) = aug_to_parts(aug_state);
        let params = self.params_at(p);
        let forms = MultilinearForms::new(self.problem.field(), &x, &params);
        Ok(Some(fold_coefficient(&forms, v, w)?))
    }

    fn first_lyapunov(
        &mut self,
        aug_state: &DVector<f64>,
        omega: f64,
        q: &DVector<Complex<f64>>,
        p: &DVector<Complex<f64>>,
    ) -> Result<Option<f64>> {
        if self.problem.kind().is_map() {
            return Ok(None);
        }
        let (param, x) = aug_to_parts(aug_state);
        let params = self.params_at(param);
        let jac = self.field_jacobian(&x, &params);
        let forms = MultilinearForms::new(self.problem.field(), &x, &params);
        Ok(Some(first_lyapunov_coefficient(&forms, &jac, omega, q, p)?))
    }

    fn neimark_sacker_coefficient(
        &mut self,
        aug_state: &DVector<f64>,
        theta: f64,
        q: &DVector<Complex<f64>>,
        p: &DVector<Complex<f64>>,
    ) -> Result<Option<f64>> {
        if !self.problem.kind().is_map() {
            return Ok(None);
        }
        let (param, x) = aug_to_parts(aug_state);
        let params = self.params_at(param);
        let jac = self.field_jacobian(&x, &params);
        let forms = MultilinearForms::new(self.problem.field(), &x, &params);
        Ok(Some(neimark_sacker_coefficient(&forms, &jac, theta, q, p)?))
    }
}

/// A converged equilibrium together with its spectrum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumSolution {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Eigenvalues of `Df` (multipliers for maps), by decreasing real part.
    pub eigenvalues: Vec<Complex<f64>>,
    pub stable: bool,
}

/// Newton solve of `F(x, p) = 0` from the problem's initial guess at its
/// current parameter value.
pub fn solve_equilibrium<F: VectorField>(
    problem: &BifurcationProblem<F>,
    settings: &NewtonSettings,
    oracles: Oracles<'_>,
) -> Result<EquilibriumSolution> {
    if problem.dimension() == 0 {
        bail!(ContinuationError::invalid("System has zero dimension."));
    }
    let p = problem.param();
    let mut system = FnSystem::new(
        |x: &DVector<f64>| Ok::<_, anyhow::Error>(problem.residual(x.as_slice(), p)),
        |x: &DVector<f64>| Ok::<_, anyhow::Error>(problem.jacobian(x.as_slice(), p)),
    );
    let guess = DVector::from_column_slice(problem.initial_guess());
    let outcome = correct(&mut system, guess, settings, oracles.linear)
        .context("Failed to converge to an equilibrium")?;

    let state: Vec<f64> = outcome.state.iter().copied().collect();
    let jac = problem.field_jacobian(&state, p);
    let eigenvalues = oracles
        .eigen
        .eigenvalues(&jac, 0)
        .context("Failed to compute eigenvalues of the Jacobian")?;
    let stable = match problem.kind() {
        SystemKind::Flow => eigenvalues.iter().all(|l| l.re < 0.0),
        SystemKind::Map => eigenvalues.iter().all(|m| m.norm() < 1.0),
    };
    Ok(EquilibriumSolution {
        state,
        residual_norm: outcome.residual_norm,
        iterations: outcome.iterations,
        eigenvalues,
        stable,
    })
}

fn initial_point<F: VectorField>(problem: &BifurcationProblem<F>) -> ContinuationPoint {
    ContinuationPoint::new(problem.initial_guess().to_vec(), problem.param())
}

/// Continues the equilibrium through the problem's initial guess in the lens
/// parameter, with the default dense oracles and no hooks.
pub fn continue_parameter<F: VectorField>(
    problem: &BifurcationProblem<F>,
    settings: &ContinuationSettings,
    forward: bool,
) -> Result<ContinuationBranch> {
    continue_parameter_with(
        problem,
        settings,
        Oracles::default(),
        forward,
        &mut ContinuationHooks::new(),
    )
}

pub fn continue_parameter_with<F: VectorField>(
    problem: &BifurcationProblem<F>,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    forward: bool,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let mut equilibrium = EquilibriumProblem::new(problem);
    continue_with_problem(
        &mut equilibrium,
        initial_point(problem),
        settings,
        oracles,
        forward,
        hooks,
    )
}

/// Traces both directions from the initial guess and merges them.
pub fn continue_parameter_bothside<F: VectorField>(
    problem: &BifurcationProblem<F>,
    settings: &ContinuationSettings,
) -> Result<ContinuationBranch> {
    continue_parameter_bothside_with(
        problem,
        settings,
        Oracles::default(),
        &mut ContinuationHooks::new(),
    )
}

pub fn continue_parameter_bothside_with<F: VectorField>(
    problem: &BifurcationProblem<F>,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    continue_bothside(
        &EquilibriumProblem::new(problem),
        initial_point(problem),
        settings,
        oracles,
        hooks,
    )
}

/// Extends an equilibrium branch from its forward or backward end.
pub fn extend_branch<F: VectorField>(
    problem: &BifurcationProblem<F>,
    branch: ContinuationBranch,
    settings: &ContinuationSettings,
    forward: bool,
) -> Result<ContinuationBranch> {
    let mut equilibrium = EquilibriumProblem::new(problem);
    extend_branch_with_problem(
        &mut equilibrium,
        branch,
        settings,
        Oracles::default(),
        forward,
        &mut ContinuationHooks::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::TerminationReason;
    use crate::problem::ParameterSet;
    use crate::traits::FnVectorField;

    fn settings(param_min: f64, param_max: f64) -> ContinuationSettings {
        ContinuationSettings {
            step_size: 0.02,
            max_step_size: 0.05,
            max_steps: 400,
            param_min: Some(param_min),
            param_max: Some(param_max),
            ..ContinuationSettings::default()
        }
    }

    fn saddle_node() -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] - x[0] * x[0];
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("mu", 1.0)]),
            "mu",
            vec![1.0],
        )
        .expect("problem")
    }

    fn hopf_normal_form(sigma: f64) -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(2, move |x: &[f64], p: &[f64], out: &mut [f64]| {
            let r2 = x[0] * x[0] + x[1] * x[1];
            out[0] = p[0] * x[0] - x[1] + sigma * x[0] * r2;
            out[1] = x[0] + p[0] * x[1] + sigma * x[1] * r2;
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("beta", -0.5), ("unused", 0.0)]),
            "beta",
            vec![0.0, 0.0],
        )
        .expect("problem")
    }

    #[test]
    fn saddle_node_fold_carries_normal_form() {
        let problem = saddle_node();
        let branch = continue_parameter(&problem, &settings(-1.0, 2.0), false).expect("branch");

        let folds: Vec<_> = branch.special_points_of(BifurcationType::Fold).collect();
        assert_eq!(folds.len(), 1);
        let fold = folds[0];
        assert!(fold.localized);
        assert!(fold.param_value.abs() < 1e-6);
        match fold.data.as_ref().and_then(|d| d.normal_form) {
            Some(NormalForm::Fold { a }) => assert!((a + 1.0).abs() < 1e-4, "a = {a}"),
            other => panic!("unexpected normal form {other:?}"),
        }
        // A backward run numbers its points downwards from the start.
        let start = branch.indices.iter().position(|&i| i == 0).expect("start");
        let far = branch.endpoint(false).expect("far end");
        assert!(branch.indices[far] < 0);
        assert!(branch.points[start].stable);
        assert!(branch.points[start].state[0] > 0.0);
        // Past the fold the branch is the unstable lower half.
        let last = &branch.points[far];
        assert!(last.state[0] < 0.0);
        assert!(!last.stable);
    }

    #[test]
    fn hopf_point_reports_lyapunov_coefficient() {
        let problem = hopf_normal_form(-1.0);
        let branch = continue_parameter(&problem, &settings(-1.0, 0.5), true).expect("branch");

        let hopf: Vec<_> = branch.special_points_of(BifurcationType::Hopf).collect();
        assert_eq!(hopf.len(), 1);
        assert!(hopf[0].param_value.abs() < 1e-6);
        match hopf[0].data.as_ref().and_then(|d| d.normal_form) {
            Some(NormalForm::Hopf { omega, l1 }) => {
                assert!((omega - 1.0).abs() < 1e-6);
                assert!((l1 + 2.0).abs() < 1e-3, "l1 = {l1}");
            }
            other => panic!("unexpected normal form {other:?}"),
        }
        assert!(branch.special_points_of(BifurcationType::Fold).next().is_none());
        assert!(matches!(
            branch.termination,
            Some(TerminationReason::ParameterBound { .. })
        ));
    }

    #[test]
    fn transcritical_crossing_is_a_branch_point() {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] * x[0] - x[0] * x[0];
        });
        let problem = BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("p", -0.5)]),
            "p",
            vec![0.0],
        )
        .expect("problem");
        let branch = continue_parameter(&problem, &settings(-1.0, 0.5), true).expect("branch");
        let bp: Vec<_> = branch
            .special_points_of(BifurcationType::BranchPoint)
            .collect();
        assert_eq!(bp.len(), 1);
        assert!(bp[0].param_value.abs() < 1e-6);
        assert!(branch.special_points_of(BifurcationType::Fold).next().is_none());
        assert!(branch.points.iter().all(|pt| pt.state[0].abs() < 1e-10));
    }

    #[test]
    fn logistic_map_period_doubling() {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] * x[0] * (1.0 - x[0]);
        });
        let problem = BifurcationProblem::new(
            field,
            SystemKind::Map,
            ParameterSet::new([("r", 2.5)]),
            "r",
            vec![0.6],
        )
        .expect("problem");
        let branch = continue_parameter(&problem, &settings(2.0, 3.4), true).expect("branch");
        let pd: Vec<_> = branch
            .special_points_of(BifurcationType::PeriodDoubling)
            .collect();
        assert_eq!(pd.len(), 1);
        assert!((pd[0].param_value - 3.0).abs() < 1e-6);
        assert!((pd[0].state[0] - 2.0 / 3.0).abs() < 1e-6);
        let data = pd[0].data.as_ref().expect("null vectors");
        assert_eq!(data.right_null.len(), 1);
        // The multiplier at the PD point is -1.
        let index = pd[0].index;
        assert!((branch.points[index].eigenvalues[0].re + 1.0).abs() < 1e-5);
    }

    #[test]
    fn rotation_map_neimark_sacker() {
        let (theta, c) = (0.9_f64, -0.7);
        let field = FnVectorField::new(2, move |x: &[f64], p: &[f64], out: &mut [f64]| {
            let scale = 1.0 + p[0] + c * (x[0] * x[0] + x[1] * x[1]);
            let (s, co) = theta.sin_cos();
            out[0] = scale * (co * x[0] - s * x[1]);
            out[1] = scale * (s * x[0] + co * x[1]);
        });
        let problem = BifurcationProblem::new(
            field,
            SystemKind::Map,
            ParameterSet::new([("beta", -0.3)]),
            "beta",
            vec![0.0, 0.0],
        )
        .expect("problem");
        let branch = continue_parameter(&problem, &settings(-1.0, 0.3), true).expect("branch");
        let ns: Vec<_> = branch
            .special_points_of(BifurcationType::NeimarkSacker)
            .collect();
        assert_eq!(ns.len(), 1);
        assert!(ns[0].param_value.abs() < 1e-6);
        match ns[0].data.as_ref().and_then(|d| d.normal_form) {
            Some(NormalForm::NeimarkSacker { theta: found, d }) => {
                assert!((found - theta).abs() < 1e-6);
                assert!((d - 2.0 * c).abs() < 1e-3, "d = {d}");
            }
            other => panic!("unexpected normal form {other:?}"),
        }
    }

    #[test]
    fn bothside_and_extension_share_the_branch() {
        let problem = saddle_node();
        let mut s = settings(0.5, 2.0);
        s.max_steps = 4;
        let branch = continue_parameter_bothside(&problem, &s).expect("branch");
        assert_eq!(branch.indices.first(), Some(&-4));
        assert_eq!(branch.indices.last(), Some(&4));
        let start = branch.points.iter().position(|pt| pt.step_size == 0.0);
        assert_eq!(start, Some(4));

        let extended = extend_branch(&problem, branch.clone(), &s, true).expect("extended");
        assert_eq!(extended.points.len(), branch.points.len() + 4);
        let tail = extended.points.last().expect("points");
        assert!(tail.param_value > branch.points.last().expect("points").param_value);
        assert!((tail.param_value - tail.state[0] * tail.state[0]).abs() < 1e-8);
    }

    #[test]
    fn solve_equilibrium_reports_spectrum() {
        let mut problem = saddle_node();
        problem.set_param(4.0);
        problem.set_initial_guess(vec![1.5]);
        let solution =
            solve_equilibrium(&problem, &NewtonSettings::default(), Oracles::default())
                .expect("solution");
        assert!((solution.state[0] - 2.0).abs() < 1e-9);
        assert!((solution.eigenvalues[0].re + 4.0).abs() < 1e-6);
        assert!(solution.stable);
    }

    #[test]
    fn secondary_parameter_must_differ_from_lens() {
        let problem = hopf_normal_form(1.0);
        assert!(EquilibriumProblem::with_secondary(&problem, "beta").is_err());
        let mut eq = EquilibriumProblem::with_secondary(&problem, "unused").expect("secondary");
        assert_eq!(eq.secondary_parameter(), Some(0.0));
        eq.set_secondary_parameter(0.25);
        assert_eq!(eq.secondary_parameter(), Some(0.25));
        assert_eq!(EquilibriumProblem::new(&problem).secondary_parameter(), None);
    }
}

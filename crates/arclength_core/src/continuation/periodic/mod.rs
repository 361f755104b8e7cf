//! Periodic orbits of flows as continuation problems.
//!
//! Three discretizations share one contract ([`PeriodicOrbitProblem`]):
//! trapezoidal finite differences, orthogonal collocation on an adaptive
//! mesh, and multiple shooting through a [`FlowMap`](crate::solvers::FlowMap).
//! Each stores the period as its last unknown, so the augmented layout is
//! `[p, discretized orbit..., T]`.

mod collocation;
mod shooting;
mod trapezoid;

pub use collocation::{CollocationConfig, CollocationProblem};
pub use shooting::{ShootingConfig, ShootingProblem};
pub use trapezoid::{TrapezoidConfig, TrapezoidProblem};

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::codim1_curves::{continue_fold_curve_with_problem, Codim2Settings, TwoParameterProblem};
use super::normal_form::critical_eigenvectors;
use super::problem::{ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate};
use super::util::{critical_ns_multiplier, drop_trivial_multiplier, multiplier_diagnostics};
use super::{
    continue_with_problem, extend_branch_with_problem, BifurcationType, BranchType,
    ContinuationBranch, ContinuationHooks, ContinuationPoint, ContinuationSettings, SpecialPoint,
    SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{bordered_null_vectors, Oracles};
use crate::problem::BifurcationProblem;
use crate::solvers::Rk4Flow;
use crate::traits::{SystemKind, VectorField};

/// Samples of one period of an orbit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrbitSamples {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

/// Discretization-independent starting guess: `states` are equally spaced
/// over one period, the first at `t = 0`, without repeating it at `t = T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbitGuess {
    pub param_value: f64,
    pub period: f64,
    pub states: Vec<Vec<f64>>,
}

/// Period of a corrector iterate. A non-positive period fails as a
/// non-converged step.
pub(crate) fn iterate_period(period: f64) -> Result<f64> {
    if !(period.is_finite() && period > 0.0) {
        bail!(ContinuationError::NonConvergence {
            iterations: 0,
            residual_norm: f64::INFINITY,
        });
    }
    Ok(period)
}

impl OrbitGuess {
    pub fn validate(&self, dim: usize) -> Result<()> {
        if !(self.period.is_finite() && self.period > 0.0) {
            bail!(ContinuationError::invalid(format!(
                "Initial period must be positive, got {}",
                self.period
            )));
        }
        if self.states.len() < 2 {
            bail!(ContinuationError::invalid(
                "An orbit guess needs at least two samples"
            ));
        }
        if let Some(bad) = self.states.iter().find(|s| s.len() != dim) {
            bail!(ContinuationError::invalid(format!(
                "Orbit sample has length {}, expected {}",
                bad.len(),
                dim
            )));
        }
        Ok(())
    }

    /// Periodic linear interpolation at normalized time `tau` (mod 1).
    pub fn sample(&self, tau: f64) -> Vec<f64> {
        let m = self.states.len();
        let scaled = tau.rem_euclid(1.0) * m as f64;
        let i = (scaled.floor() as usize).min(m - 1);
        let frac = scaled - i as f64;
        let a = &self.states[i];
        let b = &self.states[(i + 1) % m];
        a.iter()
            .zip(b)
            .map(|(&x, &y)| x + frac * (y - x))
            .collect()
    }
}

/// The capability set every periodic-orbit discretization exposes on top of
/// residual and Jacobian.
pub trait PeriodicOrbitProblem: TwoParameterProblem {
    /// Dimension of the underlying vector field.
    fn state_dim(&self) -> usize;

    fn period(&self, aug_state: &DVector<f64>) -> f64;

    fn orbit(&self, aug_state: &DVector<f64>) -> OrbitSamples;

    /// Linearized return map over one period, built from the discretization.
    fn monodromy(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Discretizes `guess` into a start point for this problem.
    fn initial_point(&mut self, guess: &OrbitGuess) -> Result<ContinuationPoint>;

    /// Refreshes phase references (and the mesh, where there is one) from a
    /// stored branch point.
    fn reset_from(&mut self, point: &ContinuationPoint) -> Result<()>;
}

/// Parameters and field shared by the discretizations.
pub(crate) struct CycleContext<'a, F> {
    problem: &'a BifurcationProblem<F>,
    params: Vec<f64>,
    secondary: Option<usize>,
}

impl<F> Clone for CycleContext<'_, F> {
    fn clone(&self) -> Self {
        Self {
            problem: self.problem,
            params: self.params.clone(),
            secondary: self.secondary,
        }
    }
}

impl<'a, F: VectorField> CycleContext<'a, F> {
    pub(crate) fn new(problem: &'a BifurcationProblem<F>, secondary: Option<&str>) -> Result<Self> {
        if problem.kind() != SystemKind::Flow {
            bail!(ContinuationError::invalid(
                "Periodic orbits are only continued for flows"
            ));
        }
        let secondary = match secondary {
            Some(name) => {
                let index = problem.params().lens(name)?.index;
                if index == problem.lens().index {
                    bail!(ContinuationError::invalid(format!(
                        "Secondary parameter '{name}' is already the continuation parameter"
                    )));
                }
                Some(index)
            }
            None => None,
        };
        Ok(Self {
            problem,
            params: problem.params().values.clone(),
            secondary,
        })
    }

    pub(crate) fn dim(&self) -> usize {
        self.problem.dimension()
    }

    pub(crate) fn params_at(&self, p: f64) -> Vec<f64> {
        let mut values = self.params.clone();
        values[self.problem.lens().index] = p;
        values
    }

    pub(crate) fn evaluate(&self, x: &[f64], params: &[f64]) -> DVector<f64> {
        let mut out = DVector::zeros(x.len());
        self.problem.field().evaluate(x, params, out.as_mut_slice());
        out
    }

    pub(crate) fn jacobian(&self, x: &[f64], params: &[f64]) -> DMatrix<f64> {
        self.problem.field().jacobian(x, params)
    }

    /// `∂f/∂p` for the continuation parameter.
    pub(crate) fn dp(&self, x: &[f64], params: &[f64]) -> DVector<f64> {
        self.problem.dp_with(x, params, self.problem.lens().index)
    }

    pub(crate) fn secondary_parameter(&self) -> Option<f64> {
        self.secondary.map(|index| self.params[index])
    }

    pub(crate) fn set_secondary_parameter(&mut self, value: f64) {
        if let Some(index) = self.secondary {
            self.params[index] = value;
        }
    }
}

/// Unit vector along `f(x)`, used as a Poincaré-plane normal.
pub(crate) fn plane_normal(velocity: &DVector<f64>) -> Result<DVector<f64>> {
    let norm = velocity.norm();
    if norm < 1e-12 {
        bail!(ContinuationError::invalid(
            "Vector field vanishes at the phase anchor; the orbit guess is an equilibrium"
        ));
    }
    Ok(velocity / norm)
}

/// Floquet test functions from a monodromy matrix.
pub(crate) fn cycle_diagnostics(
    monodromy: &DMatrix<f64>,
    monitor: &SpectralMonitor<'_>,
) -> Result<PointDiagnostics> {
    let mut multipliers = monitor.eigen.eigenvalues(monodromy, 0)?;
    drop_trivial_multiplier(&mut multipliers);
    Ok(multiplier_diagnostics(
        multipliers,
        monitor.imag_tolerance,
        BifurcationType::CycleFold,
    ))
}

/// Null vectors attached to a cycle bifurcation: the discretized Jacobian at
/// a cycle fold, and eigenvectors of the monodromy for PD and NS.
pub(crate) fn cycle_point_data<P: PeriodicOrbitProblem + ?Sized>(
    problem: &mut P,
    aug_state: &DVector<f64>,
    kind: BifurcationType,
    monitor: &SpectralMonitor<'_>,
) -> Result<Option<SpecialPointData>> {
    match kind {
        BifurcationType::CycleFold => {
            let dim = problem.dimension();
            let j_ext = problem.extended_jacobian(aug_state)?;
            let (v, w) = bordered_null_vectors(&j_ext.columns(1, dim).into_owned())?;
            Ok(Some(SpecialPointData::real(v.as_slice(), w.as_slice())))
        }
        BifurcationType::PeriodDoubling => {
            let mut shifted = problem.monodromy(aug_state)?;
            for i in 0..shifted.nrows() {
                shifted[(i, i)] += 1.0;
            }
            let (v, w) = bordered_null_vectors(&shifted)?;
            Ok(Some(SpecialPointData::real(v.as_slice(), w.as_slice())))
        }
        BifurcationType::NeimarkSacker => {
            let monodromy = problem.monodromy(aug_state)?;
            let multipliers = monitor.eigen.eigenvalues(&monodromy, 0)?;
            let Some(mu) = critical_ns_multiplier(&multipliers, monitor.imag_tolerance) else {
                return Ok(None);
            };
            let (q, p) = critical_eigenvectors(&monodromy, mu)?;
            Ok(Some(SpecialPointData {
                right_null: q.iter().copied().collect(),
                left_null: p.iter().copied().collect(),
                normal_form: None,
            }))
        }
        _ => Ok(None),
    }
}

/// Which discretization to use, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeriodicOrbitFamily {
    Trapezoid(TrapezoidConfig),
    Collocation(CollocationConfig),
    Shooting(ShootingConfig),
}

impl PeriodicOrbitFamily {
    pub fn name(&self) -> &'static str {
        match self {
            PeriodicOrbitFamily::Trapezoid(_) => "trapezoid",
            PeriodicOrbitFamily::Collocation(_) => "collocation",
            PeriodicOrbitFamily::Shooting(_) => "shooting",
        }
    }
}

/// A periodic-orbit problem of any of the three discretizations, so the
/// engine is instantiated once for all of them.
pub enum PeriodicOrbit<'a, F> {
    Trapezoid(TrapezoidProblem<'a, F>),
    Collocation(CollocationProblem<'a, F>),
    Shooting(ShootingProblem<'a, F, Rk4Flow<&'a F>>),
}

impl<F> Clone for PeriodicOrbit<'_, F> {
    fn clone(&self) -> Self {
        match self {
            Self::Trapezoid(p) => Self::Trapezoid(p.clone()),
            Self::Collocation(p) => Self::Collocation(p.clone()),
            Self::Shooting(p) => Self::Shooting(p.clone()),
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            PeriodicOrbit::Trapezoid($p) => $body,
            PeriodicOrbit::Collocation($p) => $body,
            PeriodicOrbit::Shooting($p) => $body,
        }
    };
}

impl<'a, F: VectorField> PeriodicOrbit<'a, F> {
    pub fn new(
        problem: &'a BifurcationProblem<F>,
        family: &PeriodicOrbitFamily,
        secondary: Option<&str>,
    ) -> Result<Self> {
        let context = CycleContext::new(problem, secondary)?;
        Ok(match family {
            PeriodicOrbitFamily::Trapezoid(config) => {
                PeriodicOrbit::Trapezoid(TrapezoidProblem::new(context, config.clone())?)
            }
            PeriodicOrbitFamily::Collocation(config) => {
                PeriodicOrbit::Collocation(CollocationProblem::new(context, config.clone())?)
            }
            PeriodicOrbitFamily::Shooting(config) => {
                let flow = Rk4Flow::new(problem.field(), config.integrator_steps);
                PeriodicOrbit::Shooting(ShootingProblem::new(context, flow, config.clone())?)
            }
        })
    }
}

impl<F: VectorField> ContinuationProblem for PeriodicOrbit<'_, F> {
    fn dimension(&self) -> usize {
        dispatch!(self, p => p.dimension())
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        dispatch!(self, p => p.residual(aug_state, out))
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        dispatch!(self, p => p.extended_jacobian(aug_state))
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        dispatch!(self, p => p.diagnostics(aug_state, monitor))
    }

    fn update_after_step(
        &mut self,
        aug_state: &DVector<f64>,
        tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        dispatch!(self, p => p.update_after_step(aug_state, tangent))
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        dispatch!(self, p => p.special_point_data(aug_state, kind, monitor))
    }

    fn branch_type(&self) -> BranchType {
        dispatch!(self, p => p.branch_type())
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        dispatch!(self, p => p.current_mesh())
    }
}

impl<F: VectorField> TwoParameterProblem for PeriodicOrbit<'_, F> {
    fn secondary_parameter(&self) -> Option<f64> {
        dispatch!(self, p => p.secondary_parameter())
    }

    fn set_secondary_parameter(&mut self, value: f64) {
        dispatch!(self, p => p.set_secondary_parameter(value))
    }

    fn system_kind(&self) -> Option<SystemKind> {
        None
    }
}

impl<F: VectorField> PeriodicOrbitProblem for PeriodicOrbit<'_, F> {
    fn state_dim(&self) -> usize {
        dispatch!(self, p => p.state_dim())
    }

    fn period(&self, aug_state: &DVector<f64>) -> f64 {
        dispatch!(self, p => p.period(aug_state))
    }

    fn orbit(&self, aug_state: &DVector<f64>) -> OrbitSamples {
        dispatch!(self, p => p.orbit(aug_state))
    }

    fn monodromy(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        dispatch!(self, p => p.monodromy(aug_state))
    }

    fn initial_point(&mut self, guess: &OrbitGuess) -> Result<ContinuationPoint> {
        dispatch!(self, p => p.initial_point(guess))
    }

    fn reset_from(&mut self, point: &ContinuationPoint) -> Result<()> {
        dispatch!(self, p => p.reset_from(point))
    }
}

/// Continues a family of periodic orbits from `guess` in one direction.
pub fn continue_periodic_orbit<F: VectorField>(
    problem: &BifurcationProblem<F>,
    family: &PeriodicOrbitFamily,
    guess: &OrbitGuess,
    settings: &ContinuationSettings,
    forward: bool,
) -> Result<ContinuationBranch> {
    continue_periodic_orbit_with(
        problem,
        family,
        guess,
        settings,
        Oracles::default(),
        forward,
        &mut ContinuationHooks::new(),
    )
}

pub fn continue_periodic_orbit_with<F: VectorField>(
    problem: &BifurcationProblem<F>,
    family: &PeriodicOrbitFamily,
    guess: &OrbitGuess,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    forward: bool,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let mut orbit = PeriodicOrbit::new(problem, family, None)?;
    let start = orbit.initial_point(guess)?;
    continue_with_problem(&mut orbit, start, settings, oracles, forward, hooks)
}

/// Appends points to a periodic-orbit branch traced with the same `family`.
pub fn extend_periodic_orbit<F: VectorField>(
    problem: &BifurcationProblem<F>,
    family: &PeriodicOrbitFamily,
    branch: ContinuationBranch,
    settings: &ContinuationSettings,
    forward: bool,
) -> Result<ContinuationBranch> {
    let mut orbit = PeriodicOrbit::new(problem, family, None)?;
    let end = branch
        .endpoint(forward)
        .ok_or_else(|| ContinuationError::invalid("Cannot extend an empty branch"))?;
    orbit.reset_from(&branch.points[end])?;
    extend_branch_with_problem(
        &mut orbit,
        branch,
        settings,
        Oracles::default(),
        forward,
        &mut ContinuationHooks::new(),
    )
}

/// Two-parameter continuation of a cycle fold found on `branch`.
pub fn continue_cycle_fold_curve<F: VectorField>(
    problem: &BifurcationProblem<F>,
    family: &PeriodicOrbitFamily,
    branch: &ContinuationBranch,
    fold: &SpecialPoint,
    secondary: &str,
    settings: &ContinuationSettings,
    codim2: Codim2Settings,
) -> Result<ContinuationBranch> {
    if fold.kind != BifurcationType::CycleFold {
        bail!(ContinuationError::invalid(format!(
            "Expected a cycle fold, got {:?}",
            fold.kind
        )));
    }
    let mut orbit = PeriodicOrbit::new(problem, family, Some(secondary))?;
    let point = branch
        .points
        .get(fold.index)
        .ok_or_else(|| ContinuationError::invalid("Cycle fold index is outside the branch"))?;
    orbit.reset_from(&ContinuationPoint {
        state: fold.state.clone(),
        param_value: fold.param_value,
        mesh: point.mesh.clone(),
        ..ContinuationPoint::default()
    })?;
    continue_fold_curve_with_problem(
        orbit,
        fold.param_value,
        &fold.state,
        settings,
        codim2,
        Oracles::default(),
        &mut ContinuationHooks::new(),
    )
}

/// Period stored in a periodic-orbit branch point.
pub fn point_period(point: &ContinuationPoint) -> Option<f64> {
    point.state.last().copied()
}

/// Componentwise `max - min` over the samples of an orbit.
pub fn orbit_amplitude(samples: &OrbitSamples) -> Vec<f64> {
    let Some(first) = samples.states.first() else {
        return Vec::new();
    };
    (0..first.len())
        .map(|i| {
            let (lo, hi) = samples
                .states
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                    (lo.min(s[i]), hi.max(s[i]))
                });
            hi - lo
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn guess_sampling_wraps_around() {
        let guess = OrbitGuess {
            param_value: 0.0,
            period: 1.0,
            states: vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]],
        };
        assert_eq!(guess.sample(0.5), vec![2.0]);
        assert_eq!(guess.sample(0.875), vec![1.5]);
        assert_eq!(guess.sample(1.25), vec![1.0]);
        assert!(guess.validate(1).is_ok());
        assert!(guess.validate(2).is_err());
    }

    #[test]
    fn maps_are_rejected() {
        let field = crate::traits::FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] * x[0];
        });
        let problem = BifurcationProblem::new(
            field,
            SystemKind::Map,
            crate::problem::ParameterSet::new([("a", 0.5)]),
            "a",
            vec![0.0],
        )
        .expect("problem");
        let family = PeriodicOrbitFamily::Trapezoid(TrapezoidConfig::default());
        assert!(PeriodicOrbit::new(&problem, &family, None).is_err());
    }

    #[test]
    fn families_serialize_with_a_tag() {
        let family = PeriodicOrbitFamily::Collocation(CollocationConfig::default());
        let json = serde_json::to_string(&family).expect("serialize");
        assert!(json.contains("\"type\":\"Collocation\""));
        let back: PeriodicOrbitFamily = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, family);
        assert_eq!(back.name(), "collocation");
    }

    /// `ż = (1 + iω) z - z|z|²`: the unit circle with period `2π/ω`.
    fn spinning_oscillator() -> BifurcationProblem<impl VectorField> {
        let field = crate::traits::FnVectorField::new(2, |x: &[f64], p: &[f64], out: &mut [f64]| {
            let g = 1.0 - x[0] * x[0] - x[1] * x[1];
            out[0] = g * x[0] - p[0] * x[1];
            out[1] = g * x[1] + p[0] * x[0];
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            crate::problem::ParameterSet::new([("omega", 1.0)]),
            "omega",
            vec![0.0, 0.0],
        )
        .expect("problem")
    }

    fn families() -> [PeriodicOrbitFamily; 3] {
        [
            PeriodicOrbitFamily::Trapezoid(TrapezoidConfig { intervals: 30 }),
            PeriodicOrbitFamily::Collocation(CollocationConfig::default()),
            PeriodicOrbitFamily::Shooting(ShootingConfig::default()),
        ]
    }

    #[test]
    fn negative_period_iterates_are_recoverable() {
        let problem = hopf_oscillator();
        let guess = circle_guess(0.25, 40);
        for family in families() {
            let mut orbit = PeriodicOrbit::new(&problem, &family, None).expect("orbit");
            let start = orbit.initial_point(&guess).expect("start");
            let mut aug = DVector::zeros(start.state.len() + 1);
            aug[0] = start.param_value;
            aug.rows_mut(1, start.state.len()).copy_from_slice(&start.state);
            let last = aug.len() - 1;
            aug[last] = -0.5;
            let mut out = DVector::zeros(orbit.dimension());
            let err = orbit.residual(&aug, &mut out).err().expect("negative period");
            assert_eq!(
                ContinuationError::classify(&err),
                crate::error::FailureClass::Recoverable,
                "{}",
                family.name()
            );
        }
    }

    #[test]
    fn period_overshoot_shrinks_the_step() {
        // The period falls like 2π/ω, so the first predictor lands at T < 0.
        let problem = spinning_oscillator();
        let guess = OrbitGuess {
            param_value: 1.0,
            period: 2.0 * std::f64::consts::PI,
            states: (0..30)
                .map(|k| {
                    let t = 2.0 * std::f64::consts::PI * k as f64 / 30.0;
                    vec![t.cos(), t.sin()]
                })
                .collect(),
        };
        let s = ContinuationSettings {
            step_size: 8.0,
            max_step_size: 8.0,
            max_steps: 2,
            param_min: Some(0.5),
            param_max: Some(20.0),
            ..ContinuationSettings::default()
        };
        for family in families() {
            let branch =
                continue_periodic_orbit(&problem, &family, &guess, &s, true).expect("branch");
            assert!(
                !matches!(
                    branch.termination,
                    Some(crate::continuation::TerminationReason::ProblemError { .. })
                ),
                "{}: {:?}",
                family.name(),
                branch.termination
            );
            assert!(branch.len() > 1, "{}", family.name());
            for point in &branch.points {
                let period = point_period(point).expect("period");
                assert!(period > 0.0);
                assert!((period * point.param_value - 2.0 * std::f64::consts::PI).abs() < 0.05);
            }
        }
    }

    #[test]
    fn every_family_extends_its_own_branch() {
        let problem = hopf_oscillator();
        let guess = circle_guess(0.25, 40);
        let mut s = settings();
        s.max_steps = 2;
        for family in [
            PeriodicOrbitFamily::Trapezoid(TrapezoidConfig { intervals: 30 }),
            PeriodicOrbitFamily::Collocation(CollocationConfig::default()),
            PeriodicOrbitFamily::Shooting(ShootingConfig::default()),
        ] {
            let branch =
                continue_periodic_orbit(&problem, &family, &guess, &s, true).expect("branch");
            let before = branch.len();
            let extended = extend_periodic_orbit(&problem, &family, branch, &s, true)
                .expect("extension");
            assert_eq!(extended.len(), before + 2, "{}", family.name());
            let last = &extended.points[extended.endpoint(true).expect("end")];
            let period = point_period(last).expect("period");
            assert!((period - 2.0 * std::f64::consts::PI).abs() < 0.05);
        }
    }
}

pub mod codim1_curves;
pub mod detection;
pub mod equilibrium;
pub mod normal_form;
pub mod periodic;
pub mod problem;
pub mod switching;
pub mod types;
pub mod util;

pub use equilibrium::{
    continue_parameter, continue_parameter_bothside, continue_parameter_with, EquilibriumProblem,
};
pub use problem::{
    ContinuationProblem, PointDiagnostics, SpectralMonitor, StepUpdate, TestFunctionValues,
    TestValue,
};
pub use types::{
    BifurcationType, BranchType, ContinuationBranch, ContinuationPoint, ContinuationSettings,
    NormalForm, SpecialPoint, SpecialPointData, TerminationReason,
};

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::error::{ContinuationError, FailureClass};
use crate::linalg::{LinearSolver, Oracles};
use crate::newton::{correct, NewtonOutcome, NewtonSettings, NewtonSystem};
use detection::{classify_fold, locate_special_point, LocatedPoint};
use util::{bordered_tangent, compute_nullspace_tangent, continuation_point_to_aug};

/// Progress and stopping callbacks passed explicitly into a run.
#[derive(Default)]
pub struct ContinuationHooks<'a> {
    /// Called for every point stored on the branch, in storage order.
    pub on_point: Option<Box<dyn FnMut(&ContinuationPoint) + 'a>>,
    /// Checked after every accepted step; `true` ends the branch.
    pub should_stop: Option<Box<dyn FnMut(&ContinuationPoint) -> bool + 'a>>,
}

impl<'a> ContinuationHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_point(mut self, callback: impl FnMut(&ContinuationPoint) + 'a) -> Self {
        self.on_point = Some(Box::new(callback));
        self
    }

    pub fn with_should_stop(
        mut self,
        predicate: impl FnMut(&ContinuationPoint) -> bool + 'a,
    ) -> Self {
        self.should_stop = Some(Box::new(predicate));
        self
    }

    fn emit(&mut self, point: &ContinuationPoint) {
        if let Some(callback) = self.on_point.as_mut() {
            callback(point);
        }
    }

    fn stop_requested(&mut self, point: &ContinuationPoint) -> bool {
        self.should_stop
            .as_mut()
            .map_or(false, |predicate| predicate(point))
    }
}

/// `[F(aug); t·(aug - base) - ds] = 0`.
struct PalcSystem<'a, P: ?Sized> {
    problem: &'a mut P,
    base: &'a DVector<f64>,
    tangent: &'a DVector<f64>,
    ds: f64,
}

impl<P: ContinuationProblem + ?Sized> NewtonSystem for PalcSystem<'_, P> {
    fn residual(&mut self, aug: &DVector<f64>) -> Result<DVector<f64>> {
        let dim = self.problem.dimension();
        let mut f_val = DVector::zeros(dim);
        self.problem.residual(aug, &mut f_val)?;
        let mut out = DVector::zeros(dim + 1);
        out.rows_mut(0, dim).copy_from(&f_val);
        out[dim] = self.tangent.dot(&(aug - self.base)) - self.ds;
        Ok(out)
    }

    fn jacobian(&mut self, aug: &DVector<f64>) -> Result<DMatrix<f64>> {
        let j_ext = self.problem.extended_jacobian(aug)?;
        let dim = j_ext.nrows();
        let mut a = DMatrix::zeros(dim + 1, dim + 1);
        a.view_mut((0, 0), (dim, dim + 1)).copy_from(&j_ext);
        a.row_mut(dim).copy_from(&self.tangent.transpose());
        Ok(a)
    }
}

/// `F([p, x]) = 0` in `x` alone, with `p` frozen.
struct FixedParamSystem<'a, P: ?Sized> {
    problem: &'a mut P,
    param: f64,
}

impl<P: ContinuationProblem + ?Sized> FixedParamSystem<'_, P> {
    fn augment(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut aug = DVector::zeros(x.len() + 1);
        aug[0] = self.param;
        aug.rows_mut(1, x.len()).copy_from(x);
        aug
    }
}

impl<P: ContinuationProblem + ?Sized> NewtonSystem for FixedParamSystem<'_, P> {
    fn residual(&mut self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let aug = self.augment(x);
        let mut out = DVector::zeros(x.len());
        self.problem.residual(&aug, &mut out)?;
        Ok(out)
    }

    fn jacobian(&mut self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        let aug = self.augment(x);
        let j_ext = self.problem.extended_jacobian(&aug)?;
        Ok(j_ext.columns(1, x.len()).into_owned())
    }
}

/// PALC corrector: Newton on the bordered system from the predictor
/// `base + ds·tangent`.
pub fn correct_palc<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    base: &DVector<f64>,
    tangent: &DVector<f64>,
    ds: f64,
    settings: &NewtonSettings,
    solver: &dyn LinearSolver,
) -> Result<NewtonOutcome> {
    let predicted = base + tangent * ds;
    let mut system = PalcSystem {
        problem,
        base,
        tangent,
        ds,
    };
    correct(&mut system, predicted, settings, solver)
}

/// Newton at fixed parameter; returns the corrected augmented state.
pub fn correct_at_fixed_param<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    aug: &DVector<f64>,
    settings: &NewtonSettings,
    solver: &dyn LinearSolver,
) -> Result<DVector<f64>> {
    let dim = aug.len() - 1;
    let mut system = FixedParamSystem {
        problem,
        param: aug[0],
    };
    let outcome = correct(&mut system, aug.rows(1, dim).into_owned(), settings, solver)?;
    Ok(system.augment(&outcome.state))
}

fn spectral_monitor<'a>(
    settings: &ContinuationSettings,
    oracles: Oracles<'a>,
) -> SpectralMonitor<'a> {
    SpectralMonitor {
        eigen: oracles.eigen,
        eigen_count: settings.eigen_count,
        imag_tolerance: settings.corrector.tolerance,
    }
}

fn validate_settings(settings: &ContinuationSettings) -> Result<()> {
    settings.corrector.validate()?;
    if !(settings.min_step_size > 0.0
        && settings.min_step_size <= settings.step_size
        && settings.step_size <= settings.max_step_size)
    {
        bail!(ContinuationError::invalid(
            "step sizes must satisfy 0 < min_step_size <= step_size <= max_step_size"
        ));
    }
    if !(settings.step_shrink > 0.0 && settings.step_shrink < 1.0 && settings.step_growth >= 1.0) {
        bail!(ContinuationError::invalid(
            "step_shrink must lie in (0, 1) and step_growth must be at least 1"
        ));
    }
    if let (Some(min), Some(max)) = (settings.param_min, settings.param_max) {
        if min > max {
            bail!(ContinuationError::invalid("param_min exceeds param_max"));
        }
    }
    Ok(())
}

/// Corrects the start at fixed parameter and fills in its tangent (oriented
/// towards increasing `p`) and diagnostics.
fn prepare_start<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    initial: ContinuationPoint,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
) -> Result<ContinuationPoint> {
    validate_settings(settings)?;
    let dim = problem.dimension();
    if initial.state.len() != dim {
        bail!(ContinuationError::invalid(format!(
            "Initial state dimension mismatch. Expected {}, got {}.",
            dim,
            initial.state.len()
        )));
    }

    let aug = continuation_point_to_aug(&initial);
    let mut aug = correct_at_fixed_param(problem, &aug, &settings.corrector, oracles.linear)
        .context("Failed to converge to the initial point")?;
    let j_ext = problem.extended_jacobian(&aug)?;
    let mut tangent = compute_nullspace_tangent(&j_ext)?;
    if tangent[0] < 0.0 {
        tangent = -tangent;
    }
    if let StepUpdate::Remapped {
        aug_state,
        tangent: remapped,
    } = problem.update_after_step(&aug, &tangent)?
    {
        aug = aug_state;
        tangent = remapped;
    }

    let diagnostics = problem.diagnostics(&aug, &spectral_monitor(settings, oracles))?;
    Ok(ContinuationPoint {
        state: aug.iter().skip(1).cloned().collect(),
        param_value: aug[0],
        tangent: tangent.iter().cloned().collect(),
        step_size: 0.0,
        kind: BifurcationType::None,
        stable: diagnostics.stable,
        eigenvalues: diagnostics.eigenvalues,
        mesh: problem.current_mesh(),
    })
}

/// Points traced in one direction from a start point (exclusive).
struct Segment {
    points: Vec<ContinuationPoint>,
    /// Special points with `index` relative to `points`.
    special_points: Vec<SpecialPoint>,
    termination: TerminationReason,
}

fn point_from_aug(
    aug: &DVector<f64>,
    tangent: &DVector<f64>,
    step_size: f64,
    diagnostics: &PointDiagnostics,
    mesh: Option<Vec<f64>>,
) -> ContinuationPoint {
    ContinuationPoint {
        state: aug.iter().skip(1).cloned().collect(),
        param_value: aug[0],
        tangent: tangent.iter().cloned().collect(),
        step_size,
        kind: BifurcationType::None,
        stable: diagnostics.stable,
        eigenvalues: diagnostics.eigenvalues.clone(),
        mesh,
    }
}

fn failure_termination(
    err: &anyhow::Error,
    class: FailureClass,
    at: &DVector<f64>,
) -> TerminationReason {
    let message = format!("{err:#}");
    let param_value = at[0];
    let state: Vec<f64> = at.iter().skip(1).cloned().collect();
    match (class, err.downcast_ref::<ContinuationError>()) {
        (FailureClass::Singular, Some(ContinuationError::BorderingSingular { .. })) => {
            TerminationReason::BorderingSingular {
                param_value,
                state,
                message,
            }
        }
        (FailureClass::Singular, _) => TerminationReason::SingularJacobian {
            param_value,
            state,
            message,
        },
        _ => TerminationReason::ProblemError { message },
    }
}

/// One accepted PALC step: corrected state, its tangent and diagnostics.
fn attempt_step<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    prev_aug: &DVector<f64>,
    prev_tangent: &DVector<f64>,
    ds: f64,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    monitor: &SpectralMonitor<'_>,
) -> Result<(NewtonOutcome, DVector<f64>, PointDiagnostics)> {
    let outcome = correct_palc(
        problem,
        prev_aug,
        prev_tangent,
        ds,
        &settings.corrector,
        oracles.linear,
    )?;
    let j_ext = problem.extended_jacobian(&outcome.state)?;
    let tangent = bordered_tangent(&j_ext, prev_tangent, oracles.linear)?;
    let diagnostics = problem.diagnostics(&outcome.state, monitor)?;
    if !diagnostics.test_values.is_finite() || tangent.iter().any(|v| !v.is_finite()) {
        bail!(ContinuationError::NonConvergence {
            iterations: outcome.iterations,
            residual_norm: f64::NAN,
        });
    }
    Ok((outcome, tangent, diagnostics))
}

fn trace_segment<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    start: &ContinuationPoint,
    start_tangent: DVector<f64>,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<Segment> {
    let monitor = spectral_monitor(settings, oracles);
    let mut prev_aug = continuation_point_to_aug(start);
    let mut prev_tangent = start_tangent;
    let mut prev_diag = problem.diagnostics(&prev_aug, &monitor)?;
    let mut ds = settings.step_size;
    let mut accepted = 0usize;
    let mut segment_points: Vec<ContinuationPoint> = Vec::new();
    let mut special_points: Vec<SpecialPoint> = Vec::new();

    let termination = loop {
        if accepted >= settings.max_steps {
            break TerminationReason::MaxSteps;
        }

        let (outcome, tangent, diagnostics) = match attempt_step(
            problem,
            &prev_aug,
            &prev_tangent,
            ds,
            settings,
            oracles,
            &monitor,
        ) {
            Ok(step) => step,
            Err(err) => match ContinuationError::classify(&err) {
                FailureClass::Recoverable => {
                    ds *= settings.step_shrink;
                    debug!(step_size = ds, error = %err, "Step rejected, shrinking");
                    if ds < settings.min_step_size {
                        let stalled = ContinuationError::ContinuationStalled {
                            step_size: ds,
                            min_step_size: settings.min_step_size,
                        };
                        warn!(error = %stalled, last_error = %err, "Branch stalled");
                        break TerminationReason::Stalled { step_size: ds };
                    }
                    continue;
                }
                class => {
                    let predicted = &prev_aug + &prev_tangent * ds;
                    break failure_termination(&err, class, &predicted);
                }
            },
        };
        let mut aug = outcome.state;
        let mut tangent = tangent;

        if !settings.param_in_range(aug[0]) {
            break TerminationReason::ParameterBound {
                param_value: aug[0],
            };
        }

        let mut located: Vec<LocatedPoint> = Vec::new();
        let mut unlocated: Vec<BifurcationType> = Vec::new();
        if settings.detect_bifurcation {
            for kind in diagnostics.test_values.sign_changes(&prev_diag.test_values) {
                let prev_value = prev_diag.test_values.value_for(kind).unwrap_or(0.0);
                match locate_special_point(
                    problem,
                    &prev_aug,
                    &prev_tangent,
                    prev_value,
                    kind,
                    ds,
                    settings,
                    oracles,
                    &monitor,
                ) {
                    Ok(point) => located.push(point),
                    Err(err) => {
                        warn!(
                            ?kind,
                            error = %err,
                            "Failed to localise special point; marking step end"
                        );
                        unlocated.push(kind);
                    }
                }
            }
            located.sort_by(|a, b| {
                a.arclength
                    .partial_cmp(&b.arclength)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        // Located points are stored with the mesh they were computed on.
        let mesh_before = problem.current_mesh();
        let mut pending: Vec<(ContinuationPoint, Option<SpecialPointData>, bool)> = Vec::new();
        let mut last_arclength = 0.0;
        for point in &located {
            let kind = classify_fold(point.kind, &prev_tangent, &tangent);
            let data = if settings.compute_normal_forms {
                match problem.special_point_data(&point.aug_state, kind, &monitor) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(?kind, error = %err, "Failed to compute special point data");
                        None
                    }
                }
            } else {
                None
            };
            let mut stored = point_from_aug(
                &point.aug_state,
                &point.tangent,
                point.arclength - last_arclength,
                &point.diagnostics,
                mesh_before.clone(),
            );
            stored.kind = kind;
            last_arclength = point.arclength;
            info!(
                ?kind,
                param = stored.param_value,
                localized = point.converged,
                "Special point detected"
            );
            pending.push((stored, data, point.converged));
        }

        if let Some(end) = pending.iter().position(|(p, _, _)| problem.ends_at(p.kind)) {
            pending.truncate(end + 1);
            let kind = pending[end].0.kind;
            for (stored, data, localized) in pending {
                record_special_point(
                    &mut segment_points,
                    &mut special_points,
                    hooks,
                    stored,
                    data,
                    localized,
                );
            }
            info!(?kind, "Branch ends at special point");
            break TerminationReason::EndPoint { kind };
        }

        match problem.update_after_step(&aug, &tangent) {
            Ok(StepUpdate::Unchanged) => {}
            Ok(StepUpdate::Remapped {
                aug_state,
                tangent: remapped,
            }) => {
                aug = aug_state;
                tangent = match problem
                    .extended_jacobian(&aug)
                    .and_then(|j_ext| bordered_tangent(&j_ext, &remapped, oracles.linear))
                {
                    Ok(t) => t,
                    Err(err) => {
                        break failure_termination(&err, ContinuationError::classify(&err), &aug)
                    }
                };
            }
            Err(err) => {
                break failure_termination(&err, ContinuationError::classify(&err), &aug)
            }
        }

        let mut accepted_point = point_from_aug(
            &aug,
            &tangent,
            ds,
            &diagnostics,
            problem.current_mesh(),
        );

        for (stored, data, localized) in pending {
            record_special_point(
                &mut segment_points,
                &mut special_points,
                hooks,
                stored,
                data,
                localized,
            );
        }
        let unlocated_end = unlocated.iter().copied().find(|&kind| problem.ends_at(kind));
        for kind in unlocated {
            let kind = classify_fold(kind, &prev_tangent, &tangent);
            // The point keeps the first kind; every kind is still recorded.
            if accepted_point.kind == BifurcationType::None {
                accepted_point.kind = kind;
            }
            special_points.push(SpecialPoint {
                kind,
                index: segment_points.len(),
                param_value: accepted_point.param_value,
                state: accepted_point.state.clone(),
                localized: false,
                data: None,
            });
        }

        debug!(
            step = accepted,
            param = accepted_point.param_value,
            step_size = ds,
            iterations = outcome.iterations,
            "Step accepted"
        );
        hooks.emit(&accepted_point);
        let stop = hooks.stop_requested(&accepted_point);
        segment_points.push(accepted_point);
        accepted += 1;

        prev_aug = aug;
        prev_tangent = tangent;
        prev_diag = diagnostics;
        if outcome.iterations < settings.target_corrector_steps {
            ds = (ds * settings.step_growth).min(settings.max_step_size);
        }

        if let Some(kind) = unlocated_end {
            break TerminationReason::EndPoint { kind };
        }
        if stop {
            break TerminationReason::StopRequested;
        }
    };

    info!(?termination, points = segment_points.len(), "Branch segment finished");
    Ok(Segment {
        points: segment_points,
        special_points,
        termination,
    })
}

fn record_special_point(
    segment_points: &mut Vec<ContinuationPoint>,
    special_points: &mut Vec<SpecialPoint>,
    hooks: &mut ContinuationHooks<'_>,
    stored: ContinuationPoint,
    data: Option<SpecialPointData>,
    localized: bool,
) {
    special_points.push(SpecialPoint {
        kind: stored.kind,
        index: segment_points.len(),
        param_value: stored.param_value,
        state: stored.state.clone(),
        localized,
        data,
    });
    hooks.emit(&stored);
    segment_points.push(stored);
}

fn negate(tangent: &mut [f64]) {
    for v in tangent.iter_mut() {
        *v = -*v;
    }
}

/// Lays out `backward` (reversed), `start`, `forward` in index order.
fn assemble_branch(
    start: ContinuationPoint,
    backward: Option<Segment>,
    forward: Option<Segment>,
    branch_type: BranchType,
) -> ContinuationBranch {
    let mut branch = ContinuationBranch {
        branch_type,
        ..ContinuationBranch::default()
    };

    if let Some(segment) = backward {
        let count = segment.points.len();
        for (k, mut point) in segment.points.into_iter().enumerate().rev() {
            negate(&mut point.tangent);
            branch.points.push(point);
            branch.indices.push(-(k as i32) - 1);
        }
        for mut special in segment.special_points.into_iter().rev() {
            special.index = count - 1 - special.index;
            branch.special_points.push(special);
        }
        branch.backward_termination = Some(segment.termination);
    }

    branch.points.push(start);
    branch.indices.push(0);

    if let Some(segment) = forward {
        let offset = branch.points.len();
        for (k, point) in segment.points.into_iter().enumerate() {
            branch.points.push(point);
            branch.indices.push(k as i32 + 1);
        }
        for mut special in segment.special_points {
            special.index += offset;
            branch.special_points.push(special);
        }
        branch.termination = Some(segment.termination);
    }

    branch
}

/// Traces a branch from `initial` in one direction.
///
/// Errors are returned only when the start cannot be set up; failures during
/// stepping end the branch and are recorded in its termination reason.
pub fn continue_with_problem<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    initial: ContinuationPoint,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    forward: bool,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let start = prepare_start(problem, initial, settings, oracles)?;
    info!(
        param = start.param_value,
        forward,
        branch_type = ?problem.branch_type(),
        "Starting continuation"
    );
    hooks.emit(&start);
    let mut direction = DVector::from_column_slice(&start.tangent);
    if !forward {
        direction = -direction;
    }
    let segment = trace_segment(problem, &start, direction, settings, oracles, hooks)?;
    let branch_type = problem.branch_type();
    Ok(if forward {
        assemble_branch(start, None, Some(segment), branch_type)
    } else {
        assemble_branch(start, Some(segment), None, branch_type)
    })
}

/// Runs the backward and forward directions from the same start and merges
/// them into one branch (backward points carry negative indices).
pub fn continue_bothside<P: ContinuationProblem + Clone>(
    problem: &P,
    initial: ContinuationPoint,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    let mut forward_problem = problem.clone();
    let start = prepare_start(&mut forward_problem, initial, settings, oracles)?;
    let mut backward_problem = forward_problem.clone();
    info!(param = start.param_value, "Starting bothside continuation");
    hooks.emit(&start);

    let tangent = DVector::from_column_slice(&start.tangent);
    let backward = trace_segment(
        &mut backward_problem,
        &start,
        -&tangent,
        settings,
        oracles,
        hooks,
    )?;
    let forward = trace_segment(&mut forward_problem, &start, tangent, settings, oracles, hooks)?;
    let branch_type = forward_problem.branch_type();
    Ok(assemble_branch(start, Some(backward), Some(forward), branch_type))
}

/// Extends an existing branch from its forward (largest index) or backward
/// end, reusing the stored tangent. Existing points are left untouched.
pub fn extend_branch_with_problem<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    mut branch: ContinuationBranch,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    forward: bool,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    validate_settings(settings)?;
    if branch.points.is_empty() {
        bail!(ContinuationError::invalid("Cannot extend empty branch"));
    }
    if branch.indices.len() != branch.points.len() {
        branch.indices = (0..branch.points.len() as i32).collect();
    }
    let position = branch
        .endpoint(forward)
        .ok_or_else(|| ContinuationError::invalid("Branch has no indices"))?;
    let endpoint = branch.points[position].clone();
    let dim = problem.dimension();
    if endpoint.state.len() != dim {
        bail!(ContinuationError::invalid(format!(
            "Branch state dimension mismatch. Expected {}, got {}.",
            dim,
            endpoint.state.len()
        )));
    }

    let mut tangent = if endpoint.tangent.len() == dim + 1 {
        DVector::from_column_slice(&endpoint.tangent)
    } else {
        let j_ext = problem.extended_jacobian(&continuation_point_to_aug(&endpoint))?;
        let t = compute_nullspace_tangent(&j_ext)?;
        if t[0] < 0.0 {
            -t
        } else {
            t
        }
    };
    if !forward {
        tangent = -tangent;
    }

    info!(param = endpoint.param_value, forward, "Extending branch");
    let segment = trace_segment(problem, &endpoint, tangent, settings, oracles, hooks)?;
    let edge_index = branch.indices[position];

    if forward {
        let offset = branch.points.len();
        for (k, point) in segment.points.into_iter().enumerate() {
            branch.points.push(point);
            branch.indices.push(edge_index + k as i32 + 1);
        }
        for mut special in segment.special_points {
            special.index += offset;
            branch.special_points.push(special);
        }
        branch.termination = Some(segment.termination);
    } else {
        let count = segment.points.len();
        let mut points = Vec::with_capacity(count + branch.points.len());
        let mut indices = Vec::with_capacity(count + branch.points.len());
        for (k, mut point) in segment.points.into_iter().enumerate().rev() {
            negate(&mut point.tangent);
            points.push(point);
            indices.push(edge_index - k as i32 - 1);
        }
        points.append(&mut branch.points);
        indices.append(&mut branch.indices);
        branch.points = points;
        branch.indices = indices;

        let mut specials: Vec<SpecialPoint> = segment
            .special_points
            .into_iter()
            .rev()
            .map(|mut sp| {
                sp.index = count - 1 - sp.index;
                sp
            })
            .collect();
        for mut special in branch.special_points.drain(..) {
            special.index += count;
            specials.push(special);
        }
        branch.special_points = specials;
        branch.backward_termination = Some(segment.termination);
    }

    Ok(branch)
}

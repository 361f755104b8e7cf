//! Leaving a branch at a special point: onto the crossing branch at a branch
//! point, and onto the family of cycles born at a Hopf point.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, SVD};
use num_complex::Complex;
use std::f64::consts::PI;
use tracing::{info, warn};

use super::codim1_curves::hopf_frequency;
use super::normal_form::{critical_eigenvectors, first_lyapunov_coefficient, MultilinearForms};
use super::periodic::OrbitGuess;
use super::problem::ContinuationProblem;
use super::util::closest_to;
use super::{
    continue_with_problem, correct_palc, BifurcationType, ContinuationBranch, ContinuationHooks,
    ContinuationPoint, ContinuationSettings, EquilibriumProblem, NormalForm, SpecialPoint,
    SpecialPointData,
};
use crate::error::ContinuationError;
use crate::linalg::{DenseEigen, EigenSolver, Oracles};
use crate::problem::BifurcationProblem;
use crate::traits::{SystemKind, VectorField};

/// Two orthonormal vectors spanning the (assumed two-dimensional) kernel of
/// the `n × (n+1)` matrix `j_ext`.
fn two_dimensional_kernel(j_ext: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
    let cols = j_ext.ncols();
    let mut square = DMatrix::zeros(cols, cols);
    square.rows_mut(0, j_ext.nrows()).copy_from(j_ext);
    let svd = SVD::new(square, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| ContinuationError::singular("SVD did not return right singular vectors"))?;
    let mut order: Vec<usize> = (0..cols).collect();
    order.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));
    let (first, second) = (order[0], order[1]);
    let scale = svd.singular_values.max().max(1.0);
    if svd.singular_values[second] > 1e-6 * scale {
        warn!(
            sigma = svd.singular_values[second],
            "Kernel at the branch point is numerically one-dimensional"
        );
    }
    Ok((
        v_t.row(first).transpose().into_owned(),
        v_t.row(second).transpose().into_owned(),
    ))
}

/// Makes the first component that is clearly nonzero positive.
fn orient(mut v: DVector<f64>) -> DVector<f64> {
    if let Some(&lead) = v.iter().find(|c| c.abs() > 1e-8) {
        if lead < 0.0 {
            v.neg_mut();
        }
    }
    v
}

/// Secondary direction at a branch point: the kernel vector of the extended
/// Jacobian orthogonal to the tangent of the branch already traced.
pub fn branch_switch_direction<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    aug_state: &DVector<f64>,
    old_tangent: &DVector<f64>,
) -> Result<DVector<f64>> {
    let j_ext = problem.extended_jacobian(aug_state)?;
    let (k1, k2) = two_dimensional_kernel(&j_ext)?;
    let (a, b) = (k1.dot(old_tangent), k2.dot(old_tangent));
    let direction = k1 * b - k2 * a;
    let norm = direction.norm();
    if norm < 1e-12 {
        bail!(ContinuationError::singular(
            "Branch tangent has no component in the kernel at the branch point"
        ));
    }
    Ok(orient(direction / norm))
}

/// Starts the crossing branch at a `BranchPoint` of an equilibrium branch.
///
/// The first point is `settings.step_size` away along the secondary
/// direction (`forward` picks the side); tracing continues in the same
/// sense from there.
pub fn switch_at_branch_point<F: VectorField>(
    problem: &BifurcationProblem<F>,
    branch: &ContinuationBranch,
    point: &SpecialPoint,
    settings: &ContinuationSettings,
    forward: bool,
) -> Result<ContinuationBranch> {
    switch_at_branch_point_with(
        problem,
        branch,
        point,
        settings,
        Oracles::default(),
        forward,
        &mut ContinuationHooks::new(),
    )
}

pub fn switch_at_branch_point_with<F: VectorField>(
    problem: &BifurcationProblem<F>,
    branch: &ContinuationBranch,
    point: &SpecialPoint,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    forward: bool,
    hooks: &mut ContinuationHooks<'_>,
) -> Result<ContinuationBranch> {
    if point.kind != BifurcationType::BranchPoint {
        bail!(ContinuationError::invalid(format!(
            "Expected a branch point, got {:?}",
            point.kind
        )));
    }
    let stored = branch
        .points
        .get(point.index)
        .ok_or_else(|| ContinuationError::invalid("Branch point index is outside the branch"))?;
    let mut equilibrium = EquilibriumProblem::new(problem);
    let dim = equilibrium.dimension();
    if point.state.len() != dim || stored.tangent.len() != dim + 1 {
        bail!(ContinuationError::invalid(
            "Branch point does not belong to an equilibrium branch of this problem"
        ));
    }
    let mut aug = DVector::zeros(dim + 1);
    aug[0] = point.param_value;
    aug.rows_mut(1, dim).copy_from_slice(&point.state);
    let old_tangent = DVector::from_column_slice(&stored.tangent);

    let mut direction = branch_switch_direction(&mut equilibrium, &aug, &old_tangent)?;
    if !forward {
        direction.neg_mut();
    }
    let outcome = correct_palc(
        &mut equilibrium,
        &aug,
        &direction,
        settings.step_size,
        &settings.corrector,
        oracles.linear,
    )?;
    info!(
        from = point.param_value,
        to = outcome.state[0],
        iterations = outcome.iterations,
        "Switched branches"
    );
    let start = ContinuationPoint::new(
        outcome.state.iter().skip(1).copied().collect(),
        outcome.state[0],
    );
    // The start tangent is oriented with dp/ds >= 0; keep moving away from
    // the branch point.
    let ahead = outcome.state[0] >= point.param_value;
    continue_with_problem(&mut equilibrium, start, settings, oracles, ahead, hooks)
}

/// `d Re λ / dp` of the critical eigenvalue along the equilibrium branch,
/// by central differences with `x(p)` moved to first order.
fn eigenvalue_drift<F: VectorField>(
    problem: &BifurcationProblem<F>,
    state: &[f64],
    p: f64,
    lambda: Complex<f64>,
) -> Result<f64> {
    let jac = problem.jacobian(state, p);
    let dp = problem.dp(state, p);
    let dx = jac
        .lu()
        .solve(&(-dp))
        .ok_or_else(|| ContinuationError::singular("Jacobian is singular at the Hopf point"))?;
    let h = 1e-6 * (1.0 + p.abs());
    let critical_at = |sign: f64| -> Result<f64> {
        let x: Vec<f64> = state
            .iter()
            .zip(dx.iter())
            .map(|(x, d)| x + sign * h * d)
            .collect();
        let values = DenseEigen.eigenvalues(&problem.field_jacobian(&x, p + sign * h), 0)?;
        let index = closest_to(&values, lambda)
            .ok_or_else(|| ContinuationError::invalid("No eigenvalues at the Hopf point"))?;
        Ok(values[index].re)
    };
    Ok((critical_at(1.0)? - critical_at(-1.0)?) / (2.0 * h))
}

/// Starting guess for the cycles born at a Hopf point of a flow:
/// `x(t) = x0 + 2ρ Re(q e^{iωt})`, `‖q‖ = 1`, at parameter
/// `p0 - ω l1 ρ² / α'` where `α' = d Re λ / dp`. When `l1` or `α'` is not
/// available the parameter is left at `p0`.
pub fn hopf_orbit_guess<F: VectorField>(
    problem: &BifurcationProblem<F>,
    hopf: &SpecialPoint,
    amplitude: f64,
    samples: usize,
) -> Result<OrbitGuess> {
    if problem.kind() != SystemKind::Flow {
        bail!(ContinuationError::invalid(
            "Cycles from a Hopf point need a flow"
        ));
    }
    if hopf.kind != BifurcationType::Hopf {
        bail!(ContinuationError::invalid(format!(
            "Expected a Hopf point, got {:?}",
            hopf.kind
        )));
    }
    if !(amplitude > 0.0) || samples < 2 {
        bail!(ContinuationError::invalid(
            "Hopf orbit guess needs a positive amplitude and at least two samples"
        ));
    }
    let state = &hopf.state;
    let p0 = hopf.param_value;
    let omega = hopf_frequency(problem, hopf, 1e-8)?;
    let jac = problem.field_jacobian(state, p0);
    let lambda = Complex::new(0.0, omega);
    let (q, left) = critical_eigenvectors(&jac, lambda)?;

    let l1 = match &hopf.data {
        Some(SpecialPointData {
            normal_form: Some(NormalForm::Hopf { l1, .. }),
            ..
        }) => Ok(*l1),
        _ => {
            let params = problem.params_at(p0);
            let forms = MultilinearForms::new(problem.field(), state, &params);
            first_lyapunov_coefficient(&forms, &jac, omega, &q, &left)
        }
    };
    let shift = match (l1, eigenvalue_drift(problem, state, p0, lambda)) {
        (Ok(l1), Ok(drift)) if drift.abs() > 1e-12 => -omega * l1 * amplitude * amplitude / drift,
        (l1, drift) => {
            warn!(
                l1 = ?l1.ok(),
                drift = ?drift.ok(),
                "Hopf orbit guess keeps the parameter at the Hopf point"
            );
            0.0
        }
    };

    let period = 2.0 * PI / omega;
    let states = (0..samples)
        .map(|k| {
            let phase = Complex::from_polar(1.0, 2.0 * PI * k as f64 / samples as f64);
            state
                .iter()
                .zip(q.iter())
                .map(|(x, qi)| x + 2.0 * amplitude * (qi * phase).re)
                .collect()
        })
        .collect();
    Ok(OrbitGuess {
        param_value: p0 + shift,
        period,
        states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::continue_parameter;
    use crate::continuation::periodic::test_support::{hopf_oscillator, radii, settings};
    use crate::continuation::periodic::{
        continue_periodic_orbit, OrbitSamples, PeriodicOrbitFamily, TrapezoidConfig,
    };
    use crate::problem::ParameterSet;
    use crate::traits::FnVectorField;

    fn transcritical() -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = x[0] * (p[0] - x[0]);
        });
        BifurcationProblem::new(
            field,
            SystemKind::Flow,
            ParameterSet::new([("p", -0.5)]),
            "p",
            vec![0.0],
        )
        .expect("problem")
    }

    fn transcritical_settings() -> ContinuationSettings {
        ContinuationSettings {
            step_size: 0.02,
            max_step_size: 0.05,
            max_steps: 100,
            param_min: Some(-1.0),
            param_max: Some(0.5),
            ..ContinuationSettings::default()
        }
    }

    #[test]
    fn switches_onto_the_crossing_branch() {
        let problem = transcritical();
        let settings = transcritical_settings();
        let trivial = continue_parameter(&problem, &settings, true).expect("branch");
        let bp = trivial
            .special_points_of(BifurcationType::BranchPoint)
            .next()
            .expect("branch point");

        let ahead = switch_at_branch_point(&problem, &trivial, bp, &settings, true)
            .expect("switched");
        assert!(ahead.len() > 5);
        for point in &ahead.points {
            assert!((point.state[0] - point.param_value).abs() < 1e-8);
            assert!(point.param_value > 0.0);
        }

        let behind = switch_at_branch_point(&problem, &trivial, bp, &settings, false)
            .expect("switched");
        assert!(behind.points.iter().all(|pt| pt.param_value < 0.0));
        assert!(behind
            .points
            .iter()
            .all(|pt| (pt.state[0] - pt.param_value).abs() < 1e-8));
    }

    #[test]
    fn switching_needs_a_branch_point() {
        let problem = transcritical();
        let settings = transcritical_settings();
        let trivial = continue_parameter(&problem, &settings, true).expect("branch");
        let mut fake = trivial.special_points[0].clone();
        fake.kind = BifurcationType::Fold;
        assert!(switch_at_branch_point(&problem, &trivial, &fake, &settings, true).is_err());
    }

    fn origin_hopf() -> SpecialPoint {
        SpecialPoint {
            kind: BifurcationType::Hopf,
            index: 0,
            param_value: 0.0,
            state: vec![0.0, 0.0],
            localized: true,
            data: None,
        }
    }

    #[test]
    fn hopf_guess_matches_the_bifurcating_circles() {
        let problem = hopf_oscillator();
        let guess = hopf_orbit_guess(&problem, &origin_hopf(), 0.2, 64).expect("guess");
        // l1 = -2, ω = 1, α' = 1: β = 2ρ², radius √2 ρ = √β.
        assert!((guess.param_value - 0.08).abs() < 1e-4);
        assert!((guess.period - 2.0 * PI).abs() < 1e-8);
        let samples = OrbitSamples {
            times: Vec::new(),
            states: guess.states.clone(),
        };
        for r in radii(&samples) {
            assert!((r - 0.08f64.sqrt()).abs() < 1e-8);
        }
    }

    #[test]
    fn hopf_guess_starts_a_cycle_branch() {
        let mut problem = hopf_oscillator();
        problem.set_param(-0.2);
        let equilibria = continue_parameter(
            &problem,
            &ContinuationSettings {
                step_size: 0.02,
                max_step_size: 0.05,
                max_steps: 50,
                param_min: Some(-0.5),
                param_max: Some(0.2),
                ..ContinuationSettings::default()
            },
            true,
        )
        .expect("equilibria");
        let hopf = equilibria
            .special_points_of(BifurcationType::Hopf)
            .next()
            .expect("hopf");
        let guess = hopf_orbit_guess(&problem, hopf, 0.25, 50).expect("guess");
        let family = PeriodicOrbitFamily::Trapezoid(TrapezoidConfig { intervals: 50 });
        let cycles =
            continue_periodic_orbit(&problem, &family, &guess, &settings(), true).expect("cycles");
        assert!(cycles.len() > 2);
        let start = &cycles.points[0];
        assert!((start.param_value - guess.param_value).abs() < 1e-6);
    }

    #[test]
    fn maps_have_no_hopf_cycles() {
        let field = FnVectorField::new(2, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] * x[0];
            out[1] = p[0] * x[1];
        });
        let problem = BifurcationProblem::new(
            field,
            SystemKind::Map,
            ParameterSet::new([("a", 0.5)]),
            "a",
            vec![0.0, 0.0],
        )
        .expect("problem");
        assert!(hopf_orbit_guess(&problem, &origin_hopf(), 0.1, 10).is_err());
    }
}

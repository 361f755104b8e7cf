//! Two-parameter fold curves checked against one-parameter runs.

use arclength_core::continuation::codim1_curves::{continue_fold_curve, Codim2Settings};
use arclength_core::{
    continue_parameter, BifurcationProblem, BifurcationType, BranchType, ContinuationSettings,
    FnVectorField, ParameterSet, SystemKind, VectorField,
};

/// `x' = β1 + β2 x - x³`.
fn cusp(beta1: f64, beta2: f64, guess: f64) -> BifurcationProblem<impl VectorField> {
    let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
        out[0] = p[0] + p[1] * x[0] - x[0].powi(3);
    });
    BifurcationProblem::new(
        field,
        SystemKind::Flow,
        ParameterSet::new([("beta1", beta1), ("beta2", beta2)]),
        "beta1",
        vec![guess],
    )
    .expect("problem")
}

fn settings(param_min: f64, param_max: f64, max_steps: usize) -> ContinuationSettings {
    ContinuationSettings {
        step_size: 0.02,
        max_step_size: 0.1,
        max_steps,
        param_min: Some(param_min),
        param_max: Some(param_max),
        ..ContinuationSettings::default()
    }
}

/// β1 of the first fold met when lowering β1 from 2 at fixed β2.
fn upper_fold(beta2: f64) -> f64 {
    let problem = cusp(2.0, beta2, 2.5);
    let branch = continue_parameter(&problem, &settings(-5.0, 3.0, 400), false).expect("branch");
    let fold = branch
        .special_points_of(BifurcationType::Fold)
        .min_by(|a, b| b.state[0].total_cmp(&a.state[0]))
        .expect("fold");
    fold.param_value
}

#[test]
fn fold_curve_points_are_folds_of_the_sliced_problem() {
    let problem = cusp(2.0, 3.0, 2.0);
    let equilibria =
        continue_parameter(&problem, &settings(-5.0, 3.0, 400), false).expect("equilibria");
    let fold = equilibria
        .special_points_of(BifurcationType::Fold)
        .find(|f| f.state[0] > 0.0)
        .expect("upper fold");
    assert!((fold.param_value + 2.0).abs() < 1e-6);

    let curve = continue_fold_curve(
        &problem,
        fold,
        "beta2",
        &settings(-2.5, 0.5, 60),
        Codim2Settings::default(),
    )
    .expect("fold curve");
    assert_eq!(curve.branch_type, BranchType::FoldCurve);
    assert!(curve.len() > 10);

    for point in &curve.points {
        let (beta1, beta2, x) = (point.param_value, point.state[0], point.state[1]);
        assert!((beta1 + beta2 * x - x.powi(3)).abs() < 1e-8);
        assert!((beta2 - 3.0 * x * x).abs() < 1e-6, "not a fold at β2 = {beta2}");
    }

    // Spot-check a few curve points away from the cusp against fresh
    // one-parameter runs.
    let mut checked = 0;
    let upper = curve
        .points
        .iter()
        .filter(|pt| pt.state[0] > 1.0 && pt.state[1] > 0.0);
    for point in upper.step_by(3) {
        let beta2 = point.state[0];
        assert!((upper_fold(beta2) - point.param_value).abs() < 1e-6);
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn frozen_and_refreshed_borders_trace_the_same_curve() {
    let problem = cusp(2.0, 3.0, 2.0);
    let equilibria =
        continue_parameter(&problem, &settings(-5.0, 3.0, 400), false).expect("equilibria");
    let fold = equilibria
        .special_points_of(BifurcationType::Fold)
        .find(|f| f.state[0] > 0.0)
        .expect("upper fold");
    let run = |update_minaug_every_step: bool| {
        continue_fold_curve(
            &problem,
            fold,
            "beta2",
            &settings(-2.5, -1.0, 20),
            Codim2Settings {
                update_minaug_every_step,
                detect_codim2_bifurcation: false,
            },
        )
        .expect("fold curve")
    };
    let refreshed = run(true);
    let frozen = run(false);
    for point in refreshed.points.iter().chain(&frozen.points) {
        let (beta2, x) = (point.state[0], point.state[1]);
        assert!((beta2 - 3.0 * x * x).abs() < 1e-6);
    }
    assert!(refreshed.special_points.is_empty());
}

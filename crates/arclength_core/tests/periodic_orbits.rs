//! Periodic-orbit families started from Hopf points and tracked through
//! cycle folds.

use std::f64::consts::PI;

use arclength_core::continuation::codim1_curves::Codim2Settings;
use arclength_core::continuation::periodic::{
    continue_cycle_fold_curve, continue_periodic_orbit, orbit_amplitude, point_period,
    CollocationConfig, OrbitGuess, PeriodicOrbit, PeriodicOrbitFamily, PeriodicOrbitProblem,
    ShootingConfig, TrapezoidConfig,
};
use arclength_core::continuation::switching::hopf_orbit_guess;
use arclength_core::{
    continue_parameter, BifurcationProblem, BifurcationType, ContinuationPoint,
    ContinuationSettings, FnVectorField, ParameterSet, SystemKind, VectorField,
};
use nalgebra::DVector;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Brusselator with `a = 1`: Hopf at `b = 2` with `ω = 1`.
fn brusselator() -> BifurcationProblem<impl VectorField> {
    let field = FnVectorField::new(2, |u: &[f64], p: &[f64], out: &mut [f64]| {
        let (x, y) = (u[0], u[1]);
        let (a, b) = (p[0], p[1]);
        out[0] = a - (b + 1.0) * x + x * x * y;
        out[1] = b * x - x * x * y;
    });
    BifurcationProblem::new(
        field,
        SystemKind::Flow,
        ParameterSet::new([("a", 1.0), ("b", 1.5)]),
        "b",
        vec![1.0, 1.5],
    )
    .expect("problem")
}

fn families() -> [PeriodicOrbitFamily; 3] {
    [
        PeriodicOrbitFamily::Trapezoid(TrapezoidConfig { intervals: 100 }),
        PeriodicOrbitFamily::Collocation(CollocationConfig::default()),
        PeriodicOrbitFamily::Shooting(ShootingConfig {
            sections: 40,
            integrator_steps: 40,
            parallel: true,
        }),
    ]
}

fn aug_of(point: &ContinuationPoint) -> DVector<f64> {
    let mut aug = DVector::zeros(point.state.len() + 1);
    aug[0] = point.param_value;
    aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
    aug
}

/// Period and amplitude of one stored cycle.
struct CycleSummary {
    param: f64,
    period: f64,
    amplitude: Vec<f64>,
}

/// Linear interpolation of the reference family at `param`, from its two
/// points closest in parameter.
fn interpolate(reference: &[CycleSummary], param: f64) -> (f64, Vec<f64>) {
    let mut nearest: Vec<&CycleSummary> = reference.iter().collect();
    nearest.sort_by(|a, b| (a.param - param).abs().total_cmp(&(b.param - param).abs()));
    let (a, b) = (nearest[0], nearest[1]);
    if (b.param - a.param).abs() < 1e-12 {
        return (a.period, a.amplitude.clone());
    }
    let t = (param - a.param) / (b.param - a.param);
    let lerp = |x: f64, y: f64| x + t * (y - x);
    let amplitude = a
        .amplitude
        .iter()
        .zip(&b.amplitude)
        .map(|(&x, &y)| lerp(x, y))
        .collect();
    (lerp(a.period, b.period), amplitude)
}

#[test]
fn discretizations_agree_on_the_cycles_born_at_a_hopf_point() {
    init_tracing();
    let problem = brusselator();
    let equilibria = continue_parameter(
        &problem,
        &ContinuationSettings {
            step_size: 0.02,
            max_step_size: 0.05,
            max_steps: 100,
            param_min: Some(1.0),
            param_max: Some(2.5),
            ..ContinuationSettings::default()
        },
        true,
    )
    .expect("equilibria");
    let hopf = equilibria
        .special_points_of(BifurcationType::Hopf)
        .next()
        .expect("hopf");
    assert!((hopf.param_value - 2.0).abs() < 1e-6);

    let guess: OrbitGuess = hopf_orbit_guess(&problem, hopf, 0.05, 80).expect("guess");
    assert!(guess.param_value > 2.0, "supercritical cycles exist for b > 2");
    let settings = ContinuationSettings {
        step_size: 0.01,
        max_step_size: 0.02,
        max_steps: 5,
        param_min: Some(guess.param_value - 0.05),
        param_max: Some(2.5),
        ..ContinuationSettings::default()
    };

    let mut families_summaries = Vec::new();
    for family in families() {
        let branch = continue_periodic_orbit(&problem, &family, &guess, &settings, true)
            .unwrap_or_else(|err| panic!("{} failed: {err:#}", family.name()));
        assert!(branch.len() > 3, "{} stopped early", family.name());
        let start = &branch.points[0];
        assert_eq!(start.param_value, guess.param_value);
        assert!(start.stable, "{} start is unstable", family.name());
        let mut orbit = PeriodicOrbit::new(&problem, &family, None).expect("orbit");
        let summaries: Vec<CycleSummary> = branch
            .points
            .iter()
            .map(|point| {
                orbit.reset_from(point).expect("reset");
                CycleSummary {
                    param: point.param_value,
                    period: point_period(point).expect("period"),
                    amplitude: orbit_amplitude(&orbit.orbit(&aug_of(point))),
                }
            })
            .collect();
        families_summaries.push((family.name(), summaries));
    }

    let (_, reference) = &families_summaries[1];
    assert!((reference[0].period - 2.0 * PI).abs() < 0.1);
    for (name, summaries) in &families_summaries {
        for cycle in summaries {
            let (period, amplitude) = interpolate(reference, cycle.param);
            assert!(
                (cycle.period - period).abs() < 5e-3,
                "{name} at b = {}: period {} vs {period}",
                cycle.param,
                cycle.period
            );
            for (a, r) in cycle.amplitude.iter().zip(&amplitude) {
                assert!(
                    (a - r).abs() < 0.05 * r,
                    "{name} at b = {}: amplitude {a} vs {r}",
                    cycle.param
                );
            }
        }
    }
    // The family grows away from the Hopf point.
    for (name, summaries) in &families_summaries {
        let first = &summaries[0];
        let last = summaries.last().expect("points");
        assert!(last.param > first.param, "{name}");
        assert!(last.amplitude[0] > first.amplitude[0], "{name}");
    }
}

/// `ṙ = r(β1 + β2 r² - r⁴)`, `θ̇ = 1` in Cartesian form: circular cycles
/// with a cycle fold on `β1 = -β2²/4` at `r² = β2/2`.
fn bautin_cycles() -> BifurcationProblem<impl VectorField> {
    let field = FnVectorField::new(2, |u: &[f64], p: &[f64], out: &mut [f64]| {
        let (x, y) = (u[0], u[1]);
        let r2 = x * x + y * y;
        let g = p[0] + p[1] * r2 - r2 * r2;
        out[0] = x * g - y;
        out[1] = y * g + x;
    });
    BifurcationProblem::new(
        field,
        SystemKind::Flow,
        ParameterSet::new([("beta1", -0.1), ("beta2", 1.0)]),
        "beta1",
        vec![0.0, 0.0],
    )
    .expect("problem")
}

fn circle(beta1: f64, beta2: f64, samples: usize) -> OrbitGuess {
    let r = ((beta2 + (beta2 * beta2 + 4.0 * beta1).sqrt()) / 2.0).sqrt();
    OrbitGuess {
        param_value: beta1,
        period: 2.0 * PI,
        states: (0..samples)
            .map(|k| {
                let t = 2.0 * PI * k as f64 / samples as f64;
                vec![r * t.cos(), r * t.sin()]
            })
            .collect(),
    }
}

#[test]
fn cycle_folds_are_detected_and_tracked_in_two_parameters() {
    let problem = bautin_cycles();
    let family = PeriodicOrbitFamily::Trapezoid(TrapezoidConfig { intervals: 40 });
    let branch = continue_periodic_orbit(
        &problem,
        &family,
        &circle(-0.1, 1.0, 40),
        &ContinuationSettings {
            step_size: 0.05,
            max_step_size: 0.2,
            max_steps: 150,
            param_min: Some(-1.0),
            param_max: Some(-0.05),
            ..ContinuationSettings::default()
        },
        false,
    )
    .expect("cycles");

    let folds: Vec<_> = branch
        .special_points_of(BifurcationType::CycleFold)
        .collect();
    assert_eq!(folds.len(), 1);
    let fold = folds[0];
    assert!((fold.param_value + 0.25).abs() < 1e-6);
    let r2 = fold.state[0].powi(2) + fold.state[1].powi(2);
    assert!((r2 - 0.5).abs() < 1e-4);
    // The outer cycles are stable, the inner ones past the fold are not.
    let outer = &branch.points[branch.endpoint(true).expect("start")];
    let inner = &branch.points[branch.endpoint(false).expect("end")];
    assert!(outer.stable);
    assert!(!inner.stable);
    assert!(inner.param_value > -0.25);

    let curve = continue_cycle_fold_curve(
        &problem,
        &family,
        &branch,
        fold,
        "beta2",
        &ContinuationSettings {
            step_size: 0.02,
            max_step_size: 0.05,
            max_steps: 15,
            param_min: Some(-0.6),
            param_max: Some(-0.1),
            ..ContinuationSettings::default()
        },
        Codim2Settings {
            detect_codim2_bifurcation: false,
            ..Codim2Settings::default()
        },
    )
    .expect("cycle fold curve");
    assert!(curve.len() > 5);
    for point in &curve.points {
        let beta1 = point.param_value;
        let beta2 = point.state[0];
        assert!((beta1 + beta2 * beta2 / 4.0).abs() < 1e-6, "β1 = {beta1}, β2 = {beta2}");
        let r2 = point.state[1].powi(2) + point.state[2].powi(2);
        assert!((r2 - beta2 / 2.0).abs() < 1e-5);
    }
}

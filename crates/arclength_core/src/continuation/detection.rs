//! Localisation of test-function zeros inside an accepted step.
//!
//! The bracket is the arclength interval `[0, ds]` measured from the previous
//! point along its tangent; every trial point is re-corrected with the PALC
//! corrector so it lies on the branch.

use anyhow::{anyhow, Result};
use nalgebra::DVector;
use tracing::debug;

use super::problem::{ContinuationProblem, PointDiagnostics, SpectralMonitor};
use super::types::{BifurcationType, ContinuationSettings};
use super::util::bordered_tangent;
use super::correct_palc;
use crate::linalg::Oracles;

#[derive(Debug, Clone)]
pub struct LocatedPoint {
    pub kind: BifurcationType,
    pub aug_state: DVector<f64>,
    pub tangent: DVector<f64>,
    /// Arclength from the bracketing start point.
    pub arclength: f64,
    pub diagnostics: PointDiagnostics,
    /// Whether the bisection met `bisection_tolerance`.
    pub converged: bool,
}

/// Bisects the sign change of `kind` between the previous point (arclength 0)
/// and the accepted point (arclength `ds`).
#[allow(clippy::too_many_arguments)]
pub fn locate_special_point<P: ContinuationProblem + ?Sized>(
    problem: &mut P,
    prev_aug: &DVector<f64>,
    prev_tangent: &DVector<f64>,
    prev_value: f64,
    kind: BifurcationType,
    ds: f64,
    settings: &ContinuationSettings,
    oracles: Oracles<'_>,
    monitor: &SpectralMonitor<'_>,
) -> Result<LocatedPoint> {
    let mut lo = 0.0;
    let mut hi = ds;
    let mut f_lo = prev_value;
    let mut best: Option<(f64, DVector<f64>, PointDiagnostics)> = None;
    let mut converged = false;

    for iteration in 0..settings.bisection_steps.max(1) {
        let mid = 0.5 * (lo + hi);
        let outcome = correct_palc(
            problem,
            prev_aug,
            prev_tangent,
            mid,
            &settings.corrector,
            oracles.linear,
        )?;
        let diagnostics = problem.diagnostics(&outcome.state, monitor)?;
        let f_mid = diagnostics
            .test_values
            .value_for(kind)
            .ok_or_else(|| anyhow!("Test function {kind:?} disappeared during localisation"))?;
        best = Some((mid, outcome.state, diagnostics));

        if f_mid.abs() < settings.bisection_tolerance
            || (hi - lo).abs() < settings.bisection_tolerance
        {
            debug!(?kind, iteration, arclength = mid, "Special point localised");
            converged = true;
            break;
        }
        if f_lo * f_mid <= 0.0 {
            hi = mid;
        } else {
            lo = mid;
            f_lo = f_mid;
        }
    }

    let (arclength, aug_state, diagnostics) =
        best.ok_or_else(|| anyhow!("Bisection performed no iterations"))?;
    let j_ext = problem.extended_jacobian(&aug_state)?;
    let tangent = bordered_tangent(&j_ext, prev_tangent, oracles.linear)?;

    Ok(LocatedPoint {
        kind,
        aug_state,
        tangent,
        arclength,
        diagnostics,
        converged,
    })
}

/// Folds turn the branch around in `p`; otherwise the zero is a branch point.
pub fn classify_fold(
    kind: BifurcationType,
    prev_tangent: &DVector<f64>,
    next_tangent: &DVector<f64>,
) -> BifurcationType {
    if kind.is_fold_like() && prev_tangent[0] * next_tangent[0] > 0.0 {
        BifurcationType::BranchPoint
    } else {
        kind
    }
}

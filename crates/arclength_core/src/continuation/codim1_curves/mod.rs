//! Two-parameter continuation of codim-1 bifurcation curves.
//!
//! Each curve is a minimally augmented system: the inner problem's residual
//! plus the scalar (fold) or complex (Hopf, Neimark-Sacker) test function of a
//! bordered linear system, which vanishes exactly on the curve. The augmented
//! layout is `[p1, p2, x...]`, with the auxiliary frequency or angle appended
//! for the Hopf and Neimark-Sacker curves.

mod fold_curve;
mod hopf_curve;
mod ns_curve;

pub use fold_curve::{continue_fold_curve, continue_fold_curve_with_problem, FoldCurveProblem};
pub use hopf_curve::{continue_hopf_curve, continue_hopf_curve_with_problem, HopfCurveProblem};
pub(crate) use hopf_curve::hopf_frequency;
pub use ns_curve::{continue_ns_curve, continue_ns_curve_with_problem, NeimarkSackerCurveProblem};

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::problem::ContinuationProblem;
use super::StepUpdate;
use crate::error::ContinuationError;
use crate::linalg::{bordered_null_solve, complex_bordered_null_solve};
use crate::traits::SystemKind;

/// Relative step of the finite differences taken along null vectors.
const HESSIAN_STEP: f64 = 1e-5;

/// Policy flags of a codim-2 run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Codim2Settings {
    /// Refresh the bordering vectors from the accepted point after every step.
    /// When off they stay at their initial values.
    pub update_minaug_every_step: bool,
    /// Monitor codim-2 test functions along the curve.
    pub detect_codim2_bifurcation: bool,
}

impl Default for Codim2Settings {
    fn default() -> Self {
        Self {
            update_minaug_every_step: true,
            detect_codim2_bifurcation: true,
        }
    }
}

/// A continuation problem that also exposes a second parameter, the input of
/// the codim-1 curve trackers.
pub trait TwoParameterProblem: ContinuationProblem {
    /// `None` when no second parameter was selected.
    fn secondary_parameter(&self) -> Option<f64>;

    fn set_secondary_parameter(&mut self, value: f64);

    /// `None` for problems that are neither equilibria nor fixed points
    /// (periodic orbits), which only support fold tracking.
    fn system_kind(&self) -> Option<SystemKind>;

    /// `∂F/∂p2` at `[p1, x]`, by central differences unless overridden.
    fn secondary_derivative(&mut self, aug_state: &DVector<f64>) -> Result<DVector<f64>> {
        let p2 = self
            .secondary_parameter()
            .ok_or_else(|| ContinuationError::invalid("No secondary parameter selected"))?;
        let h = 1e-6 * (1.0 + p2.abs());
        let n = self.dimension();
        let mut plus = DVector::zeros(n);
        let mut minus = DVector::zeros(n);
        self.set_secondary_parameter(p2 + h);
        let forward = self.residual(aug_state, &mut plus);
        self.set_secondary_parameter(p2 - h);
        let backward = self.residual(aug_state, &mut minus);
        self.set_secondary_parameter(p2);
        forward?;
        backward?;
        Ok((plus - minus) / (2.0 * h))
    }

    /// Quadratic fold coefficient for right/left null vectors `v`, `w`.
    fn fold_coefficient(
        &mut self,
        _aug_state: &DVector<f64>,
        _v: &DVector<f64>,
        _w: &DVector<f64>,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    /// First Lyapunov coefficient at a Hopf point with frequency `omega`.
    fn first_lyapunov(
        &mut self,
        _aug_state: &DVector<f64>,
        _omega: f64,
        _q: &DVector<Complex<f64>>,
        _p: &DVector<Complex<f64>>,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    /// Cubic Neimark-Sacker coefficient at multipliers `e^{±iθ}`.
    fn neimark_sacker_coefficient(
        &mut self,
        _aug_state: &DVector<f64>,
        _theta: f64,
        _q: &DVector<Complex<f64>>,
        _p: &DVector<Complex<f64>>,
    ) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Bordering vectors of `[A b; cᵀ 0]`.
#[derive(Debug, Clone)]
pub struct Borders {
    /// Approximates the right null vector; the bottom row.
    pub v: DVector<f64>,
    /// Approximates the left null vector; the last column.
    pub w: DVector<f64>,
}

impl Borders {
    pub fn new(v: DVector<f64>, w: DVector<f64>) -> Self {
        Self { v, w }
    }

    /// Right null vector `v` with test function `σ`, and left null vector
    /// `w` of `A` solving the adjoint bordered system.
    pub fn solve(&self, a: &DMatrix<f64>) -> Result<(DVector<f64>, f64, DVector<f64>)> {
        let (v, sigma) = bordered_null_solve(a, &self.w, &self.v)?;
        let (w, _) = bordered_null_solve(&a.transpose(), &self.v, &self.w)?;
        Ok((v, sigma, w))
    }

    /// Replaces the borders by the normalized null vectors at `a`.
    pub fn update(&mut self, a: &DMatrix<f64>) -> Result<()> {
        let (v, _, w) = self.solve(a)?;
        if v.norm() > 1e-12 && w.norm() > 1e-12 {
            self.v = v.normalize();
            self.w = w.normalize();
        }
        Ok(())
    }
}

/// Complex bordering vectors of `[M b; cᴴ 0]`.
#[derive(Debug, Clone)]
pub struct ComplexBorders {
    /// Approximates the right eigenvector.
    pub c: DVector<Complex<f64>>,
    /// Approximates the left eigenvector.
    pub b: DVector<Complex<f64>>,
}

/// Solution of the complex bordered pair at one point.
pub struct ComplexBorderedSolution {
    pub q: DVector<Complex<f64>>,
    pub sigma: Complex<f64>,
    /// Adjoint vector with `ψᴴ M = -s cᴴ`, `ψᴴ b = 1`.
    pub psi: DVector<Complex<f64>>,
}

impl ComplexBorders {
    pub fn solve(&self, m: &DMatrix<Complex<f64>>) -> Result<ComplexBorderedSolution> {
        let (q, sigma) = complex_bordered_null_solve(m, &self.b, &self.c)?;
        let (psi, _) = complex_bordered_null_solve(&m.adjoint(), &self.c, &self.b)?;
        Ok(ComplexBorderedSolution { q, sigma, psi })
    }

    pub fn update(&mut self, m: &DMatrix<Complex<f64>>) -> Result<()> {
        let solution = self.solve(m)?;
        if solution.q.norm() > 1e-12 && solution.psi.norm() > 1e-12 {
            self.c = solution.q.unscale(solution.q.norm());
            self.b = solution.psi.unscale(solution.psi.norm());
        }
        Ok(())
    }
}

/// Splits a curve state `[p1, p2, x..., extra...]` into `([p1, x], p2)`.
pub(crate) fn inner_aug(aug: &DVector<f64>, n: usize) -> (DVector<f64>, f64) {
    let mut inner = DVector::zeros(n + 1);
    inner[0] = aug[0];
    inner.rows_mut(1, n).copy_from(&aug.rows(2, n));
    (inner, aug[1])
}

/// Jacobian of the inner residual with respect to its state only.
pub(crate) fn state_jacobian<P: TwoParameterProblem + ?Sized>(
    inner: &mut P,
    inner_state: &DVector<f64>,
    p2: f64,
) -> Result<DMatrix<f64>> {
    inner.set_secondary_parameter(p2);
    let n = inner.dimension();
    Ok(inner.extended_jacobian(inner_state)?.columns(1, n).into_owned())
}

/// `[∂F/∂p1 | ∂F/∂p2 | ∂F/∂x]` of the inner problem at `[p1, x]`, `p2`.
pub(crate) fn full_jacobian<P: TwoParameterProblem + ?Sized>(
    inner: &mut P,
    inner_state: &DVector<f64>,
    p2: f64,
) -> Result<DMatrix<f64>> {
    inner.set_secondary_parameter(p2);
    let n = inner.dimension();
    let j_ext = inner.extended_jacobian(inner_state)?;
    let dp2 = inner.secondary_derivative(inner_state)?;
    let mut full = DMatrix::zeros(n, n + 2);
    full.set_column(0, &j_ext.column(0));
    full.set_column(1, &dp2);
    full.view_mut((0, 2), (n, n)).copy_from(&j_ext.columns(1, n));
    Ok(full)
}

/// Column `k` holds `∂/∂z_k (J(z) d)` for `z = [p1, p2, x]`, by central
/// differences of [`full_jacobian`] along the state direction `d`.
pub(crate) fn directional_hessian<P: TwoParameterProblem + ?Sized>(
    inner: &mut P,
    inner_state: &DVector<f64>,
    p2: f64,
    direction: &DVector<f64>,
) -> Result<DMatrix<f64>> {
    let n = inner.dimension();
    let scale = direction.norm();
    if scale == 0.0 {
        return Ok(DMatrix::zeros(n, n + 2));
    }
    let eps = HESSIAN_STEP * (1.0 + inner_state.norm()) / scale;
    let mut shifted = inner_state.clone();
    shifted.rows_mut(1, n).axpy(eps, direction, 1.0);
    let plus = full_jacobian(inner, &shifted, p2)?;
    shifted.rows_mut(1, n).axpy(-2.0 * eps, direction, 1.0);
    let minus = full_jacobian(inner, &shifted, p2)?;
    Ok((plus - minus) / (2.0 * eps))
}

/// Gradient of `σ` with respect to `[p1, p2, x]` for a complex bordered
/// system with null vector `q` and adjoint vector `psi`:
/// `σ_z = -ψᴴ (∂_z J) q`.
pub(crate) fn complex_sigma_gradient<P: TwoParameterProblem + ?Sized>(
    inner: &mut P,
    inner_state: &DVector<f64>,
    p2: f64,
    q: &DVector<Complex<f64>>,
    psi: &DVector<Complex<f64>>,
) -> Result<Vec<Complex<f64>>> {
    let re = directional_hessian(inner, inner_state, p2, &q.map(|c| c.re))?;
    let im = directional_hessian(inner, inner_state, p2, &q.map(|c| c.im))?;
    Ok((0..re.ncols())
        .map(|k| {
            let column: DVector<Complex<f64>> = re
                .column(k)
                .iter()
                .zip(im.column(k).iter())
                .map(|(&r, &i)| Complex::new(r, i))
                .collect::<Vec<_>>()
                .into();
            -psi.dotc(&column)
        })
        .collect())
}

/// Lifts an inner remap (`[p1, x]` and its tangent) back into curve
/// coordinates, keeping `p2` and the trailing auxiliary unknowns.
pub(crate) fn lift_update(
    update: StepUpdate,
    aug: &DVector<f64>,
    tangent: &DVector<f64>,
    n_old: usize,
) -> Option<(DVector<f64>, DVector<f64>)> {
    let StepUpdate::Remapped {
        aug_state,
        tangent: inner_tangent,
    } = update
    else {
        return None;
    };
    let n_new = aug_state.len() - 1;
    let extra = aug.len() - 2 - n_old;
    let lift = |inner: &DVector<f64>, outer: &DVector<f64>| {
        let mut lifted = DVector::zeros(n_new + 2 + extra);
        lifted[0] = inner[0];
        lifted[1] = outer[1];
        lifted.rows_mut(2, n_new).copy_from(&inner.rows(1, n_new));
        lifted
            .rows_mut(2 + n_new, extra)
            .copy_from(&outer.rows(2 + n_old, extra));
        lifted
    };
    Some((lift(&aug_state, aug), lift(&inner_tangent, tangent)))
}

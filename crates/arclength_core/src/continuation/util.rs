//! Tangent computation and spectral test functions shared by every problem
//! type.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex;

use super::problem::{PointDiagnostics, TestFunctionValues};
use super::types::{BifurcationType, ContinuationPoint};
use crate::error::ContinuationError;
use crate::linalg::LinearSolver;

/// Unit null vector of an `n × (n+1)` extended Jacobian.
///
/// Uses the smallest eigenvector of the Gram matrix, falling back to bordered
/// solves against each coordinate direction.
pub fn compute_nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    if dim == 0 || j_ext.ncols() != dim + 1 {
        bail!(ContinuationError::invalid(format!(
            "Failed to compute tangent: expected an n x (n+1) matrix, got {}x{}",
            dim,
            j_ext.ncols()
        )));
    }
    let tangent = match gram_null_vector(j_ext) {
        Some(vec) => vec,
        None => coordinate_bordered_null_vector(j_ext)?,
    };
    Ok(tangent.normalize())
}

fn gram_null_vector(j_ext: &DMatrix<f64>) -> Option<DVector<f64>> {
    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let eig = SymmetricEigen::new(gram);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let vec = eig.eigenvectors.column(min_idx).into_owned();
    (vec.norm_squared() > 0.0 && vec.iter().all(|v| v.is_finite())).then_some(vec)
}

fn coordinate_bordered_null_vector(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    for col in 0..=dim {
        a.row_mut(dim).fill(0.0);
        a[(dim, col)] = 1.0;
        if let Some(solution) = a.clone().lu().solve(&rhs) {
            if solution.iter().all(|v| v.is_finite()) && solution.norm_squared() != 0.0 {
                return Ok(solution);
            }
        }
    }
    bail!(ContinuationError::singular(
        "Failed to compute tangent: all bordered solves singular"
    ))
}

/// Tangent continuing `reference`: solves `[J_ext; refᵀ] t = [0; 1]`.
///
/// Falls back to the null-space tangent oriented along `reference` when the
/// bordered matrix is singular.
pub fn bordered_tangent(
    j_ext: &DMatrix<f64>,
    reference: &DVector<f64>,
    solver: &dyn LinearSolver,
) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    a.row_mut(dim).copy_from(&reference.transpose());
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    let tangent = match solver.solve(&a, &rhs) {
        Ok(t) if t.norm() > 0.0 => t.normalize(),
        _ => {
            let t = compute_nullspace_tangent(j_ext)?;
            if t.dot(reference) < 0.0 {
                -t
            } else {
                t
            }
        }
    };
    Ok(tangent)
}

/// Converts a ContinuationPoint to an augmented state vector [p, x...].
pub fn continuation_point_to_aug(point: &ContinuationPoint) -> DVector<f64> {
    let mut aug = DVector::zeros(point.state.len() + 1);
    aug[0] = point.param_value;
    aug.rows_mut(1, point.state.len())
        .copy_from_slice(&point.state);
    aug
}

pub fn aug_to_parts(aug: &DVector<f64>) -> (f64, Vec<f64>) {
    (aug[0], aug.iter().skip(1).cloned().collect())
}

/// Signed distance of the closest candidate to the critical set, with the
/// sign flipped once per candidate on the unstable side. Crossing the
/// critical set changes the sign; pairs entering together do not.
fn signed_distance(candidates: impl Iterator<Item = (f64, bool)>) -> Option<f64> {
    let mut unstable = 0usize;
    let mut closest = f64::INFINITY;
    let mut any = false;
    for (distance, is_unstable) in candidates {
        any = true;
        closest = closest.min(distance);
        if is_unstable {
            unstable += 1;
        }
    }
    any.then(|| if unstable % 2 == 0 { closest } else { -closest })
}

/// Fold and Hopf test functions from the eigenvalues of an equilibrium.
pub fn equilibrium_diagnostics(eigenvalues: Vec<Complex<f64>>, imag_tol: f64) -> PointDiagnostics {
    let mut tests = TestFunctionValues::new();

    let fold = signed_distance(
        eigenvalues
            .iter()
            .filter(|l| l.im.abs() <= imag_tol)
            .map(|l| (l.re.abs(), l.re > 0.0)),
    );
    tests.push(BifurcationType::Fold, fold.unwrap_or(1.0));

    let pairs: Vec<&Complex<f64>> = eigenvalues.iter().filter(|l| l.im > imag_tol).collect();
    let hopf = signed_distance(pairs.iter().map(|l| (l.re.abs(), l.re > 0.0)));
    tests.push_with_signature(BifurcationType::Hopf, hopf.unwrap_or(1.0), pairs.len() as i32);

    let stable = eigenvalues.iter().all(|l| l.re < 0.0);
    PointDiagnostics {
        test_values: tests,
        eigenvalues,
        stable,
    }
}

/// Fold (μ = 1), period-doubling (μ = −1) and Neimark-Sacker (|μ| = 1) test
/// functions from Floquet / map multipliers.
///
/// `fold_kind` is [`BifurcationType::Fold`] for fixed points of maps and
/// [`BifurcationType::CycleFold`] for periodic orbits.
pub fn multiplier_diagnostics(
    multipliers: Vec<Complex<f64>>,
    imag_tol: f64,
    fold_kind: BifurcationType,
) -> PointDiagnostics {
    let mut tests = TestFunctionValues::new();
    let real: Vec<f64> = multipliers
        .iter()
        .filter(|m| m.im.abs() <= imag_tol)
        .map(|m| m.re)
        .collect();

    let fold = signed_distance(real.iter().map(|&m| ((m - 1.0).abs(), m > 1.0)));
    tests.push(fold_kind, fold.unwrap_or(1.0));

    let flip = signed_distance(real.iter().map(|&m| ((m + 1.0).abs(), m < -1.0)));
    tests.push(BifurcationType::PeriodDoubling, flip.unwrap_or(1.0));

    let pairs: Vec<&Complex<f64>> = multipliers.iter().filter(|m| m.im > imag_tol).collect();
    let ns = signed_distance(pairs.iter().map(|m| ((m.norm() - 1.0).abs(), m.norm() > 1.0)));
    tests.push_with_signature(
        BifurcationType::NeimarkSacker,
        ns.unwrap_or(1.0),
        pairs.len() as i32,
    );

    let stable = multipliers.iter().all(|m| m.norm() < 1.0);
    PointDiagnostics {
        test_values: tests,
        eigenvalues: multipliers,
        stable,
    }
}

/// Removes the multiplier closest to `1`, which every periodic orbit of an
/// autonomous flow carries.
pub fn drop_trivial_multiplier(multipliers: &mut Vec<Complex<f64>>) {
    if let Some(idx) = closest_to(multipliers, Complex::new(1.0, 0.0)) {
        multipliers.remove(idx);
    }
}

/// Eigenvalue with positive imaginary part closest to the imaginary axis.
pub fn critical_hopf_eigenvalue(
    eigenvalues: &[Complex<f64>],
    imag_tol: f64,
) -> Option<Complex<f64>> {
    eigenvalues
        .iter()
        .filter(|l| l.im > imag_tol)
        .min_by(|a, b| a.re.abs().partial_cmp(&b.re.abs()).unwrap_or(std::cmp::Ordering::Equal))
        .copied()
}

/// Multiplier with positive imaginary part closest to the unit circle.
pub fn critical_ns_multiplier(multipliers: &[Complex<f64>], imag_tol: f64) -> Option<Complex<f64>> {
    multipliers
        .iter()
        .filter(|m| m.im > imag_tol)
        .min_by(|a, b| {
            (a.norm() - 1.0)
                .abs()
                .partial_cmp(&(b.norm() - 1.0).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()
}

/// Index of the value closest to `target`.
pub fn closest_to(values: &[Complex<f64>], target: Complex<f64>) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (i, (v - target).norm()))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::DenseLu;

    #[test]
    fn nullspace_tangent_spans_kernel() {
        let j_ext = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 0.0, 0.0, 1.0, -1.0]);
        let t = compute_nullspace_tangent(&j_ext).expect("tangent");
        assert!((&j_ext * &t).norm() < 1e-12);
        assert!((t.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bordered_tangent_keeps_orientation() {
        let j_ext = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let reference = DVector::from_vec(vec![-1.0, 0.9]);
        let t = bordered_tangent(&j_ext, &reference, &DenseLu).expect("tangent");
        assert!(t.dot(&reference) > 0.0);
        assert!((&j_ext * &t).norm() < 1e-12);
    }

    #[test]
    fn fold_test_changes_sign_when_real_eigenvalue_crosses() {
        let before = equilibrium_diagnostics(
            vec![Complex::new(-0.1, 0.0), Complex::new(-2.0, 0.0)],
            1e-9,
        );
        let after = equilibrium_diagnostics(
            vec![Complex::new(0.05, 0.0), Complex::new(-2.0, 0.0)],
            1e-9,
        );
        assert!(before.stable && !after.stable);
        assert_eq!(
            after.test_values.sign_changes(&before.test_values),
            vec![BifurcationType::Fold]
        );
    }

    #[test]
    fn hopf_test_ignores_real_collision() {
        // Two stable real eigenvalues merge into a stable complex pair.
        let before = equilibrium_diagnostics(
            vec![Complex::new(-0.5, 0.0), Complex::new(-0.6, 0.0)],
            1e-9,
        );
        let after = equilibrium_diagnostics(
            vec![Complex::new(-0.55, 0.1), Complex::new(-0.55, -0.1)],
            1e-9,
        );
        assert!(after.test_values.sign_changes(&before.test_values).is_empty());

        let crossed = equilibrium_diagnostics(
            vec![Complex::new(0.01, 0.1), Complex::new(0.01, -0.1)],
            1e-9,
        );
        assert_eq!(
            crossed.test_values.sign_changes(&after.test_values),
            vec![BifurcationType::Hopf]
        );
    }

    #[test]
    fn multiplier_tests_cover_three_crossings() {
        let before = multiplier_diagnostics(
            vec![
                Complex::new(0.9, 0.0),
                Complex::new(-0.95, 0.0),
                Complex::new(0.0, 0.9),
                Complex::new(0.0, -0.9),
            ],
            1e-9,
            BifurcationType::CycleFold,
        );
        let after = multiplier_diagnostics(
            vec![
                Complex::new(1.1, 0.0),
                Complex::new(-1.05, 0.0),
                Complex::new(0.0, 1.1),
                Complex::new(0.0, -1.1),
            ],
            1e-9,
            BifurcationType::CycleFold,
        );
        let mut crossed = after.test_values.sign_changes(&before.test_values);
        crossed.sort_by_key(|k| format!("{k:?}"));
        assert_eq!(
            crossed,
            vec![
                BifurcationType::CycleFold,
                BifurcationType::NeimarkSacker,
                BifurcationType::PeriodDoubling
            ]
        );
    }

    #[test]
    fn trivial_multiplier_is_removed() {
        let mut mults = vec![
            Complex::new(0.3, 0.0),
            Complex::new(1.0 + 1e-9, 0.0),
            Complex::new(-0.2, 0.0),
        ];
        drop_trivial_multiplier(&mut mults);
        assert_eq!(mults.len(), 2);
        assert!(mults.iter().all(|m| (m.re - 1.0).abs() > 0.5));
    }
}

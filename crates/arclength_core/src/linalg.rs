//! Linear and eigen oracles plus the small bordered solves used throughout the
//! crate.
//!
//! The continuation engine only talks to [`LinearSolver`] and [`EigenSolver`];
//! [`DenseLu`] and [`DenseEigen`] are the default dense implementations.

use crate::error::ContinuationError;
use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

/// Solves `A x = b`. Fails with [`ContinuationError::SingularJacobian`].
pub trait LinearSolver: Sync {
    fn solve(&self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>>;
}

/// Eigenpairs ordered by decreasing real part.
#[derive(Debug, Clone, Default)]
pub struct EigenDecomposition {
    pub values: Vec<Complex<f64>>,
    pub vectors: Vec<DVector<Complex<f64>>>,
}

/// Returns `count` eigenpairs (all of them when `count == 0`), ordered by
/// decreasing real part.
pub trait EigenSolver: Sync {
    fn eigen(&self, matrix: &DMatrix<f64>, count: usize) -> Result<EigenDecomposition>;

    fn eigenvalues(&self, matrix: &DMatrix<f64>, count: usize) -> Result<Vec<Complex<f64>>> {
        Ok(self.eigen(matrix, count)?.values)
    }
}

/// Dense LU factorisation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn solve(&self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() != rhs.len() {
            bail!(ContinuationError::invalid(format!(
                "Linear system shape mismatch: {}x{} matrix, rhs of length {}",
                matrix.nrows(),
                matrix.ncols(),
                rhs.len()
            )));
        }
        let solution = matrix
            .clone()
            .lu()
            .solve(rhs)
            .ok_or_else(|| ContinuationError::singular("LU factorisation is singular"))?;
        if solution.iter().any(|v| !v.is_finite()) {
            bail!(ContinuationError::singular(
                "LU solve produced non-finite values"
            ));
        }
        Ok(solution)
    }
}

/// Dense Schur-based eigenvalues with SVD eigenvectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEigen;

impl DenseEigen {
    fn sorted_values(matrix: &DMatrix<f64>) -> Result<Vec<Complex<f64>>> {
        if matrix.nrows() != matrix.ncols() {
            bail!(ContinuationError::invalid("Eigenvalues of a non-square matrix"));
        }
        if matrix.nrows() == 0 {
            return Ok(Vec::new());
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            bail!(ContinuationError::singular(
                "Eigenvalues requested for a non-finite matrix"
            ));
        }
        let mut values: Vec<Complex<f64>> =
            matrix.clone().complex_eigenvalues().iter().cloned().collect();
        sort_by_real_part(&mut values);
        Ok(values)
    }
}

impl EigenSolver for DenseEigen {
    fn eigen(&self, matrix: &DMatrix<f64>, count: usize) -> Result<EigenDecomposition> {
        let mut values = Self::sorted_values(matrix)?;
        if count > 0 && count < values.len() {
            values.truncate(count);
        }
        let vectors = values
            .iter()
            .map(|&lambda| complex_eigenvector(matrix, lambda))
            .collect::<Result<Vec<_>>>()?;
        Ok(EigenDecomposition { values, vectors })
    }

    fn eigenvalues(&self, matrix: &DMatrix<f64>, count: usize) -> Result<Vec<Complex<f64>>> {
        let mut values = Self::sorted_values(matrix)?;
        if count > 0 && count < values.len() {
            values.truncate(count);
        }
        Ok(values)
    }
}

/// The pair of oracles the engine consumes.
#[derive(Clone, Copy)]
pub struct Oracles<'a> {
    pub linear: &'a dyn LinearSolver,
    pub eigen: &'a dyn EigenSolver,
}

impl Default for Oracles<'static> {
    fn default() -> Self {
        Self {
            linear: &DenseLu,
            eigen: &DenseEigen,
        }
    }
}

pub fn sort_by_real_part(values: &mut [Complex<f64>]) {
    values.sort_by(|a, b| {
        b.re.partial_cmp(&a.re)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.im.partial_cmp(&a.im).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Unit-norm right eigenvector of a real matrix for `eigenvalue`, from the
/// smallest singular direction of `A - λI`.
pub fn complex_eigenvector(
    mat: &DMatrix<f64>,
    eigenvalue: Complex<f64>,
) -> Result<DVector<Complex<f64>>> {
    let dim = mat.nrows();
    let mut shifted = to_complex(mat);
    for i in 0..dim {
        shifted[(i, i)] -= eigenvalue;
    }
    complex_null_vector(shifted)
}

/// Left eigenvector: `Aᵀ p = conj(λ) p`, i.e. `pᴴ A = λ pᴴ`.
pub fn complex_left_eigenvector(
    mat: &DMatrix<f64>,
    eigenvalue: Complex<f64>,
) -> Result<DVector<Complex<f64>>> {
    complex_eigenvector(&mat.transpose(), eigenvalue.conj())
}

/// Unit vector spanning the (numerical) kernel of a complex matrix.
pub fn complex_null_vector(
    matrix: DMatrix<Complex<f64>>,
) -> Result<DVector<Complex<f64>>> {
    let svd = SVD::new(matrix, false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| anyhow!("SVD failed to compute right singular vectors"))?;
    let (min_idx, _) = svd.singular_values.iter().enumerate().fold(
        (0usize, f64::INFINITY),
        |(idx_min, val_min), (idx, &val)| {
            if val < val_min {
                (idx, val)
            } else {
                (idx_min, val_min)
            }
        },
    );
    let mut vector: DVector<Complex<f64>> = v_t.row(min_idx).transpose().map(|c| c.conj());
    let norm = vector.norm();
    if norm <= 1e-14 {
        bail!("Degenerate eigenvector");
    }
    vector.unscale_mut(norm);
    Ok(vector)
}

/// Approximate right and left null vectors of a (nearly) singular real matrix.
pub fn real_null_vectors(mat: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = mat.nrows();
    if n == 0 {
        bail!(ContinuationError::invalid("Null vectors of an empty matrix"));
    }
    let svd = mat.clone().svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => bail!("SVD failed to compute singular vectors"),
    };
    let (min_idx, _) = svd.singular_values.iter().enumerate().fold(
        (0usize, f64::INFINITY),
        |(idx_min, val_min), (idx, &val)| {
            if val < val_min {
                (idx, val)
            } else {
                (idx_min, val_min)
            }
        },
    );
    let v: DVector<f64> = v_t.row(min_idx).transpose();
    let w: DVector<f64> = u.column(min_idx).into_owned();
    Ok((v.normalize(), w.normalize()))
}

pub fn to_complex(mat: &DMatrix<f64>) -> DMatrix<Complex<f64>> {
    mat.map(|v| Complex::new(v, 0.0))
}

/// Solves `[A b; cᵀ 0] [x; s] = [0; 1]` and returns `(x, s)`.
///
/// `s` vanishes exactly when `A` is singular (for generic borders), which is
/// the scalar test function of the minimally augmented fold system.
pub fn bordered_null_solve(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    c: &DVector<f64>,
) -> Result<(DVector<f64>, f64)> {
    let n = a.nrows();
    let mut bordered = DMatrix::zeros(n + 1, n + 1);
    bordered.view_mut((0, 0), (n, n)).copy_from(a);
    for i in 0..n {
        bordered[(i, n)] = b[i];
        bordered[(n, i)] = c[i];
    }
    let mut rhs = DVector::zeros(n + 1);
    rhs[n] = 1.0;
    let sol = bordered
        .lu()
        .solve(&rhs)
        .ok_or_else(|| ContinuationError::bordering("[A b; cᵀ 0] is singular"))?;
    if sol.iter().any(|v| !v.is_finite()) {
        bail!(ContinuationError::bordering(
            "bordered solve produced non-finite values"
        ));
    }
    Ok((sol.rows(0, n).into_owned(), sol[n]))
}

/// Unit right and left null vectors of a singular matrix: the SVD guess
/// refined by one bordered solve each.
///
/// `v` is oriented so its largest component is positive and `w` so that
/// `⟨w, v⟩ ≥ 0`, which fixes the sign of normal-form coefficients.
pub fn bordered_null_vectors(mat: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
    let (v0, w0) = real_null_vectors(mat)?;
    let (v, _) = bordered_null_solve(mat, &w0, &v0)?;
    let (w, _) = bordered_null_solve(&mat.transpose(), &v0, &w0)?;
    let mut v = v.normalize();
    let mut w = w.normalize();
    if v[v.iamax()] < 0.0 {
        v = -v;
    }
    if w.dot(&v) < 0.0 {
        w = -w;
    }
    Ok((v, w))
}

/// Complex analogue of [`bordered_null_solve`]: `[A b; cᴴ 0] [x; s] = [0; 1]`.
pub fn complex_bordered_null_solve(
    a: &DMatrix<Complex<f64>>,
    b: &DVector<Complex<f64>>,
    c: &DVector<Complex<f64>>,
) -> Result<(DVector<Complex<f64>>, Complex<f64>)> {
    let n = a.nrows();
    let zero = Complex::new(0.0, 0.0);
    let mut bordered = DMatrix::from_element(n + 1, n + 1, zero);
    bordered.view_mut((0, 0), (n, n)).copy_from(a);
    for i in 0..n {
        bordered[(i, n)] = b[i];
        bordered[(n, i)] = c[i].conj();
    }
    let mut rhs = DVector::from_element(n + 1, zero);
    rhs[n] = Complex::new(1.0, 0.0);
    let sol = bordered
        .lu()
        .solve(&rhs)
        .ok_or_else(|| ContinuationError::bordering("[A b; cᴴ 0] is singular"))?;
    if sol.iter().any(|v| !v.re.is_finite() || !v.im.is_finite()) {
        bail!(ContinuationError::bordering(
            "complex bordered solve produced non-finite values"
        ));
    }
    Ok((sol.rows(0, n).into_owned(), sol[n]))
}

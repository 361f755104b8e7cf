//! Normal-form coefficients of codim-1 points.
//!
//! Multilinear forms of the vector field are taken by finite differences of
//! `f` itself, so only [`VectorField::evaluate`] is required. Conventions
//! follow Kuznetsov, *Elements of Applied Bifurcation Theory*: `⟨p, q⟩ = p̄ᵀq`,
//! `A q = λ q`, `Aᵀ p = λ̄ p`, `⟨q, q⟩ = 1`, `⟨p, q⟩ = 1`.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use crate::error::ContinuationError;
use crate::linalg::{complex_eigenvector, complex_left_eigenvector, to_complex};
use crate::traits::VectorField;

type CVector = DVector<Complex<f64>>;

const BILINEAR_STEP: f64 = 1e-4;
const TRILINEAR_STEP: f64 = 1e-3;

/// Second and third derivatives of `f` at a fixed `(state, params)`.
pub struct MultilinearForms<'a, F: ?Sized> {
    field: &'a F,
    state: &'a [f64],
    params: &'a [f64],
}

impl<'a, F: VectorField + ?Sized> MultilinearForms<'a, F> {
    pub fn new(field: &'a F, state: &'a [f64], params: &'a [f64]) -> Self {
        Self {
            field,
            state,
            params,
        }
    }

    fn eval_at(&self, base: &[f64], offset: &DVector<f64>) -> DVector<f64> {
        let shifted: Vec<f64> = base.iter().zip(offset.iter()).map(|(x, d)| x + d).collect();
        let mut out = DVector::zeros(base.len());
        self.field.evaluate(&shifted, self.params, out.as_mut_slice());
        out
    }

    fn bilinear_at(&self, base: &[f64], u: &DVector<f64>, v: &DVector<f64>) -> DVector<f64> {
        let h = BILINEAR_STEP;
        let sum = (u + v) * h;
        let diff = (u - v) * h;
        let pp = self.eval_at(base, &sum);
        let pm = self.eval_at(base, &diff);
        let mp = self.eval_at(base, &(-&diff));
        let mm = self.eval_at(base, &(-&sum));
        (pp - pm - mp + mm) / (4.0 * h * h)
    }

    /// `B(u, v)`, the symmetric second derivative.
    pub fn bilinear(&self, u: &DVector<f64>, v: &DVector<f64>) -> DVector<f64> {
        self.bilinear_at(self.state, u, v)
    }

    /// `C(u, v, w)`, the symmetric third derivative.
    pub fn trilinear(&self, u: &DVector<f64>, v: &DVector<f64>, w: &DVector<f64>) -> DVector<f64> {
        let h = TRILINEAR_STEP;
        let plus: Vec<f64> = self.state.iter().zip(u.iter()).map(|(x, d)| x + h * d).collect();
        let minus: Vec<f64> = self.state.iter().zip(u.iter()).map(|(x, d)| x - h * d).collect();
        (self.bilinear_at(&plus, v, w) - self.bilinear_at(&minus, v, w)) / (2.0 * h)
    }

    pub fn complex_bilinear(&self, u: &CVector, v: &CVector) -> CVector {
        let parts = [split(u), split(v)];
        expand(2, |mask| {
            let a = pick(&parts[0], mask & 1);
            let b = pick(&parts[1], (mask >> 1) & 1);
            if a.norm() == 0.0 || b.norm() == 0.0 {
                None
            } else {
                Some(self.bilinear(a, b))
            }
        }, u.len())
    }

    pub fn complex_trilinear(&self, u: &CVector, v: &CVector, w: &CVector) -> CVector {
        let parts = [split(u), split(v), split(w)];
        expand(3, |mask| {
            let a = pick(&parts[0], mask & 1);
            let b = pick(&parts[1], (mask >> 1) & 1);
            let c = pick(&parts[2], (mask >> 2) & 1);
            if a.norm() == 0.0 || b.norm() == 0.0 || c.norm() == 0.0 {
                None
            } else {
                Some(self.trilinear(a, b, c))
            }
        }, u.len())
    }
}

fn split(v: &CVector) -> (DVector<f64>, DVector<f64>) {
    (v.map(|c| c.re), v.map(|c| c.im))
}

fn pick(parts: &(DVector<f64>, DVector<f64>), imag: usize) -> &DVector<f64> {
    if imag == 1 {
        &parts.1
    } else {
        &parts.0
    }
}

/// Sums `i^k · form(parts)` over every real/imaginary choice of the `arity`
/// arguments, `k` being the number of imaginary parts chosen.
fn expand(
    arity: usize,
    mut form: impl FnMut(usize) -> Option<DVector<f64>>,
    len: usize,
) -> CVector {
    let mut total = CVector::from_element(len, Complex::new(0.0, 0.0));
    for mask in 0..(1usize << arity) {
        if let Some(value) = form(mask) {
            let factor = Complex::i().powu(mask.count_ones());
            total += value.map(|x| factor * x);
        }
    }
    total
}

fn inner(p: &CVector, q: &CVector) -> Complex<f64> {
    p.dotc(q)
}

fn complex_solve(a: DMatrix<Complex<f64>>, rhs: &CVector, context: &str) -> Result<CVector> {
    a.lu()
        .solve(rhs)
        .ok_or_else(|| ContinuationError::singular(context.to_string()).into())
}

/// Quadratic fold coefficient `a = ½⟨w, B(v, v)⟩ / ⟨w, v⟩`.
pub fn fold_coefficient<F: VectorField + ?Sized>(
    forms: &MultilinearForms<'_, F>,
    v: &DVector<f64>,
    w: &DVector<f64>,
) -> Result<f64> {
    let wv = w.dot(v);
    if wv.abs() < 1e-12 {
        bail!(ContinuationError::singular(
            "fold null vectors are orthogonal (Bogdanov-Takens point)"
        ));
    }
    Ok(0.5 * w.dot(&forms.bilinear(v, v)) / wv)
}

/// Right/left critical eigenvectors with `‖q‖ = 1`, `⟨p, q⟩ = 1`.
pub fn critical_eigenvectors(
    jac: &DMatrix<f64>,
    eigenvalue: Complex<f64>,
) -> Result<(CVector, CVector)> {
    let q = complex_eigenvector(jac, eigenvalue)?;
    let p = complex_left_eigenvector(jac, eigenvalue)?;
    let s = inner(&p, &q);
    if s.norm() < 1e-12 {
        bail!(ContinuationError::singular(
            "left and right critical eigenvectors are orthogonal"
        ));
    }
    Ok((q, p / s.conj()))
}

/// First Lyapunov coefficient at a Hopf point with frequency `omega`.
///
/// `jac` is the Jacobian of the vector field; negative values mean a
/// supercritical (stable cycle) bifurcation.
pub fn first_lyapunov_coefficient<F: VectorField + ?Sized>(
    forms: &MultilinearForms<'_, F>,
    jac: &DMatrix<f64>,
    omega: f64,
    q: &CVector,
    p: &CVector,
) -> Result<f64> {
    let n = jac.nrows();
    let a = to_complex(jac);
    let qb = q.map(|c| c.conj());

    let b_qqb = forms.complex_bilinear(q, &qb);
    let b_qq = forms.complex_bilinear(q, q);

    let h11 = complex_solve(a.clone(), &b_qqb, "A is singular at the Hopf point")?;
    let mut shifted = -a;
    for i in 0..n {
        shifted[(i, i)] += Complex::new(0.0, 2.0 * omega);
    }
    let h20 = complex_solve(shifted, &b_qq, "2iω is an eigenvalue at the Hopf point")?;

    let c_term = inner(p, &forms.complex_trilinear(q, q, &qb));
    let b1 = inner(p, &forms.complex_bilinear(q, &h11));
    let b2 = inner(p, &forms.complex_bilinear(&qb, &h20));
    Ok((c_term - 2.0 * b1 + b2).re / (2.0 * omega))
}

/// Cubic Neimark-Sacker coefficient `d` of a map with multipliers `e^{±iθ}`.
///
/// `jac` is the Jacobian of the map itself (not of `f(x) - x`).
pub fn neimark_sacker_coefficient<F: VectorField + ?Sized>(
    forms: &MultilinearForms<'_, F>,
    jac: &DMatrix<f64>,
    theta: f64,
    q: &CVector,
    p: &CVector,
) -> Result<f64> {
    let n = jac.nrows();
    let a = to_complex(jac);
    let qb = q.map(|c| c.conj());
    let one = Complex::new(1.0, 0.0);

    let mut i_minus_a = -a.clone();
    for i in 0..n {
        i_minus_a[(i, i)] += one;
    }
    let mut e2_minus_a = -a;
    let e2 = Complex::from_polar(1.0, 2.0 * theta);
    for i in 0..n {
        e2_minus_a[(i, i)] += e2;
    }

    let b_qqb = forms.complex_bilinear(q, &qb);
    let b_qq = forms.complex_bilinear(q, q);
    let h11 = complex_solve(i_minus_a, &b_qqb, "multiplier 1 at the Neimark-Sacker point")?;
    let h20 = complex_solve(e2_minus_a, &b_qq, "strong resonance at the Neimark-Sacker point")?;

    let bracket = inner(p, &forms.complex_trilinear(q, q, &qb))
        + 2.0 * inner(p, &forms.complex_bilinear(q, &h11))
        + inner(p, &forms.complex_bilinear(&qb, &h20));
    Ok(0.5 * (Complex::from_polar(1.0, -theta) * bracket).re)
}

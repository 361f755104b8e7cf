use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Relative step used by the finite-difference fallbacks below.
const FD_STEP: f64 = 1e-6;

/// Whether the vector field generates a continuous-time flow or a discrete map.
///
/// For flows the continuation residual is `f(x, p)`; for maps it is `f(x, p) - x`
/// and stability is read from the multipliers of `Df` instead of the eigenvalues
/// of the residual Jacobian.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SystemKind {
    #[default]
    Flow,
    Map,
}

impl SystemKind {
    pub fn is_map(self) -> bool {
        matches!(self, SystemKind::Map)
    }
}

/// A parametrized vector field `f(x, p)`.
///
/// Only [`VectorField::evaluate`] is required. The Jacobian and the parameter
/// derivative fall back to central differences; implementors with analytic
/// derivatives should override them.
pub trait VectorField: Sync {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field (flow) or map function into `out`.
    fn evaluate(&self, state: &[f64], params: &[f64], out: &mut [f64]);

    /// Jacobian `∂f/∂x` at `(state, params)`.
    fn jacobian(&self, state: &[f64], params: &[f64]) -> DMatrix<f64> {
        let n = self.dimension();
        let mut jac = DMatrix::zeros(n, n);
        let mut shifted = state.to_vec();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        for col in 0..n {
            let h = FD_STEP * (1.0 + state[col].abs());
            shifted[col] = state[col] + h;
            self.evaluate(&shifted, params, &mut plus);
            shifted[col] = state[col] - h;
            self.evaluate(&shifted, params, &mut minus);
            shifted[col] = state[col];
            for row in 0..n {
                jac[(row, col)] = (plus[row] - minus[row]) / (2.0 * h);
            }
        }
        jac
    }

    /// Derivative `∂f/∂p_index` at `(state, params)`, written into `out`.
    fn param_derivative(&self, state: &[f64], params: &[f64], index: usize, out: &mut [f64]) {
        let n = self.dimension();
        let h = FD_STEP * (1.0 + params[index].abs());
        let mut shifted = params.to_vec();
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        shifted[index] = params[index] + h;
        self.evaluate(state, &shifted, &mut plus);
        shifted[index] = params[index] - h;
        self.evaluate(state, &shifted, &mut minus);
        for i in 0..n {
            out[i] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
}

impl<T: VectorField + ?Sized> VectorField for &T {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn evaluate(&self, state: &[f64], params: &[f64], out: &mut [f64]) {
        (**self).evaluate(state, params, out)
    }

    fn jacobian(&self, state: &[f64], params: &[f64]) -> DMatrix<f64> {
        (**self).jacobian(state, params)
    }

    fn param_derivative(&self, state: &[f64], params: &[f64], index: usize, out: &mut [f64]) {
        (**self).param_derivative(state, params, index, out)
    }
}

/// Adapter turning a closure `(x, p, out)` into a [`VectorField`].
/// Derivatives are obtained by finite differences.
pub struct FnVectorField<F> {
    dimension: usize,
    func: F,
}

impl<F> FnVectorField<F>
where
    F: Fn(&[f64], &[f64], &mut [f64]) + Sync,
{
    pub fn new(dimension: usize, func: F) -> Self {
        Self { dimension, func }
    }
}

impl<F> VectorField for FnVectorField<F>
where
    F: Fn(&[f64], &[f64], &mut [f64]) + Sync,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn evaluate(&self, state: &[f64], params: &[f64], out: &mut [f64]) {
        (self.func)(state, params, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic;

    impl VectorField for Quadratic {
        fn dimension(&self) -> usize {
            2
        }

        fn evaluate(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
            out[0] = x[0] * x[0] + p[0] * x[1];
            out[1] = x[0] * x[1] - p[0] * p[0];
        }
    }

    #[test]
    fn finite_difference_jacobian_matches_analytic() {
        let jac = Quadratic.jacobian(&[1.5, -2.0], &[0.5]);
        let expected = DMatrix::from_row_slice(2, 2, &[3.0, 0.5, -2.0, 1.5]);
        assert!((jac - expected).norm() < 1e-8);
    }

    #[test]
    fn finite_difference_param_derivative_matches_analytic() {
        let mut out = [0.0; 2];
        Quadratic.param_derivative(&[1.5, -2.0], &[0.5], 0, &mut out);
        assert!((out[0] + 2.0).abs() < 1e-8);
        assert!((out[1] + 1.0).abs() < 1e-8);
    }

    #[test]
    fn closure_adapter_evaluates() {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] - x[0] * x[0];
        });
        let mut out = [0.0];
        field.evaluate(&[2.0], &[1.0], &mut out);
        assert_eq!(out[0], -3.0);
        assert!((field.jacobian(&[2.0], &[1.0])[(0, 0)] + 4.0).abs() < 1e-8);
    }
}

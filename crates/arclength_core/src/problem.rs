//! Problem wrapper: a vector field, its parameter record, the lens selecting the
//! continuation parameter and an initial guess, exposed through the uniform
//! `residual(u, p)`, `jacobian(u, p)`, `dp(u, p)` contract.

use crate::error::ContinuationError;
use crate::traits::{SystemKind, VectorField};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Named parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl ParameterSet {
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = (S, f64)>) -> Self {
        let (names, values) = entries
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .unzip();
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Builds a lens onto the named parameter.
    pub fn lens(&self, name: &str) -> Result<ParamLens> {
        match self.index_of(name) {
            Some(index) => Ok(ParamLens {
                index,
                name: name.to_string(),
            }),
            None => bail!(ContinuationError::invalid(format!(
                "Unknown parameter '{name}'"
            ))),
        }
    }
}

/// Projection selecting one scalar out of a [`ParameterSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLens {
    pub index: usize,
    pub name: String,
}

impl ParamLens {
    pub fn get(&self, params: &ParameterSet) -> f64 {
        params.values[self.index]
    }

    pub fn set(&self, params: &mut ParameterSet, value: f64) {
        params.values[self.index] = value;
    }
}

/// Uniform wrapper around a parametrized vector field.
#[derive(Debug, Clone)]
pub struct BifurcationProblem<F> {
    field: F,
    kind: SystemKind,
    params: ParameterSet,
    lens: ParamLens,
    initial_guess: Vec<f64>,
}

impl<F: VectorField> BifurcationProblem<F> {
    pub fn new(
        field: F,
        kind: SystemKind,
        params: ParameterSet,
        param_name: &str,
        initial_guess: Vec<f64>,
    ) -> Result<Self> {
        let lens = params.lens(param_name)?;
        if initial_guess.len() != field.dimension() {
            bail!(ContinuationError::invalid(format!(
                "Initial guess dimension mismatch. Expected {}, got {}.",
                field.dimension(),
                initial_guess.len()
            )));
        }
        Ok(Self {
            field,
            kind,
            params,
            lens,
            initial_guess,
        })
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn kind(&self) -> SystemKind {
        self.kind
    }

    pub fn dimension(&self) -> usize {
        self.field.dimension()
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn lens(&self) -> &ParamLens {
        &self.lens
    }

    pub fn initial_guess(&self) -> &[f64] {
        &self.initial_guess
    }

    pub fn set_initial_guess(&mut self, guess: Vec<f64>) {
        self.initial_guess = guess;
    }

    /// Current value of the continuation parameter.
    pub fn param(&self) -> f64 {
        self.lens.get(&self.params)
    }

    pub fn set_param(&mut self, value: f64) {
        self.lens.set(&mut self.params, value);
    }

    /// Re-targets the wrapper at another parameter of the same record.
    pub fn with_lens(mut self, param_name: &str) -> Result<Self> {
        self.lens = self.params.lens(param_name)?;
        Ok(self)
    }

    /// Parameter vector with the lens set to `p`.
    pub fn params_at(&self, p: f64) -> Vec<f64> {
        let mut values = self.params.values.clone();
        values[self.lens.index] = p;
        values
    }

    /// Jacobian of the raw vector field.
    pub fn field_jacobian(&self, u: &[f64], p: f64) -> DMatrix<f64> {
        self.field.jacobian(u, &self.params_at(p))
    }

    /// Continuation residual: `f(u, p)` for flows, `f(u, p) - u` for maps.
    pub fn residual(&self, u: &[f64], p: f64) -> DVector<f64> {
        self.residual_with(u, &self.params_at(p))
    }

    /// Jacobian of [`BifurcationProblem::residual`] with respect to `u`.
    pub fn jacobian(&self, u: &[f64], p: f64) -> DMatrix<f64> {
        self.jacobian_with(u, &self.params_at(p))
    }

    /// Derivative of the residual with respect to the lens parameter.
    pub fn dp(&self, u: &[f64], p: f64) -> DVector<f64> {
        self.dp_with(u, &self.params_at(p), self.lens.index)
    }

    /// Residual for an explicit parameter vector.
    pub fn residual_with(&self, u: &[f64], params: &[f64]) -> DVector<f64> {
        let mut out = DVector::zeros(u.len());
        self.field.evaluate(u, params, out.as_mut_slice());
        if self.kind.is_map() {
            for i in 0..u.len() {
                out[i] -= u[i];
            }
        }
        out
    }

    pub fn jacobian_with(&self, u: &[f64], params: &[f64]) -> DMatrix<f64> {
        let mut jac = self.field.jacobian(u, params);
        if self.kind.is_map() {
            for i in 0..u.len() {
                jac[(i, i)] -= 1.0;
            }
        }
        jac
    }

    /// `∂f/∂p_index`; the map shift does not depend on parameters.
    pub fn dp_with(&self, u: &[f64], params: &[f64], index: usize) -> DVector<f64> {
        let mut out = DVector::zeros(u.len());
        self.field
            .param_derivative(u, params, index, out.as_mut_slice());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnVectorField;

    fn logistic_problem(kind: SystemKind) -> BifurcationProblem<impl VectorField> {
        let field = FnVectorField::new(1, |x: &[f64], p: &[f64], out: &mut [f64]| {
            out[0] = p[0] * x[0] * (1.0 - x[0]) + p[1];
        });
        let params = ParameterSet::new([("r", 2.5), ("shift", 0.0)]);
        BifurcationProblem::new(field, kind, params, "r", vec![0.5]).expect("valid problem")
    }

    #[test]
    fn lens_reads_and_writes_named_parameter() {
        let mut params = ParameterSet::new([("a", 1.0), ("b", 2.0)]);
        let lens = params.lens("b").expect("lens");
        assert_eq!(lens.get(&params), 2.0);
        lens.set(&mut params, 3.0);
        assert_eq!(params.values, vec![1.0, 3.0]);
        assert!(params.lens("c").is_err());
    }

    #[test]
    fn map_residual_subtracts_identity() {
        let flow = logistic_problem(SystemKind::Flow);
        let map = logistic_problem(SystemKind::Map);
        let r_flow = flow.residual(&[0.5], 2.0);
        let r_map = map.residual(&[0.5], 2.0);
        assert!((r_flow[0] - 0.5).abs() < 1e-14);
        assert!(r_map[0].abs() < 1e-14);
        let j_flow = flow.jacobian(&[0.2], 2.0);
        let j_map = map.jacobian(&[0.2], 2.0);
        assert!((j_flow[(0, 0)] - j_map[(0, 0)] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn dp_follows_lens() {
        let problem = logistic_problem(SystemKind::Flow);
        let dp = problem.dp(&[0.5], 2.0);
        assert!((dp[0] - 0.25).abs() < 1e-8);
        let retargeted = problem.with_lens("shift").expect("lens");
        let dp = retargeted.dp(&[0.5], 0.0);
        assert!((dp[0] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn rejects_wrong_initial_guess() {
        let field = FnVectorField::new(2, |_x: &[f64], _p: &[f64], _out: &mut [f64]| {});
        let params = ParameterSet::new([("a", 0.0)]);
        let err = BifurcationProblem::new(field, SystemKind::Flow, params, "a", vec![0.0])
            .err()
            .expect("dimension mismatch");
        assert!(format!("{err}").contains("dimension mismatch"));
    }
}

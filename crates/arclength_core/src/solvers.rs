//! Flow-map oracle used by the shooting discretization, and a fixed-step RK4
//! implementation that also integrates the variational equations.

use crate::error::ContinuationError;
use crate::traits::VectorField;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

const FD_STEP: f64 = 1e-7;

/// `integrate(u0, t, p) -> φ_t(u0; p)`.
///
/// Failures are reported as [`ContinuationError::IntegrationDiverged`] so the
/// engine treats them like a failed corrector step.
pub trait FlowMap: Sync {
    fn dimension(&self) -> usize;

    fn integrate(&self, state: &[f64], duration: f64, params: &[f64]) -> Result<DVector<f64>>;

    /// End state together with the sensitivity `∂φ/∂u0`.
    fn integrate_with_jacobian(
        &self,
        state: &[f64],
        duration: f64,
        params: &[f64],
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let n = state.len();
        let end = self.integrate(state, duration, params)?;
        let mut jac = DMatrix::zeros(n, n);
        let mut shifted = state.to_vec();
        for col in 0..n {
            let h = FD_STEP * (1.0 + state[col].abs());
            shifted[col] = state[col] + h;
            let plus = self.integrate(&shifted, duration, params)?;
            shifted[col] = state[col] - h;
            let minus = self.integrate(&shifted, duration, params)?;
            shifted[col] = state[col];
            jac.set_column(col, &((plus - minus) / (2.0 * h)));
        }
        Ok((end, jac))
    }
}

/// Classic Runge-Kutta 4th order stages.
struct Rk4Stages {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4Stages {
    fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    fn step(&mut self, rhs: &mut impl FnMut(&[f64], &mut [f64]), state: &mut [f64], dt: f64) {
        let n = state.len();
        rhs(state, &mut self.k1);

        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        rhs(&self.tmp, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        rhs(&self.tmp, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        rhs(&self.tmp, &mut self.k4);

        for i in 0..n {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
    }
}

/// Fixed-step RK4 flow map of an autonomous vector field.
#[derive(Debug, Clone)]
pub struct Rk4Flow<F> {
    field: F,
    steps: usize,
}

impl<F: VectorField> Rk4Flow<F> {
    /// `steps` RK4 steps are taken per call regardless of the duration.
    pub fn new(field: F, steps: usize) -> Self {
        Self {
            field,
            steps: steps.max(1),
        }
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    fn check_finite(state: &[f64], duration: f64) -> Result<()> {
        if state.iter().any(|v| !v.is_finite()) {
            bail!(ContinuationError::diverged(format!(
                "RK4 state became non-finite over t = {duration}"
            )));
        }
        Ok(())
    }
}

impl<F: VectorField> FlowMap for Rk4Flow<F> {
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn integrate(&self, state: &[f64], duration: f64, params: &[f64]) -> Result<DVector<f64>> {
        let n = state.len();
        let mut current = state.to_vec();
        let mut stages = Rk4Stages::new(n);
        let dt = duration / self.steps as f64;
        let mut rhs = |x: &[f64], out: &mut [f64]| self.field.evaluate(x, params, out);
        for _ in 0..self.steps {
            stages.step(&mut rhs, &mut current, dt);
        }
        Self::check_finite(&current, duration)?;
        Ok(DVector::from_vec(current))
    }

    /// Integrates `ẋ = f(x)`, `Φ̇ = J(x) Φ`, `Φ(0) = I` alongside each other.
    fn integrate_with_jacobian(
        &self,
        state: &[f64],
        duration: f64,
        params: &[f64],
    ) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let n = state.len();
        // Layout: [x (n), Φ column-major (n*n)].
        let mut current = vec![0.0; n + n * n];
        current[..n].copy_from_slice(state);
        for i in 0..n {
            current[n + i * n + i] = 1.0;
        }
        let mut stages = Rk4Stages::new(n + n * n);
        let dt = duration / self.steps as f64;
        let field = &self.field;
        let mut rhs = |x: &[f64], out: &mut [f64]| {
            field.evaluate(&x[..n], params, &mut out[..n]);
            let jac = field.jacobian(&x[..n], params);
            let phi = DMatrix::from_column_slice(n, n, &x[n..]);
            let dphi = jac * phi;
            out[n..].copy_from_slice(dphi.as_slice());
        };
        for _ in 0..self.steps {
            stages.step(&mut rhs, &mut current, dt);
        }
        Self::check_finite(&current, duration)?;
        let end = DVector::from_column_slice(&current[..n]);
        let phi = DMatrix::from_column_slice(n, n, &current[n..]);
        Ok((end, phi))
    }
}

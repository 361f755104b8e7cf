use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::{BifurcationType, BranchType, SpecialPointData};
use crate::linalg::EigenSolver;

/// One scalar test function evaluated at a point.
///
/// A sign change between consecutive points only counts when the
/// `signature` (e.g. the number of complex pairs the test ranges over)
/// is unchanged, so collisions of real eigenvalues do not register as Hopf
/// points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestValue {
    pub kind: BifurcationType,
    pub value: f64,
    pub signature: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFunctionValues {
    pub values: Vec<TestValue>,
}

impl TestFunctionValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: BifurcationType, value: f64) {
        self.push_with_signature(kind, value, 0);
    }

    pub fn push_with_signature(&mut self, kind: BifurcationType, value: f64, signature: i32) {
        self.values.push(TestValue {
            kind,
            value,
            signature,
        });
    }

    pub fn get(&self, kind: BifurcationType) -> Option<&TestValue> {
        self.values.iter().find(|t| t.kind == kind)
    }

    pub fn value_for(&self, kind: BifurcationType) -> Option<f64> {
        self.get(kind).map(|t| t.value)
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|t| t.value.is_finite())
    }

    /// Kinds whose test function changed sign from `prev` to `self`.
    pub fn sign_changes(&self, prev: &TestFunctionValues) -> Vec<BifurcationType> {
        self.values
            .iter()
            .filter_map(|current| {
                let before = prev.get(current.kind)?;
                let crossed = before.value * current.value < 0.0
                    && before.signature == current.signature;
                crossed.then_some(current.kind)
            })
            .collect()
    }
}

/// Generic diagnostics reported by a continuation problem at a given point.
#[derive(Debug, Clone, Default)]
pub struct PointDiagnostics {
    pub test_values: TestFunctionValues,
    /// Eigenvalues (flows) or multipliers (maps, cycles).
    pub eigenvalues: Vec<Complex<f64>>,
    pub stable: bool,
}

/// What the engine hands a problem when asking for diagnostics.
#[derive(Clone, Copy)]
pub struct SpectralMonitor<'a> {
    pub eigen: &'a dyn EigenSolver,
    /// Leading eigenvalues requested from the oracle (`0` = all).
    pub eigen_count: usize,
    /// Imaginary parts below this count as real.
    pub imag_tolerance: f64,
}

/// Result of the after-step hook.
#[derive(Debug, Clone)]
pub enum StepUpdate {
    Unchanged,
    /// The problem changed its discretization; the accepted point and its
    /// tangent are re-expressed in the new coordinates.
    Remapped {
        aug_state: DVector<f64>,
        tangent: DVector<f64>,
    },
}

/// Core interface implemented by any system that can be continued via PALC.
///
/// The augmented state is laid out as `[p, x...]`, where `x` has
/// [`ContinuationProblem::dimension`] components.
pub trait ContinuationProblem {
    /// Number of state variables (excluding the continuation parameter).
    fn dimension(&self) -> usize;

    /// Evaluate the residual F(aug_state) and write into `out`.
    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    /// Compute the extended Jacobian (derivative of F w.r.t. [p, x]).
    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Return diagnostics (test functions, eigenvalues, etc.) for bifurcation detection.
    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics>;

    /// Called after each accepted step, before the point is stored. `tangent`
    /// is the unit tangent at the accepted point, in the direction of travel.
    fn update_after_step(
        &mut self,
        _aug_state: &DVector<f64>,
        _tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        Ok(StepUpdate::Unchanged)
    }

    /// Null vectors and normal-form data for a located special point.
    fn special_point_data(
        &mut self,
        _aug_state: &DVector<f64>,
        _kind: BifurcationType,
        _monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        Ok(None)
    }

    fn branch_type(&self) -> BranchType {
        BranchType::Equilibrium
    }

    /// Mesh the current discretization lives on, stored with every point.
    fn current_mesh(&self) -> Option<Vec<f64>> {
        None
    }

    /// Whether the branch ends at a located special point of `kind`. Points
    /// past it are discarded.
    fn ends_at(&self, _kind: BifurcationType) -> bool {
        false
    }
}

impl<P: ContinuationProblem + ?Sized> ContinuationProblem for &mut P {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn residual(&mut self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        (**self).residual(aug_state, out)
    }

    fn extended_jacobian(&mut self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>> {
        (**self).extended_jacobian(aug_state)
    }

    fn diagnostics(
        &mut self,
        aug_state: &DVector<f64>,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<PointDiagnostics> {
        (**self).diagnostics(aug_state, monitor)
    }

    fn update_after_step(
        &mut self,
        aug_state: &DVector<f64>,
        tangent: &DVector<f64>,
    ) -> Result<StepUpdate> {
        (**self).update_after_step(aug_state, tangent)
    }

    fn special_point_data(
        &mut self,
        aug_state: &DVector<f64>,
        kind: BifurcationType,
        monitor: &SpectralMonitor<'_>,
    ) -> Result<Option<SpecialPointData>> {
        (**self).special_point_data(aug_state, kind, monitor)
    }

    fn branch_type(&self) -> BranchType {
        (**self).branch_type()
    }

    fn current_mesh(&self) -> Option<Vec<f64>> {
        (**self).current_mesh()
    }

    fn ends_at(&self, kind: BifurcationType) -> bool {
        (**self).ends_at(kind)
    }
}

//! Core types for continuation analysis.
//!
//! This module contains the data structures produced by the engine: branch
//! points, special points, termination reasons and the settings that drive
//! a run.

use crate::newton::NewtonSettings;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    pub max_steps: usize,
    /// Lower bound on the continuation parameter (unbounded when `None`).
    pub param_min: Option<f64>,
    pub param_max: Option<f64>,
    pub corrector: NewtonSettings,
    /// Steps converging in fewer corrector iterations than this grow `ds`.
    pub target_corrector_steps: usize,
    pub step_growth: f64,
    pub step_shrink: f64,
    pub detect_bifurcation: bool,
    /// Attach null vectors and normal-form coefficients to special points.
    pub compute_normal_forms: bool,
    /// Number of leading eigenvalues monitored; `0` monitors all of them.
    pub eigen_count: usize,
    pub bisection_steps: usize,
    pub bisection_tolerance: f64,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            min_step_size: 1e-6,
            max_step_size: 0.1,
            max_steps: 200,
            param_min: None,
            param_max: None,
            corrector: NewtonSettings::default(),
            target_corrector_steps: 4,
            step_growth: 1.5,
            step_shrink: 0.5,
            detect_bifurcation: true,
            compute_normal_forms: true,
            eigen_count: 0,
            bisection_steps: 30,
            bisection_tolerance: 1e-9,
        }
    }
}

impl ContinuationSettings {
    pub fn param_in_range(&self, value: f64) -> bool {
        self.param_min.map_or(true, |min| value >= min)
            && self.param_max.map_or(true, |max| value <= max)
    }
}

/// Classification of points detected during continuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum BifurcationType {
    #[default]
    None,
    Fold,
    /// Transcritical / pitchfork: the fold test function vanishes while dp/ds
    /// keeps its sign.
    BranchPoint,
    Hopf,
    CycleFold,
    PeriodDoubling,
    NeimarkSacker,
    Cusp,
    BogdanovTakens,
    FoldHopf,
    HopfHopf,
    /// Generalized Hopf: the first Lyapunov coefficient vanishes.
    Bautin,
    FoldFlip,
    FoldNeimarkSacker,
    FlipNeimarkSacker,
    DoubleNeimarkSacker,
    Chenciner,
    Resonance1_1,
    Resonance1_2,
    Resonance1_3,
    Resonance1_4,
}

impl BifurcationType {
    /// Kinds whose test function also vanishes at branch points.
    pub fn is_fold_like(self) -> bool {
        matches!(self, BifurcationType::Fold | BifurcationType::CycleFold)
    }

    pub fn is_codim2(self) -> bool {
        !matches!(
            self,
            BifurcationType::None
                | BifurcationType::Fold
                | BifurcationType::BranchPoint
                | BifurcationType::Hopf
                | BifurcationType::CycleFold
                | BifurcationType::PeriodDoubling
                | BifurcationType::NeimarkSacker
        )
    }
}

/// Normal-form coefficient computed at a codim-1 point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NormalForm {
    /// `ẋ = a x²` restricted to the centre manifold.
    Fold { a: f64 },
    /// First Lyapunov coefficient; negative means supercritical.
    Hopf { omega: f64, l1: f64 },
    /// Cubic coefficient of the Neimark-Sacker normal form at angle `theta`.
    NeimarkSacker { theta: f64, d: f64 },
}

/// Bordering data attached to a special point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialPointData {
    /// Right null vector (real for folds, complex for Hopf / NS).
    pub right_null: Vec<Complex<f64>>,
    /// Left null vector.
    pub left_null: Vec<Complex<f64>>,
    #[serde(default)]
    pub normal_form: Option<NormalForm>,
}

impl SpecialPointData {
    pub fn real(v: &[f64], w: &[f64]) -> Self {
        Self {
            right_null: v.iter().map(|&x| Complex::new(x, 0.0)).collect(),
            left_null: w.iter().map(|&x| Complex::new(x, 0.0)).collect(),
            normal_form: None,
        }
    }
}

/// A single point on a continuation branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationPoint {
    pub state: Vec<f64>,
    pub param_value: f64,
    /// Unit tangent in `[p, state...]` coordinates, pointing towards
    /// increasing branch index.
    #[serde(default)]
    pub tangent: Vec<f64>,
    /// Arclength from the point this one was predicted from.
    #[serde(default)]
    pub step_size: f64,
    #[serde(default)]
    pub kind: BifurcationType,
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub eigenvalues: Vec<Complex<f64>>,
    /// Collocation mesh the state is expressed on.
    #[serde(default)]
    pub mesh: Option<Vec<f64>>,
}

impl ContinuationPoint {
    pub fn new(state: Vec<f64>, param_value: f64) -> Self {
        Self {
            state,
            param_value,
            ..Self::default()
        }
    }
}

/// A detected bifurcation, recorded once and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialPoint {
    pub kind: BifurcationType,
    /// Position in [`ContinuationBranch::points`].
    pub index: usize,
    pub param_value: f64,
    pub state: Vec<f64>,
    /// Whether bisection reached the requested tolerance.
    pub localized: bool,
    #[serde(default)]
    pub data: Option<SpecialPointData>,
}

/// Type of continuation branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type")]
pub enum BranchType {
    #[default]
    Equilibrium,
    FoldCurve,
    HopfCurve,
    NeimarkSackerCurve,
    PeriodicOrbit { discretization: String },
}

/// Why a branch stopped growing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason")]
pub enum TerminationReason {
    /// The next corrected point fell outside `[param_min, param_max]` and was
    /// discarded.
    ParameterBound { param_value: f64 },
    MaxSteps,
    StopRequested,
    /// Step size fell below `min_step_size`.
    Stalled { step_size: f64 },
    SingularJacobian { param_value: f64, state: Vec<f64>, message: String },
    BorderingSingular { param_value: f64, state: Vec<f64>, message: String },
    ProblemError { message: String },
    /// The branch reached a special point it cannot be continued through.
    EndPoint { kind: BifurcationType },
}

/// A complete continuation branch containing multiple points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationBranch {
    pub points: Vec<ContinuationPoint>,
    /// Explicit indices relative to the start point (0); negative for points
    /// traced backwards.
    pub indices: Vec<i32>,
    pub special_points: Vec<SpecialPoint>,
    #[serde(default)]
    pub branch_type: BranchType,
    /// Why the forward end stopped.
    #[serde(default)]
    pub termination: Option<TerminationReason>,
    /// Why the backward end stopped (bothside runs and backward extensions).
    #[serde(default)]
    pub backward_termination: Option<TerminationReason>,
}

impl ContinuationBranch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn special_points_of(&self, kind: BifurcationType) -> impl Iterator<Item = &SpecialPoint> {
        self.special_points.iter().filter(move |sp| sp.kind == kind)
    }

    /// Position of the point with the largest (`forward`) or smallest index.
    pub fn endpoint(&self, forward: bool) -> Option<usize> {
        let iter = self.indices.iter().enumerate();
        let found = if forward {
            iter.max_by_key(|(_, &idx)| idx)
        } else {
            iter.min_by_key(|(_, &idx)| idx)
        };
        found.map(|(pos, _)| pos)
    }
}

pub mod continuation;
pub mod error;
pub mod linalg;
pub mod newton;
pub mod problem;
pub mod solvers;
/// The `arclength_core` crate traces solution branches of `F(u, p) = 0` by
/// pseudo-arclength continuation and analyses what happens along them.
///
/// Key components:
/// - **Problem**: `BifurcationProblem` wraps a `VectorField` (flow or map) with named parameters and a lens.
/// - **Continuation**: PALC engine with fold / Hopf / branch-point detection, codim-1 curve trackers, and branch switching.
/// - **Periodic orbits**: trapezoid, collocation and shooting discretizations behind one `PeriodicOrbitProblem` contract.
/// - **Oracles**: pluggable linear solvers, eigen solvers and flow maps with dense defaults.
pub mod traits;

pub use continuation::{
    continue_parameter, continue_parameter_bothside, BifurcationType, BranchType,
    ContinuationBranch, ContinuationHooks, ContinuationPoint, ContinuationSettings, SpecialPoint,
    TerminationReason,
};
pub use error::ContinuationError;
pub use newton::NewtonSettings;
pub use problem::{BifurcationProblem, ParameterSet};
pub use traits::{FnVectorField, SystemKind, VectorField};

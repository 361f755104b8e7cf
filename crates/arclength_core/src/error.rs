//! Error taxonomy shared by the corrector, the continuation engine and the
//! periodic orbit discretizations.
//!
//! Public functions return `anyhow::Result`; the variants below travel inside
//! the `anyhow::Error` and can be recovered with [`ContinuationError::classify`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContinuationError {
    /// Newton iteration budget exhausted (or the iteration stagnated/diverged).
    #[error("Newton iteration did not converge after {iterations} steps (‖F‖ = {residual_norm:e})")]
    NonConvergence { iterations: usize, residual_norm: f64 },

    /// The linear oracle reported a non-invertible operator.
    #[error("Singular Jacobian: {context}")]
    SingularJacobian { context: String },

    /// The bordering vectors of a minimally-augmented system make it singular.
    #[error("Bordered system singular: {context}")]
    BorderingSingular { context: String },

    /// Step size fell below its floor after repeated corrector failures.
    #[error("Continuation stalled: step size {step_size:e} below minimum {min_step_size:e}")]
    ContinuationStalled { step_size: f64, min_step_size: f64 },

    /// The flow-map oracle failed to integrate a section.
    #[error("Integration diverged: {context}")]
    IntegrationDiverged { context: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Problem(#[from] anyhow::Error),
}

/// How the engine reacts to a failure raised while correcting a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Shrink the step and retry from the last accepted point.
    Recoverable,
    /// Halt the branch: the operator is singular at the current point.
    Singular,
    /// Halt the branch: the error did not originate in the numerics.
    Fatal,
}

impl ContinuationError {
    pub fn singular(context: impl Into<String>) -> Self {
        ContinuationError::SingularJacobian {
            context: context.into(),
        }
    }

    pub fn bordering(context: impl Into<String>) -> Self {
        ContinuationError::BorderingSingular {
            context: context.into(),
        }
    }

    pub fn diverged(context: impl Into<String>) -> Self {
        ContinuationError::IntegrationDiverged {
            context: context.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ContinuationError::InvalidInput(message.into())
    }

    /// Classifies an `anyhow::Error` by the typed cause it carries, if any.
    pub fn classify(err: &anyhow::Error) -> FailureClass {
        match err.downcast_ref::<ContinuationError>() {
            Some(ContinuationError::NonConvergence { .. })
            | Some(ContinuationError::IntegrationDiverged { .. }) => FailureClass::Recoverable,
            Some(ContinuationError::SingularJacobian { .. })
            | Some(ContinuationError::BorderingSingular { .. }) => FailureClass::Singular,
            _ => FailureClass::Fatal,
        }
    }
}

//! Chain- and stage-boundary error types.

use crate::pipeline::phase::{ChainState, Phase};
use thiserror::Error;

/// Errors a stage returns from a lifecycle call.
///
/// Whatever a stage returns is turned into a diagnostic entry by the chain,
/// tagged with the stage name and the phase in progress.
#[derive(Error, Debug)]
pub enum StageError {
    /// Operator-fixable configuration problem.
    #[error("{0}")]
    Configuration(String),

    /// Unexpected failure of an external resource (device, memory, thread).
    #[error("{0}")]
    Environment(String),

    /// The stage already wrote its problem to the diagnostic stream.
    #[error("error already reported")]
    Reported,

    /// A named parameter or state field was not declared.
    #[error("{kind} \"{name}\" does not exist")]
    Missing { kind: &'static str, name: String },

    /// State field access failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Parameter access failed.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// Any other error a stage propagates with `?`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn config(message: impl Into<String>) -> Self {
        StageError::Configuration(message.into())
    }

    pub fn environment(message: impl Into<String>) -> Self {
        StageError::Environment(message.into())
    }

    /// Whether the chain should skip recording this error.
    pub fn is_reported(&self) -> bool {
        matches!(self, StageError::Reported)
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

/// State vector access errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state \"{0}\" is not declared")]
    Unknown(String),

    #[error("state \"{name}\": sample {sample} outside block of {samples} samples")]
    SampleOutOfRange {
        name: String,
        sample: usize,
        samples: usize,
    },

    #[error("state \"{name}\": value {value} does not fit into {bits} bits")]
    ValueOutOfRange { name: String, value: u32, bits: u8 },

    #[error("state \"{name}\": bit width {bits} outside 1..=32")]
    InvalidWidth { name: String, bits: u8 },

    #[error("state \"{0}\" declared twice with different layouts")]
    Conflict(String),
}

/// Parameter access errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("parameter \"{0}\" does not exist")]
    Unknown(String),

    #[error("parameter \"{name}\": expected {expected}, found {found}")]
    WrongType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("parameter \"{name}\": value {value} outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("parameter \"{0}\" is not set to auto and cannot be derived")]
    NotAuto(String),

    #[error("parameter \"{0}\" may only be derived during auto-configuration")]
    WrongPhase(String),
}

/// Errors surfaced at the chain boundary.
#[derive(Error, Debug)]
pub enum ChainError {
    /// A lifecycle operation was called in a state that does not allow it.
    #[error("{phase} called while chain is {state}")]
    PhaseOrder { phase: Phase, state: ChainState },

    /// Validation produced diagnostic errors; the chain did not advance.
    #[error("configuration rejected with {errors} error(s)")]
    ConfigurationRejected { errors: usize },

    /// A stage failed during a phase that is fatal for the run.
    #[error("stage {stage} failed during {phase}")]
    StageFailed { stage: String, phase: Phase },

    /// The sample block would be empty.
    #[error("invalid sample block: {0}")]
    InvalidBlock(String),

    /// The external input does not match the validated input shape.
    #[error("input block mismatch: expected {expected}, got {actual}")]
    InputMismatch { expected: String, actual: String },

    /// Registry access failed.
    #[error("registry unavailable: {0}")]
    Registry(String),
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display_is_bare_message() {
        let err = StageError::config("SpatialFilter matrix has 3 columns, input has 4 channels");
        assert_eq!(
            err.to_string(),
            "SpatialFilter matrix has 3 columns, input has 4 channels"
        );
    }

    #[test]
    fn test_reported_marker() {
        assert!(StageError::Reported.is_reported());
        assert!(!StageError::environment("device gone").is_reported());
    }

    #[test]
    fn test_missing_display() {
        let err = StageError::Missing {
            kind: "parameter",
            name: "Gain".into(),
        };
        assert_eq!(err.to_string(), "parameter \"Gain\" does not exist");
    }

    #[test]
    fn test_phase_order_display() {
        let err = ChainError::PhaseOrder {
            phase: Phase::Allocate,
            state: ChainState::Declared,
        };
        assert_eq!(err.to_string(), "Allocate called while chain is Declared");
    }

    #[test]
    fn test_state_error_into_stage_error() {
        let err: StageError = StateError::Unknown("Running".into()).into();
        assert!(matches!(err, StageError::State(_)));
    }
}

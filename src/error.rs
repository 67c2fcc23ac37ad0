//! Custom error types for the engine.
//!
//! This module defines the primary error type, `CalError`, for the whole crate.
//! Using the `thiserror` crate it provides one place where every failure an
//! author or operator can see is named, from configuration problems to a
//! transport timing out in the middle of a run.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: the batch of author-facing [`ValidationError`]s produced by
//!   the sequence compiler. Nothing is executed when this is returned.
//! - **`Transport`**: failures of the physical link, see [`TransportError`].
//! - **`Render`**: an instruction template could not be turned into command text,
//!   see [`RenderError`].
//! - **`StepFailed`**: a fatal runtime failure of one `command` step, carrying the
//!   index of the failing step and the underlying cause.
//! - **`AlreadyRunning` / `MissingSection` / `GraphLookupFailure`**: rejected
//!   transitions of the action run state machine.
//!
//! By using `#[from]`, `CalError` can be created from the underlying error types,
//! so the `?` operator works across module boundaries.

use crate::instruction::RenderError;
use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CalError>;

/// One problem found while compiling a sequence.
///
/// `index` is the zero-based position of the offending operation in the
/// authored sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("operation {index}: {message}")]
pub struct ValidationError {
    /// Position of the operation in the authored sequence.
    pub index: usize,
    /// Human readable description of the problem.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for the operation at `index`.
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Root cause of a fatal `command` step failure.
#[derive(Error, Debug)]
pub enum StepFailure {
    /// The link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An instruction template could not be rendered.
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum CalError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Configuration is inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be parsed or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The sequence failed validation.
    #[error("Sequence failed validation with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),

    /// The link failed outside a step.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An instruction template could not be rendered.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// A `command` step failed fatally.
    #[error("Step {index} failed: {source}")]
    StepFailed {
        /// Plan index of the failed step
        index: usize,
        /// What went wrong
        #[source]
        source: StepFailure,
    },

    /// A start request hit an active run.
    #[error("Action '{0}' is already running")]
    AlreadyRunning(String),

    /// The action has no owning section.
    #[error("Action '{0}' has no section configured")]
    MissingSection(String),

    /// A node id or action lookup failed.
    #[error("Graph lookup failed: {0}")]
    GraphLookupFailure(String),

    /// No device binding for the unit.
    #[error("Cannot execute: no device is configured for unit '{0}'")]
    UnknownUnit(String),

    /// The unit's interface is not registered.
    #[error("Communication interface '{0}' does not exist")]
    UnknownInterface(String),

    /// The run was stopped or reset.
    #[error("Execution cancelled")]
    Cancelled,
}

impl From<Vec<ValidationError>> for CalError {
    fn from(errors: Vec<ValidationError>) -> Self {
        CalError::Validation(errors)
    }
}

impl CalError {
    /// Index of the failing operation or step, when the error is tied to one.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            CalError::StepFailed { index, .. } => Some(*index),
            CalError::Validation(errors) => errors.first().map(|e| e.index),
            _ => None,
        }
    }
}

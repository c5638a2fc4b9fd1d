//! Error types shared across the Cadence crates.
//!
//! Workflow-level failures travel as [`CustomError`] (reason plus opaque
//! details) so they can be recorded in a `WorkflowExecutionFailed` event and
//! surfaced to whoever awaits the workflow result.

use thiserror::Error;

/// Failure raised by workflow code, recorded verbatim in history
#[derive(Debug, Clone, PartialEq, Error)]
#[error("CustomError: reason={reason}, details={details:?}")]
pub struct CustomError {
    pub reason: String,
    pub details: Vec<u8>,
}

impl CustomError {
    pub fn new(reason: impl Into<String>, details: Vec<u8>) -> Self {
        Self {
            reason: reason.into(),
            details,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn details(&self) -> &[u8] {
        &self.details
    }
}

/// How replayed commands disagreed with history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NonDeterminismReason {
    /// History recorded a decision the replay did not make
    #[error("missing replay decision")]
    MissingReplayDecision,
    /// The replay made a decision history does not have
    #[error("extra replay decision")]
    ExtraReplayDecision,
    #[error("mismatch")]
    Mismatch,
}

/// Replayed workflow code produced commands that disagree with the recorded history.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("NonDeterministicError: reason={reason}, workflow_type={workflow_type}, workflow_id={workflow_id}, run_id={run_id}")]
pub struct NonDeterministicError {
    pub reason: NonDeterminismReason,
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Recorded event the replay was compared against, if any
    pub history_event_text: Option<String>,
    /// Decision the replay produced, if any
    pub decision_text: Option<String>,
}

/// Rejections returned by the workflow service
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServerError {
    /// Unknown run, activity, timer or stale task token
    #[error("EntityNotExistsError: {message}")]
    EntityNotExists { message: String },

    #[error("BadRequestError: {message}")]
    BadRequest { message: String },

    #[error("WorkflowExecutionAlreadyCompletedError: {message}")]
    WorkflowExecutionAlreadyCompleted { message: String },

    #[error("InternalServiceError: {message}")]
    InternalService { message: String },

    #[error("QueryFailedError: {message}")]
    QueryFailed { message: String },
}

/// Error type of the worker and service boundary
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error(transparent)]
    Custom(#[from] CustomError),

    #[error(transparent)]
    NonDeterministic(#[from] NonDeterministicError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for CadenceError {
    fn from(err: serde_json::Error) -> Self {
        CadenceError::Serialization(err.to_string())
    }
}

pub fn is_entity_not_exists_error(err: &CadenceError) -> bool {
    matches!(
        err,
        CadenceError::Server(ServerError::EntityNotExists { .. })
    )
}

pub fn is_already_completed_error(err: &CadenceError) -> bool {
    matches!(
        err,
        CadenceError::Server(ServerError::WorkflowExecutionAlreadyCompleted { .. })
    )
}

pub fn is_non_deterministic_error(err: &CadenceError) -> bool {
    matches!(err, CadenceError::NonDeterministic(_))
}

//! Workflow errors and future aliases.

use std::future::Future;
use std::pin::Pin;

use cadence_core::{CustomError, TimeoutType};

/// Boxed future returned by workflow entry points
pub type WorkflowFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, WorkflowError>> + Send>>;

/// Reason recorded for failures that carry no explicit reason.
pub const GENERIC_ERROR_REASON: &str = "cadenceInternal:Generic";
pub const PANIC_ERROR_REASON: &str = "cadenceInternal:Panic";
pub const CANCELED_ERROR_REASON: &str = "cadenceInternal:Canceled";

/// Error observed by workflow code.
///
/// `Canceled` is an expected outcome of cooperative cancellation. `Destroyed`
/// is raised at every suspension point while the runner tears an instance
/// down; workflow code may run cleanup when it sees it but must propagate it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("workflow thread destroyed")]
    Destroyed,
    #[error(transparent)]
    Custom(#[from] CustomError),
    #[error("activity failed: {reason}")]
    ActivityFailed {
        reason: String,
        details: Option<Vec<u8>>,
    },
    #[error("activity timed out: {0}")]
    ActivityTimedOut(TimeoutType),
    #[error("child workflow failed: {reason}")]
    ChildWorkflowFailed {
        reason: String,
        details: Option<Vec<u8>>,
    },
    #[error("child workflow timed out: {0}")]
    ChildWorkflowTimedOut(TimeoutType),
    #[error("child workflow could not start: {0}")]
    StartChildWorkflowFailed(String),
    #[error("version {version} of change {change_id} is outside the supported range [{min_supported}, {max_supported}]")]
    UnsupportedVersion {
        change_id: String,
        version: i32,
        min_supported: i32,
        max_supported: i32,
    },
    #[error("workflow code panicked: {0}")]
    Panic(String),
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    Generic(String),
}

impl WorkflowError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled(_))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, WorkflowError::Destroyed)
    }

    /// Reason string recorded in a `FailWorkflowExecution` decision.
    pub fn reason(&self) -> String {
        match self {
            WorkflowError::Custom(e) => e.reason.clone(),
            WorkflowError::ActivityFailed { reason, .. } => reason.clone(),
            WorkflowError::ChildWorkflowFailed { reason, .. } => reason.clone(),
            WorkflowError::Canceled(_) => CANCELED_ERROR_REASON.to_string(),
            WorkflowError::Panic(_) => PANIC_ERROR_REASON.to_string(),
            _ => GENERIC_ERROR_REASON.to_string(),
        }
    }

    /// Details recorded alongside [`WorkflowError::reason`].
    pub fn details(&self) -> Vec<u8> {
        match self {
            WorkflowError::Custom(e) => e.details.clone(),
            WorkflowError::ActivityFailed {
                details: Some(details),
                ..
            }
            | WorkflowError::ChildWorkflowFailed {
                details: Some(details),
                ..
            } => details.clone(),
            other => other.to_string().into_bytes(),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Generic(format!("serialization failed: {}", err))
    }
}

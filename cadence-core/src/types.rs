//! Core types shared by the runtime, the decider and the test service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Retry policy for workflow-level retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial retry interval
    pub initial_interval: Duration,
    /// Backoff coefficient (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,
    /// Maximum retry interval, zero means uncapped
    pub maximum_interval: Duration,
    /// Maximum number of attempts, zero means unlimited
    pub maximum_attempts: i32,
    /// Error reasons that are never retried
    pub non_retryable_error_types: Vec<String>,
    /// Total time budget measured from the first attempt, zero means unlimited
    pub expiration_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0, // Unlimited
            non_retryable_error_types: vec![],
            expiration_interval: Duration::from_secs(0),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval.is_zero() {
            return Err("initial_interval must be greater than zero".to_string());
        }
        if self.backoff_coefficient < 1.0 {
            return Err("backoff_coefficient must be at least 1.0".to_string());
        }
        if self.maximum_attempts < 0 {
            return Err("maximum_attempts cannot be negative".to_string());
        }
        if self.maximum_attempts == 0 && self.expiration_interval.is_zero() {
            return Err("either maximum_attempts or expiration_interval is required".to_string());
        }
        Ok(())
    }

    /// Sleep before attempt `attempt + 1`, given that `attempt` attempts (1-based) failed.
    pub fn backoff_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = (attempt - 1).max(0);
        let millis =
            self.initial_interval.as_millis() as f64 * self.backoff_coefficient.powi(exponent);
        let mut backoff = Duration::from_millis(millis as u64);
        if !self.maximum_interval.is_zero() && backoff > self.maximum_interval {
            backoff = self.maximum_interval;
        }
        backoff
    }

    /// Whether another attempt is allowed after `attempt` failures, `elapsed`
    /// time since the first attempt and the backoff that would precede it.
    pub fn should_retry(&self, attempt: i32, elapsed: Duration, backoff: Duration) -> bool {
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts {
            return false;
        }
        if !self.expiration_interval.is_zero() && elapsed + backoff >= self.expiration_interval {
            return false;
        }
        true
    }

    pub fn is_non_retryable(&self, reason: &str) -> bool {
        self.non_retryable_error_types.iter().any(|r| r == reason)
    }
}

/// Options for activities scheduled from workflow code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Task list to schedule activity on, empty means the workflow's task list
    pub task_list: String,
    pub schedule_to_close_timeout: Duration,
    pub schedule_to_start_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_list: String::new(),
            schedule_to_close_timeout: Duration::from_secs(60),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(0),
        }
    }
}

/// Options for child workflows started from workflow code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Empty means the parent's domain
    pub domain: String,
    /// Empty means an id derived from the parent run
    pub workflow_id: String,
    /// Empty means the parent's task list
    pub task_list: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
}

impl Default for ChildWorkflowOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            workflow_id: String::new(),
            task_list: String::new(),
            execution_start_to_close_timeout: Duration::from_secs(3600),
            task_start_to_close_timeout: Duration::from_secs(10),
        }
    }
}

/// Workflow execution identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Workflow type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowType {
    pub name: String,
}

impl WorkflowType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Activity type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityType {
    pub name: String,
}

impl ActivityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Task list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskList {
    pub name: String,
    pub kind: TaskListKind,
}

impl TaskList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Normal,
        }
    }

    pub fn sticky(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Sticky,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskListKind {
    Normal = 0,
    Sticky = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TimeoutType {
    StartToClose = 0,
    ScheduleToStart = 1,
    ScheduleToClose = 2,
    Heartbeat = 3,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutType::StartToClose => write!(f, "START_TO_CLOSE"),
            TimeoutType::ScheduleToStart => write!(f, "SCHEDULE_TO_START"),
            TimeoutType::ScheduleToClose => write!(f, "SCHEDULE_TO_CLOSE"),
            TimeoutType::Heartbeat => write!(f, "HEARTBEAT"),
        }
    }
}

/// Workflow information available in workflow context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub task_list: String,
    pub attempt: i32,
}

impl WorkflowInfo {
    pub fn new(
        domain: impl Into<String>,
        workflow_execution: WorkflowExecution,
        workflow_type: WorkflowType,
    ) -> Self {
        Self {
            domain: domain.into(),
            workflow_execution,
            workflow_type,
            task_list: String::new(),
            attempt: 0,
        }
    }
}

/// What a worker does with a run whose replay diverged from its history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NonDeterministicWorkflowPolicy {
    /// Fail the decision task and let the service retry it
    #[default]
    BlockWorkflow,
    /// Fail the workflow execution
    FailWorkflow,
}

/// Worker identity information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub name: String,
    pub version: String,
}

impl Default for WorkerIdentity {
    fn default() -> Self {
        Self {
            name: format!(
                "cadence-rust-worker@{}-pid-{}",
                std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
                std::process::id()
            ),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

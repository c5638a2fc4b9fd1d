//! Service interface consumed by the decision task handler.
//!
//! Only the decision task surface is modeled: polling, fetching full history
//! and answering a task. Transport is up to the implementation.

use async_trait::async_trait;
use cadence_core::{
    CadenceError, Decision, History, TaskList, WorkflowExecution, WorkflowType,
};
use serde::{Deserialize, Serialize};

/// Decision task handed out by a poll.
///
/// `history` is the full history on a cold start and only the events after
/// `previous_started_event_id` when the task continues a sticky run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTask {
    pub task_token: Vec<u8>,
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub previous_started_event_id: i64,
    pub started_event_id: i64,
    pub attempt: i64,
    pub history: History,
    pub query: Option<WorkflowQuery>,
}

impl DecisionTask {
    pub fn run_id(&self) -> &str {
        &self.workflow_execution.run_id
    }

    pub fn is_query(&self) -> bool {
        self.query.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub query_type: String,
    pub query_args: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResultType {
    Answered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQueryResult {
    pub result_type: QueryResultType,
    pub answer: Option<Vec<u8>>,
    pub error_message: Option<String>,
}

impl WorkflowQueryResult {
    pub fn answered(answer: Vec<u8>) -> Self {
        Self {
            result_type: QueryResultType::Answered,
            answer: Some(answer),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result_type: QueryResultType::Failed,
            answer: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollForDecisionTaskRequest {
    pub domain: String,
    pub task_list: TaskList,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondDecisionTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub decisions: Vec<Decision>,
    pub identity: String,
    /// Set when the task carried a query
    pub query_result: Option<WorkflowQueryResult>,
    /// Ask the service to keep dispatching this run to the worker's sticky list
    pub sticky_task_list: Option<TaskList>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    UnhandledDecision,
    WorkflowWorkerUnhandledFailure,
    ResetStickyTaskList,
}

impl DecisionTaskFailedCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionTaskFailedCause::UnhandledDecision => "UNHANDLED_DECISION",
            DecisionTaskFailedCause::WorkflowWorkerUnhandledFailure => {
                "WORKFLOW_WORKER_UNHANDLED_FAILURE"
            }
            DecisionTaskFailedCause::ResetStickyTaskList => "RESET_STICKY_TASKLIST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondDecisionTaskFailedRequest {
    pub task_token: Vec<u8>,
    pub cause: DecisionTaskFailedCause,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

/// Workflow service operations a decision worker needs.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Returns `None` when no task became available before the poll expired.
    async fn poll_for_decision_task(
        &self,
        request: PollForDecisionTaskRequest,
    ) -> Result<Option<DecisionTask>, CadenceError>;

    async fn get_workflow_execution_history(
        &self,
        domain: &str,
        execution: &WorkflowExecution,
    ) -> Result<History, CadenceError>;

    async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<(), CadenceError>;

    async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<(), CadenceError>;
}

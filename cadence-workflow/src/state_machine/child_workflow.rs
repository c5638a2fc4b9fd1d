//! Child workflow state machine, kept in the parent's history.
//!
//! `Scheduled` means the start was initiated but the child run does not
//! exist yet; `Started` carries the child's run id.

use std::sync::{Arc, OnceLock};

use cadence_core::{
    ChildWorkflowExecutionCanceledEventAttributes, ChildWorkflowExecutionCompletedEventAttributes,
    ChildWorkflowExecutionFailedEventAttributes, ChildWorkflowExecutionStartedEventAttributes,
    ChildWorkflowExecutionTimedOutEventAttributes, EventAttributes, EventType,
    StartChildWorkflowExecutionDecisionAttributes,
    StartChildWorkflowExecutionFailedEventAttributes,
    StartChildWorkflowExecutionInitiatedEventAttributes, TimeoutType, WorkflowExecution,
    WorkflowType,
};

use super::context::{ChildWorkflowDispatch, RequestContext};
use super::{on_commit_data, SharedData, State, StateMachine, StateMachineError, TransitionTable};

const KIND: &str = "ChildWorkflow";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildWorkflowData {
    pub workflow_id: String,
    pub domain: String,
    pub workflow_type: Option<WorkflowType>,
    pub initiated_event_id: i64,
    pub started_event_id: i64,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildWorkflowRequest {
    Initiate(StartChildWorkflowExecutionDecisionAttributes),
    StartFailed { cause: String },
    Started { run_id: String },
    Complete { result: Option<Vec<u8>> },
    Fail {
        reason: Option<String>,
        details: Option<Vec<u8>>,
    },
    Cancel { details: Option<Vec<u8>> },
    TimeOut { timeout_type: TimeoutType },
}

pub type ChildWorkflowMachine = StateMachine<ChildWorkflowData, ChildWorkflowRequest>;

fn table() -> Arc<TransitionTable<ChildWorkflowData, ChildWorkflowRequest>> {
    static TABLE: OnceLock<Arc<TransitionTable<ChildWorkflowData, ChildWorkflowRequest>>> =
        OnceLock::new();
    TABLE
        .get_or_init(|| {
            Arc::new(
                TransitionTable::new()
                    .add(State::None, State::Scheduled, initiate)
                    .add(State::Scheduled, State::Failed, start_failed)
                    .add(State::Scheduled, State::Started, started)
                    .add(State::Started, State::Completed, close)
                    .add(State::Started, State::Failed, close)
                    .add(State::Started, State::Canceled, close)
                    .add(State::Started, State::TimedOut, close),
            )
        })
        .clone()
}

impl StateMachine<ChildWorkflowData, ChildWorkflowRequest> {
    pub fn child_workflow(workflow_id: impl Into<String>) -> Self {
        let data = ChildWorkflowData {
            workflow_id: workflow_id.into(),
            ..ChildWorkflowData::default()
        };
        StateMachine::new(KIND, data, table())
    }
}

fn invalid(message: &str) -> StateMachineError {
    StateMachineError::InvalidRequest {
        kind: KIND,
        message: message.to_string(),
    }
}

/// Initiated event id, looking into the current batch when the start is not
/// committed yet.
fn initiated_event_id(ctx: &RequestContext, data: &ChildWorkflowData) -> i64 {
    if data.initiated_event_id != 0 {
        return data.initiated_event_id;
    }
    ctx.events()
        .iter()
        .rev()
        .find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::StartChildWorkflowExecutionInitiatedEventAttributes(a))
                if a.workflow_id == data.workflow_id =>
            {
                Some(e.event_id)
            }
            _ => None,
        })
        .unwrap_or(0)
}

fn started_event_id(ctx: &RequestContext, data: &ChildWorkflowData) -> (i64, String) {
    if data.started_event_id != 0 {
        return (data.started_event_id, data.run_id.clone());
    }
    ctx.events()
        .iter()
        .rev()
        .find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::ChildWorkflowExecutionStartedEventAttributes(a))
                if a.workflow_execution.workflow_id == data.workflow_id =>
            {
                Some((e.event_id, a.workflow_execution.run_id.clone()))
            }
            _ => None,
        })
        .unwrap_or((0, String::new()))
}

fn initiate(
    ctx: &mut RequestContext,
    data: &SharedData<ChildWorkflowData>,
    request: &ChildWorkflowRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let ChildWorkflowRequest::Initiate(attrs) = request else {
        return Err(invalid("initiate expects start attributes"));
    };
    if attrs.workflow_id != data.lock().workflow_id {
        return Err(StateMachineError::InvalidRequest {
            kind: KIND,
            message: format!(
                "start of child {} on the machine of another child",
                attrs.workflow_id
            ),
        });
    }
    let initiated_event_id = ctx.add_event(
        EventType::StartChildWorkflowExecutionInitiated,
        EventAttributes::StartChildWorkflowExecutionInitiatedEventAttributes(Box::new(
            StartChildWorkflowExecutionInitiatedEventAttributes {
                domain: attrs.domain.clone(),
                workflow_id: attrs.workflow_id.clone(),
                workflow_type: attrs.workflow_type.clone(),
                task_list: attrs.task_list.clone(),
                input: attrs.input.clone(),
                execution_start_to_close_timeout_seconds: attrs
                    .execution_start_to_close_timeout_seconds,
                task_start_to_close_timeout_seconds: attrs.task_start_to_close_timeout_seconds,
                decision_task_completed_event_id,
            },
        )),
    );
    ctx.add_child_workflow(ChildWorkflowDispatch {
        domain: attrs.domain.clone(),
        workflow_id: attrs.workflow_id.clone(),
        workflow_type: attrs.workflow_type.clone(),
        task_list: attrs.task_list.clone(),
        input: attrs.input.clone(),
        execution_start_to_close_timeout_seconds: attrs.execution_start_to_close_timeout_seconds,
        task_start_to_close_timeout_seconds: attrs.task_start_to_close_timeout_seconds,
        initiated_event_id,
    });
    let domain = attrs.domain.clone();
    let workflow_type = attrs.workflow_type.clone();
    on_commit_data(ctx, data, move |d| {
        d.domain = domain;
        d.workflow_type = Some(workflow_type);
        d.initiated_event_id = initiated_event_id;
    });
    Ok(())
}

/// Fields every child event repeats.
fn identity(ctx: &RequestContext, data: &SharedData<ChildWorkflowData>) -> (String, String, WorkflowType, i64) {
    let d = data.lock();
    let workflow_type = d.workflow_type.clone().or_else(|| {
        ctx.events().iter().find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::StartChildWorkflowExecutionInitiatedEventAttributes(a))
                if a.workflow_id == d.workflow_id =>
            {
                Some(a.workflow_type.clone())
            }
            _ => None,
        })
    });
    (
        d.workflow_id.clone(),
        d.domain.clone(),
        workflow_type.unwrap_or_else(|| WorkflowType::new("")),
        initiated_event_id(ctx, &d),
    )
}

fn start_failed(
    ctx: &mut RequestContext,
    data: &SharedData<ChildWorkflowData>,
    request: &ChildWorkflowRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let ChildWorkflowRequest::StartFailed { cause } = request else {
        return Err(invalid("start failure expects a cause"));
    };
    let (workflow_id, domain, workflow_type, initiated_event_id) = identity(ctx, data);
    ctx.add_event(
        EventType::StartChildWorkflowExecutionFailed,
        EventAttributes::StartChildWorkflowExecutionFailedEventAttributes(Box::new(
            StartChildWorkflowExecutionFailedEventAttributes {
                domain,
                workflow_id,
                workflow_type,
                cause: cause.clone(),
                initiated_event_id,
                decision_task_completed_event_id,
            },
        )),
    );
    Ok(())
}

fn started(
    ctx: &mut RequestContext,
    data: &SharedData<ChildWorkflowData>,
    request: &ChildWorkflowRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ChildWorkflowRequest::Started { run_id } = request else {
        return Err(invalid("started expects the child's run id"));
    };
    let (workflow_id, domain, workflow_type, initiated_event_id) = identity(ctx, data);
    let started_event_id = ctx.add_event(
        EventType::ChildWorkflowExecutionStarted,
        EventAttributes::ChildWorkflowExecutionStartedEventAttributes(Box::new(
            ChildWorkflowExecutionStartedEventAttributes {
                domain,
                workflow_execution: WorkflowExecution::new(workflow_id, run_id.clone()),
                workflow_type,
                initiated_event_id,
            },
        )),
    );
    let run_id = run_id.clone();
    on_commit_data(ctx, data, move |d| {
        d.started_event_id = started_event_id;
        d.run_id = run_id;
    });
    Ok(())
}

fn close(
    ctx: &mut RequestContext,
    data: &SharedData<ChildWorkflowData>,
    request: &ChildWorkflowRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let (workflow_id, domain, workflow_type, initiated_event_id) = identity(ctx, data);
    let (started_event_id, run_id) = started_event_id(ctx, &data.lock());
    let workflow_execution = WorkflowExecution::new(workflow_id, run_id);
    let (event_type, attributes) = match request {
        ChildWorkflowRequest::Complete { result } => (
            EventType::ChildWorkflowExecutionCompleted,
            EventAttributes::ChildWorkflowExecutionCompletedEventAttributes(Box::new(
                ChildWorkflowExecutionCompletedEventAttributes {
                    result: result.clone(),
                    domain,
                    workflow_execution,
                    workflow_type,
                    initiated_event_id,
                    started_event_id,
                },
            )),
        ),
        ChildWorkflowRequest::Fail { reason, details } => (
            EventType::ChildWorkflowExecutionFailed,
            EventAttributes::ChildWorkflowExecutionFailedEventAttributes(Box::new(
                ChildWorkflowExecutionFailedEventAttributes {
                    reason: reason.clone(),
                    details: details.clone(),
                    domain,
                    workflow_execution,
                    workflow_type,
                    initiated_event_id,
                    started_event_id,
                },
            )),
        ),
        ChildWorkflowRequest::Cancel { details } => (
            EventType::ChildWorkflowExecutionCanceled,
            EventAttributes::ChildWorkflowExecutionCanceledEventAttributes(Box::new(
                ChildWorkflowExecutionCanceledEventAttributes {
                    details: details.clone(),
                    domain,
                    workflow_execution,
                    workflow_type,
                    initiated_event_id,
                    started_event_id,
                },
            )),
        ),
        ChildWorkflowRequest::TimeOut { timeout_type } => (
            EventType::ChildWorkflowExecutionTimedOut,
            EventAttributes::ChildWorkflowExecutionTimedOutEventAttributes(Box::new(
                ChildWorkflowExecutionTimedOutEventAttributes {
                    timeout_type: *timeout_type,
                    domain,
                    workflow_execution,
                    workflow_type,
                    initiated_event_id,
                    started_event_id,
                },
            )),
        ),
        _ => return Err(invalid("close expects a child outcome")),
    };
    ctx.add_event(event_type, attributes);
    Ok(())
}

use std::sync::{Arc, OnceLock};

use cadence_core::{
    EventAttributes, EventType, TimeoutType, WorkflowExecutionCancelRequestedEventAttributes,
    WorkflowExecutionCanceledEventAttributes, WorkflowExecutionCompletedEventAttributes,
    WorkflowExecutionFailedEventAttributes, WorkflowExecutionStartedEventAttributes,
    WorkflowExecutionTimedOutEventAttributes,
};

use super::context::RequestContext;
use super::{on_commit_data, SharedData, State, StateMachine, StateMachineError, TransitionTable};

const KIND: &str = "Workflow";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowData {
    pub started: Option<WorkflowExecutionStartedEventAttributes>,
    pub cancel_requested_cause: Option<String>,
    pub result: Option<Vec<u8>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowRequest {
    Start(WorkflowExecutionStartedEventAttributes),
    Complete {
        result: Option<Vec<u8>>,
    },
    Fail {
        reason: Option<String>,
        details: Option<Vec<u8>>,
    },
    TimeOut {
        timeout_type: TimeoutType,
    },
    RequestCancel {
        cause: Option<String>,
        identity: String,
    },
    Cancel {
        details: Option<Vec<u8>>,
    },
}

pub type WorkflowMachine = StateMachine<WorkflowData, WorkflowRequest>;

fn table() -> Arc<TransitionTable<WorkflowData, WorkflowRequest>> {
    static TABLE: OnceLock<Arc<TransitionTable<WorkflowData, WorkflowRequest>>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            Arc::new(
                TransitionTable::new()
                    .add(State::None, State::Started, start)
                    .add(State::Started, State::Completed, complete)
                    .add(State::Started, State::Failed, fail)
                    .add(State::Started, State::TimedOut, time_out)
                    .add(State::Started, State::CancellationRequested, request_cancel)
                    .add(State::CancellationRequested, State::Completed, complete)
                    .add(State::CancellationRequested, State::Canceled, cancel)
                    .add(State::CancellationRequested, State::Failed, fail)
                    .add(State::CancellationRequested, State::TimedOut, time_out),
            )
        })
        .clone()
}

impl StateMachine<WorkflowData, WorkflowRequest> {
    pub fn workflow() -> Self {
        StateMachine::new(KIND, WorkflowData::default(), table())
    }
}

fn invalid(message: &str) -> StateMachineError {
    StateMachineError::InvalidRequest {
        kind: KIND,
        message: message.to_string(),
    }
}

fn start(
    ctx: &mut RequestContext,
    data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::Start(attrs) = request else {
        return Err(invalid("start expects started attributes"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionStarted,
        EventAttributes::WorkflowExecutionStartedEventAttributes(Box::new(attrs.clone())),
    );
    let attrs = attrs.clone();
    on_commit_data(ctx, data, move |d| d.started = Some(attrs));
    Ok(())
}

fn complete(
    ctx: &mut RequestContext,
    data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::Complete { result } = request else {
        return Err(invalid("complete expects a result"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionCompleted,
        EventAttributes::WorkflowExecutionCompletedEventAttributes(Box::new(
            WorkflowExecutionCompletedEventAttributes {
                result: result.clone(),
                decision_task_completed_event_id,
            },
        )),
    );
    ctx.mark_workflow_closed();
    let result = result.clone();
    on_commit_data(ctx, data, move |d| d.result = result);
    Ok(())
}

fn fail(
    ctx: &mut RequestContext,
    data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::Fail { reason, details } = request else {
        return Err(invalid("fail expects a failure"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionFailed,
        EventAttributes::WorkflowExecutionFailedEventAttributes(Box::new(
            WorkflowExecutionFailedEventAttributes {
                reason: reason.clone(),
                details: details.clone(),
                decision_task_completed_event_id,
            },
        )),
    );
    ctx.mark_workflow_closed();
    let reason = reason.clone();
    on_commit_data(ctx, data, move |d| d.failure_reason = reason);
    Ok(())
}

fn time_out(
    ctx: &mut RequestContext,
    _data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::TimeOut { timeout_type } = request else {
        return Err(invalid("time out expects a timeout type"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionTimedOut,
        EventAttributes::WorkflowExecutionTimedOutEventAttributes(Box::new(
            WorkflowExecutionTimedOutEventAttributes {
                timeout_type: *timeout_type,
            },
        )),
    );
    ctx.mark_workflow_closed();
    Ok(())
}

fn request_cancel(
    ctx: &mut RequestContext,
    data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::RequestCancel { cause, identity } = request else {
        return Err(invalid("request cancel expects a cause"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionCancelRequested,
        EventAttributes::WorkflowExecutionCancelRequestedEventAttributes(Box::new(
            WorkflowExecutionCancelRequestedEventAttributes {
                cause: cause.clone(),
                identity: identity.clone(),
            },
        )),
    );
    let cause = cause.clone();
    on_commit_data(ctx, data, move |d| d.cancel_requested_cause = cause);
    Ok(())
}

fn cancel(
    ctx: &mut RequestContext,
    _data: &SharedData<WorkflowData>,
    request: &WorkflowRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let WorkflowRequest::Cancel { details } = request else {
        return Err(invalid("cancel expects details"));
    };
    ctx.add_event(
        EventType::WorkflowExecutionCanceled,
        EventAttributes::WorkflowExecutionCanceledEventAttributes(Box::new(
            WorkflowExecutionCanceledEventAttributes {
                decision_task_completed_event_id,
                details: details.clone(),
            },
        )),
    );
    ctx.mark_workflow_closed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ExecutionId;
    use cadence_core::{TaskList, WorkflowExecution, WorkflowType};

    fn ctx(next_event_id: i64) -> RequestContext {
        RequestContext::new(
            ExecutionId::new("domain", WorkflowExecution::new("wf", "run")),
            next_event_id,
            0,
        )
    }

    fn started() -> WorkflowRequest {
        WorkflowRequest::Start(WorkflowExecutionStartedEventAttributes {
            workflow_type: WorkflowType::new("greeting"),
            task_list: TaskList::new("tl"),
            input: Vec::new(),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            identity: "client".to_string(),
            attempt: 0,
        })
    }

    #[test]
    fn test_complete_closes_workflow() {
        let wf = WorkflowMachine::workflow();
        let mut c = ctx(1);
        wf.action(State::Started, &mut c, &started(), 0).unwrap();
        assert!(!c.commit().workflow_closed);

        let mut c = ctx(5);
        wf.action(
            State::Completed,
            &mut c,
            &WorkflowRequest::Complete {
                result: Some(b"\"done\"".to_vec()),
            },
            4,
        )
        .unwrap();
        let committed = c.commit();
        assert!(committed.workflow_closed);
        assert_eq!(committed.events[0].event_type, EventType::WorkflowExecutionCompleted);
        assert_eq!(wf.state(), State::Completed);
        assert!(wf.state().is_closed());
    }

    #[test]
    fn test_cancel_requires_cancel_request() {
        let wf = WorkflowMachine::workflow();
        let mut c = ctx(1);
        wf.action(State::Started, &mut c, &started(), 0).unwrap();
        let err = wf
            .action(State::Canceled, &mut c, &WorkflowRequest::Cancel { details: None }, 0)
            .unwrap_err();
        assert!(matches!(err, StateMachineError::IllegalTransition { .. }));

        wf.action(
            State::CancellationRequested,
            &mut c,
            &WorkflowRequest::RequestCancel {
                cause: Some("user".into()),
                identity: "cli".into(),
            },
            0,
        )
        .unwrap();
        wf.action(State::Canceled, &mut c, &WorkflowRequest::Cancel { details: None }, 0)
            .unwrap();
        c.commit();
        assert_eq!(wf.state(), State::Canceled);
        assert_eq!(wf.data().cancel_requested_cause.as_deref(), Some("user"));
    }

    #[test]
    fn test_closed_workflow_rejects_requests() {
        let wf = WorkflowMachine::workflow();
        let mut c = ctx(1);
        wf.action(State::Started, &mut c, &started(), 0).unwrap();
        wf.action(
            State::TimedOut,
            &mut c,
            &WorkflowRequest::TimeOut {
                timeout_type: TimeoutType::StartToClose,
            },
            0,
        )
        .unwrap();
        c.commit();

        let mut c = ctx(3);
        assert!(wf
            .action(
                State::Failed,
                &mut c,
                &WorkflowRequest::Fail {
                    reason: None,
                    details: None
                },
                0
            )
            .is_err());
    }
}

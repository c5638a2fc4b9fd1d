//! Activity task state machine.

use std::sync::{Arc, OnceLock};

use cadence_core::{
    ActivityTaskCancelRequestedEventAttributes, ActivityTaskCanceledEventAttributes,
    ActivityTaskCompletedEventAttributes, ActivityTaskFailedEventAttributes,
    ActivityTaskScheduledEventAttributes, ActivityTaskStartedEventAttributes,
    ActivityTaskTimedOutEventAttributes, ActivityType, EventAttributes, EventType,
    ScheduleActivityTaskDecisionAttributes, TaskList, TimeoutType,
};

use super::context::{ActivityTaskDispatch, RequestContext};
use super::{on_commit_data, SharedData, State, StateMachine, StateMachineError, TransitionTable};

const KIND: &str = "ActivityTask";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityTaskData {
    pub activity_id: String,
    pub activity_type: Option<ActivityType>,
    pub task_list: Option<TaskList>,
    pub input: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub cancel_requested_event_id: i64,
    pub heartbeat_details: Option<Vec<u8>>,
    pub identity: String,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityTaskRequest {
    Schedule(ScheduleActivityTaskDecisionAttributes),
    Start {
        identity: String,
        request_id: String,
    },
    Complete {
        identity: String,
        result: Option<Vec<u8>>,
    },
    Fail {
        identity: String,
        reason: Option<String>,
        details: Option<Vec<u8>>,
    },
    TimeOut {
        timeout_type: TimeoutType,
    },
    Heartbeat {
        details: Option<Vec<u8>>,
    },
    RequestCancel,
    ReportCanceled {
        identity: String,
        details: Option<Vec<u8>>,
    },
}

pub type ActivityTaskMachine = StateMachine<ActivityTaskData, ActivityTaskRequest>;

fn table() -> Arc<TransitionTable<ActivityTaskData, ActivityTaskRequest>> {
    static TABLE: OnceLock<Arc<TransitionTable<ActivityTaskData, ActivityTaskRequest>>> =
        OnceLock::new();
    TABLE
        .get_or_init(|| {
            Arc::new(
                TransitionTable::new()
                    .add(State::None, State::Scheduled, schedule)
                    .add(State::Scheduled, State::Started, start)
                    .add(State::Scheduled, State::TimedOut, time_out)
                    .add(State::Scheduled, State::CancellationRequested, request_cancel)
                    .add(State::Started, State::Completed, complete)
                    .add(State::Started, State::Failed, fail)
                    .add(State::Started, State::TimedOut, time_out)
                    .add(State::Started, State::Started, heartbeat)
                    .add(State::Started, State::CancellationRequested, request_cancel)
                    .add(State::CancellationRequested, State::Canceled, report_canceled)
                    .add(
                        State::CancellationRequested,
                        State::CancellationRequested,
                        heartbeat,
                    )
                    .add(State::CancellationRequested, State::TimedOut, time_out)
                    .add(State::CancellationRequested, State::Failed, fail),
            )
        })
        .clone()
}

impl StateMachine<ActivityTaskData, ActivityTaskRequest> {
    /// Machine for the activity `activity_id`; the id is fixed for its lifetime.
    pub fn activity_task(activity_id: impl Into<String>) -> Self {
        let data = ActivityTaskData {
            activity_id: activity_id.into(),
            ..ActivityTaskData::default()
        };
        StateMachine::new(KIND, data, table())
    }
}

fn invalid(message: impl Into<String>) -> StateMachineError {
    StateMachineError::InvalidRequest {
        kind: KIND,
        message: message.into(),
    }
}

/// Scheduled event id, looking at events of the current batch when the
/// schedule has not been committed yet.
fn scheduled_event_id(ctx: &RequestContext, data: &ActivityTaskData) -> i64 {
    if data.scheduled_event_id != 0 {
        return data.scheduled_event_id;
    }
    ctx.events()
        .iter()
        .rev()
        .find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::ActivityTaskScheduledEventAttributes(a))
                if a.activity_id == data.activity_id =>
            {
                Some(e.event_id)
            }
            _ => None,
        })
        .unwrap_or(0)
}

fn started_event_id(ctx: &RequestContext, data: &ActivityTaskData) -> i64 {
    if data.started_event_id != 0 {
        return data.started_event_id;
    }
    let scheduled = scheduled_event_id(ctx, data);
    ctx.events()
        .iter()
        .rev()
        .find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::ActivityTaskStartedEventAttributes(a))
                if a.scheduled_event_id == scheduled =>
            {
                Some(e.event_id)
            }
            _ => None,
        })
        .unwrap_or(0)
}

fn schedule(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::Schedule(attrs) = request else {
        return Err(invalid("schedule expects schedule attributes"));
    };
    if attrs.activity_id != data.lock().activity_id {
        return Err(invalid(format!(
            "schedule of activity {} on the machine of another activity",
            attrs.activity_id
        )));
    }
    let scheduled_event_id = ctx.add_event(
        EventType::ActivityTaskScheduled,
        EventAttributes::ActivityTaskScheduledEventAttributes(Box::new(
            ActivityTaskScheduledEventAttributes {
                activity_id: attrs.activity_id.clone(),
                activity_type: attrs.activity_type.clone(),
                task_list: attrs.task_list.clone(),
                input: attrs.input.clone(),
                schedule_to_close_timeout_seconds: attrs.schedule_to_close_timeout_seconds,
                schedule_to_start_timeout_seconds: attrs.schedule_to_start_timeout_seconds,
                start_to_close_timeout_seconds: attrs.start_to_close_timeout_seconds,
                heartbeat_timeout_seconds: attrs.heartbeat_timeout_seconds,
                decision_task_completed_event_id,
            },
        )),
    );
    ctx.add_activity_task(ActivityTaskDispatch {
        task_list: attrs.task_list.clone(),
        activity_id: attrs.activity_id.clone(),
        activity_type: attrs.activity_type.clone(),
        input: attrs.input.clone(),
        scheduled_event_id,
    });
    let attrs = attrs.clone();
    on_commit_data(ctx, data, move |d| {
        d.activity_type = Some(attrs.activity_type);
        d.task_list = Some(attrs.task_list);
        d.input = attrs.input;
        d.scheduled_event_id = scheduled_event_id;
    });
    Ok(())
}

fn start(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::Start {
        identity,
        request_id,
    } = request
    else {
        return Err(invalid("start expects a start request"));
    };
    let (scheduled, attempt) = {
        let d = data.lock();
        (scheduled_event_id(ctx, &d), d.attempt)
    };
    let started_event_id = ctx.add_event(
        EventType::ActivityTaskStarted,
        EventAttributes::ActivityTaskStartedEventAttributes(Box::new(
            ActivityTaskStartedEventAttributes {
                scheduled_event_id: scheduled,
                identity: identity.clone(),
                request_id: request_id.clone(),
                attempt,
            },
        )),
    );
    let identity = identity.clone();
    on_commit_data(ctx, data, move |d| {
        d.started_event_id = started_event_id;
        d.identity = identity;
    });
    Ok(())
}

fn complete(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::Complete { identity, result } = request else {
        return Err(invalid("complete expects a completion request"));
    };
    let (scheduled, started) = ids(ctx, data);
    ctx.add_event(
        EventType::ActivityTaskCompleted,
        EventAttributes::ActivityTaskCompletedEventAttributes(Box::new(
            ActivityTaskCompletedEventAttributes {
                result: result.clone(),
                scheduled_event_id: scheduled,
                started_event_id: started,
                identity: identity.clone(),
            },
        )),
    );
    Ok(())
}

fn fail(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::Fail {
        identity,
        reason,
        details,
    } = request
    else {
        return Err(invalid("fail expects a failure request"));
    };
    let (scheduled, started) = ids(ctx, data);
    ctx.add_event(
        EventType::ActivityTaskFailed,
        EventAttributes::ActivityTaskFailedEventAttributes(Box::new(
            ActivityTaskFailedEventAttributes {
                reason: reason.clone(),
                details: details.clone(),
                scheduled_event_id: scheduled,
                started_event_id: started,
                identity: identity.clone(),
            },
        )),
    );
    Ok(())
}

fn time_out(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::TimeOut { timeout_type } = request else {
        return Err(invalid("time out expects a timeout request"));
    };
    let (scheduled, started) = ids(ctx, data);
    let details = data.lock().heartbeat_details.clone();
    ctx.add_event(
        EventType::ActivityTaskTimedOut,
        EventAttributes::ActivityTaskTimedOutEventAttributes(Box::new(
            ActivityTaskTimedOutEventAttributes {
                details,
                scheduled_event_id: scheduled,
                started_event_id: started,
                timeout_type: *timeout_type,
            },
        )),
    );
    Ok(())
}

fn heartbeat(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::Heartbeat { details } = request else {
        return Err(invalid("heartbeat expects heartbeat details"));
    };
    let details = details.clone();
    on_commit_data(ctx, data, move |d| d.heartbeat_details = details);
    Ok(())
}

fn request_cancel(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    if !matches!(request, ActivityTaskRequest::RequestCancel) {
        return Err(invalid("request cancel expects a cancel request"));
    }
    let activity_id = data.lock().activity_id.clone();
    let event_id = ctx.add_event(
        EventType::ActivityTaskCancelRequested,
        EventAttributes::ActivityTaskCancelRequestedEventAttributes(Box::new(
            ActivityTaskCancelRequestedEventAttributes {
                activity_id,
                decision_task_completed_event_id,
            },
        )),
    );
    on_commit_data(ctx, data, move |d| d.cancel_requested_event_id = event_id);
    Ok(())
}

fn report_canceled(
    ctx: &mut RequestContext,
    data: &SharedData<ActivityTaskData>,
    request: &ActivityTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let ActivityTaskRequest::ReportCanceled { identity, details } = request else {
        return Err(invalid("report canceled expects a cancellation report"));
    };
    let (scheduled, started) = ids(ctx, data);
    let latest_cancel_requested_event_id = data.lock().cancel_requested_event_id;
    ctx.add_event(
        EventType::ActivityTaskCanceled,
        EventAttributes::ActivityTaskCanceledEventAttributes(Box::new(
            ActivityTaskCanceledEventAttributes {
                details: details.clone(),
                latest_cancel_requested_event_id,
                scheduled_event_id: scheduled,
                started_event_id: started,
                identity: identity.clone(),
            },
        )),
    );
    Ok(())
}

fn ids(ctx: &RequestContext, data: &SharedData<ActivityTaskData>) -> (i64, i64) {
    let d = data.lock();
    (scheduled_event_id(ctx, &d), started_event_id(ctx, &d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ExecutionId;
    use cadence_core::WorkflowExecution;

    fn ctx(next_event_id: i64) -> RequestContext {
        RequestContext::new(
            ExecutionId::new("domain", WorkflowExecution::new("wf", "run")),
            next_event_id,
            0,
        )
    }

    fn schedule_request() -> ActivityTaskRequest {
        ActivityTaskRequest::Schedule(ScheduleActivityTaskDecisionAttributes {
            activity_id: "1".to_string(),
            activity_type: ActivityType::new("greet"),
            task_list: TaskList::new("tl"),
            input: Some(b"in".to_vec()),
            schedule_to_close_timeout_seconds: 60,
            schedule_to_start_timeout_seconds: 60,
            start_to_close_timeout_seconds: 60,
            heartbeat_timeout_seconds: 0,
        })
    }

    #[test]
    fn test_schedule_start_complete() {
        let machine = ActivityTaskMachine::activity_task("1");

        let mut c = ctx(5);
        machine.action(State::Scheduled, &mut c, &schedule_request(), 4).unwrap();
        let committed = c.commit();
        assert_eq!(committed.events[0].event_id, 5);
        assert_eq!(committed.activity_tasks.len(), 1);
        assert_eq!(committed.activity_tasks[0].scheduled_event_id, 5);
        assert_eq!(machine.state(), State::Scheduled);
        assert_eq!(machine.data().scheduled_event_id, 5);

        let mut c = ctx(6);
        machine
            .action(
                State::Started,
                &mut c,
                &ActivityTaskRequest::Start {
                    identity: "worker".into(),
                    request_id: "r".into(),
                },
                0,
            )
            .unwrap();
        machine
            .action(
                State::Completed,
                &mut c,
                &ActivityTaskRequest::Complete {
                    identity: "worker".into(),
                    result: Some(b"out".to_vec()),
                },
                0,
            )
            .unwrap();
        let committed = c.commit();
        assert_eq!(machine.state(), State::Completed);
        match committed.events[1].attributes.as_ref() {
            Some(EventAttributes::ActivityTaskCompletedEventAttributes(a)) => {
                assert_eq!(a.scheduled_event_id, 5);
                assert_eq!(a.started_event_id, 6);
            }
            other => panic!("unexpected attributes {:?}", other),
        }
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let machine = ActivityTaskMachine::activity_task("1");
        let mut c = ctx(1);
        let err = machine
            .action(
                State::Completed,
                &mut c,
                &ActivityTaskRequest::Complete {
                    identity: "w".into(),
                    result: None,
                },
                0,
            )
            .unwrap_err();
        assert_eq!(
            err,
            StateMachineError::IllegalTransition {
                kind: "ActivityTask",
                from: State::None,
                to: State::Completed
            }
        );
        assert!(c.events().is_empty());
    }

    #[test]
    fn test_rollback_leaves_state_untouched() {
        let machine = ActivityTaskMachine::activity_task("1");
        let mut c = ctx(1);
        machine.action(State::Scheduled, &mut c, &schedule_request(), 0).unwrap();
        assert_eq!(machine.staged_state(&c), State::Scheduled);
        machine
            .action(State::CancellationRequested, &mut c, &ActivityTaskRequest::RequestCancel, 0)
            .unwrap();
        let before = machine.data().clone();
        c.rollback();
        assert_eq!(machine.state(), State::None);
        assert_eq!(*machine.data(), before);
        assert_eq!(
            *machine.data(),
            ActivityTaskData {
                activity_id: "1".to_string(),
                ..ActivityTaskData::default()
            }
        );
    }

    #[test]
    fn test_schedule_of_other_activity_is_rejected() {
        let machine = ActivityTaskMachine::activity_task("2");
        let mut c = ctx(1);
        let err = machine
            .action(State::Scheduled, &mut c, &schedule_request(), 0)
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidRequest { .. }));
        assert_eq!(machine.staged_state(&c), State::None);
    }

    #[test]
    fn test_heartbeat_while_cancel_requested() {
        let machine = ActivityTaskMachine::activity_task("1");
        let mut c = ctx(1);
        machine.action(State::Scheduled, &mut c, &schedule_request(), 0).unwrap();
        machine.action(State::CancellationRequested, &mut c, &ActivityTaskRequest::RequestCancel, 0).unwrap();
        c.commit();

        let mut c = ctx(3);
        machine
            .action(
                State::CancellationRequested,
                &mut c,
                &ActivityTaskRequest::Heartbeat {
                    details: Some(b"hb".to_vec()),
                },
                0,
            )
            .unwrap();
        c.commit();
        assert_eq!(machine.data().heartbeat_details, Some(b"hb".to_vec()));
        assert_eq!(machine.data().cancel_requested_event_id, 2);

        let mut c = ctx(3);
        machine
            .action(
                State::Canceled,
                &mut c,
                &ActivityTaskRequest::ReportCanceled {
                    identity: "w".into(),
                    details: None,
                },
                0,
            )
            .unwrap();
        c.commit();
        assert_eq!(machine.state(), State::Canceled);
    }
}

use std::sync::{Arc, OnceLock};

use cadence_core::{
    DecisionTaskCompletedEventAttributes, DecisionTaskFailedEventAttributes,
    DecisionTaskScheduledEventAttributes, DecisionTaskStartedEventAttributes,
    DecisionTaskTimedOutEventAttributes, EventAttributes, EventType, TaskList, TimeoutType,
};

use super::context::{DecisionTaskDispatch, RequestContext};
use super::{on_commit_data, SharedData, State, StateMachine, StateMachineError, TransitionTable};

const KIND: &str = "DecisionTask";

/// One decision round.
///
/// `previous_started_event_id` is the started event id of the last completed
/// round, fixed when the round is created and handed to the worker on start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionTaskData {
    pub previous_started_event_id: i64,
    pub task_list: Option<TaskList>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub attempt: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionTaskRequest {
    Schedule {
        task_list: TaskList,
        start_to_close_timeout_seconds: i32,
    },
    Start {
        identity: String,
        request_id: String,
    },
    Complete {
        identity: String,
    },
    TimeOut {
        timeout_type: TimeoutType,
    },
    Fail {
        cause: String,
        details: Option<Vec<u8>>,
        identity: String,
    },
}

pub type DecisionTaskMachine = StateMachine<DecisionTaskData, DecisionTaskRequest>;

fn table() -> Arc<TransitionTable<DecisionTaskData, DecisionTaskRequest>> {
    static TABLE: OnceLock<Arc<TransitionTable<DecisionTaskData, DecisionTaskRequest>>> =
        OnceLock::new();
    TABLE
        .get_or_init(|| {
            Arc::new(
                TransitionTable::new()
                    .add(State::None, State::Scheduled, schedule)
                    .add(State::Scheduled, State::Started, start)
                    .add(State::Started, State::Completed, complete)
                    .add(State::Started, State::TimedOut, time_out)
                    .add(State::Started, State::Failed, fail),
            )
        })
        .clone()
}

impl StateMachine<DecisionTaskData, DecisionTaskRequest> {
    pub fn decision_task(previous_started_event_id: i64) -> Self {
        StateMachine::new(
            KIND,
            DecisionTaskData {
                previous_started_event_id,
                ..DecisionTaskData::default()
            },
            table(),
        )
    }
}

fn invalid(message: &str) -> StateMachineError {
    StateMachineError::InvalidRequest {
        kind: KIND,
        message: message.to_string(),
    }
}

fn schedule(
    ctx: &mut RequestContext,
    data: &SharedData<DecisionTaskData>,
    request: &DecisionTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let DecisionTaskRequest::Schedule {
        task_list,
        start_to_close_timeout_seconds,
    } = request
    else {
        return Err(invalid("schedule expects a task list"));
    };
    let attempt = data.lock().attempt;
    let scheduled_event_id = ctx.add_event(
        EventType::DecisionTaskScheduled,
        EventAttributes::DecisionTaskScheduledEventAttributes(Box::new(
            DecisionTaskScheduledEventAttributes {
                task_list: task_list.clone(),
                start_to_close_timeout_seconds: *start_to_close_timeout_seconds,
                attempt,
            },
        )),
    );
    ctx.schedule_decision_task(DecisionTaskDispatch {
        task_list: task_list.clone(),
        scheduled_event_id,
    });
    let task_list = task_list.clone();
    on_commit_data(ctx, data, move |d| {
        d.task_list = Some(task_list);
        d.scheduled_event_id = scheduled_event_id;
    });
    Ok(())
}

fn scheduled_event_id(ctx: &RequestContext, data: &DecisionTaskData) -> i64 {
    if data.scheduled_event_id != 0 {
        return data.scheduled_event_id;
    }
    ctx.events()
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::DecisionTaskScheduled)
        .map(|e| e.event_id)
        .unwrap_or(0)
}

fn start(
    ctx: &mut RequestContext,
    data: &SharedData<DecisionTaskData>,
    request: &DecisionTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let DecisionTaskRequest::Start {
        identity,
        request_id,
    } = request
    else {
        return Err(invalid("start expects a poll request"));
    };
    let scheduled = scheduled_event_id(ctx, &data.lock());
    let started_event_id = ctx.add_event(
        EventType::DecisionTaskStarted,
        EventAttributes::DecisionTaskStartedEventAttributes(Box::new(
            DecisionTaskStartedEventAttributes {
                scheduled_event_id: scheduled,
                identity: identity.clone(),
                request_id: request_id.clone(),
            },
        )),
    );
    on_commit_data(ctx, data, move |d| d.started_event_id = started_event_id);
    Ok(())
}

fn complete(
    ctx: &mut RequestContext,
    data: &SharedData<DecisionTaskData>,
    request: &DecisionTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let DecisionTaskRequest::Complete { identity } = request else {
        return Err(invalid("complete expects an identity"));
    };
    let (scheduled, started) = {
        let d = data.lock();
        (d.scheduled_event_id, d.started_event_id)
    };
    ctx.add_event(
        EventType::DecisionTaskCompleted,
        EventAttributes::DecisionTaskCompletedEventAttributes(Box::new(
            DecisionTaskCompletedEventAttributes {
                scheduled_event_id: scheduled,
                started_event_id: started,
                identity: identity.clone(),
            },
        )),
    );
    Ok(())
}

/// Scheduled and started ids, including a start staged in the same batch.
fn round_ids(ctx: &RequestContext, data: &DecisionTaskData) -> (i64, i64) {
    let started = if data.started_event_id != 0 {
        data.started_event_id
    } else {
        ctx.events()
            .iter()
            .rev()
            .find(|e| e.event_type == EventType::DecisionTaskStarted)
            .map(|e| e.event_id)
            .unwrap_or(0)
    };
    (scheduled_event_id(ctx, data), started)
}

fn time_out(
    ctx: &mut RequestContext,
    data: &SharedData<DecisionTaskData>,
    request: &DecisionTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let DecisionTaskRequest::TimeOut { timeout_type } = request else {
        return Err(invalid("time out expects a timeout type"));
    };
    let (scheduled, started) = round_ids(ctx, &data.lock());
    ctx.add_event(
        EventType::DecisionTaskTimedOut,
        EventAttributes::DecisionTaskTimedOutEventAttributes(Box::new(
            DecisionTaskTimedOutEventAttributes {
                scheduled_event_id: scheduled,
                started_event_id: started,
                timeout_type: *timeout_type,
            },
        )),
    );
    Ok(())
}

fn fail(
    ctx: &mut RequestContext,
    data: &SharedData<DecisionTaskData>,
    request: &DecisionTaskRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let DecisionTaskRequest::Fail {
        cause,
        details,
        identity,
    } = request
    else {
        return Err(invalid("fail expects a cause"));
    };
    let (scheduled, started) = round_ids(ctx, &data.lock());
    ctx.add_event(
        EventType::DecisionTaskFailed,
        EventAttributes::DecisionTaskFailedEventAttributes(Box::new(
            DecisionTaskFailedEventAttributes {
                scheduled_event_id: scheduled,
                started_event_id: started,
                cause: cause.clone(),
                details: details.clone(),
                identity: identity.clone(),
            },
        )),
    );
    Ok(())
}

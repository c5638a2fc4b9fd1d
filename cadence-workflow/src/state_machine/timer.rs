use std::sync::{Arc, OnceLock};

use cadence_core::{
    EventAttributes, EventType, StartTimerDecisionAttributes, TimerCanceledEventAttributes,
    TimerFiredEventAttributes, TimerStartedEventAttributes,
};

use super::context::{RequestContext, TimerRegistration};
use super::{on_commit_data, SharedData, State, StateMachine, StateMachineError, TransitionTable};

const KIND: &str = "Timer";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerData {
    pub timer_id: String,
    pub started_event_id: i64,
    pub fire_time_millis: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerRequest {
    Start(StartTimerDecisionAttributes),
    Fire,
    Cancel { identity: String },
}

pub type TimerMachine = StateMachine<TimerData, TimerRequest>;

fn table() -> Arc<TransitionTable<TimerData, TimerRequest>> {
    static TABLE: OnceLock<Arc<TransitionTable<TimerData, TimerRequest>>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            Arc::new(
                TransitionTable::new()
                    .add(State::None, State::Started, start)
                    .add(State::Started, State::Completed, fire)
                    .add(State::Started, State::Canceled, cancel),
            )
        })
        .clone()
}

impl StateMachine<TimerData, TimerRequest> {
    pub fn timer(timer_id: impl Into<String>) -> Self {
        let data = TimerData {
            timer_id: timer_id.into(),
            ..TimerData::default()
        };
        StateMachine::new(KIND, data, table())
    }
}

fn started_event_id(ctx: &RequestContext, data: &TimerData) -> i64 {
    if data.started_event_id != 0 {
        return data.started_event_id;
    }
    ctx.events()
        .iter()
        .rev()
        .find_map(|e| match e.attributes.as_ref() {
            Some(EventAttributes::TimerStartedEventAttributes(a))
                if a.timer_id == data.timer_id =>
            {
                Some(e.event_id)
            }
            _ => None,
        })
        .unwrap_or(0)
}

fn start(
    ctx: &mut RequestContext,
    data: &SharedData<TimerData>,
    request: &TimerRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let TimerRequest::Start(attrs) = request else {
        return Err(StateMachineError::InvalidRequest {
            kind: KIND,
            message: "start expects timer attributes".to_string(),
        });
    };
    if attrs.timer_id != data.lock().timer_id {
        return Err(StateMachineError::InvalidRequest {
            kind: KIND,
            message: format!("start of timer {} on the machine of another timer", attrs.timer_id),
        });
    }
    let started_event_id = ctx.add_event(
        EventType::TimerStarted,
        EventAttributes::TimerStartedEventAttributes(Box::new(TimerStartedEventAttributes {
            timer_id: attrs.timer_id.clone(),
            start_to_fire_timeout_seconds: attrs.start_to_fire_timeout_seconds,
            decision_task_completed_event_id,
        })),
    );
    let fire_time_millis =
        ctx.current_time_millis() + attrs.start_to_fire_timeout_seconds.max(0) * 1000;
    ctx.add_timer(TimerRegistration {
        timer_id: attrs.timer_id.clone(),
        fire_time_millis,
    });
    on_commit_data(ctx, data, move |d| {
        d.started_event_id = started_event_id;
        d.fire_time_millis = fire_time_millis;
    });
    Ok(())
}

fn fire(
    ctx: &mut RequestContext,
    data: &SharedData<TimerData>,
    _request: &TimerRequest,
    _causal_event_id: i64,
) -> Result<(), StateMachineError> {
    let (timer_id, started) = {
        let d = data.lock();
        (d.timer_id.clone(), started_event_id(ctx, &d))
    };
    ctx.add_event(
        EventType::TimerFired,
        EventAttributes::TimerFiredEventAttributes(Box::new(TimerFiredEventAttributes {
            timer_id,
            started_event_id: started,
        })),
    );
    Ok(())
}

fn cancel(
    ctx: &mut RequestContext,
    data: &SharedData<TimerData>,
    request: &TimerRequest,
    decision_task_completed_event_id: i64,
) -> Result<(), StateMachineError> {
    let TimerRequest::Cancel { identity } = request else {
        return Err(StateMachineError::InvalidRequest {
            kind: KIND,
            message: "cancel expects a cancel request".to_string(),
        });
    };
    let (timer_id, started) = {
        let d = data.lock();
        (d.timer_id.clone(), started_event_id(ctx, &d))
    };
    ctx.add_event(
        EventType::TimerCanceled,
        EventAttributes::TimerCanceledEventAttributes(Box::new(TimerCanceledEventAttributes {
            timer_id,
            started_event_id: started,
            decision_task_completed_event_id,
            identity: identity.clone(),
        })),
    );
    Ok(())
}

//! Decision bookkeeping for one workflow run.
//!
//! [`DecisionsHelper`] owns the workflow, activity, timer and child workflow
//! state machines of a run as seen by the worker. Commands submitted by workflow code run their
//! transitions inside the open round's [`RequestContext`]; the events those
//! transitions add are the history the service is expected to record for the
//! round's decisions. History events coming back from the service run the
//! remaining transitions and complete the promises workflow code waits on.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::{
    ActivityType, Decision, EventAttributes, EventType, HistoryEvent,
    MarkerRecordedEventAttributes, ScheduleActivityTaskDecisionAttributes,
    StartChildWorkflowExecutionDecisionAttributes, StartTimerDecisionAttributes, TaskList,
    WorkflowExecutionStartedEventAttributes, WorkflowType,
};
use cadence_workflow::state_machine::{
    ActivityTaskMachine, ActivityTaskRequest, ChildWorkflowMachine, ChildWorkflowRequest,
    ExecutionId, RequestContext, State, TimerMachine, TimerRequest, WorkflowMachine,
    WorkflowRequest,
};
use cadence_workflow::{
    decode_side_effect_details, decode_version_details, CommandResult, CommandSink,
    ScheduleActivityCommand, StartChildWorkflowCommand, WorkflowCommand, WorkflowError,
    WorkflowPromise, SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::decider::DeciderError;

const WAKE_UP_TIMER_PREFIX: &str = "wake-up-";

struct ActivityEntry {
    machine: ActivityTaskMachine,
    promise: WorkflowPromise<Vec<u8>>,
}

struct TimerEntry {
    machine: TimerMachine,
    /// `None` for wake-up timers, which only advance the runner's clock
    promise: Option<WorkflowPromise<Vec<u8>>>,
}

struct ChildEntry {
    machine: ChildWorkflowMachine,
    promise: WorkflowPromise<Vec<u8>>,
}

/// Decisions of one round and the history events they are expected to produce.
pub struct Round {
    ctx: RequestContext,
    decisions: Vec<Decision>,
    decision_task_completed_event_id: i64,
    /// Entities created by the round, dropped again when it is rolled back
    scheduled_activities: Vec<(String, i64)>,
    started_timers: Vec<String>,
    initiated_children: Vec<(String, i64)>,
}

impl Round {
    /// Events the service records when it accepts the round's decisions.
    pub fn events(&self) -> &[HistoryEvent] {
        self.ctx.events()
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn commit(self) -> Vec<Decision> {
        self.ctx.commit();
        self.decisions
    }
}

pub struct DecisionsHelper {
    execution: ExecutionId,
    task_list: TaskList,
    workflow: WorkflowMachine,
    activities: HashMap<String, ActivityEntry>,
    activity_ids: HashMap<i64, String>,
    timers: HashMap<String, TimerEntry>,
    children: HashMap<String, ChildEntry>,
    /// Initiated event id to child workflow id
    child_ids: HashMap<i64, String>,
    side_effects: HashMap<u64, Vec<u8>>,
    versions: HashMap<String, i32>,
    replaying: bool,
    round: Option<Round>,
    defect: Option<DeciderError>,
}

impl DecisionsHelper {
    pub fn new(execution: ExecutionId) -> Self {
        Self {
            execution,
            task_list: TaskList::new(""),
            workflow: WorkflowMachine::workflow(),
            activities: HashMap::new(),
            activity_ids: HashMap::new(),
            timers: HashMap::new(),
            children: HashMap::new(),
            child_ids: HashMap::new(),
            side_effects: HashMap::new(),
            versions: HashMap::new(),
            replaying: false,
            round: None,
            defect: None,
        }
    }

    /// Committed state of the workflow machine.
    pub fn workflow_state(&self) -> State {
        self.workflow.state()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub fn recorded_side_effect(&self, side_effect_id: u64) -> Option<Vec<u8>> {
        self.side_effects.get(&side_effect_id).cloned()
    }

    pub fn recorded_version(&self, change_id: &str) -> Option<i32> {
        self.versions.get(change_id).copied()
    }

    /// Makes the values of recorded side effect and version markers
    /// available to replay.
    pub fn add_markers(&mut self, markers: &[HistoryEvent]) -> Result<(), DeciderError> {
        for marker in markers.iter().filter_map(HistoryEvent::marker_attributes) {
            match marker.marker_name.as_str() {
                SIDE_EFFECT_MARKER_NAME => {
                    let details = decode_side_effect_details(&marker.details)
                        .map_err(|e| DeciderError::InvalidMarker(e.to_string()))?;
                    self.side_effects.insert(details.side_effect_id, details.result);
                }
                VERSION_MARKER_NAME => {
                    let details = decode_version_details(&marker.details)
                        .map_err(|e| DeciderError::InvalidMarker(e.to_string()))?;
                    self.versions.insert(details.change_id, details.version);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn event_context(&self, event: &HistoryEvent) -> RequestContext {
        RequestContext::new(
            self.execution.clone(),
            event.event_id,
            event.timestamp_millis(),
        )
    }

    pub fn handle_workflow_started(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<WorkflowExecutionStartedEventAttributes, DeciderError> {
        let Some(EventAttributes::WorkflowExecutionStartedEventAttributes(attrs)) =
            event.attributes.as_ref()
        else {
            return Err(DeciderError::MissingStartEvent);
        };
        let attrs = attrs.as_ref().clone();
        let mut ctx = self.event_context(event);
        self.workflow
            .action(State::Started, &mut ctx, &WorkflowRequest::Start(attrs.clone()), 0)?;
        ctx.commit();
        self.task_list = attrs.task_list.clone();
        Ok(attrs)
    }

    /// Returns the cause when the request moved the workflow to
    /// cancellation requested; repeated requests are ignored.
    pub fn handle_cancel_requested(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<Option<String>, DeciderError> {
        let Some(EventAttributes::WorkflowExecutionCancelRequestedEventAttributes(attrs)) =
            event.attributes.as_ref()
        else {
            return Err(DeciderError::UnknownEntity {
                kind: "workflow",
                event_id: event.event_id,
            });
        };
        if self.workflow.state() != State::Started {
            debug!(event_id = event.event_id, "ignoring repeated cancel request");
            return Ok(None);
        }
        let mut ctx = self.event_context(event);
        self.workflow.action(
            State::CancellationRequested,
            &mut ctx,
            &WorkflowRequest::RequestCancel {
                cause: attrs.cause.clone(),
                identity: attrs.identity.clone(),
            },
            0,
        )?;
        ctx.commit();
        Ok(Some(attrs.cause.clone().unwrap_or_default()))
    }

    fn activity_for(&self, event: &HistoryEvent) -> Result<&ActivityEntry, DeciderError> {
        event
            .activity_scheduled_event_id()
            .and_then(|id| self.activity_ids.get(&id))
            .and_then(|activity_id| self.activities.get(activity_id))
            .ok_or(DeciderError::UnknownEntity {
                kind: "activity",
                event_id: event.event_id,
            })
    }

    fn timer_for(&self, event: &HistoryEvent, timer_id: &str) -> Result<&TimerEntry, DeciderError> {
        self.timers.get(timer_id).ok_or(DeciderError::UnknownEntity {
            kind: "timer",
            event_id: event.event_id,
        })
    }

    fn child_for(&self, event: &HistoryEvent) -> Result<&ChildEntry, DeciderError> {
        event
            .child_initiated_event_id()
            .and_then(|id| self.child_ids.get(&id))
            .and_then(|workflow_id| self.children.get(workflow_id))
            .ok_or(DeciderError::UnknownEntity {
                kind: "child workflow",
                event_id: event.event_id,
            })
    }

    /// Applies an activity, timer or child workflow event from history.
    pub fn handle_event(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        let mut ctx = self.event_context(event);
        match event.attributes.as_ref() {
            Some(EventAttributes::StartChildWorkflowExecutionFailedEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::Failed,
                    &mut ctx,
                    &ChildWorkflowRequest::StartFailed {
                        cause: a.cause.clone(),
                    },
                    a.decision_task_completed_event_id,
                )?;
                ctx.commit();
                entry
                    .promise
                    .fail(WorkflowError::StartChildWorkflowFailed(a.cause.clone()));
            }
            Some(EventAttributes::ChildWorkflowExecutionStartedEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::Started,
                    &mut ctx,
                    &ChildWorkflowRequest::Started {
                        run_id: a.workflow_execution.run_id.clone(),
                    },
                    0,
                )?;
                ctx.commit();
            }
            Some(EventAttributes::ChildWorkflowExecutionCompletedEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::Completed,
                    &mut ctx,
                    &ChildWorkflowRequest::Complete {
                        result: a.result.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.complete(a.result.clone().unwrap_or_default());
            }
            Some(EventAttributes::ChildWorkflowExecutionFailedEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::Failed,
                    &mut ctx,
                    &ChildWorkflowRequest::Fail {
                        reason: a.reason.clone(),
                        details: a.details.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.fail(WorkflowError::ChildWorkflowFailed {
                    reason: a.reason.clone().unwrap_or_default(),
                    details: a.details.clone(),
                });
            }
            Some(EventAttributes::ChildWorkflowExecutionCanceledEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::Canceled,
                    &mut ctx,
                    &ChildWorkflowRequest::Cancel {
                        details: a.details.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.fail(WorkflowError::Canceled(format!(
                    "child workflow {} canceled",
                    a.workflow_execution.workflow_id
                )));
            }
            Some(EventAttributes::ChildWorkflowExecutionTimedOutEventAttributes(a)) => {
                let entry = self.child_for(event)?;
                entry.machine.action(
                    State::TimedOut,
                    &mut ctx,
                    &ChildWorkflowRequest::TimeOut {
                        timeout_type: a.timeout_type,
                    },
                    0,
                )?;
                ctx.commit();
                entry
                    .promise
                    .fail(WorkflowError::ChildWorkflowTimedOut(a.timeout_type));
            }
            Some(EventAttributes::ActivityTaskStartedEventAttributes(a)) => {
                let entry = self.activity_for(event)?;
                entry.machine.action(
                    State::Started,
                    &mut ctx,
                    &ActivityTaskRequest::Start {
                        identity: a.identity.clone(),
                        request_id: a.request_id.clone(),
                    },
                    0,
                )?;
                ctx.commit();
            }
            Some(EventAttributes::ActivityTaskCompletedEventAttributes(a)) => {
                let entry = self.activity_for(event)?;
                entry.machine.action(
                    State::Completed,
                    &mut ctx,
                    &ActivityTaskRequest::Complete {
                        identity: a.identity.clone(),
                        result: a.result.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.complete(a.result.clone().unwrap_or_default());
            }
            Some(EventAttributes::ActivityTaskFailedEventAttributes(a)) => {
                let entry = self.activity_for(event)?;
                entry.machine.action(
                    State::Failed,
                    &mut ctx,
                    &ActivityTaskRequest::Fail {
                        identity: a.identity.clone(),
                        reason: a.reason.clone(),
                        details: a.details.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.fail(WorkflowError::ActivityFailed {
                    reason: a.reason.clone().unwrap_or_default(),
                    details: a.details.clone(),
                });
            }
            Some(EventAttributes::ActivityTaskTimedOutEventAttributes(a)) => {
                let entry = self.activity_for(event)?;
                entry.machine.action(
                    State::TimedOut,
                    &mut ctx,
                    &ActivityTaskRequest::TimeOut {
                        timeout_type: a.timeout_type,
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.fail(WorkflowError::ActivityTimedOut(a.timeout_type));
            }
            Some(EventAttributes::ActivityTaskCanceledEventAttributes(a)) => {
                let entry = self.activity_for(event)?;
                entry.machine.action(
                    State::Canceled,
                    &mut ctx,
                    &ActivityTaskRequest::ReportCanceled {
                        identity: a.identity.clone(),
                        details: a.details.clone(),
                    },
                    0,
                )?;
                ctx.commit();
                entry.promise.fail(WorkflowError::Canceled(format!(
                    "activity {} canceled",
                    entry.machine.data().activity_id
                )));
            }
            Some(EventAttributes::TimerFiredEventAttributes(a)) => {
                let entry = self.timer_for(event, &a.timer_id)?;
                entry
                    .machine
                    .action(State::Completed, &mut ctx, &TimerRequest::Fire, 0)?;
                ctx.commit();
                if let Some(promise) = &entry.promise {
                    promise.complete(Vec::new());
                }
            }
            _ => {
                trace!(event_id = event.event_id, event_type = ?event.event_type, "event needs no transition");
            }
        }
        Ok(())
    }

    /// Moves activities and child workflows to the event ids the service
    /// actually assigned to the last answered round.
    pub fn confirm_decision_events(&mut self, events: &[HistoryEvent]) {
        for event in events {
            if let Some(EventAttributes::StartChildWorkflowExecutionInitiatedEventAttributes(a)) =
                event.attributes.as_ref()
            {
                self.confirm_child(&a.workflow_id, event.event_id);
                continue;
            }
            let Some(EventAttributes::ActivityTaskScheduledEventAttributes(a)) =
                event.attributes.as_ref()
            else {
                continue;
            };
            let Some(entry) = self.activities.get(&a.activity_id) else {
                continue;
            };
            let predicted = entry.machine.data().scheduled_event_id;
            if predicted != event.event_id {
                debug!(
                    activity_id = %a.activity_id,
                    predicted,
                    actual = event.event_id,
                    "activity scheduled under a different event id"
                );
                self.activity_ids.remove(&predicted);
                self.activity_ids.insert(event.event_id, a.activity_id.clone());
                entry.machine.data().scheduled_event_id = event.event_id;
            }
        }
    }

    fn confirm_child(&mut self, workflow_id: &str, actual: i64) {
        let Some(entry) = self.children.get(workflow_id) else {
            return;
        };
        let predicted = entry.machine.data().initiated_event_id;
        if predicted != actual {
            debug!(workflow_id, predicted, actual, "child initiated under a different event id");
            self.child_ids.remove(&predicted);
            self.child_ids.insert(actual, workflow_id.to_string());
            entry.machine.data().initiated_event_id = actual;
        }
    }

    pub fn begin_round(&mut self, next_decision_event_id: i64, current_time_millis: i64) {
        self.round = Some(Round {
            ctx: RequestContext::new(
                self.execution.clone(),
                next_decision_event_id,
                current_time_millis,
            ),
            decisions: Vec::new(),
            decision_task_completed_event_id: next_decision_event_id - 1,
            scheduled_activities: Vec::new(),
            started_timers: Vec::new(),
            initiated_children: Vec::new(),
        });
    }

    /// Discards the round together with the entities it created.
    pub fn rollback_round(&mut self, round: Round) {
        for (workflow_id, initiated_event_id) in &round.initiated_children {
            self.children.remove(workflow_id);
            self.child_ids.remove(initiated_event_id);
        }
        for (activity_id, scheduled_event_id) in &round.scheduled_activities {
            self.activities.remove(activity_id);
            self.activity_ids.remove(scheduled_event_id);
        }
        for timer_id in &round.started_timers {
            self.timers.remove(timer_id);
        }
        round.ctx.rollback();
    }

    pub fn take_round(&mut self) -> Option<Round> {
        self.round.take()
    }

    pub fn take_defect(&mut self) -> Option<DeciderError> {
        self.defect.take()
    }

    fn record_defect(&mut self, error: DeciderError) -> WorkflowError {
        let message = error.to_string();
        if self.defect.is_none() {
            self.defect = Some(error);
        }
        WorkflowError::Internal(message)
    }

    fn schedule_activity(
        &mut self,
        cmd: ScheduleActivityCommand,
    ) -> Result<WorkflowPromise<Vec<u8>>, DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        let task_list = if cmd.options.task_list.is_empty() {
            self.task_list.clone()
        } else {
            TaskList::new(cmd.options.task_list.clone())
        };
        let attrs = ScheduleActivityTaskDecisionAttributes {
            activity_id: cmd.activity_id.clone(),
            activity_type: ActivityType::new(cmd.activity_type),
            task_list,
            input: cmd.args,
            schedule_to_close_timeout_seconds: timeout_seconds(cmd.options.schedule_to_close_timeout),
            schedule_to_start_timeout_seconds: timeout_seconds(cmd.options.schedule_to_start_timeout),
            start_to_close_timeout_seconds: timeout_seconds(cmd.options.start_to_close_timeout),
            heartbeat_timeout_seconds: timeout_seconds(cmd.options.heartbeat_timeout),
        };
        let machine = ActivityTaskMachine::activity_task(cmd.activity_id.clone());
        machine.action(
            State::Scheduled,
            &mut round.ctx,
            &ActivityTaskRequest::Schedule(attrs.clone()),
            round.decision_task_completed_event_id,
        )?;
        if let Some(event) = round.ctx.events().last() {
            self.activity_ids.insert(event.event_id, cmd.activity_id.clone());
            round
                .scheduled_activities
                .push((cmd.activity_id.clone(), event.event_id));
        }
        round.decisions.push(Decision::schedule_activity_task(attrs));

        let promise = WorkflowPromise::new();
        self.activities.insert(
            cmd.activity_id,
            ActivityEntry {
                machine,
                promise: promise.clone(),
            },
        );
        Ok(promise)
    }

    fn start_child_workflow(
        &mut self,
        cmd: StartChildWorkflowCommand,
    ) -> Result<WorkflowPromise<Vec<u8>>, DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        let task_list = if cmd.options.task_list.is_empty() {
            self.task_list.clone()
        } else {
            TaskList::new(cmd.options.task_list.clone())
        };
        let domain = if cmd.options.domain.is_empty() {
            self.execution.domain.clone()
        } else {
            cmd.options.domain.clone()
        };
        let attrs = StartChildWorkflowExecutionDecisionAttributes {
            domain,
            workflow_id: cmd.workflow_id.clone(),
            workflow_type: WorkflowType::new(cmd.workflow_type),
            task_list,
            input: cmd.args,
            execution_start_to_close_timeout_seconds: timeout_seconds(
                cmd.options.execution_start_to_close_timeout,
            ),
            task_start_to_close_timeout_seconds: timeout_seconds(
                cmd.options.task_start_to_close_timeout,
            ),
        };
        let machine = ChildWorkflowMachine::child_workflow(cmd.workflow_id.clone());
        machine.action(
            State::Scheduled,
            &mut round.ctx,
            &ChildWorkflowRequest::Initiate(attrs.clone()),
            round.decision_task_completed_event_id,
        )?;
        if let Some(event) = round.ctx.events().last() {
            self.child_ids.insert(event.event_id, cmd.workflow_id.clone());
            round
                .initiated_children
                .push((cmd.workflow_id.clone(), event.event_id));
        }
        round
            .decisions
            .push(Decision::start_child_workflow_execution(attrs));

        let promise = WorkflowPromise::new();
        self.children.insert(
            cmd.workflow_id,
            ChildEntry {
                machine,
                promise: promise.clone(),
            },
        );
        Ok(promise)
    }

    fn request_cancel_activity(&mut self, activity_id: &str) -> Result<(), DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        let Some(entry) = self.activities.get(activity_id) else {
            return Ok(());
        };
        let state = entry.machine.staged_state(&round.ctx);
        if state.is_closed() || state == State::CancellationRequested {
            return Ok(());
        }
        entry.machine.action(
            State::CancellationRequested,
            &mut round.ctx,
            &ActivityTaskRequest::RequestCancel,
            round.decision_task_completed_event_id,
        )?;
        round
            .decisions
            .push(Decision::request_cancel_activity_task(activity_id));
        Ok(())
    }

    fn start_timer_entry(
        &mut self,
        timer_id: String,
        duration_millis: i64,
        promise: Option<WorkflowPromise<Vec<u8>>>,
    ) -> Result<(), DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        // timers have second resolution on the service
        let seconds = ((duration_millis.max(1) + 999) / 1000).max(1);
        let attrs = StartTimerDecisionAttributes {
            timer_id: timer_id.clone(),
            start_to_fire_timeout_seconds: seconds,
        };
        let machine = TimerMachine::timer(timer_id.clone());
        machine.action(
            State::Started,
            &mut round.ctx,
            &TimerRequest::Start(attrs),
            round.decision_task_completed_event_id,
        )?;
        round
            .decisions
            .push(Decision::start_timer(timer_id.clone(), seconds));
        round.started_timers.push(timer_id.clone());
        self.timers.insert(timer_id, TimerEntry { machine, promise });
        Ok(())
    }

    /// Durable timer that wakes the workflow up at `fire_time_millis`.
    pub fn start_wake_up_timer(&mut self, fire_time_millis: i64) -> Result<(), DeciderError> {
        let timer_id = format!("{}{}", WAKE_UP_TIMER_PREFIX, fire_time_millis);
        if self.timers.contains_key(&timer_id) {
            return Ok(());
        }
        let now = match &self.round {
            Some(round) => round.ctx.current_time_millis(),
            None => return Err(DeciderError::NoOpenRound),
        };
        debug!(timer_id = %timer_id, fire_time_millis, "starting wake-up timer");
        self.start_timer_entry(timer_id, fire_time_millis - now, None)
    }

    fn cancel_timer(&mut self, timer_id: &str) -> Result<(), DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        let Some(entry) = self.timers.get(timer_id) else {
            return Err(DeciderError::UnknownEntity {
                kind: "timer",
                event_id: 0,
            });
        };
        if entry.machine.staged_state(&round.ctx) != State::Started {
            return Ok(());
        }
        entry.machine.action(
            State::Canceled,
            &mut round.ctx,
            &TimerRequest::Cancel {
                identity: String::new(),
            },
            round.decision_task_completed_event_id,
        )?;
        round.decisions.push(Decision::cancel_timer(timer_id));
        if let Some(promise) = entry.promise.clone() {
            let cause = format!("timer {} canceled", timer_id);
            round
                .ctx
                .on_commit(move || {
                    promise.fail(WorkflowError::Canceled(cause));
                });
        }
        Ok(())
    }

    fn record_marker(&mut self, marker_name: String, details: Vec<u8>) -> Result<(), DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        round.ctx.add_event(
            EventType::MarkerRecorded,
            EventAttributes::MarkerRecordedEventAttributes(Box::new(
                MarkerRecordedEventAttributes {
                    marker_name: marker_name.clone(),
                    details: details.clone(),
                    decision_task_completed_event_id: round.decision_task_completed_event_id,
                },
            )),
        );
        round.decisions.push(Decision::record_marker(marker_name, details));
        Ok(())
    }

    fn close_workflow(
        &mut self,
        to: State,
        request: WorkflowRequest,
        decision: Decision,
    ) -> Result<(), DeciderError> {
        let round = self.round.as_mut().ok_or(DeciderError::NoOpenRound)?;
        if self.workflow.staged_state(&round.ctx).is_closed() {
            return Ok(());
        }
        self.workflow.action(
            to,
            &mut round.ctx,
            &request,
            round.decision_task_completed_event_id,
        )?;
        round.decisions.push(decision);
        Ok(())
    }

    pub fn complete_workflow(&mut self, result: Option<Vec<u8>>) -> Result<(), DeciderError> {
        self.close_workflow(
            State::Completed,
            WorkflowRequest::Complete {
                result: result.clone(),
            },
            Decision::complete_workflow_execution(result),
        )
    }

    pub fn fail_workflow(
        &mut self,
        reason: String,
        details: Option<Vec<u8>>,
    ) -> Result<(), DeciderError> {
        self.close_workflow(
            State::Failed,
            WorkflowRequest::Fail {
                reason: Some(reason.clone()),
                details: details.clone(),
            },
            Decision::fail_workflow_execution(reason, details),
        )
    }

    pub fn cancel_workflow(&mut self) -> Result<(), DeciderError> {
        self.close_workflow(
            State::Canceled,
            WorkflowRequest::Cancel { details: None },
            Decision::cancel_workflow_execution(None),
        )
    }

    fn submit(&mut self, command: WorkflowCommand) -> Result<CommandResult, DeciderError> {
        match command {
            WorkflowCommand::ScheduleActivity(cmd) => {
                self.schedule_activity(cmd).map(CommandResult::Pending)
            }
            WorkflowCommand::RequestCancelActivity(cmd) => {
                self.request_cancel_activity(&cmd.activity_id)?;
                Ok(CommandResult::Accepted)
            }
            WorkflowCommand::StartTimer(cmd) => {
                let promise = WorkflowPromise::new();
                self.start_timer_entry(
                    cmd.timer_id,
                    cmd.duration.as_millis() as i64,
                    Some(promise.clone()),
                )?;
                Ok(CommandResult::Pending(promise))
            }
            WorkflowCommand::CancelTimer(cmd) => {
                self.cancel_timer(&cmd.timer_id)?;
                Ok(CommandResult::Accepted)
            }
            WorkflowCommand::RecordMarker(cmd) => {
                self.record_marker(cmd.marker_name, cmd.details)?;
                Ok(CommandResult::Accepted)
            }
            WorkflowCommand::StartChildWorkflow(cmd) => {
                self.start_child_workflow(cmd).map(CommandResult::Pending)
            }
        }
    }
}

/// Whole seconds of `duration`, saturating at the service's `i32` limit.
fn timeout_seconds(duration: std::time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

impl std::fmt::Debug for DecisionsHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionsHelper")
            .field("execution", &self.execution)
            .field("workflow", &self.workflow)
            .field("activities", &self.activities.len())
            .field("timers", &self.timers.len())
            .field("children", &self.children.len())
            .field("replaying", &self.replaying)
            .finish()
    }
}

/// Command sink of a runner driven by a replay decider.
///
/// A command that violates a state machine is recorded as a defect for the
/// decider to report; workflow code only sees an internal error.
#[derive(Debug, Clone)]
pub struct ReplayCommandSink {
    helper: Arc<Mutex<DecisionsHelper>>,
}

impl ReplayCommandSink {
    pub fn new(helper: Arc<Mutex<DecisionsHelper>>) -> Self {
        Self { helper }
    }
}

impl CommandSink for ReplayCommandSink {
    fn submit(&self, command: WorkflowCommand) -> Result<CommandResult, WorkflowError> {
        let mut helper = self.helper.lock();
        match helper.submit(command) {
            Ok(result) => Ok(result),
            Err(e) => Err(helper.record_defect(e)),
        }
    }

    fn is_replaying(&self) -> bool {
        self.helper.lock().is_replaying()
    }

    fn recorded_side_effect(&self, side_effect_id: u64) -> Result<Option<Vec<u8>>, WorkflowError> {
        Ok(self.helper.lock().recorded_side_effect(side_effect_id))
    }

    fn recorded_version(&self, change_id: &str) -> Result<Option<i32>, WorkflowError> {
        Ok(self.helper.lock().recorded_version(change_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::history::tests::event;
    use cadence_core::{
        ActivityOptions, ChildWorkflowExecutionCompletedEventAttributes,
        ChildWorkflowExecutionStartedEventAttributes, ChildWorkflowOptions,
        StartChildWorkflowExecutionFailedEventAttributes, WorkflowExecution,
    };
    use cadence_workflow::{encode_side_effect_details, encode_version_details, StartTimerCommand};
    use std::time::Duration;

    fn helper() -> DecisionsHelper {
        let mut helper =
            DecisionsHelper::new(ExecutionId::new("domain", WorkflowExecution::new("wf", "run")));
        helper
            .handle_workflow_started(&event(1, EventType::WorkflowExecutionStarted))
            .unwrap();
        helper
    }

    fn schedule(helper: &mut DecisionsHelper, activity_id: &str) -> WorkflowPromise<Vec<u8>> {
        helper
            .submit(WorkflowCommand::ScheduleActivity(ScheduleActivityCommand {
                activity_id: activity_id.to_string(),
                activity_type: "greet".to_string(),
                args: None,
                options: ActivityOptions::default(),
            }))
            .unwrap()
            .into_promise()
            .unwrap()
    }

    #[test]
    fn test_round_predicts_decision_events() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        schedule(&mut helper, "1");
        helper
            .submit(WorkflowCommand::StartTimer(StartTimerCommand {
                timer_id: "2".to_string(),
                duration: Duration::from_millis(1_500),
            }))
            .unwrap();

        let round = helper.take_round().unwrap();
        let events: Vec<(i64, EventType)> =
            round.events().iter().map(|e| (e.event_id, e.event_type)).collect();
        assert_eq!(
            events,
            vec![(5, EventType::ActivityTaskScheduled), (6, EventType::TimerStarted)]
        );
        let decisions = round.commit();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[1], Decision::start_timer("2", 2));
    }

    #[test]
    fn test_activity_task_uses_workflow_task_list() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        schedule(&mut helper, "1");
        let decisions = helper.take_round().unwrap().commit();
        match decisions[0].attributes.as_ref() {
            Some(cadence_core::DecisionAttributes::ScheduleActivityTaskDecisionAttributes(a)) => {
                assert_eq!(a.task_list, TaskList::new("tl"));
                assert_eq!(a.activity_type, ActivityType::new("greet"));
            }
            other => panic!("unexpected attributes {:?}", other),
        }
    }

    #[test]
    fn test_completion_resolves_promise() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = schedule(&mut helper, "1");
        helper.take_round().unwrap().commit();

        helper
            .handle_event(&event(6, EventType::ActivityTaskStarted))
            .unwrap();
        assert!(!promise.is_done());
        helper
            .handle_event(&event(7, EventType::ActivityTaskCompleted))
            .unwrap();
        assert_eq!(promise.try_get(), Some(Ok(Vec::new())));
    }

    #[test]
    fn test_completion_before_start_is_illegal() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        schedule(&mut helper, "1");
        helper.take_round().unwrap().commit();

        // ActivityTaskCompleted built by the fixture references scheduled id 5
        let err = helper
            .handle_event(&event(7, EventType::ActivityTaskCompleted))
            .unwrap_err();
        assert!(matches!(err, DeciderError::StateMachine(_)));
    }

    #[test]
    fn test_unknown_activity_is_reported() {
        let mut helper = helper();
        let err = helper
            .handle_event(&event(6, EventType::ActivityTaskStarted))
            .unwrap_err();
        assert!(matches!(
            err,
            DeciderError::UnknownEntity {
                kind: "activity",
                event_id: 6
            }
        ));
    }

    #[test]
    fn test_confirm_moves_activity_to_actual_id() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = schedule(&mut helper, "1");
        helper.take_round().unwrap().commit();

        // the service recorded the schedule one event later than predicted
        helper.confirm_decision_events(&[event(6, EventType::ActivityTaskScheduled)]);
        assert!(helper
            .handle_event(&event(6, EventType::ActivityTaskStarted))
            .is_err());
        helper
            .handle_event(&event(7, EventType::ActivityTaskStarted))
            .unwrap();
        helper
            .handle_event(&event(8, EventType::ActivityTaskCompleted))
            .unwrap();
        assert!(promise.is_done());
    }

    #[test]
    fn test_cancel_requested_once() {
        let mut helper = helper();
        let cancel = HistoryEvent::new(
            2,
            0,
            EventType::WorkflowExecutionCancelRequested,
            EventAttributes::WorkflowExecutionCancelRequestedEventAttributes(Box::new(
                cadence_core::WorkflowExecutionCancelRequestedEventAttributes {
                    cause: Some("stop".to_string()),
                    identity: "cli".to_string(),
                },
            )),
        );
        assert_eq!(
            helper.handle_cancel_requested(&cancel).unwrap(),
            Some("stop".to_string())
        );
        assert_eq!(helper.workflow_state(), State::CancellationRequested);
        assert_eq!(helper.handle_cancel_requested(&cancel).unwrap(), None);

        helper.begin_round(5, 0);
        helper.cancel_workflow().unwrap();
        let decisions = helper.take_round().unwrap().commit();
        assert_eq!(decisions, vec![Decision::cancel_workflow_execution(None)]);
        assert_eq!(helper.workflow_state(), State::Canceled);
    }

    #[test]
    fn test_close_is_emitted_once() {
        let mut helper = helper();
        helper.begin_round(5, 0);
        helper.complete_workflow(Some(b"1".to_vec())).unwrap();
        helper.fail_workflow("late".to_string(), None).unwrap();
        let round = helper.take_round().unwrap();
        assert_eq!(round.events().len(), 1);
        assert_eq!(round.decisions().len(), 1);
        helper.rollback_round(round);
        assert_eq!(helper.workflow_state(), State::Started);
    }

    #[test]
    fn test_rolled_back_round_forgets_its_entities() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = schedule(&mut helper, "1");
        helper
            .submit(WorkflowCommand::StartTimer(StartTimerCommand {
                timer_id: "2".to_string(),
                duration: Duration::from_secs(3),
            }))
            .unwrap();
        let round = helper.take_round().unwrap();
        helper.rollback_round(round);

        assert!(helper.activities.is_empty());
        assert!(helper.activity_ids.is_empty());
        assert!(helper.timers.is_empty());
        assert!(!promise.is_done());
        assert!(matches!(
            helper.handle_event(&event(6, EventType::ActivityTaskStarted)),
            Err(DeciderError::UnknownEntity { .. })
        ));

        // the same ids can be scheduled again by the replacement round
        helper.begin_round(5, 3_000);
        schedule(&mut helper, "1");
        assert_eq!(helper.take_round().unwrap().commit().len(), 1);
    }

    #[test]
    fn test_timer_cancellation_resolves_on_commit() {
        let mut helper = helper();
        helper.begin_round(5, 0);
        let promise = helper
            .submit(WorkflowCommand::StartTimer(StartTimerCommand {
                timer_id: "1".to_string(),
                duration: Duration::from_secs(3),
            }))
            .unwrap()
            .into_promise()
            .unwrap();
        helper.take_round().unwrap().commit();

        helper.begin_round(7, 0);
        helper
            .submit(WorkflowCommand::CancelTimer(cadence_workflow::CancelTimerCommand {
                timer_id: "1".to_string(),
            }))
            .unwrap();
        let round = helper.take_round().unwrap();
        helper.rollback_round(round);
        assert!(!promise.is_done());

        helper.begin_round(7, 0);
        helper
            .submit(WorkflowCommand::CancelTimer(cadence_workflow::CancelTimerCommand {
                timer_id: "1".to_string(),
            }))
            .unwrap();
        assert!(!promise.is_done());
        helper.take_round().unwrap().commit();
        assert!(matches!(promise.try_get(), Some(Err(WorkflowError::Canceled(_)))));
    }

    #[test]
    fn test_oversized_timeouts_saturate() {
        let mut helper = helper();
        helper.begin_round(5, 0);
        helper
            .submit(WorkflowCommand::ScheduleActivity(ScheduleActivityCommand {
                activity_id: "1".to_string(),
                activity_type: "greet".to_string(),
                args: None,
                options: ActivityOptions {
                    start_to_close_timeout: Duration::from_secs(u64::from(u32::MAX) + 7),
                    ..ActivityOptions::default()
                },
            }))
            .unwrap();
        let decisions = helper.take_round().unwrap().commit();
        match decisions[0].attributes.as_ref() {
            Some(cadence_core::DecisionAttributes::ScheduleActivityTaskDecisionAttributes(a)) => {
                assert_eq!(a.start_to_close_timeout_seconds, i32::MAX);
                assert!(a.schedule_to_close_timeout_seconds >= 0);
            }
            other => panic!("unexpected attributes {:?}", other),
        }
    }

    #[test]
    fn test_wake_up_timer_is_started_once() {
        let mut helper = helper();
        helper.begin_round(5, 10_000);
        helper.start_wake_up_timer(71_000).unwrap();
        helper.start_wake_up_timer(71_000).unwrap();
        let decisions = helper.take_round().unwrap().commit();
        assert_eq!(decisions, vec![Decision::start_timer("wake-up-71000", 61)]);
    }

    #[test]
    fn test_sink_records_defects() {
        let helper = Arc::new(Mutex::new(helper()));
        let sink = ReplayCommandSink::new(helper.clone());
        // no open round
        let result = sink.submit(WorkflowCommand::StartTimer(StartTimerCommand {
            timer_id: "1".to_string(),
            duration: Duration::from_secs(1),
        }));
        assert!(matches!(result, Err(WorkflowError::Internal(_))));
        assert!(matches!(
            helper.lock().take_defect(),
            Some(DeciderError::NoOpenRound)
        ));
    }

    #[test]
    fn test_side_effect_markers() {
        let mut helper = helper();
        let details = encode_side_effect_details(3, b"\"v\"").unwrap();
        let marker = HistoryEvent::new(
            5,
            0,
            EventType::MarkerRecorded,
            EventAttributes::MarkerRecordedEventAttributes(Box::new(
                MarkerRecordedEventAttributes {
                    marker_name: SIDE_EFFECT_MARKER_NAME.to_string(),
                    details,
                    decision_task_completed_event_id: 4,
                },
            )),
        );
        helper.add_markers(&[marker]).unwrap();
        assert_eq!(helper.recorded_side_effect(3), Some(b"\"v\"".to_vec()));
        assert_eq!(helper.recorded_side_effect(4), None);
    }

    #[test]
    fn test_version_markers() {
        let mut helper = helper();
        let marker = HistoryEvent::new(
            5,
            0,
            EventType::MarkerRecorded,
            EventAttributes::MarkerRecordedEventAttributes(Box::new(
                MarkerRecordedEventAttributes {
                    marker_name: VERSION_MARKER_NAME.to_string(),
                    details: encode_version_details("change", 2).unwrap(),
                    decision_task_completed_event_id: 4,
                },
            )),
        );
        helper.add_markers(&[marker]).unwrap();
        assert_eq!(helper.recorded_version("change"), Some(2));
        assert_eq!(helper.recorded_version("other"), None);
        assert_eq!(helper.recorded_side_effect(1), None);
    }

    fn start_child(helper: &mut DecisionsHelper, workflow_id: &str) -> WorkflowPromise<Vec<u8>> {
        helper
            .submit(WorkflowCommand::StartChildWorkflow(StartChildWorkflowCommand {
                workflow_id: workflow_id.to_string(),
                workflow_type: "child-type".to_string(),
                args: Some(b"in".to_vec()),
                options: ChildWorkflowOptions::default(),
            }))
            .unwrap()
            .into_promise()
            .unwrap()
    }

    fn child_started(id: i64, initiated_event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            id,
            0,
            EventType::ChildWorkflowExecutionStarted,
            EventAttributes::ChildWorkflowExecutionStartedEventAttributes(Box::new(
                ChildWorkflowExecutionStartedEventAttributes {
                    domain: "domain".to_string(),
                    workflow_execution: WorkflowExecution::new("child-1", "child-run"),
                    workflow_type: WorkflowType::new("child-type"),
                    initiated_event_id,
                },
            )),
        )
    }

    fn child_completed(id: i64, initiated_event_id: i64, started_event_id: i64) -> HistoryEvent {
        HistoryEvent::new(
            id,
            0,
            EventType::ChildWorkflowExecutionCompleted,
            EventAttributes::ChildWorkflowExecutionCompletedEventAttributes(Box::new(
                ChildWorkflowExecutionCompletedEventAttributes {
                    result: Some(b"child done".to_vec()),
                    domain: "domain".to_string(),
                    workflow_execution: WorkflowExecution::new("child-1", "child-run"),
                    workflow_type: WorkflowType::new("child-type"),
                    initiated_event_id,
                    started_event_id,
                },
            )),
        )
    }

    #[test]
    fn test_child_workflow_resolves_on_completion() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = start_child(&mut helper, "child-1");
        let decisions = helper.take_round().unwrap().commit();
        match decisions[0].attributes.as_ref() {
            Some(cadence_core::DecisionAttributes::StartChildWorkflowExecutionDecisionAttributes(
                a,
            )) => {
                assert_eq!(a.domain, "domain");
                assert_eq!(a.task_list, TaskList::new("tl"));
                assert_eq!(a.execution_start_to_close_timeout_seconds, 3600);
            }
            other => panic!("unexpected attributes {:?}", other),
        }

        helper.handle_event(&child_started(7, 5)).unwrap();
        assert!(!promise.is_done());
        helper.handle_event(&child_completed(9, 5, 7)).unwrap();
        assert_eq!(promise.try_get(), Some(Ok(b"child done".to_vec())));
    }

    #[test]
    fn test_child_start_failure_fails_promise() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = start_child(&mut helper, "child-1");
        helper.take_round().unwrap().commit();

        let failed = HistoryEvent::new(
            7,
            0,
            EventType::StartChildWorkflowExecutionFailed,
            EventAttributes::StartChildWorkflowExecutionFailedEventAttributes(Box::new(
                StartChildWorkflowExecutionFailedEventAttributes {
                    domain: "domain".to_string(),
                    workflow_id: "child-1".to_string(),
                    workflow_type: WorkflowType::new("child-type"),
                    cause: "WORKFLOW_ALREADY_RUNNING".to_string(),
                    initiated_event_id: 5,
                    decision_task_completed_event_id: 4,
                },
            )),
        );
        helper.handle_event(&failed).unwrap();
        assert_eq!(
            promise.try_get(),
            Some(Err(WorkflowError::StartChildWorkflowFailed(
                "WORKFLOW_ALREADY_RUNNING".to_string()
            )))
        );
    }

    #[test]
    fn test_confirm_moves_child_to_actual_id() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        let promise = start_child(&mut helper, "child-1");
        let round = helper.take_round().unwrap();
        let mut initiated = round.events()[0].clone();
        round.commit();

        initiated.event_id = 8;
        helper.confirm_decision_events(&[initiated]);
        assert!(helper.handle_event(&child_started(9, 5)).is_err());
        helper.handle_event(&child_started(9, 8)).unwrap();
        helper.handle_event(&child_completed(10, 8, 9)).unwrap();
        assert!(promise.is_done());
    }

    #[test]
    fn test_rolled_back_round_forgets_its_children() {
        let mut helper = helper();
        helper.begin_round(5, 3_000);
        start_child(&mut helper, "child-1");
        let round = helper.take_round().unwrap();
        helper.rollback_round(round);

        assert!(helper.children.is_empty());
        assert!(helper.child_ids.is_empty());
        assert!(matches!(
            helper.handle_event(&child_started(7, 5)),
            Err(DeciderError::UnknownEntity {
                kind: "child workflow",
                ..
            })
        ));
    }
}

//! Replay decider.
//!
//! A [`ReplayDecider`] owns the runner of one workflow run. Every decision
//! task feeds it the history it has not seen yet; it replays answered rounds,
//! checks that the workflow emits the same decisions again and returns the
//! decisions of the open round.

use std::sync::Arc;

use cadence_core::{
    CadenceError, Decision, EventAttributes, EventType, HistoryEvent, NonDeterminismReason,
    NonDeterministicError, WorkflowExecution, WorkflowInfo, WorkflowType,
};
use cadence_workflow::state_machine::{ExecutionId, State, StateMachineError};
use cadence_workflow::{DeterministicRunner, RunnerError, VirtualClock};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::decisions::{DecisionsHelper, ReplayCommandSink};
use super::history::{split_previous_round, DecisionEvents, DecisionEventsIterator};
use crate::registry::Workflow;
use crate::service::DecisionTask;

#[derive(Debug, Error)]
pub enum DeciderError {
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    NonDeterministic(#[from] NonDeterministicError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("history continues at event {actual}, expected {expected}")]
    HistoryGap { expected: i64, actual: i64 },
    #[error("decision round started at event {started_event_id} was discarded")]
    RoundDiscarded { started_event_id: i64 },
    #[error("history has no usable WorkflowExecutionStarted event")]
    MissingStartEvent,
    #[error("no {kind} known for event {event_id}")]
    UnknownEntity { kind: &'static str, event_id: i64 },
    #[error("command submitted outside of a decision round")]
    NoOpenRound,
    #[error("invalid marker: {0}")]
    InvalidMarker(String),
    #[error("workflow type {0} is not registered")]
    UnknownWorkflowType(String),
    #[error("decider is closed")]
    Closed,
}

impl From<DeciderError> for CadenceError {
    fn from(e: DeciderError) -> Self {
        match e {
            DeciderError::NonDeterministic(e) => CadenceError::NonDeterministic(e),
            other => CadenceError::Other(other.to_string()),
        }
    }
}

/// Outcome of one decision task.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    pub decisions: Vec<Decision>,
    /// Workflow state after the decisions are applied
    pub state: State,
}

impl DecisionResult {
    pub fn is_workflow_closed(&self) -> bool {
        self.state.is_closed()
    }
}

pub struct ReplayDecider {
    domain: String,
    execution: WorkflowExecution,
    workflow_type: WorkflowType,
    workflow: Box<dyn Workflow>,
    clock: Arc<VirtualClock>,
    helper: Arc<Mutex<DecisionsHelper>>,
    runner: Option<DeterministicRunner>,
    /// First history event this decider has not consumed
    next_event_id: i64,
    /// Started event id of the last round answered with decisions
    answered_started_event_id: i64,
    closed: bool,
}

impl ReplayDecider {
    pub fn new(
        domain: impl Into<String>,
        execution: WorkflowExecution,
        workflow_type: WorkflowType,
        workflow: Box<dyn Workflow>,
    ) -> Self {
        let domain = domain.into();
        let helper = DecisionsHelper::new(ExecutionId::new(domain.clone(), execution.clone()));
        Self {
            domain,
            execution,
            workflow_type,
            workflow,
            clock: Arc::new(VirtualClock::new(0)),
            helper: Arc::new(Mutex::new(helper)),
            runner: None,
            next_event_id: 1,
            answered_started_event_id: 0,
            closed: false,
        }
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    pub fn workflow_state(&self) -> State {
        self.helper.lock().workflow_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds the task's unseen history through the workflow and returns the
    /// decisions for its open round.
    pub fn process_decision_task(
        &mut self,
        task: &DecisionTask,
    ) -> Result<DecisionResult, DeciderError> {
        if self.closed {
            return Err(DeciderError::Closed);
        }
        let events = self.unseen_events(&task.history.events)?;
        self.check_round_not_discarded(events)?;

        let (previous_round, rest) = split_previous_round(events);
        if !previous_round.is_empty() {
            self.helper.lock().confirm_decision_events(previous_round);
        }

        let mut decisions = Vec::new();
        for batch in DecisionEventsIterator::new(rest, task.previous_started_event_id) {
            let round = self.apply_batch(&batch)?;
            if !batch.replay {
                decisions = round;
            }
        }

        if let Some(last) = task.history.last_event_id() {
            self.next_event_id = self.next_event_id.max(last + 1);
        }
        self.answered_started_event_id = task.started_event_id;
        let state = self.helper.lock().workflow_state();
        info!(
            workflow_id = %self.execution.workflow_id,
            run_id = %self.execution.run_id,
            started_event_id = task.started_event_id,
            decisions = decisions.len(),
            state = ?state,
            "decision task processed"
        );
        Ok(DecisionResult { decisions, state })
    }

    /// Replays the task's history and evaluates a query against the result.
    ///
    /// Decisions produced along the way are dropped; the decider should not
    /// be used for decision tasks afterwards.
    pub fn query(
        &mut self,
        task: &DecisionTask,
        query_type: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, DeciderError> {
        if self.closed {
            return Err(DeciderError::Closed);
        }
        if task.history.last_event_id().unwrap_or(0) >= self.next_event_id {
            self.process_decision_task(task)?;
        }
        let runner = self.runner.as_ref().ok_or(DeciderError::MissingStartEvent)?;
        debug!(query_type, "evaluating query");
        Ok(runner.query(query_type, args)?)
    }

    /// Stack trace of the workflow's live threads.
    pub fn stack_trace(&self) -> Option<String> {
        self.runner.as_ref().map(DeterministicRunner::stack_trace)
    }

    /// Destroys the workflow threads. The decider cannot be used afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(runner) = self.runner.as_mut() {
            if let Err(e) = runner.close() {
                warn!(
                    workflow_id = %self.execution.workflow_id,
                    run_id = %self.execution.run_id,
                    error = %e,
                    "error closing workflow runner"
                );
            }
        }
    }

    fn unseen_events<'a>(
        &self,
        events: &'a [HistoryEvent],
    ) -> Result<&'a [HistoryEvent], DeciderError> {
        let start = events
            .iter()
            .position(|e| e.event_id >= self.next_event_id)
            .unwrap_or(events.len());
        let unseen = &events[start..];
        match unseen.first() {
            Some(first) if first.event_id != self.next_event_id => Err(DeciderError::HistoryGap {
                expected: self.next_event_id,
                actual: first.event_id,
            }),
            _ => Ok(unseen),
        }
    }

    fn check_round_not_discarded(&self, events: &[HistoryEvent]) -> Result<(), DeciderError> {
        if self.answered_started_event_id == 0 {
            return Ok(());
        }
        let discarded = events.iter().any(|e| match e.attributes.as_ref() {
            Some(EventAttributes::DecisionTaskTimedOutEventAttributes(a)) => {
                a.started_event_id == self.answered_started_event_id
            }
            Some(EventAttributes::DecisionTaskFailedEventAttributes(a)) => {
                a.started_event_id == self.answered_started_event_id
            }
            _ => false,
        });
        if discarded {
            return Err(DeciderError::RoundDiscarded {
                started_event_id: self.answered_started_event_id,
            });
        }
        Ok(())
    }

    fn apply_batch(&mut self, batch: &DecisionEvents) -> Result<Vec<Decision>, DeciderError> {
        debug!(
            started_event_id = ?batch.started_event_id,
            events = batch.events.len(),
            replay = batch.replay,
            "applying decision batch"
        );
        self.clock.set_millis(batch.replay_current_time_millis);
        {
            let mut helper = self.helper.lock();
            helper.set_replaying(batch.replay);
            helper.add_markers(&batch.markers)?;
        }
        for event in &batch.events {
            self.apply_event(event)?;
        }

        let runner = self.runner.as_mut().ok_or(DeciderError::MissingStartEvent)?;
        self.helper
            .lock()
            .begin_round(batch.next_decision_event_id, batch.replay_current_time_millis);
        let outcome = if runner.is_done() {
            Ok(())
        } else {
            runner.run_until_all_blocked()
        };

        let result = self.close_round(outcome);
        let round = self.helper.lock().take_round();
        let Some(round) = round else {
            return Err(DeciderError::NoOpenRound);
        };
        if let Err(e) = result {
            self.helper.lock().rollback_round(round);
            return Err(e);
        }
        if batch.replay {
            if let Err(e) = self.check_determinism(round.events(), &batch.decision_events) {
                self.helper.lock().rollback_round(round);
                return Err(e);
            }
        }
        let decisions = round.commit();
        if batch.replay {
            self.helper
                .lock()
                .confirm_decision_events(&batch.decision_events);
        }
        Ok(decisions)
    }

    fn apply_event(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        match event.event_type {
            EventType::WorkflowExecutionStarted => {
                let attrs = self.helper.lock().handle_workflow_started(event)?;
                let mut info = WorkflowInfo::new(
                    self.domain.clone(),
                    self.execution.clone(),
                    self.workflow_type.clone(),
                );
                info.task_list = attrs.task_list.name.clone();
                info.attempt = attrs.attempt;
                let input = if attrs.input.is_empty() {
                    None
                } else {
                    Some(attrs.input)
                };
                let workflow = self.workflow.clone();
                let sink = Arc::new(ReplayCommandSink::new(self.helper.clone()));
                self.runner = Some(
                    DeterministicRunner::builder()
                        .clock(self.clock.clone())
                        .command_sink(sink)
                        .workflow_info(info)
                        .build(move |ctx| workflow.execute(ctx, input)),
                );
            }
            EventType::WorkflowExecutionSignaled => {
                let runner = self.runner.as_ref().ok_or(DeciderError::MissingStartEvent)?;
                if let Some(EventAttributes::WorkflowExecutionSignaledEventAttributes(a)) =
                    event.attributes.as_ref()
                {
                    debug!(signal_name = %a.signal_name, "delivering signal");
                    runner.signal(a.signal_name.clone(), a.input.clone());
                }
            }
            EventType::WorkflowExecutionCancelRequested => {
                let cause = self.helper.lock().handle_cancel_requested(event)?;
                if let Some(cause) = cause {
                    let runner = self.runner.as_ref().ok_or(DeciderError::MissingStartEvent)?;
                    runner.cancel(cause);
                }
            }
            t if t.is_decision_task_event() => {}
            _ => self.helper.lock().handle_event(event)?,
        }
        Ok(())
    }

    /// Turns the runner's state after a pass into closing decisions or a
    /// wake-up timer.
    fn close_round(&mut self, outcome: Result<(), RunnerError>) -> Result<(), DeciderError> {
        if let Some(defect) = self.helper.lock().take_defect() {
            return Err(defect);
        }
        let runner = self.runner.as_ref().ok_or(DeciderError::MissingStartEvent)?;
        let mut helper = self.helper.lock();
        match outcome {
            Ok(()) | Err(RunnerError::Closed) => {}
            Err(RunnerError::WorkflowFailed(e)) => {
                info!(workflow_id = %self.execution.workflow_id, error = %e, "workflow failed");
                return helper.fail_workflow(e.reason(), Some(e.details()));
            }
            Err(RunnerError::DestroySwallowed { threads }) => {
                warn!(?threads, "workflow threads swallowed their destruction");
            }
            Err(e) => return Err(e.into()),
        }

        if !runner.is_done() {
            if let Some(wake_up) = runner.next_wake_up_time() {
                if wake_up > runner.current_time_millis() {
                    helper.start_wake_up_timer(wake_up)?;
                }
            }
            return Ok(());
        }
        if let Some(value) = runner.exit_value() {
            return helper.complete_workflow(Some(value));
        }
        match runner.root_result() {
            Some(Ok(value)) => helper.complete_workflow(Some(value)),
            Some(Err(e)) if e.is_canceled() && runner.is_cancel_requested() => {
                helper.cancel_workflow()
            }
            Some(Err(e)) => helper.fail_workflow(e.reason(), Some(e.details())),
            None => Ok(()),
        }
    }

    fn check_determinism(
        &self,
        emitted: &[HistoryEvent],
        recorded: &[HistoryEvent],
    ) -> Result<(), DeciderError> {
        for index in 0..emitted.len().max(recorded.len()) {
            let reason = match (emitted.get(index), recorded.get(index)) {
                (Some(e), Some(r)) if same_decision(e, r) => continue,
                (Some(_), Some(_)) => NonDeterminismReason::Mismatch,
                (Some(_), None) => NonDeterminismReason::ExtraReplayDecision,
                (None, Some(_)) => NonDeterminismReason::MissingReplayDecision,
                (None, None) => continue,
            };
            let error = NonDeterministicError {
                reason,
                workflow_type: self.workflow_type.name.clone(),
                workflow_id: self.execution.workflow_id.clone(),
                run_id: self.execution.run_id.clone(),
                history_event_text: recorded.get(index).map(|e| format!("{:?}", e)),
                decision_text: emitted.get(index).map(|e| format!("{:?}", e)),
            };
            warn!(error = %error, "replay diverged from history");
            return Err(error.into());
        }
        Ok(())
    }
}

impl Drop for ReplayDecider {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ReplayDecider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDecider")
            .field("domain", &self.domain)
            .field("execution", &self.execution)
            .field("workflow_type", &self.workflow_type)
            .field("next_event_id", &self.next_event_id)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Identity of the entity a decision event is about.
fn decision_key(event: &HistoryEvent) -> Option<&str> {
    match event.attributes.as_ref()? {
        EventAttributes::ActivityTaskScheduledEventAttributes(a) => Some(&a.activity_id),
        EventAttributes::ActivityTaskCancelRequestedEventAttributes(a) => Some(&a.activity_id),
        EventAttributes::TimerStartedEventAttributes(a) => Some(&a.timer_id),
        EventAttributes::TimerCanceledEventAttributes(a) => Some(&a.timer_id),
        EventAttributes::MarkerRecordedEventAttributes(a) => Some(&a.marker_name),
        EventAttributes::StartChildWorkflowExecutionInitiatedEventAttributes(a) => {
            Some(&a.workflow_id)
        }
        _ => None,
    }
}

fn same_decision(emitted: &HistoryEvent, recorded: &HistoryEvent) -> bool {
    emitted.event_type == recorded.event_type && decision_key(emitted) == decision_key(recorded)
}

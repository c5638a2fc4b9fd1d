//! Request context shared by the transitions of one batch.

use std::collections::HashMap;
use std::fmt;

use cadence_core::{
    ActivityType, EventAttributes, EventType, HistoryEvent, TaskList, WorkflowExecution,
    WorkflowType,
};
use tracing::trace;

use super::State;

/// Domain-qualified identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionId {
    pub domain: String,
    pub execution: WorkflowExecution,
}

impl ExecutionId {
    pub fn new(domain: impl Into<String>, execution: WorkflowExecution) -> Self {
        Self {
            domain: domain.into(),
            execution,
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.execution)
    }
}

/// Activity task to offer to activity pollers once the batch commits.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTaskDispatch {
    pub task_list: TaskList,
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub input: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
}

/// Durable timer to arm once the batch commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration {
    pub timer_id: String,
    pub fire_time_millis: i64,
}

/// Child run to start once the batch commits.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildWorkflowDispatch {
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub task_list: TaskList,
    pub input: Option<Vec<u8>>,
    pub execution_start_to_close_timeout_seconds: i32,
    pub task_start_to_close_timeout_seconds: i32,
    pub initiated_event_id: i64,
}

/// Decision task to offer to decision pollers once the batch commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTaskDispatch {
    pub task_list: TaskList,
    pub scheduled_event_id: i64,
}

/// Everything a committed batch produced.
#[derive(Debug, Default)]
pub struct CommittedRequest {
    pub events: Vec<HistoryEvent>,
    pub activity_tasks: Vec<ActivityTaskDispatch>,
    pub timers: Vec<TimerRegistration>,
    pub child_workflows: Vec<ChildWorkflowDispatch>,
    pub decision_task: Option<DecisionTaskDispatch>,
    pub workflow_closed: bool,
}

pub struct RequestContext {
    execution: ExecutionId,
    current_time_millis: i64,
    next_event_id: i64,
    events: Vec<HistoryEvent>,
    commit_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    staged_states: HashMap<u64, State>,
    activity_tasks: Vec<ActivityTaskDispatch>,
    timers: Vec<TimerRegistration>,
    child_workflows: Vec<ChildWorkflowDispatch>,
    decision_task: Option<DecisionTaskDispatch>,
    workflow_closed: bool,
}

impl RequestContext {
    pub fn new(execution: ExecutionId, next_event_id: i64, current_time_millis: i64) -> Self {
        Self {
            execution,
            current_time_millis,
            next_event_id,
            events: Vec::new(),
            commit_callbacks: Vec::new(),
            staged_states: HashMap::new(),
            activity_tasks: Vec::new(),
            timers: Vec::new(),
            child_workflows: Vec::new(),
            decision_task: None,
            workflow_closed: false,
        }
    }

    pub fn execution(&self) -> &ExecutionId {
        &self.execution
    }

    pub fn current_time_millis(&self) -> i64 {
        self.current_time_millis
    }

    pub fn set_current_time_millis(&mut self, millis: i64) {
        self.current_time_millis = millis;
    }

    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Replay uses this to give re-created events the ids recorded in history.
    pub fn set_next_event_id(&mut self, event_id: i64) {
        self.next_event_id = event_id;
    }

    /// Appends an event and returns its id.
    pub fn add_event(&mut self, event_type: EventType, attributes: EventAttributes) -> i64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        trace!(event_id, ?event_type, execution = %self.execution, "history event added");
        self.events.push(HistoryEvent::new(
            event_id,
            self.current_time_millis * 1_000_000,
            event_type,
            attributes,
        ));
        event_id
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn on_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.commit_callbacks.push(Box::new(callback));
    }

    pub(crate) fn staged_state(&self, machine_id: u64) -> Option<State> {
        self.staged_states.get(&machine_id).copied()
    }

    pub(crate) fn stage_state(&mut self, machine_id: u64, state: State) {
        self.staged_states.insert(machine_id, state);
    }

    pub fn add_activity_task(&mut self, task: ActivityTaskDispatch) {
        self.activity_tasks.push(task);
    }

    pub fn add_timer(&mut self, timer: TimerRegistration) {
        self.timers.push(timer);
    }

    pub fn add_child_workflow(&mut self, child: ChildWorkflowDispatch) {
        self.child_workflows.push(child);
    }

    pub fn schedule_decision_task(&mut self, task: DecisionTaskDispatch) {
        self.decision_task = Some(task);
    }

    pub fn mark_workflow_closed(&mut self) {
        self.workflow_closed = true;
    }

    /// Runs the commit callbacks in registration order.
    pub fn commit(self) -> CommittedRequest {
        for callback in self.commit_callbacks {
            callback();
        }
        CommittedRequest {
            events: self.events,
            activity_tasks: self.activity_tasks,
            timers: self.timers,
            child_workflows: self.child_workflows,
            decision_task: self.decision_task,
            workflow_closed: self.workflow_closed,
        }
    }

    /// Drops everything the batch produced.
    pub fn rollback(self) {
        trace!(
            execution = %self.execution,
            discarded_events = self.events.len(),
            "request context rolled back"
        );
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("execution", &self.execution)
            .field("next_event_id", &self.next_event_id)
            .field("events", &self.events.len())
            .field("commit_callbacks", &self.commit_callbacks.len())
            .finish()
    }
}

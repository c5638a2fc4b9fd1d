//! In-memory workflow service.
//!
//! Every request runs as one batch of state machine transitions against a
//! request context and is committed atomically onto the run's history, the
//! way the real service persists a transaction. Time is virtual and only
//! moves when a test advances it.
//!
//! Requests that would add events while a decision task is in flight are
//! buffered and applied once the task is answered, failed or timed out, so
//! the events of one round stay contiguous.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{
    ActivityType, CadenceError, Decision, DecisionAttributes, DecisionType, EventAttributes,
    EventType, History, HistoryEvent, MarkerRecordedEventAttributes, ServerError, TaskList,
    TimeoutType, WorkflowExecution, WorkflowExecutionSignaledEventAttributes,
    WorkflowExecutionStartedEventAttributes, WorkflowType,
};
use cadence_worker::{
    DecisionTask, PollForDecisionTaskRequest, RespondDecisionTaskCompletedRequest,
    RespondDecisionTaskFailedRequest, WorkflowQuery, WorkflowQueryResult, WorkflowService,
};
use cadence_workflow::state_machine::{
    ActivityTaskMachine, ActivityTaskRequest, ChildWorkflowDispatch, ChildWorkflowMachine,
    ChildWorkflowRequest, CommittedRequest, DecisionTaskMachine, DecisionTaskRequest,
    ExecutionId, RequestContext, State, StateMachineError, TimerMachine, TimerRequest,
    WorkflowMachine, WorkflowRequest,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_DOMAIN: &str = "test-domain";

#[derive(Debug, Error)]
pub enum TestServiceError {
    #[error("workflow execution {0} not found")]
    UnknownExecution(String),
    #[error("workflow {0} is already running")]
    AlreadyStarted(String),
    #[error("workflow execution {0} already completed")]
    AlreadyCompleted(String),
    #[error("activity {activity_id} of {execution} not found")]
    UnknownActivity {
        execution: String,
        activity_id: String,
    },
    #[error("activity {activity_id} of {execution} already scheduled")]
    DuplicateActivity {
        execution: String,
        activity_id: String,
    },
    #[error("timer {timer_id} of {execution} not found")]
    UnknownTimer { execution: String, timer_id: String },
    #[error("timer {timer_id} of {execution} already started")]
    DuplicateTimer { execution: String, timer_id: String },
    #[error("child workflow {workflow_id} of {execution} not found")]
    UnknownChild {
        execution: String,
        workflow_id: String,
    },
    #[error("child workflow {workflow_id} of {execution} already initiated")]
    DuplicateChild {
        execution: String,
        workflow_id: String,
    },
    #[error("decision task started at {started_event_id} of {execution} is not outstanding")]
    StaleDecisionTask {
        execution: String,
        started_event_id: i64,
    },
    #[error("query {0} not found")]
    UnknownQuery(String),
    #[error("{0:?} decision carries no attributes")]
    MissingAttributes(DecisionType),
    #[error("malformed task token: {0}")]
    MalformedToken(#[from] serde_json::Error),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

impl From<TestServiceError> for CadenceError {
    fn from(err: TestServiceError) -> Self {
        let message = err.to_string();
        let server = match err {
            TestServiceError::UnknownExecution(_)
            | TestServiceError::UnknownActivity { .. }
            | TestServiceError::UnknownTimer { .. }
            | TestServiceError::UnknownChild { .. }
            | TestServiceError::StaleDecisionTask { .. }
            | TestServiceError::UnknownQuery(_) => ServerError::EntityNotExists { message },
            TestServiceError::AlreadyCompleted(_) => {
                ServerError::WorkflowExecutionAlreadyCompleted { message }
            }
            _ => ServerError::BadRequest { message },
        };
        CadenceError::Server(server)
    }
}

/// Request to start a new workflow run
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowRequest {
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub task_list: TaskList,
    pub input: Vec<u8>,
    pub execution_start_to_close_timeout_seconds: i32,
    pub task_start_to_close_timeout_seconds: i32,
    pub identity: String,
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_list: impl Into<String>,
    ) -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            workflow_id: workflow_id.into(),
            workflow_type: WorkflowType::new(workflow_type),
            task_list: TaskList::new(task_list),
            input: Vec::new(),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            identity: "test-client".to_string(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }
}

/// Activity task handed to an activity poller.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTask {
    pub task_token: Vec<u8>,
    pub workflow_execution: WorkflowExecution,
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub input: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
    pub attempt: i32,
}

/// How an activity response names its activity.
///
/// Both forms resolve to the same activity; an empty `run_id` addresses the
/// workflow's current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityAddress {
    Token(Vec<u8>),
    Id {
        workflow_id: String,
        run_id: String,
        activity_id: String,
    },
}

impl ActivityAddress {
    pub fn by_id(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        activity_id: impl Into<String>,
    ) -> Self {
        ActivityAddress::Id {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            activity_id: activity_id.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DecisionTaskToken {
    workflow_id: String,
    run_id: String,
    scheduled_event_id: i64,
    started_event_id: i64,
    query_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivityTaskToken {
    workflow_id: String,
    run_id: String,
    activity_id: String,
    scheduled_event_id: i64,
}

/// Request against one run that appends history events.
#[derive(Debug, Clone, PartialEq)]
enum RunRequest {
    StartActivity {
        activity_id: String,
        identity: String,
        request_id: String,
    },
    CompleteActivity {
        activity_id: String,
        identity: String,
        result: Option<Vec<u8>>,
    },
    FailActivity {
        activity_id: String,
        identity: String,
        reason: Option<String>,
        details: Option<Vec<u8>>,
    },
    ReportActivityCanceled {
        activity_id: String,
        identity: String,
        details: Option<Vec<u8>>,
    },
    TimeOutActivity {
        activity_id: String,
        timeout_type: TimeoutType,
    },
    FireTimer {
        timer_id: String,
    },
    Signal {
        signal_name: String,
        input: Option<Vec<u8>>,
        identity: String,
    },
    RequestCancel {
        cause: Option<String>,
        identity: String,
    },
    /// Progress of a child workflow this run initiated
    Child {
        workflow_id: String,
        to: State,
        request: ChildWorkflowRequest,
    },
}

#[derive(Debug, Default)]
struct Inserted {
    activities: Vec<String>,
    timers: Vec<String>,
    children: Vec<String>,
}

struct TestRun {
    id: ExecutionId,
    workflow_type: WorkflowType,
    task_list: TaskList,
    task_start_to_close_timeout_seconds: i32,
    history: Vec<HistoryEvent>,
    workflow: WorkflowMachine,
    decision: Option<DecisionTaskMachine>,
    /// Started event id of the last completed decision task
    previous_started_event_id: i64,
    activities: HashMap<String, ActivityTaskMachine>,
    timers: HashMap<String, TimerMachine>,
    /// Child workflows by workflow id
    children: HashMap<String, ChildWorkflowMachine>,
    /// Run that initiated this one as a child
    parent: Option<WorkflowExecution>,
    buffered: Vec<RunRequest>,
    sticky: bool,
}

impl TestRun {
    fn new(
        id: ExecutionId,
        request: &StartWorkflowRequest,
        parent: Option<WorkflowExecution>,
    ) -> Self {
        Self {
            id,
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            history: Vec::new(),
            workflow: WorkflowMachine::workflow(),
            decision: None,
            previous_started_event_id: 0,
            activities: HashMap::new(),
            timers: HashMap::new(),
            children: HashMap::new(),
            parent,
            buffered: Vec::new(),
            sticky: false,
        }
    }

    fn execution(&self) -> &WorkflowExecution {
        &self.id.execution
    }

    fn is_closed(&self) -> bool {
        self.workflow.state().is_closed()
    }

    /// Runs `stage` as one batch, appending its events on success.
    fn in_context<F>(&mut self, now_millis: i64, stage: F) -> Result<CommittedRequest, TestServiceError>
    where
        F: FnOnce(&mut Self, &mut RequestContext) -> Result<(), TestServiceError>,
    {
        let mut ctx = RequestContext::new(self.id.clone(), self.history.len() as i64 + 1, now_millis);
        match stage(self, &mut ctx) {
            Ok(()) => {
                let committed = ctx.commit();
                self.history.extend(committed.events.iter().cloned());
                Ok(committed)
            }
            Err(e) => {
                ctx.rollback();
                Err(e)
            }
        }
    }

    fn decision_in_flight(&self) -> bool {
        self.decision
            .as_ref()
            .map(|d| d.state() == State::Started)
            .unwrap_or(false)
    }

    fn outstanding_decision(&self, started_event_id: i64) -> Result<&DecisionTaskMachine, TestServiceError> {
        match &self.decision {
            Some(d) if d.state() == State::Started && d.data().started_event_id == started_event_id => {
                Ok(d)
            }
            _ => Err(TestServiceError::StaleDecisionTask {
                execution: self.execution().to_string(),
                started_event_id,
            }),
        }
    }

    fn activity(&self, activity_id: &str) -> Result<&ActivityTaskMachine, TestServiceError> {
        self.activities
            .get(activity_id)
            .ok_or_else(|| TestServiceError::UnknownActivity {
                execution: self.execution().to_string(),
                activity_id: activity_id.to_string(),
            })
    }

    fn timer(&self, timer_id: &str) -> Result<&TimerMachine, TestServiceError> {
        self.timers
            .get(timer_id)
            .ok_or_else(|| TestServiceError::UnknownTimer {
                execution: self.execution().to_string(),
                timer_id: timer_id.to_string(),
            })
    }

    fn child(&self, workflow_id: &str) -> Result<&ChildWorkflowMachine, TestServiceError> {
        self.children
            .get(workflow_id)
            .ok_or_else(|| TestServiceError::UnknownChild {
                execution: self.execution().to_string(),
                workflow_id: workflow_id.to_string(),
            })
    }

    /// How the run ended, phrased as the request its parent applies.
    fn outcome_for_parent(&self) -> Option<(State, ChildWorkflowRequest)> {
        let closing = self.history.last()?;
        match closing.attributes.as_ref()? {
            EventAttributes::WorkflowExecutionCompletedEventAttributes(a) => Some((
                State::Completed,
                ChildWorkflowRequest::Complete {
                    result: a.result.clone(),
                },
            )),
            EventAttributes::WorkflowExecutionFailedEventAttributes(a) => Some((
                State::Failed,
                ChildWorkflowRequest::Fail {
                    reason: a.reason.clone(),
                    details: a.details.clone(),
                },
            )),
            EventAttributes::WorkflowExecutionCanceledEventAttributes(a) => Some((
                State::Canceled,
                ChildWorkflowRequest::Cancel {
                    details: a.details.clone(),
                },
            )),
            EventAttributes::WorkflowExecutionTimedOutEventAttributes(a) => Some((
                State::TimedOut,
                ChildWorkflowRequest::TimeOut {
                    timeout_type: a.timeout_type,
                },
            )),
            _ => None,
        }
    }

    /// Schedules a decision task unless one is open or the workflow closed
    /// within `ctx`.
    fn schedule_decision(
        &mut self,
        ctx: &mut RequestContext,
        previous_started_event_id: i64,
        attempt: i64,
    ) -> Result<(), TestServiceError> {
        let open = self
            .decision
            .as_ref()
            .map(|d| matches!(d.staged_state(ctx), State::Scheduled | State::Started))
            .unwrap_or(false);
        if open || self.workflow.staged_state(ctx).is_closed() {
            return Ok(());
        }
        let machine = DecisionTaskMachine::decision_task(previous_started_event_id);
        machine.data().attempt = attempt;
        machine.action(
            State::Scheduled,
            ctx,
            &DecisionTaskRequest::Schedule {
                task_list: self.task_list.clone(),
                start_to_close_timeout_seconds: self.task_start_to_close_timeout_seconds,
            },
            0,
        )?;
        self.decision = Some(machine);
        Ok(())
    }

    fn apply_request(&mut self, request: &RunRequest, now_millis: i64) -> Result<CommittedRequest, TestServiceError> {
        self.in_context(now_millis, |run, ctx| {
            match request {
                RunRequest::StartActivity {
                    activity_id,
                    identity,
                    request_id,
                } => {
                    run.activity(activity_id)?.action(
                        State::Started,
                        ctx,
                        &ActivityTaskRequest::Start {
                            identity: identity.clone(),
                            request_id: request_id.clone(),
                        },
                        0,
                    )?;
                    // starting an activity does not wake the workflow
                    return Ok(());
                }
                RunRequest::CompleteActivity {
                    activity_id,
                    identity,
                    result,
                } => run.activity(activity_id)?.action(
                    State::Completed,
                    ctx,
                    &ActivityTaskRequest::Complete {
                        identity: identity.clone(),
                        result: result.clone(),
                    },
                    0,
                )?,
                RunRequest::FailActivity {
                    activity_id,
                    identity,
                    reason,
                    details,
                } => run.activity(activity_id)?.action(
                    State::Failed,
                    ctx,
                    &ActivityTaskRequest::Fail {
                        identity: identity.clone(),
                        reason: reason.clone(),
                        details: details.clone(),
                    },
                    0,
                )?,
                RunRequest::ReportActivityCanceled {
                    activity_id,
                    identity,
                    details,
                } => run.activity(activity_id)?.action(
                    State::Canceled,
                    ctx,
                    &ActivityTaskRequest::ReportCanceled {
                        identity: identity.clone(),
                        details: details.clone(),
                    },
                    0,
                )?,
                RunRequest::TimeOutActivity {
                    activity_id,
                    timeout_type,
                } => run.activity(activity_id)?.action(
                    State::TimedOut,
                    ctx,
                    &ActivityTaskRequest::TimeOut {
                        timeout_type: *timeout_type,
                    },
                    0,
                )?,
                RunRequest::FireTimer { timer_id } => {
                    run.timer(timer_id)?
                        .action(State::Completed, ctx, &TimerRequest::Fire, 0)?
                }
                RunRequest::Signal {
                    signal_name,
                    input,
                    identity,
                } => {
                    ctx.add_event(
                        EventType::WorkflowExecutionSignaled,
                        EventAttributes::WorkflowExecutionSignaledEventAttributes(Box::new(
                            WorkflowExecutionSignaledEventAttributes {
                                signal_name: signal_name.clone(),
                                input: input.clone(),
                                identity: identity.clone(),
                            },
                        )),
                    );
                }
                RunRequest::RequestCancel { cause, identity } => run.workflow.action(
                    State::CancellationRequested,
                    ctx,
                    &WorkflowRequest::RequestCancel {
                        cause: cause.clone(),
                        identity: identity.clone(),
                    },
                    0,
                )?,
                RunRequest::Child {
                    workflow_id,
                    to,
                    request,
                } => run.child(workflow_id)?.action(*to, ctx, request, 0)?,
            }
            let previous_started = run.previous_started_event_id;
            run.schedule_decision(ctx, previous_started, 0)
        })
    }

    fn complete_decision(
        &mut self,
        request: &RespondDecisionTaskCompletedRequest,
        started_event_id: i64,
        now_millis: i64,
    ) -> Result<CommittedRequest, TestServiceError> {
        let mut inserted = Inserted::default();
        let result = self.in_context(now_millis, |run, ctx| {
            run.outstanding_decision(started_event_id)?.action(
                State::Completed,
                ctx,
                &DecisionTaskRequest::Complete {
                    identity: request.identity.clone(),
                },
                0,
            )?;
            let completed_event_id = ctx.next_event_id() - 1;
            let mut cancel_now = Vec::new();
            for decision in &request.decisions {
                run.apply_decision(
                    ctx,
                    decision,
                    completed_event_id,
                    &request.identity,
                    &mut inserted,
                    &mut cancel_now,
                )?;
            }
            // an activity no worker has picked up is canceled right away,
            // unless the same decision closed the workflow
            if run.workflow.staged_state(ctx).is_closed() {
                cancel_now.clear();
            }
            for activity_id in &cancel_now {
                run.activity(activity_id)?.action(
                    State::Canceled,
                    ctx,
                    &ActivityTaskRequest::ReportCanceled {
                        identity: request.identity.clone(),
                        details: None,
                    },
                    0,
                )?;
            }
            if !cancel_now.is_empty() {
                run.schedule_decision(ctx, started_event_id, 0)?;
            }
            Ok(())
        });
        match result {
            Ok(committed) => {
                self.previous_started_event_id = started_event_id;
                self.sticky = request.sticky_task_list.is_some();
                Ok(committed)
            }
            Err(e) => {
                for activity_id in &inserted.activities {
                    self.activities.remove(activity_id);
                }
                for timer_id in &inserted.timers {
                    self.timers.remove(timer_id);
                }
                for workflow_id in &inserted.children {
                    self.children.remove(workflow_id);
                }
                Err(e)
            }
        }
    }

    fn apply_decision(
        &mut self,
        ctx: &mut RequestContext,
        decision: &Decision,
        completed_event_id: i64,
        identity: &str,
        inserted: &mut Inserted,
        cancel_now: &mut Vec<String>,
    ) -> Result<(), TestServiceError> {
        let attributes = decision
            .attributes
            .as_ref()
            .ok_or(TestServiceError::MissingAttributes(decision.decision_type))?;
        match attributes {
            DecisionAttributes::ScheduleActivityTaskDecisionAttributes(a) => {
                if self.activities.contains_key(&a.activity_id) {
                    return Err(TestServiceError::DuplicateActivity {
                        execution: self.execution().to_string(),
                        activity_id: a.activity_id.clone(),
                    });
                }
                let machine = ActivityTaskMachine::activity_task(a.activity_id.clone());
                machine.action(
                    State::Scheduled,
                    ctx,
                    &ActivityTaskRequest::Schedule((**a).clone()),
                    completed_event_id,
                )?;
                self.activities.insert(a.activity_id.clone(), machine);
                inserted.activities.push(a.activity_id.clone());
            }
            DecisionAttributes::RequestCancelActivityTaskDecisionAttributes(a) => {
                let machine = self.activity(&a.activity_id)?;
                let never_started = machine.staged_state(ctx) == State::Scheduled;
                machine.action(
                    State::CancellationRequested,
                    ctx,
                    &ActivityTaskRequest::RequestCancel,
                    completed_event_id,
                )?;
                if never_started {
                    cancel_now.push(a.activity_id.clone());
                }
            }
            DecisionAttributes::StartTimerDecisionAttributes(a) => {
                if self.timers.contains_key(&a.timer_id) {
                    return Err(TestServiceError::DuplicateTimer {
                        execution: self.execution().to_string(),
                        timer_id: a.timer_id.clone(),
                    });
                }
                let machine = TimerMachine::timer(a.timer_id.clone());
                machine.action(
                    State::Started,
                    ctx,
                    &TimerRequest::Start((**a).clone()),
                    completed_event_id,
                )?;
                self.timers.insert(a.timer_id.clone(), machine);
                inserted.timers.push(a.timer_id.clone());
            }
            DecisionAttributes::CancelTimerDecisionAttributes(a) => {
                self.timer(&a.timer_id)?.action(
                    State::Canceled,
                    ctx,
                    &TimerRequest::Cancel {
                        identity: identity.to_string(),
                    },
                    completed_event_id,
                )?;
            }
            DecisionAttributes::StartChildWorkflowExecutionDecisionAttributes(a) => {
                if self.children.contains_key(&a.workflow_id) {
                    return Err(TestServiceError::DuplicateChild {
                        execution: self.execution().to_string(),
                        workflow_id: a.workflow_id.clone(),
                    });
                }
                let machine = ChildWorkflowMachine::child_workflow(a.workflow_id.clone());
                machine.action(
                    State::Scheduled,
                    ctx,
                    &ChildWorkflowRequest::Initiate((**a).clone()),
                    completed_event_id,
                )?;
                self.children.insert(a.workflow_id.clone(), machine);
                inserted.children.push(a.workflow_id.clone());
            }
            DecisionAttributes::RecordMarkerDecisionAttributes(a) => {
                ctx.add_event(
                    EventType::MarkerRecorded,
                    EventAttributes::MarkerRecordedEventAttributes(Box::new(
                        MarkerRecordedEventAttributes {
                            marker_name: a.marker_name.clone(),
                            details: a.details.clone(),
                            decision_task_completed_event_id: completed_event_id,
                        },
                    )),
                );
            }
            DecisionAttributes::CompleteWorkflowExecutionDecisionAttributes(a) => {
                self.workflow.action(
                    State::Completed,
                    ctx,
                    &WorkflowRequest::Complete {
                        result: a.result.clone(),
                    },
                    completed_event_id,
                )?;
            }
            DecisionAttributes::FailWorkflowExecutionDecisionAttributes(a) => {
                self.workflow.action(
                    State::Failed,
                    ctx,
                    &WorkflowRequest::Fail {
                        reason: a.reason.clone(),
                        details: a.details.clone(),
                    },
                    completed_event_id,
                )?;
            }
            DecisionAttributes::CancelWorkflowExecutionDecisionAttributes(a) => {
                self.workflow.action(
                    State::Canceled,
                    ctx,
                    &WorkflowRequest::Cancel {
                        details: a.details.clone(),
                    },
                    completed_event_id,
                )?;
            }
        }
        Ok(())
    }

    /// Closes the outstanding round with a failure or timeout and schedules
    /// its retry.
    fn close_decision(
        &mut self,
        started_event_id: i64,
        to: State,
        request: DecisionTaskRequest,
        now_millis: i64,
    ) -> Result<CommittedRequest, TestServiceError> {
        let committed = self.in_context(now_millis, |run, ctx| {
            let machine = run.outstanding_decision(started_event_id)?;
            let attempt = machine.data().attempt + 1;
            machine.action(to, ctx, &request, 0)?;
            let previous_started = run.previous_started_event_id;
            run.schedule_decision(ctx, previous_started, attempt)
        })?;
        // the retry may land on any worker
        self.sticky = false;
        Ok(committed)
    }

    fn decision_task(&self, domain: &str, query: Option<(String, WorkflowQuery)>) -> Result<DecisionTask, TestServiceError> {
        let (scheduled_event_id, started_event_id, previous_started_event_id, attempt) =
            match (&self.decision, &query) {
                (Some(d), None) => {
                    let data = d.data();
                    (
                        data.scheduled_event_id,
                        data.started_event_id,
                        data.previous_started_event_id,
                        data.attempt,
                    )
                }
                _ => (0, 0, self.previous_started_event_id, 0),
            };
        let partial = query.is_none() && self.sticky && previous_started_event_id > 0;
        let events = if partial {
            self.history
                .iter()
                .filter(|e| e.event_id > previous_started_event_id)
                .cloned()
                .collect()
        } else {
            self.history.clone()
        };
        let (query_id, query) = match query {
            Some((id, query)) => (Some(id), Some(query)),
            None => (None, None),
        };
        let token = DecisionTaskToken {
            workflow_id: self.execution().workflow_id.clone(),
            run_id: self.execution().run_id.clone(),
            scheduled_event_id,
            started_event_id,
            query_id,
        };
        Ok(DecisionTask {
            task_token: serde_json::to_vec(&token)?,
            domain: domain.to_string(),
            workflow_execution: self.execution().clone(),
            workflow_type: self.workflow_type.clone(),
            previous_started_event_id,
            started_event_id,
            attempt,
            history: History::new(events),
            query,
        })
    }
}

/// Whether a poll on `request`'s task list receives the run's decision tasks.
fn serves(run: &TestRun, request: &PollForDecisionTaskRequest) -> bool {
    run.task_list.name == request.task_list.name && run.id.domain == request.domain
}

#[derive(Debug)]
struct PendingActivity {
    execution: WorkflowExecution,
    activity_id: String,
    task_list: String,
}

#[derive(Debug)]
struct PendingTimer {
    execution: WorkflowExecution,
    timer_id: String,
    fire_time_millis: i64,
}

#[derive(Debug)]
struct PendingQuery {
    execution: WorkflowExecution,
    query: WorkflowQuery,
    result: Option<WorkflowQueryResult>,
}

#[derive(Default)]
struct ServiceState {
    now_millis: i64,
    runs: HashMap<WorkflowExecution, TestRun>,
    current_runs: HashMap<String, WorkflowExecution>,
    decision_queue: VecDeque<WorkflowExecution>,
    activity_queue: VecDeque<PendingActivity>,
    timers: Vec<PendingTimer>,
    queries: HashMap<String, PendingQuery>,
    query_queue: VecDeque<String>,
}

impl ServiceState {
    fn resolve_execution(&self, execution: &WorkflowExecution) -> Result<WorkflowExecution, TestServiceError> {
        if execution.run_id.is_empty() {
            return self
                .current_runs
                .get(&execution.workflow_id)
                .cloned()
                .ok_or_else(|| TestServiceError::UnknownExecution(execution.workflow_id.clone()));
        }
        if self.runs.contains_key(execution) {
            Ok(execution.clone())
        } else {
            Err(TestServiceError::UnknownExecution(execution.to_string()))
        }
    }

    fn run(&self, execution: &WorkflowExecution) -> Result<&TestRun, TestServiceError> {
        self.runs
            .get(execution)
            .ok_or_else(|| TestServiceError::UnknownExecution(execution.to_string()))
    }

    fn run_mut(&mut self, execution: &WorkflowExecution) -> Result<&mut TestRun, TestServiceError> {
        self.runs
            .get_mut(execution)
            .ok_or_else(|| TestServiceError::UnknownExecution(execution.to_string()))
    }

    /// Queues the tasks and timers a committed batch produced.
    fn dispatch(&mut self, execution: &WorkflowExecution, committed: CommittedRequest) {
        if let Some(task) = committed.decision_task {
            debug!(execution = %execution, scheduled_event_id = task.scheduled_event_id, "decision task scheduled");
            self.decision_queue.push_back(execution.clone());
        }
        for task in committed.activity_tasks {
            self.activity_queue.push_back(PendingActivity {
                execution: execution.clone(),
                activity_id: task.activity_id,
                task_list: task.task_list.name,
            });
        }
        for timer in committed.timers {
            self.timers.push(PendingTimer {
                execution: execution.clone(),
                timer_id: timer.timer_id,
                fire_time_millis: timer.fire_time_millis,
            });
        }
        for child in committed.child_workflows {
            self.start_child(execution, child);
        }
        if committed.workflow_closed {
            info!(execution = %execution, "workflow execution closed");
            self.report_to_parent(execution);
        }
    }

    /// Starts the child run and tells the parent whether that worked.
    fn start_child(&mut self, parent: &WorkflowExecution, child: ChildWorkflowDispatch) {
        let request = StartWorkflowRequest {
            domain: child.domain,
            workflow_id: child.workflow_id.clone(),
            workflow_type: child.workflow_type,
            task_list: child.task_list,
            input: child.input.unwrap_or_default(),
            execution_start_to_close_timeout_seconds: child
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: child.task_start_to_close_timeout_seconds,
            identity: parent.to_string(),
        };
        let (to, request) = match self.start_run(request, Some(parent.clone())) {
            Ok(started) => (
                State::Started,
                ChildWorkflowRequest::Started {
                    run_id: started.run_id,
                },
            ),
            Err(e) => {
                warn!(parent = %parent, workflow_id = %child.workflow_id, error = %e, "child workflow did not start");
                let cause = match e {
                    TestServiceError::AlreadyStarted(_) => "WORKFLOW_ALREADY_RUNNING".to_string(),
                    other => other.to_string(),
                };
                (State::Failed, ChildWorkflowRequest::StartFailed { cause })
            }
        };
        let update = RunRequest::Child {
            workflow_id: child.workflow_id,
            to,
            request,
        };
        if let Err(e) = self.submit(parent, update) {
            warn!(parent = %parent, error = %e, "parent did not take the child's start");
        }
    }

    /// Hands a closed child's outcome to its parent. A closed parent has
    /// abandoned its children and is skipped.
    fn report_to_parent(&mut self, execution: &WorkflowExecution) {
        let Some(run) = self.runs.get(execution) else {
            return;
        };
        let Some(parent) = run.parent.clone() else {
            return;
        };
        let Some((to, request)) = run.outcome_for_parent() else {
            return;
        };
        let update = RunRequest::Child {
            workflow_id: execution.workflow_id.clone(),
            to,
            request,
        };
        match self.submit(&parent, update) {
            Ok(()) => debug!(parent = %parent, child = %execution, "child outcome reported"),
            Err(e) => debug!(parent = %parent, child = %execution, error = %e, "child outcome not reported"),
        }
    }

    fn submit(&mut self, execution: &WorkflowExecution, request: RunRequest) -> Result<(), TestServiceError> {
        let now = self.now_millis;
        let run = self.run_mut(execution)?;
        if run.is_closed() {
            return Err(TestServiceError::AlreadyCompleted(execution.to_string()));
        }
        if run.decision_in_flight() {
            debug!(execution = %execution, ?request, "decision task in flight, buffering request");
            run.buffered.push(request);
            return Ok(());
        }
        let committed = run.apply_request(&request, now)?;
        self.dispatch(execution, committed);
        Ok(())
    }

    fn drain_buffered(&mut self, execution: &WorkflowExecution) {
        let now = self.now_millis;
        let buffered = match self.runs.get_mut(execution) {
            Some(run) => std::mem::take(&mut run.buffered),
            None => return,
        };
        for request in buffered {
            let Some(run) = self.runs.get_mut(execution) else {
                return;
            };
            match run.apply_request(&request, now) {
                Ok(committed) => self.dispatch(execution, committed),
                Err(e) => warn!(execution = %execution, ?request, error = %e, "dropping buffered request"),
            }
        }
    }

    fn start_workflow(&mut self, request: StartWorkflowRequest) -> Result<WorkflowExecution, TestServiceError> {
        self.start_run(request, None)
    }

    fn start_run(
        &mut self,
        request: StartWorkflowRequest,
        parent: Option<WorkflowExecution>,
    ) -> Result<WorkflowExecution, TestServiceError> {
        if let Some(current) = self.current_runs.get(&request.workflow_id) {
            if self.runs.get(current).map(|r| !r.is_closed()).unwrap_or(false) {
                return Err(TestServiceError::AlreadyStarted(request.workflow_id));
            }
        }
        let execution = WorkflowExecution::new(request.workflow_id.clone(), Uuid::new_v4().to_string());
        let mut run = TestRun::new(
            ExecutionId::new(request.domain.clone(), execution.clone()),
            &request,
            parent,
        );
        let attributes = WorkflowExecutionStartedEventAttributes {
            workflow_type: request.workflow_type.clone(),
            task_list: request.task_list.clone(),
            input: request.input.clone(),
            execution_start_to_close_timeout_seconds: request.execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            identity: request.identity.clone(),
            attempt: 0,
        };
        let committed = run.in_context(self.now_millis, |run, ctx| {
            run.workflow
                .action(State::Started, ctx, &WorkflowRequest::Start(attributes), 0)?;
            run.schedule_decision(ctx, 0, 0)
        })?;
        info!(
            execution = %execution,
            workflow_type = %request.workflow_type.name,
            "workflow execution started"
        );
        self.runs.insert(execution.clone(), run);
        self.current_runs
            .insert(request.workflow_id, execution.clone());
        self.dispatch(&execution, committed);
        Ok(execution)
    }

    fn poll_decision_task(&mut self, request: &PollForDecisionTaskRequest) -> Result<Option<DecisionTask>, TestServiceError> {
        if let Some(task) = self.poll_query_task(request)? {
            return Ok(Some(task));
        }
        loop {
            let runs = &self.runs;
            let index = self.decision_queue.iter().position(|execution| {
                runs.get(execution)
                    .map(|r| serves(r, request))
                    .unwrap_or(true)
            });
            let Some(execution) = index.and_then(|i| self.decision_queue.remove(i)) else {
                break;
            };
            let now = self.now_millis;
            let Some(run) = self.runs.get_mut(&execution) else {
                continue;
            };
            let scheduled = run
                .decision
                .as_ref()
                .map(|d| d.state() == State::Scheduled)
                .unwrap_or(false);
            if !scheduled {
                continue;
            }
            run.in_context(now, |run, ctx| {
                if let Some(machine) = &run.decision {
                    machine.action(
                        State::Started,
                        ctx,
                        &DecisionTaskRequest::Start {
                            identity: request.identity.clone(),
                            request_id: Uuid::new_v4().to_string(),
                        },
                        0,
                    )?;
                }
                Ok(())
            })?;
            let task = run.decision_task(&request.domain, None)?;
            debug!(
                execution = %execution,
                started_event_id = task.started_event_id,
                events = task.history.events.len(),
                "decision task started"
            );
            return Ok(Some(task));
        }
        Ok(None)
    }

    fn poll_query_task(&mut self, request: &PollForDecisionTaskRequest) -> Result<Option<DecisionTask>, TestServiceError> {
        let queries = &self.queries;
        let runs = &self.runs;
        let index = self.query_queue.iter().position(|id| {
            queries
                .get(id)
                .and_then(|q| runs.get(&q.execution))
                .map(|r| serves(r, request))
                .unwrap_or(false)
        });
        let Some(query_id) = index.and_then(|i| self.query_queue.remove(i)) else {
            return Ok(None);
        };
        let Some(pending) = self.queries.get(&query_id) else {
            return Ok(None);
        };
        let run = self.run(&pending.execution)?;
        let task = run.decision_task(&request.domain, Some((query_id, pending.query.clone())))?;
        Ok(Some(task))
    }

    fn respond_decision_task_completed(&mut self, request: RespondDecisionTaskCompletedRequest) -> Result<(), TestServiceError> {
        let token: DecisionTaskToken = serde_json::from_slice(&request.task_token)?;
        if let Some(query_id) = token.query_id {
            let pending = self
                .queries
                .get_mut(&query_id)
                .ok_or(TestServiceError::UnknownQuery(query_id))?;
            pending.result = Some(request.query_result.unwrap_or_else(|| {
                WorkflowQueryResult::failed("query task answered without a result")
            }));
            return Ok(());
        }
        let execution = WorkflowExecution::new(token.workflow_id, token.run_id);
        let now = self.now_millis;
        let run = self.run_mut(&execution)?;
        let committed = run.complete_decision(&request, token.started_event_id, now)?;
        info!(
            execution = %execution,
            started_event_id = token.started_event_id,
            decisions = request.decisions.len(),
            sticky = run.sticky,
            "decision task completed"
        );
        self.dispatch(&execution, committed);
        self.drain_buffered(&execution);
        Ok(())
    }

    fn respond_decision_task_failed(&mut self, request: RespondDecisionTaskFailedRequest) -> Result<(), TestServiceError> {
        let token: DecisionTaskToken = serde_json::from_slice(&request.task_token)?;
        if let Some(query_id) = token.query_id {
            let pending = self
                .queries
                .get_mut(&query_id)
                .ok_or(TestServiceError::UnknownQuery(query_id))?;
            let message = request
                .details
                .map(|d| String::from_utf8_lossy(&d).into_owned())
                .unwrap_or_else(|| request.cause.as_str().to_string());
            pending.result = Some(WorkflowQueryResult::failed(message));
            return Ok(());
        }
        let execution = WorkflowExecution::new(token.workflow_id, token.run_id);
        let fail = DecisionTaskRequest::Fail {
            cause: request.cause.as_str().to_string(),
            details: request.details,
            identity: request.identity,
        };
        self.close_decision(&execution, token.started_event_id, State::Failed, fail)
    }

    fn close_decision(
        &mut self,
        execution: &WorkflowExecution,
        started_event_id: i64,
        to: State,
        request: DecisionTaskRequest,
    ) -> Result<(), TestServiceError> {
        let now = self.now_millis;
        let committed = self
            .run_mut(execution)?
            .close_decision(started_event_id, to, request, now)?;
        warn!(execution = %execution, started_event_id, state = ?to, "decision task closed without decisions");
        self.dispatch(execution, committed);
        self.drain_buffered(execution);
        Ok(())
    }

    fn time_out_decision_task(&mut self, execution: &WorkflowExecution) -> Result<(), TestServiceError> {
        let execution = self.resolve_execution(execution)?;
        let run = self.run(&execution)?;
        let started_event_id = match &run.decision {
            Some(d) if d.state() == State::Started => d.data().started_event_id,
            _ => {
                return Err(TestServiceError::StaleDecisionTask {
                    execution: execution.to_string(),
                    started_event_id: 0,
                })
            }
        };
        self.close_decision(
            &execution,
            started_event_id,
            State::TimedOut,
            DecisionTaskRequest::TimeOut {
                timeout_type: TimeoutType::StartToClose,
            },
        )
    }

    fn poll_activity_task(&mut self, task_list: &str, identity: &str) -> Result<Option<ActivityTask>, TestServiceError> {
        while let Some(index) = self.activity_queue.iter().position(|a| a.task_list == task_list) {
            let Some(pending) = self.activity_queue.remove(index) else {
                break;
            };
            let Some(run) = self.runs.get(&pending.execution) else {
                continue;
            };
            let Some(machine) = run.activities.get(&pending.activity_id) else {
                continue;
            };
            if run.is_closed() || machine.state() != State::Scheduled {
                continue;
            }
            let task = {
                let data = machine.data();
                let token = ActivityTaskToken {
                    workflow_id: pending.execution.workflow_id.clone(),
                    run_id: pending.execution.run_id.clone(),
                    activity_id: pending.activity_id.clone(),
                    scheduled_event_id: data.scheduled_event_id,
                };
                ActivityTask {
                    task_token: serde_json::to_vec(&token)?,
                    workflow_execution: pending.execution.clone(),
                    activity_id: pending.activity_id.clone(),
                    activity_type: data
                        .activity_type
                        .clone()
                        .unwrap_or_else(|| ActivityType::new("")),
                    input: data.input.clone(),
                    scheduled_event_id: data.scheduled_event_id,
                    attempt: data.attempt,
                }
            };
            self.submit(
                &pending.execution,
                RunRequest::StartActivity {
                    activity_id: pending.activity_id,
                    identity: identity.to_string(),
                    request_id: Uuid::new_v4().to_string(),
                },
            )?;
            return Ok(Some(task));
        }
        Ok(None)
    }

    /// Resolves either addressing form to the run and activity id.
    fn resolve_activity(&self, address: &ActivityAddress) -> Result<(WorkflowExecution, String), TestServiceError> {
        match address {
            ActivityAddress::Token(token) => {
                let token: ActivityTaskToken = serde_json::from_slice(token)?;
                let execution = WorkflowExecution::new(token.workflow_id, token.run_id);
                let machine = self.run(&execution)?.activity(&token.activity_id)?;
                if machine.data().scheduled_event_id != token.scheduled_event_id {
                    return Err(TestServiceError::UnknownActivity {
                        execution: execution.to_string(),
                        activity_id: token.activity_id,
                    });
                }
                Ok((execution, token.activity_id))
            }
            ActivityAddress::Id {
                workflow_id,
                run_id,
                activity_id,
            } => {
                let execution =
                    self.resolve_execution(&WorkflowExecution::new(workflow_id.clone(), run_id.clone()))?;
                self.run(&execution)?.activity(activity_id)?;
                Ok((execution, activity_id.clone()))
            }
        }
    }

    fn record_activity_heartbeat(
        &mut self,
        address: &ActivityAddress,
        details: Option<Vec<u8>>,
    ) -> Result<bool, TestServiceError> {
        let (execution, activity_id) = self.resolve_activity(address)?;
        let now = self.now_millis;
        let run = self.run_mut(&execution)?;
        if run.is_closed() {
            return Err(TestServiceError::AlreadyCompleted(execution.to_string()));
        }
        let state = run.activity(&activity_id)?.state();
        run.in_context(now, |run, ctx| {
            run.activity(&activity_id)?.action(
                state,
                ctx,
                &ActivityTaskRequest::Heartbeat { details },
                0,
            )?;
            Ok(())
        })?;
        Ok(state == State::CancellationRequested)
    }

    fn advance_time(&mut self, by: Duration) -> Result<usize, TestServiceError> {
        let target = self.now_millis + by.as_millis() as i64;
        let mut fired = 0;
        loop {
            let next = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.fire_time_millis <= target)
                .min_by_key(|(_, t)| t.fire_time_millis)
                .map(|(i, _)| i);
            let Some(index) = next else {
                break;
            };
            let timer = self.timers.remove(index);
            self.now_millis = self.now_millis.max(timer.fire_time_millis);
            let armed = self
                .runs
                .get(&timer.execution)
                .filter(|r| !r.is_closed())
                .and_then(|r| r.timers.get(&timer.timer_id))
                .map(|t| t.state() == State::Started)
                .unwrap_or(false);
            if !armed {
                continue;
            }
            debug!(execution = %timer.execution, timer_id = %timer.timer_id, "timer fired");
            self.submit(
                &timer.execution,
                RunRequest::FireTimer {
                    timer_id: timer.timer_id,
                },
            )?;
            fired += 1;
        }
        self.now_millis = target;
        Ok(fired)
    }

    fn query_workflow(
        &mut self,
        execution: &WorkflowExecution,
        query_type: &str,
        query_args: Option<Vec<u8>>,
    ) -> Result<String, TestServiceError> {
        let execution = self.resolve_execution(execution)?;
        let query_id = Uuid::new_v4().to_string();
        self.queries.insert(
            query_id.clone(),
            PendingQuery {
                execution,
                query: WorkflowQuery {
                    query_type: query_type.to_string(),
                    query_args,
                },
                result: None,
            },
        );
        self.query_queue.push_back(query_id.clone());
        Ok(query_id)
    }
}

/// In-memory [`WorkflowService`] for tests.
pub struct TestWorkflowService {
    state: Mutex<ServiceState>,
}

impl TestWorkflowService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
        }
    }

    pub fn start_workflow(&self, request: StartWorkflowRequest) -> Result<WorkflowExecution, TestServiceError> {
        self.state.lock().start_workflow(request)
    }

    /// Records a signal; an empty `run_id` addresses the current run.
    pub fn signal_workflow(
        &self,
        execution: &WorkflowExecution,
        signal_name: &str,
        input: Option<Vec<u8>>,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        state.submit(
            &execution,
            RunRequest::Signal {
                signal_name: signal_name.to_string(),
                input,
                identity: "test-client".to_string(),
            },
        )
    }

    pub fn request_cancel_workflow(
        &self,
        execution: &WorkflowExecution,
        cause: Option<String>,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        state.submit(
            &execution,
            RunRequest::RequestCancel {
                cause,
                identity: "test-client".to_string(),
            },
        )
    }

    /// Times out the run's started decision task and schedules a retry.
    pub fn time_out_decision_task(&self, execution: &WorkflowExecution) -> Result<(), TestServiceError> {
        self.state.lock().time_out_decision_task(execution)
    }

    pub fn poll_for_activity_task(&self, task_list: &str, identity: &str) -> Result<Option<ActivityTask>, TestServiceError> {
        self.state.lock().poll_activity_task(task_list, identity)
    }

    pub fn respond_activity_task_completed(
        &self,
        address: &ActivityAddress,
        result: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let (execution, activity_id) = state.resolve_activity(address)?;
        state.submit(
            &execution,
            RunRequest::CompleteActivity {
                activity_id,
                identity: identity.to_string(),
                result,
            },
        )
    }

    pub fn respond_activity_task_failed(
        &self,
        address: &ActivityAddress,
        reason: impl Into<String>,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let (execution, activity_id) = state.resolve_activity(address)?;
        state.submit(
            &execution,
            RunRequest::FailActivity {
                activity_id,
                identity: identity.to_string(),
                reason: Some(reason.into()),
                details,
            },
        )
    }

    pub fn respond_activity_task_canceled(
        &self,
        address: &ActivityAddress,
        details: Option<Vec<u8>>,
        identity: &str,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let (execution, activity_id) = state.resolve_activity(address)?;
        state.submit(
            &execution,
            RunRequest::ReportActivityCanceled {
                activity_id,
                identity: identity.to_string(),
                details,
            },
        )
    }

    /// Returns whether cancellation of the activity was requested.
    pub fn record_activity_heartbeat(
        &self,
        address: &ActivityAddress,
        details: Option<Vec<u8>>,
    ) -> Result<bool, TestServiceError> {
        self.state.lock().record_activity_heartbeat(address, details)
    }

    pub fn time_out_activity(
        &self,
        address: &ActivityAddress,
        timeout_type: TimeoutType,
    ) -> Result<(), TestServiceError> {
        let mut state = self.state.lock();
        let (execution, activity_id) = state.resolve_activity(address)?;
        state.submit(
            &execution,
            RunRequest::TimeOutActivity {
                activity_id,
                timeout_type,
            },
        )
    }

    /// Moves virtual time forward, firing due timers in fire time order.
    pub fn advance_time(&self, by: Duration) -> Result<usize, TestServiceError> {
        self.state.lock().advance_time(by)
    }

    pub fn now_millis(&self) -> i64 {
        self.state.lock().now_millis
    }

    /// Queues a query for the next decision poll and returns its id.
    pub fn query_workflow(
        &self,
        execution: &WorkflowExecution,
        query_type: &str,
        query_args: Option<Vec<u8>>,
    ) -> Result<String, TestServiceError> {
        self.state.lock().query_workflow(execution, query_type, query_args)
    }

    pub fn query_result(&self, query_id: &str) -> Option<WorkflowQueryResult> {
        self.state
            .lock()
            .queries
            .get(query_id)
            .and_then(|q| q.result.clone())
    }

    pub fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>, TestServiceError> {
        let state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        Ok(state.run(&execution)?.history.clone())
    }

    pub fn workflow_state(&self, execution: &WorkflowExecution) -> Result<State, TestServiceError> {
        let state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        Ok(state.run(&execution)?.workflow.state())
    }

    /// Result recorded by a `CompleteWorkflowExecution` decision.
    pub fn workflow_result(&self, execution: &WorkflowExecution) -> Result<Option<Vec<u8>>, TestServiceError> {
        let state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        let result = state.run(&execution)?.workflow.data().result.clone();
        Ok(result)
    }

    pub fn activity_state(&self, execution: &WorkflowExecution, activity_id: &str) -> Result<State, TestServiceError> {
        let state = self.state.lock();
        let execution = state.resolve_execution(execution)?;
        Ok(state.run(&execution)?.activity(activity_id)?.state())
    }

    /// State of child `workflow_id` as recorded in the parent's history.
    pub fn child_state(&self, parent: &WorkflowExecution, workflow_id: &str) -> Result<State, TestServiceError> {
        let state = self.state.lock();
        let parent = state.resolve_execution(parent)?;
        Ok(state.run(&parent)?.child(workflow_id)?.state())
    }
}

impl Default for TestWorkflowService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestWorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestWorkflowService")
            .field("now_millis", &state.now_millis)
            .field("runs", &state.runs.len())
            .field("decision_queue", &state.decision_queue.len())
            .field("activity_queue", &state.activity_queue.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

#[async_trait]
impl WorkflowService for TestWorkflowService {
    async fn poll_for_decision_task(
        &self,
        request: PollForDecisionTaskRequest,
    ) -> Result<Option<DecisionTask>, CadenceError> {
        Ok(self.state.lock().poll_decision_task(&request)?)
    }

    async fn get_workflow_execution_history(
        &self,
        _domain: &str,
        execution: &WorkflowExecution,
    ) -> Result<History, CadenceError> {
        Ok(History::new(self.history(execution)?))
    }

    async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<(), CadenceError> {
        Ok(self.state.lock().respond_decision_task_completed(request)?)
    }

    async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<(), CadenceError> {
        Ok(self.state.lock().respond_decision_task_failed(request)?)
    }
}

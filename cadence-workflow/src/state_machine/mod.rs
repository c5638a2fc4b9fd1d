//! Table-driven entity state machines.
//!
//! Each entity kind (workflow, decision task, activity task, timer, child
//! workflow) has a
//! transition table keyed by `(from, to)`. Transition functions append
//! history events to a [`RequestContext`] and defer every mutation of entity
//! data to commit callbacks, so a failed batch leaves no trace.

pub mod activity;
pub mod child_workflow;
pub mod context;
pub mod decision_task;
pub mod timer;
pub mod workflow;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

pub use activity::{ActivityTaskData, ActivityTaskMachine, ActivityTaskRequest};
pub use child_workflow::{ChildWorkflowData, ChildWorkflowMachine, ChildWorkflowRequest};
pub use context::{
    ActivityTaskDispatch, ChildWorkflowDispatch, CommittedRequest, DecisionTaskDispatch,
    ExecutionId, RequestContext, TimerRegistration,
};
pub use decision_task::{DecisionTaskData, DecisionTaskMachine, DecisionTaskRequest};
pub use timer::{TimerData, TimerMachine, TimerRequest};
pub use workflow::{WorkflowData, WorkflowMachine, WorkflowRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    None,
    Scheduled,
    Started,
    Completed,
    Failed,
    TimedOut,
    CancellationRequested,
    Canceled,
}

impl State {
    pub const ALL: [State; 8] = [
        State::None,
        State::Scheduled,
        State::Started,
        State::Completed,
        State::Failed,
        State::TimedOut,
        State::CancellationRequested,
        State::Canceled,
    ];

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            State::Completed | State::Failed | State::TimedOut | State::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error("illegal {kind} transition from {from:?} to {to:?}")]
    IllegalTransition {
        kind: &'static str,
        from: State,
        to: State,
    },
    #[error("invalid {kind} request: {message}")]
    InvalidRequest { kind: &'static str, message: String },
}

pub type SharedData<D> = Arc<Mutex<D>>;

pub type TransitionFn<D, R> =
    fn(&mut RequestContext, &SharedData<D>, &R, i64) -> Result<(), StateMachineError>;

pub struct TransitionTable<D, R> {
    transitions: HashMap<(State, State), TransitionFn<D, R>>,
}

impl<D, R> TransitionTable<D, R> {
    pub fn new() -> Self {
        Self {
            transitions: HashMap::new(),
        }
    }

    pub fn add(mut self, from: State, to: State, transition: TransitionFn<D, R>) -> Self {
        self.transitions.insert((from, to), transition);
        self
    }

    pub fn get(&self, from: State, to: State) -> Option<TransitionFn<D, R>> {
        self.transitions.get(&(from, to)).copied()
    }

    pub fn is_legal(&self, from: State, to: State) -> bool {
        self.transitions.contains_key(&(from, to))
    }
}

impl<D, R> Default for TransitionTable<D, R> {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// One entity's state plus its data.
///
/// `state()` is the committed state. Within a request context, later
/// transitions start from the state staged by earlier ones.
pub struct StateMachine<D, R> {
    id: u64,
    kind: &'static str,
    state: Arc<Mutex<State>>,
    data: SharedData<D>,
    table: Arc<TransitionTable<D, R>>,
}

impl<D: Send + 'static, R> StateMachine<D, R> {
    pub fn new(kind: &'static str, data: D, table: Arc<TransitionTable<D, R>>) -> Self {
        Self {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::SeqCst),
            kind,
            state: Arc::new(Mutex::new(State::None)),
            data: Arc::new(Mutex::new(data)),
            table,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// State as seen from inside `ctx`, including staged transitions.
    pub fn staged_state(&self, ctx: &RequestContext) -> State {
        ctx.staged_state(self.id).unwrap_or_else(|| self.state())
    }

    pub fn data(&self) -> MutexGuard<'_, D> {
        self.data.lock()
    }

    /// Whether the table allows moving to `to` from the state staged in `ctx`.
    pub fn can_transition(&self, ctx: &RequestContext, to: State) -> bool {
        self.table.is_legal(self.staged_state(ctx), to)
    }

    /// Runs the `(current, to)` transition inside `ctx`.
    pub fn action(
        &self,
        to: State,
        ctx: &mut RequestContext,
        request: &R,
        causal_event_id: i64,
    ) -> Result<(), StateMachineError> {
        let from = self.staged_state(ctx);
        let transition = self
            .table
            .get(from, to)
            .ok_or(StateMachineError::IllegalTransition {
                kind: self.kind,
                from,
                to,
            })?;
        transition(ctx, &self.data, request, causal_event_id)?;
        ctx.stage_state(self.id, to);
        let cell = self.state.clone();
        ctx.on_commit(move || *cell.lock() = to);
        Ok(())
    }
}

impl<D, R> fmt::Debug for StateMachine<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Commits `data_fn` against the entity data when the context commits.
pub(crate) fn on_commit_data<D, F>(ctx: &mut RequestContext, data: &SharedData<D>, data_fn: F)
where
    D: Send + 'static,
    F: FnOnce(&mut D) + Send + 'static,
{
    let data = data.clone();
    ctx.on_commit(move || data_fn(&mut data.lock()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::WorkflowExecution;

    fn ctx() -> RequestContext {
        RequestContext::new(
            ExecutionId::new("domain", WorkflowExecution::new("wf", "run")),
            1,
            0,
        )
    }

    /// Every `(from, to)` pair is rejected as illegal exactly when the table
    /// lacks it, and a rejected action leaves the context empty.
    fn assert_table_agrees<D: Send + 'static, R>(new_machine: impl Fn() -> StateMachine<D, R>, request: &R) {
        for from in State::ALL {
            for to in State::ALL {
                let machine = new_machine();
                *machine.state.lock() = from;
                let mut c = ctx();
                let legal = machine.can_transition(&c, to);
                assert_eq!(legal, machine.table.is_legal(from, to));
                let result = machine.action(to, &mut c, request, 0);
                let illegal = matches!(result, Err(StateMachineError::IllegalTransition { .. }));
                assert_eq!(
                    legal, !illegal,
                    "{} {:?} -> {:?}: {:?}",
                    machine.kind(),
                    from,
                    to,
                    result
                );
                if illegal {
                    assert!(c.events().is_empty());
                    assert_eq!(machine.staged_state(&c), from);
                }
            }
        }
    }

    #[test]
    fn test_workflow_table_legality() {
        assert_table_agrees(WorkflowMachine::workflow, &WorkflowRequest::Complete { result: None });
    }

    #[test]
    fn test_decision_task_table_legality() {
        assert_table_agrees(
            || DecisionTaskMachine::decision_task(0),
            &DecisionTaskRequest::Complete {
                identity: "w".to_string(),
            },
        );
    }

    #[test]
    fn test_activity_task_table_legality() {
        assert_table_agrees(
            || ActivityTaskMachine::activity_task("1"),
            &ActivityTaskRequest::RequestCancel,
        );
    }

    #[test]
    fn test_timer_table_legality() {
        assert_table_agrees(|| TimerMachine::timer("t1"), &TimerRequest::Fire);
    }

    #[test]
    fn test_child_workflow_table_legality() {
        assert_table_agrees(
            || ChildWorkflowMachine::child_workflow("child"),
            &ChildWorkflowRequest::Complete { result: None },
        );
    }
}

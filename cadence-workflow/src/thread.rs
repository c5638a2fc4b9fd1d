//! Logical workflow threads.
//!
//! A logical thread is a boxed future owned by the runner. Only the runner
//! polls it, one thread at a time, so workflow code never runs concurrently
//! with other workflow code of the same instance.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::cancellation::CancellationScope;
use crate::context::WorkflowContext;
use crate::future::WorkflowError;
use crate::runner::RunnerShared;

pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, not yet polled
    Created,
    /// Currently being polled
    Runnable,
    Blocked,
    Done,
    /// Finished with an error or panic
    Failed,
}

impl ThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Done | ThreadStatus::Failed)
    }
}

/// Point-in-time view of one thread, used for stack-trace queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub blocked_reason: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ThreadState {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) status: ThreadStatus,
    pub(crate) started: bool,
    pub(crate) blocked_reason: Option<String>,
    pub(crate) failure: Option<WorkflowError>,
    pub(crate) exiting: bool,
}

impl ThreadState {
    pub(crate) fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            blocked_reason: self.blocked_reason.clone(),
        }
    }
}

pub(crate) type SharedThreadState = Arc<Mutex<ThreadState>>;

type ThreadFuture = Pin<Box<dyn Future<Output = Result<(), WorkflowError>> + Send>>;

/// What happened when a thread was polled during teardown.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DestroyOutcome {
    Unwound,
    Swallowed,
}

pub(crate) struct LogicalThread {
    state: SharedThreadState,
    future: Option<ThreadFuture>,
}

impl LogicalThread {
    /// Creates the runner-owned half of a thread and the typed handle returned to workflow code.
    pub(crate) fn new<F, Fut, T>(
        shared: Arc<RunnerShared>,
        name: String,
        scope: CancellationScope,
        body: F,
    ) -> (Self, WorkflowThread<T>)
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(Mutex::new(ThreadState {
            id: shared.next_thread_id(),
            name,
            status: ThreadStatus::Created,
            started: false,
            blocked_reason: None,
            failure: None,
            exiting: false,
        }));
        let result = Arc::new(Mutex::new(None));

        let ctx = WorkflowContext::new(shared.clone(), state.clone(), scope.clone());
        let slot = result.clone();
        let future: ThreadFuture = Box::pin(async move {
            let outcome = body(ctx).await;
            let erased = match &outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(e.clone()),
            };
            *slot.lock() = Some(outcome);
            erased
        });

        let handle = WorkflowThread {
            state: state.clone(),
            scope,
            result,
            shared,
        };
        (
            Self {
                state,
                future: Some(future),
            },
            handle,
        )
    }

    pub(crate) fn state(&self) -> &SharedThreadState {
        &self.state
    }

    pub(crate) fn is_pollable(&self) -> bool {
        self.future.is_some() && self.state.lock().started
    }

    /// Polls the thread once and records the resulting status.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>, shared: &RunnerShared) {
        let Some(future) = self.future.as_mut() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.status == ThreadStatus::Created {
                shared.mark_progress();
            }
            state.status = ThreadStatus::Runnable;
            state.blocked_reason = None;
        }

        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));

        let mut state = self.state.lock();
        match polled {
            Ok(Poll::Pending) => {
                state.status = ThreadStatus::Blocked;
                return;
            }
            Ok(Poll::Ready(Ok(()))) => {
                state.status = ThreadStatus::Done;
            }
            Ok(Poll::Ready(Err(e))) => {
                if !e.is_canceled() {
                    debug!(thread = %state.name, error = %e, "workflow thread failed");
                }
                state.status = ThreadStatus::Failed;
                state.failure = Some(e);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(thread = %state.name, panic = %message, "workflow thread panicked");
                state.status = ThreadStatus::Failed;
                state.failure = Some(WorkflowError::Panic(message));
            }
        }
        self.future = None;
        shared.mark_progress();
    }

    /// Tears the thread down. Blocked threads are polled once so that their
    /// pending await observes [`WorkflowError::Destroyed`] and unwinds.
    pub(crate) fn destroy(&mut self, cx: &mut Context<'_>) -> DestroyOutcome {
        let Some(mut future) = self.future.take() else {
            return DestroyOutcome::Unwound;
        };
        let (name, skip) = {
            let mut state = self.state.lock();
            let skip = state.exiting || state.status == ThreadStatus::Created;
            if !skip {
                state.status = ThreadStatus::Runnable;
            }
            (state.name.clone(), skip)
        };
        if skip {
            self.state.lock().status = ThreadStatus::Done;
            return DestroyOutcome::Unwound;
        }

        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));
        drop(future);

        let mut state = self.state.lock();
        state.blocked_reason = None;
        match polled {
            Ok(Poll::Ready(Err(WorkflowError::Destroyed))) => {
                state.status = ThreadStatus::Done;
                DestroyOutcome::Unwound
            }
            Ok(Poll::Ready(other)) => {
                warn!(thread = %name, outcome = ?other, "workflow thread swallowed its destruction");
                state.status = ThreadStatus::Done;
                DestroyOutcome::Swallowed
            }
            Ok(Poll::Pending) => {
                warn!(thread = %name, "workflow thread kept waiting after destruction");
                state.status = ThreadStatus::Done;
                DestroyOutcome::Swallowed
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(thread = %name, panic = %message, "workflow thread panicked during destruction");
                state.status = ThreadStatus::Failed;
                state.failure = Some(WorkflowError::Panic(message));
                DestroyOutcome::Unwound
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a logical thread created by workflow code.
pub struct WorkflowThread<T> {
    state: SharedThreadState,
    scope: CancellationScope,
    result: Arc<Mutex<Option<Result<T, WorkflowError>>>>,
    shared: Arc<RunnerShared>,
}

impl<T> WorkflowThread<T> {
    pub fn id(&self) -> ThreadId {
        self.state.lock().id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn status(&self) -> ThreadStatus {
        self.state.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Makes the thread eligible to run. Starting twice is a no-op.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if !state.started {
            state.started = true;
            self.shared.mark_progress();
        }
    }

    /// Requests cancellation of the thread's outermost scope.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.scope.cancel(reason);
    }

    pub fn cancellation_scope(&self) -> &CancellationScope {
        &self.scope
    }

    /// Waits for the thread to finish and takes its result.
    ///
    /// Joining is not interrupted by cancellation of the joining thread.
    pub async fn join(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        let state = self.state.clone();
        let reason = format!("join {}", self.name());
        ctx.await_uninterruptible(&reason, move || state.lock().status.is_terminal())
            .await?;
        self.take_result()
    }

    /// Like [`WorkflowThread::join`] but gives up after `timeout` of workflow
    /// time, returning `Ok(None)`.
    pub async fn join_timeout(
        &self,
        ctx: &WorkflowContext,
        timeout: Duration,
    ) -> Result<Option<T>, WorkflowError> {
        if self.is_done() {
            return self.take_result().map(Some);
        }
        let fired = Arc::new(Mutex::new(false));
        let fire_time = ctx.current_time_millis() + timeout.as_millis() as i64;
        let flag = fired.clone();
        let handle = ctx
            .runner()
            .timers()
            .lock()
            .add_timer(fire_time, Box::new(move |_| *flag.lock() = true));

        let state = self.state.clone();
        let timed_out = fired.clone();
        let reason = format!("join {} until {}", self.name(), fire_time);
        ctx.await_uninterruptible(&reason, move || {
            state.lock().status.is_terminal() || *timed_out.lock()
        })
        .await?;

        if self.is_done() {
            if !*fired.lock() {
                ctx.runner()
                    .timers()
                    .lock()
                    .remove_timer(handle)
                    .map_err(|e| WorkflowError::Internal(e.to_string()))?;
            }
            return self.take_result().map(Some);
        }
        Ok(None)
    }

    pub(crate) fn peek_result(&self) -> Result<T, WorkflowError>
    where
        T: Clone,
    {
        if let Some(result) = self.result.lock().as_ref() {
            return result.clone();
        }
        let state = self.state.lock();
        Err(state.failure.clone().unwrap_or(WorkflowError::Destroyed))
    }

    fn take_result(&self) -> Result<T, WorkflowError> {
        if let Some(result) = self.result.lock().take() {
            return result;
        }
        let state = self.state.lock();
        Err(state.failure.clone().unwrap_or_else(|| {
            WorkflowError::Internal(format!("result of thread {} was already taken", state.name))
        }))
    }
}

//! Promises and signal channels for workflow code.
//!
//! Neither type uses wakers. Waiting is always an await on a predicate
//! through the thread's [`WorkflowContext`], which the runner re-evaluates on
//! every pass.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::WorkflowContext;
use crate::future::WorkflowError;
use crate::runner::RunnerShared;

/// Single-assignment value completed by the environment or by workflow code.
pub struct WorkflowPromise<T> {
    inner: Arc<Mutex<Option<Result<T, WorkflowError>>>>,
}

impl<T> Clone for WorkflowPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WorkflowPromise<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> WorkflowPromise<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the promise. Returns false if it was already done.
    pub fn complete(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    pub fn fail(&self, error: WorkflowError) -> bool {
        self.set(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn set(&self, outcome: Result<T, WorkflowError>) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return false;
        }
        *inner = Some(outcome);
        true
    }
}

impl<T: Clone + Send> WorkflowPromise<T> {
    pub fn try_get(&self) -> Option<Result<T, WorkflowError>> {
        self.inner.lock().clone()
    }

    /// Waits for the promise. Cancellation of the calling thread does not
    /// interrupt the wait.
    pub async fn get(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        let inner = self.inner.clone();
        ctx.await_uninterruptible("promise", move || inner.lock().is_some())
            .await?;
        self.resolved()
    }

    /// Waits for the promise, giving up with [`WorkflowError::Canceled`] when
    /// the calling thread's scope is cancelled first.
    pub async fn get_cancellable(
        &self,
        ctx: &WorkflowContext,
        reason: &str,
    ) -> Result<T, WorkflowError> {
        let inner = self.inner.clone();
        ctx.await_condition(reason, move || inner.lock().is_some())
            .await?;
        self.resolved()
    }

    fn resolved(&self) -> Result<T, WorkflowError> {
        self.try_get()
            .unwrap_or_else(|| Err(WorkflowError::Internal("promise not completed".to_string())))
    }
}

impl<T> fmt::Debug for WorkflowPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowPromise")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Receives signals of one name, in delivery order.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    name: String,
    shared: Arc<RunnerShared>,
}

impl SignalChannel {
    pub(crate) fn new(name: String, shared: Arc<RunnerShared>) -> Self {
        Self { name, shared }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next signal and returns its input.
    pub async fn recv(&self, ctx: &WorkflowContext) -> Result<Option<Vec<u8>>, WorkflowError> {
        let shared = self.shared.clone();
        let name = self.name.clone();
        ctx.await_condition(&format!("signal {}", self.name), move || {
            shared.has_signal(&name)
        })
        .await?;
        self.try_recv().ok_or_else(|| {
            WorkflowError::Internal(format!("signal {} vanished", self.name))
        })
    }

    pub fn try_recv(&self) -> Option<Option<Vec<u8>>> {
        self.shared.take_signal(&self.name)
    }
}

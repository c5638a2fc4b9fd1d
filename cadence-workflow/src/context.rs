//! Workflow context: the API available to workflow code.
//!
//! Every logical thread gets its own context, bound to the thread and to its
//! current cancellation scope. Contexts are cheap to clone.

use std::future::Future;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use cadence_core::{ActivityOptions, ChildWorkflowOptions, RetryPolicy, WorkflowInfo};
use futures::future::poll_fn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cancellation::CancellationScope;
use crate::channel::{SignalChannel, WorkflowPromise};
use crate::commands::{
    CancelTimerCommand, RecordMarkerCommand, RequestCancelActivityCommand,
    ScheduleActivityCommand, StartChildWorkflowCommand, StartTimerCommand, WorkflowCommand,
};
use crate::future::WorkflowError;
use crate::runner::RunnerShared;
use crate::side_effect_serialization::{
    encode_side_effect_details, encode_version_details, DEFAULT_VERSION,
    SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};
use crate::thread::{LogicalThread, SharedThreadState, ThreadId, ThreadSnapshot, WorkflowThread};

#[derive(Clone)]
pub struct WorkflowContext {
    shared: Arc<RunnerShared>,
    thread: SharedThreadState,
    scope: CancellationScope,
}

impl WorkflowContext {
    pub(crate) fn new(
        shared: Arc<RunnerShared>,
        thread: SharedThreadState,
        scope: CancellationScope,
    ) -> Self {
        Self {
            shared,
            thread,
            scope,
        }
    }

    pub(crate) fn runner(&self) -> &Arc<RunnerShared> {
        &self.shared
    }

    pub fn workflow_info(&self) -> &WorkflowInfo {
        self.shared.info()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.lock().id
    }

    pub fn thread_name(&self) -> String {
        self.thread.lock().name.clone()
    }

    /// Workflow time in Unix milliseconds. Replay-safe.
    pub fn current_time_millis(&self) -> i64 {
        self.shared.clock().current_time_millis()
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.current_time_millis()).unwrap_or_default()
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.sink().is_replaying()
    }

    /// Suspends until `predicate` holds.
    ///
    /// Fails with [`WorkflowError::Canceled`] if the current scope is
    /// cancelled while the predicate is false, and with
    /// [`WorkflowError::Destroyed`] when the runner is tearing down.
    pub async fn await_condition<F>(&self, reason: &str, predicate: F) -> Result<(), WorkflowError>
    where
        F: FnMut() -> bool + Send,
    {
        self.await_inner(reason, true, predicate).await
    }

    /// Like [`WorkflowContext::await_condition`] but ignores cancellation.
    pub(crate) async fn await_uninterruptible<F>(
        &self,
        reason: &str,
        predicate: F,
    ) -> Result<(), WorkflowError>
    where
        F: FnMut() -> bool + Send,
    {
        self.await_inner(reason, false, predicate).await
    }

    async fn await_inner<F>(
        &self,
        reason: &str,
        cancellable: bool,
        mut predicate: F,
    ) -> Result<(), WorkflowError>
    where
        F: FnMut() -> bool + Send,
    {
        poll_fn(|_cx| {
            if self.shared.is_destroy_requested() {
                return Poll::Ready(Err(WorkflowError::Destroyed));
            }
            if predicate() {
                self.shared.mark_progress();
                return Poll::Ready(Ok(()));
            }
            if cancellable {
                if let Some(cause) = self.scope.cancellation_reason() {
                    self.shared.mark_progress();
                    return Poll::Ready(Err(WorkflowError::Canceled(cause)));
                }
            }
            self.thread.lock().blocked_reason = Some(reason.to_string());
            Poll::Pending
        })
        .await
    }

    /// Lets every other runnable thread run before continuing.
    pub async fn yield_now(&self, reason: &str) -> Result<(), WorkflowError> {
        let mut polled = false;
        self.await_uninterruptible(reason, move || std::mem::replace(&mut polled, true))
            .await
    }

    /// Creates a thread that runs once [`WorkflowThread::start`] is called.
    ///
    /// The thread's outermost scope is a child of this context's scope.
    pub fn new_thread<F, Fut, T>(&self, name: impl Into<String>, body: F) -> WorkflowThread<T>
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Send + 'static,
    {
        let (thread, handle) =
            LogicalThread::new(self.shared.clone(), name.into(), self.scope.child(), body);
        self.shared.register_thread(thread);
        handle
    }

    /// Creates and starts a thread.
    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, body: F) -> WorkflowThread<T>
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.new_thread(name, body);
        handle.start();
        handle
    }

    /// Context bound to a new scope nested in the current one.
    pub fn new_cancellation_scope(&self) -> WorkflowContext {
        self.with_scope(self.scope.child())
    }

    /// Context bound to a new scope that is not cancelled with its parent.
    pub fn new_detached_cancellation_scope(&self) -> WorkflowContext {
        self.with_scope(self.scope.detached_child())
    }

    fn with_scope(&self, scope: CancellationScope) -> WorkflowContext {
        WorkflowContext {
            shared: self.shared.clone(),
            thread: self.thread.clone(),
            scope,
        }
    }

    pub fn cancellation_scope(&self) -> &CancellationScope {
        &self.scope
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.scope.is_cancel_requested()
    }

    /// Sleeps for `duration` of workflow time. A zero duration returns at once.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        if let Some(cause) = self.scope.cancellation_reason() {
            return Err(WorkflowError::Canceled(cause));
        }
        if duration.is_zero() {
            return Ok(());
        }
        let timer_id = self.shared.next_command_id().to_string();
        let promise = self
            .shared
            .sink()
            .submit(WorkflowCommand::StartTimer(StartTimerCommand {
                timer_id: timer_id.clone(),
                duration,
            }))?
            .into_promise()?;

        match promise.get_cancellable(self, &format!("sleep {:?}", duration)).await {
            Ok(_) => Ok(()),
            Err(WorkflowError::Canceled(cause)) if !promise.is_done() => {
                self.shared
                    .sink()
                    .submit(WorkflowCommand::CancelTimer(CancelTimerCommand { timer_id }))?;
                Err(WorkflowError::Canceled(cause))
            }
            Err(e) => Err(e),
        }
    }

    /// Ends the whole workflow instance with `value` as its result.
    ///
    /// Never returns: the runner destroys every thread, including the caller.
    pub async fn exit(&self, value: Vec<u8>) {
        self.thread.lock().exiting = true;
        self.shared.request_exit(value);
        futures::future::pending::<()>().await
    }

    pub fn new_promise<T>(&self) -> WorkflowPromise<T> {
        WorkflowPromise::new()
    }

    /// Schedules an activity and waits for its result.
    ///
    /// Cancelling the calling scope requests cancellation of the activity and
    /// returns [`WorkflowError::Canceled`] right away.
    pub async fn execute_activity(
        &self,
        activity_type: &str,
        args: Option<Vec<u8>>,
        options: ActivityOptions,
    ) -> Result<Vec<u8>, WorkflowError> {
        let activity_id = self.shared.next_command_id().to_string();
        let promise = self
            .shared
            .sink()
            .submit(WorkflowCommand::ScheduleActivity(ScheduleActivityCommand {
                activity_id: activity_id.clone(),
                activity_type: activity_type.to_string(),
                args,
                options,
            }))?
            .into_promise()?;

        match promise
            .get_cancellable(self, &format!("activity {}", activity_type))
            .await
        {
            Err(WorkflowError::Canceled(cause)) if !promise.is_done() => {
                self.shared
                    .sink()
                    .submit(WorkflowCommand::RequestCancelActivity(
                        RequestCancelActivityCommand { activity_id },
                    ))?;
                Err(WorkflowError::Canceled(cause))
            }
            other => other,
        }
    }

    /// Starts a child workflow and waits for its result.
    ///
    /// An empty `options.workflow_id` becomes `<run id>_<sequence>`.
    /// Cancelling the calling scope abandons the child: the parent stops
    /// waiting and the child keeps running.
    pub async fn execute_child_workflow(
        &self,
        workflow_type: &str,
        args: Option<Vec<u8>>,
        options: ChildWorkflowOptions,
    ) -> Result<Vec<u8>, WorkflowError> {
        if let Some(cause) = self.scope.cancellation_reason() {
            return Err(WorkflowError::Canceled(cause));
        }
        let command_id = self.shared.next_command_id();
        let workflow_id = if options.workflow_id.is_empty() {
            format!("{}_{}", self.workflow_info().workflow_execution.run_id, command_id)
        } else {
            options.workflow_id.clone()
        };
        debug!(workflow_id = %workflow_id, workflow_type, "starting child workflow");
        let promise = self
            .shared
            .sink()
            .submit(WorkflowCommand::StartChildWorkflow(StartChildWorkflowCommand {
                workflow_id,
                workflow_type: workflow_type.to_string(),
                args,
                options,
            }))?
            .into_promise()?;
        promise
            .get_cancellable(self, &format!("child workflow {}", workflow_type))
            .await
    }

    /// Version of `change_id` this run follows.
    ///
    /// A new run records `max_supported`. A run that passed this point before
    /// the change existed has no marker and gets [`DEFAULT_VERSION`]. The
    /// first answer for a change id is kept for the rest of the run.
    pub fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32, WorkflowError> {
        let version = match self.shared.version(change_id) {
            Some(version) => version,
            None => {
                let sink = self.shared.sink();
                let version = match sink.recorded_version(change_id)? {
                    Some(recorded) => Some(recorded),
                    None if sink.is_replaying() => None,
                    None => Some(max_supported),
                };
                if let Some(version) = version {
                    let details = encode_version_details(change_id, version)
                        .map_err(|e| WorkflowError::Internal(e.to_string()))?;
                    sink.submit(WorkflowCommand::RecordMarker(RecordMarkerCommand {
                        marker_name: VERSION_MARKER_NAME.to_string(),
                        details,
                    }))?;
                }
                let version = version.unwrap_or(DEFAULT_VERSION);
                self.shared.set_version(change_id, version);
                version
            }
        };
        if version < min_supported || version > max_supported {
            return Err(WorkflowError::UnsupportedVersion {
                change_id: change_id.to_string(),
                version,
                min_supported,
                max_supported,
            });
        }
        Ok(version)
    }

    /// Runs `f` once and records its result; replays return the recorded value.
    pub fn side_effect<T, F>(&self, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let side_effect_id = self.shared.next_side_effect_id();
        let sink = self.shared.sink();
        let encoded = match sink.recorded_side_effect(side_effect_id)? {
            Some(recorded) => recorded,
            None => serde_json::to_vec(&f())?,
        };
        let details = encode_side_effect_details(side_effect_id, &encoded)
            .map_err(|e| WorkflowError::Internal(e.to_string()))?;
        sink.submit(WorkflowCommand::RecordMarker(RecordMarkerCommand {
            marker_name: SIDE_EFFECT_MARKER_NAME.to_string(),
            details,
        }))?;
        Ok(serde_json::from_slice(&encoded)?)
    }

    pub fn signal_channel(&self, name: impl Into<String>) -> SignalChannel {
        SignalChannel::new(name.into(), self.shared.clone())
    }

    /// Registers a read-only handler answering queries of `query_type`.
    pub fn register_query<F>(&self, query_type: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, WorkflowError> + Send + Sync + 'static,
    {
        self.shared.register_query(query_type.into(), Arc::new(handler));
    }

    /// Calls `f` until it succeeds or `policy` gives up, sleeping the policy's
    /// backoff between attempts.
    pub async fn retry<F, Fut, T>(&self, policy: &RetryPolicy, mut f: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        policy.validate().map_err(WorkflowError::Generic)?;
        let start = self.current_time_millis();
        let mut attempt = 1;
        loop {
            let error = match f().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if error.is_canceled() || error.is_destroyed() || policy.is_non_retryable(&error.reason()) {
                return Err(error);
            }
            let backoff = policy.backoff_for_attempt(attempt);
            let elapsed = Duration::from_millis((self.current_time_millis() - start).max(0) as u64);
            if !policy.should_retry(attempt, elapsed, backoff) {
                return Err(error);
            }
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %error, "retrying after failure");
            self.sleep(backoff).await?;
            attempt += 1;
        }
    }

    pub fn thread_snapshots(&self) -> Vec<ThreadSnapshot> {
        self.shared.snapshots()
    }

    pub fn stack_trace(&self) -> String {
        self.shared.stack_trace()
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("thread", &self.thread_name())
            .field("scope", &self.scope)
            .finish()
    }
}

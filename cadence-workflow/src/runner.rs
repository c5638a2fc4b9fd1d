//! Deterministic cooperative runner.
//!
//! The runner owns every logical thread of one workflow instance and polls
//! them in creation order with a no-op waker until a full pass makes no
//! progress. A pass makes progress when some thread runs for the first time,
//! passes a suspension point, or terminates, or when a timer fires. Given the
//! same inputs the interleaving is always the same, which is what makes replay
//! possible.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Context;

use cadence_core::{WorkflowExecution, WorkflowInfo, WorkflowType};
use futures::task::noop_waker;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationScope;
use crate::clock::{Clock, SystemClock};
use crate::commands::{CommandSink, LocalCommandSink};
use crate::context::WorkflowContext;
use crate::future::WorkflowError;
use crate::thread::{DestroyOutcome, LogicalThread, SharedThreadState, ThreadSnapshot, WorkflowThread};
use crate::timers::WorkflowTimers;

/// Name of the query answered by every runner with its thread dump.
pub const STACK_TRACE_QUERY_NAME: &str = "__stack_trace";

pub type QueryHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, WorkflowError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// Not run yet, or a pass is in progress
    Running,
    AllBlocked,
    Done,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunnerError {
    /// The root thread finished with a non-cancellation error.
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowError),
    #[error("threads swallowed their destruction: {threads:?}")]
    DestroySwallowed { threads: Vec<String> },
    #[error("runner is closed")]
    Closed,
    #[error("unknown query type {0}")]
    UnknownQuery(String),
    #[error("query {query_type} failed: {source}")]
    QueryFailed {
        query_type: String,
        source: WorkflowError,
    },
}

/// State shared between the runner and the contexts of its threads.
pub struct RunnerShared {
    info: WorkflowInfo,
    clock: Arc<dyn Clock>,
    timers: Arc<Mutex<WorkflowTimers>>,
    sink: Arc<dyn CommandSink>,
    root_scope: CancellationScope,
    pending_threads: Mutex<Vec<LogicalThread>>,
    threads: Mutex<Vec<SharedThreadState>>,
    next_thread_id: AtomicU64,
    next_command_id: AtomicU64,
    next_side_effect_id: AtomicU64,
    progress: AtomicBool,
    destroy_requested: AtomicBool,
    exit_value: Mutex<Option<Vec<u8>>>,
    signals: Mutex<HashMap<String, VecDeque<Option<Vec<u8>>>>>,
    query_handlers: Mutex<HashMap<String, QueryHandler>>,
    versions: Mutex<HashMap<String, i32>>,
}

impl RunnerShared {
    pub(crate) fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn timers(&self) -> &Arc<Mutex<WorkflowTimers>> {
        &self.timers
    }

    pub(crate) fn sink(&self) -> &Arc<dyn CommandSink> {
        &self.sink
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sequence number used to derive activity and timer ids.
    pub(crate) fn next_command_id(&self) -> u64 {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_side_effect_id(&self) -> u64 {
        self.next_side_effect_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Version already chosen for `change_id` by this run.
    pub(crate) fn version(&self, change_id: &str) -> Option<i32> {
        self.versions.lock().get(change_id).copied()
    }

    pub(crate) fn set_version(&self, change_id: &str, version: i32) {
        self.versions.lock().insert(change_id.to_string(), version);
    }

    pub(crate) fn mark_progress(&self) {
        self.progress.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_destroy_requested(&self) -> bool {
        self.destroy_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn is_exit_requested(&self) -> bool {
        self.exit_value.lock().is_some()
    }

    pub(crate) fn request_exit(&self, value: Vec<u8>) {
        let mut exit = self.exit_value.lock();
        if exit.is_none() {
            *exit = Some(value);
        }
    }

    pub(crate) fn register_thread(&self, thread: LogicalThread) {
        self.threads.lock().push(thread.state().clone());
        self.pending_threads.lock().push(thread);
    }

    pub(crate) fn take_signal(&self, name: &str) -> Option<Option<Vec<u8>>> {
        self.signals.lock().get_mut(name).and_then(VecDeque::pop_front)
    }

    pub(crate) fn has_signal(&self, name: &str) -> bool {
        self.signals
            .lock()
            .get(name)
            .is_some_and(|queue| !queue.is_empty())
    }

    pub(crate) fn register_query(&self, query_type: String, handler: QueryHandler) {
        self.query_handlers.lock().insert(query_type, handler);
    }

    pub(crate) fn snapshots(&self) -> Vec<ThreadSnapshot> {
        self.threads.lock().iter().map(|t| t.lock().snapshot()).collect()
    }

    pub(crate) fn stack_trace(&self) -> String {
        self.snapshots()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| match t.blocked_reason {
                Some(reason) => format!("{} ({}): {:?} on {}", t.name, t.id, t.status, reason),
                None => format!("{} ({}): {:?}", t.name, t.id, t.status),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for RunnerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerShared")
            .field("workflow", &self.info.workflow_execution)
            .field("destroy_requested", &self.is_destroy_requested())
            .field("exit_requested", &self.is_exit_requested())
            .finish()
    }
}

/// Delivers signals to a runner from outside workflow code.
#[derive(Debug, Clone)]
pub struct SignalSender {
    shared: Arc<RunnerShared>,
}

impl SignalSender {
    pub fn signal(&self, name: impl Into<String>, input: Option<Vec<u8>>) {
        self.shared
            .signals
            .lock()
            .entry(name.into())
            .or_default()
            .push_back(input);
    }
}

#[derive(Default)]
pub struct RunnerBuilder {
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn CommandSink>>,
    info: Option<WorkflowInfo>,
}

impl RunnerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Routes commands somewhere other than the runner's own timer set.
    pub fn command_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn workflow_info(mut self, info: WorkflowInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn build<F, Fut>(self, root: F) -> DeterministicRunner
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, WorkflowError>> + Send + 'static,
    {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let timers = Arc::new(Mutex::new(WorkflowTimers::new()));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LocalCommandSink::new(timers.clone(), clock.clone())));
        let info = self.info.unwrap_or_else(|| {
            WorkflowInfo::new(
                "default",
                WorkflowExecution::new("standalone", "standalone"),
                WorkflowType::new("standalone"),
            )
        });
        let shared = Arc::new(RunnerShared {
            info,
            clock,
            timers,
            sink,
            root_scope: CancellationScope::root(),
            pending_threads: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(0),
            next_command_id: AtomicU64::new(1),
            next_side_effect_id: AtomicU64::new(1),
            progress: AtomicBool::new(false),
            destroy_requested: AtomicBool::new(false),
            exit_value: Mutex::new(None),
            signals: Mutex::new(HashMap::new()),
            query_handlers: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
        });

        let (thread, handle) = LogicalThread::new(
            shared.clone(),
            "workflow-root".to_string(),
            shared.root_scope.clone(),
            root,
        );
        shared.register_thread(thread);

        DeterministicRunner {
            shared,
            threads: Vec::new(),
            root: handle,
            status: RunnerStatus::Running,
        }
    }
}

pub struct DeterministicRunner {
    shared: Arc<RunnerShared>,
    threads: Vec<LogicalThread>,
    root: WorkflowThread<Vec<u8>>,
    status: RunnerStatus,
}

impl DeterministicRunner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    /// Standalone runner whose timers are driven by `clock`.
    pub fn new<F, Fut>(clock: Arc<dyn Clock>, root: F) -> Self
    where
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, WorkflowError>> + Send + 'static,
    {
        Self::builder().clock(clock).build(root)
    }

    /// Runs threads until every live thread is blocked, the root thread has
    /// finished or some thread requested exit.
    ///
    /// A root thread that fails with anything other than cancellation is
    /// reported as [`RunnerError::WorkflowFailed`] after the runner closed.
    pub fn run_until_all_blocked(&mut self) -> Result<(), RunnerError> {
        if self.status == RunnerStatus::Done {
            return Err(RunnerError::Closed);
        }
        self.status = RunnerStatus::Running;
        self.root.start();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            self.merge_pending_threads();
            let now = self.shared.clock.current_time_millis();
            let fired = self.shared.timers.lock().fire_timers(now);
            self.shared.progress.store(fired, Ordering::SeqCst);

            for thread in self.threads.iter_mut() {
                if !thread.is_pollable() {
                    continue;
                }
                thread.poll(&mut cx, &self.shared);
                if self.shared.is_exit_requested() {
                    break;
                }
            }

            if self.shared.is_exit_requested() || !self.shared.progress.load(Ordering::SeqCst) {
                break;
            }
        }

        if self.shared.is_exit_requested() {
            info!(workflow = %self.shared.info.workflow_execution, "workflow exit requested");
            return self.close_threads();
        }
        if self.root.is_done() {
            let closed = self.close_threads();
            if let Some(Err(e)) = self.root_result() {
                if !e.is_canceled() || !self.is_cancel_requested() {
                    info!(workflow = %self.shared.info.workflow_execution, error = %e, "workflow root thread failed");
                    return Err(RunnerError::WorkflowFailed(e));
                }
            }
            return closed;
        }
        self.status = RunnerStatus::AllBlocked;
        debug!(threads = self.threads.len(), "all workflow threads blocked");
        Ok(())
    }

    /// Requests cancellation of the root scope.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.shared.root_scope.cancel(reason);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.root_scope.is_cancel_requested()
    }

    /// Destroys every remaining thread.
    ///
    /// Each blocked thread is resumed once so that its pending await reports
    /// [`WorkflowError::Destroyed`]; a thread that returns anything else is
    /// reported in [`RunnerError::DestroySwallowed`]. The runner is done
    /// afterwards either way.
    pub fn close(&mut self) -> Result<(), RunnerError> {
        if self.status == RunnerStatus::Done {
            return Ok(());
        }
        self.close_threads()
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status == RunnerStatus::Done
    }

    /// Earliest pending timer of the runner's own timer set.
    pub fn next_wake_up_time(&self) -> Option<i64> {
        self.shared.timers.lock().next_fire_time()
    }

    pub fn current_time_millis(&self) -> i64 {
        self.shared.clock.current_time_millis()
    }

    /// Value passed to [`WorkflowContext::exit`], if any thread called it.
    pub fn exit_value(&self) -> Option<Vec<u8>> {
        self.shared.exit_value.lock().clone()
    }

    /// Outcome of the root thread once it has finished.
    pub fn root_result(&self) -> Option<Result<Vec<u8>, WorkflowError>> {
        if !self.root.is_done() {
            return None;
        }
        Some(self.root.peek_result())
    }

    pub fn signal(&self, name: impl Into<String>, input: Option<Vec<u8>>) {
        self.signal_sender().signal(name, input);
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            shared: self.shared.clone(),
        }
    }

    /// Answers a query against the current state of the instance.
    pub fn query(&self, query_type: &str, args: &[u8]) -> Result<Vec<u8>, RunnerError> {
        if query_type == STACK_TRACE_QUERY_NAME {
            return Ok(self.shared.stack_trace().into_bytes());
        }
        let handler = self
            .shared
            .query_handlers
            .lock()
            .get(query_type)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownQuery(query_type.to_string()))?;
        handler(args).map_err(|source| RunnerError::QueryFailed {
            query_type: query_type.to_string(),
            source,
        })
    }

    pub fn thread_snapshots(&self) -> Vec<ThreadSnapshot> {
        self.shared.snapshots()
    }

    pub fn stack_trace(&self) -> String {
        self.shared.stack_trace()
    }

    fn merge_pending_threads(&mut self) {
        let mut pending = self.shared.pending_threads.lock();
        if !pending.is_empty() {
            self.threads.append(&mut pending);
        }
    }

    fn close_threads(&mut self) -> Result<(), RunnerError> {
        self.merge_pending_threads();
        self.shared.destroy_requested.store(true, Ordering::SeqCst);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut swallowed = Vec::new();
        for thread in self.threads.iter_mut() {
            if thread.destroy(&mut cx) == DestroyOutcome::Swallowed {
                swallowed.push(thread.state().lock().name.clone());
            }
        }
        // threads created during teardown never run
        self.shared.pending_threads.lock().clear();
        self.threads.clear();
        self.status = RunnerStatus::Done;

        if swallowed.is_empty() {
            Ok(())
        } else {
            warn!(threads = ?swallowed, "workflow threads did not unwind on destruction");
            Err(RunnerError::DestroySwallowed { threads: swallowed })
        }
    }
}

impl Drop for DeterministicRunner {
    fn drop(&mut self) {
        if self.status != RunnerStatus::Done {
            if let Err(e) = self.close_threads() {
                debug!(error = %e, "runner closed on drop");
            }
        }
    }
}

impl fmt::Debug for DeterministicRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicRunner")
            .field("status", &self.status)
            .field("threads", &self.threads.len())
            .field("shared", &self.shared)
            .finish()
    }
}

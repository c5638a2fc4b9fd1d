use std::sync::Arc;

use cadence_core::{
    CadenceError, Decision, History, NonDeterministicWorkflowPolicy, TaskList,
};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::executor::{CacheError, DeciderError, DecisionResult, DeciderCache, ReplayDecider};
use crate::options::WorkerOptions;
use crate::registry::Registry;
use crate::service::{
    DecisionTask, DecisionTaskFailedCause, PollForDecisionTaskRequest,
    RespondDecisionTaskCompletedRequest, RespondDecisionTaskFailedRequest, WorkflowQuery,
    WorkflowQueryResult, WorkflowService,
};

/// Failure reason of workflows failed by the non-deterministic workflow policy
pub const NON_DETERMINISTIC_FAILURE_REASON: &str = "NonDeterministicWorkflowPolicyFailWorkflow";

enum Attempt {
    Done(Result<DecisionResult, CadenceError>),
    NeedsFullHistory,
}

/// Decision task handler
pub struct DecisionTaskHandler {
    domain: String,
    service: Arc<dyn WorkflowService>,
    registry: Arc<dyn Registry>,
    cache: Arc<DeciderCache>,
    options: WorkerOptions,
}

impl DecisionTaskHandler {
    pub fn new(
        domain: impl Into<String>,
        service: Arc<dyn WorkflowService>,
        registry: Arc<dyn Registry>,
        options: WorkerOptions,
    ) -> Self {
        let cache = Arc::new(DeciderCache::new(options.sticky_cache_size));
        Self {
            domain: domain.into(),
            service,
            registry,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<DeciderCache> {
        &self.cache
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Task list the service should route this worker's sticky runs to.
    pub fn sticky_task_list(&self) -> Option<TaskList> {
        if self.options.disable_sticky_execution {
            return None;
        }
        Some(TaskList::sticky(format!("{}:sticky", self.options.identity)))
    }

    /// Polls `task_list` once and handles the task if one was available.
    pub async fn poll_and_handle(&self, task_list: &str) -> Result<bool, CadenceError> {
        let task = self
            .service
            .poll_for_decision_task(PollForDecisionTaskRequest {
                domain: self.domain.clone(),
                task_list: TaskList::new(task_list),
                identity: self.options.identity.clone(),
            })
            .await?;
        match task {
            Some(task) => {
                self.handle(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn handle(&self, task: DecisionTask) -> Result<(), CadenceError> {
        if task.task_token.is_empty() {
            return Err(CadenceError::Other("Empty task token received".into()));
        }
        if let Some(query) = task.query.clone() {
            return self.handle_query(&task, &query).await;
        }

        let result = std::panic::AssertUnwindSafe(self.process(&task))
            .catch_unwind()
            .await;
        let execution_result = match result {
            Ok(res) => res,
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "Unknown panic".to_string()
                };
                error!(panic_msg = %panic_msg, "decision task panicked");
                self.cache.invalidate(task.run_id());
                Err(CadenceError::Other(format!("Decider panic: {}", panic_msg)))
            }
        };

        match execution_result {
            Ok(result) => {
                info!(
                    workflow_id = %task.workflow_execution.workflow_id,
                    decision_count = result.decisions.len(),
                    "responding with decisions"
                );
                self.respond_completed(&task, result.decisions, None).await
            }
            Err(CadenceError::NonDeterministic(e))
                if self.options.non_deterministic_workflow_policy
                    == NonDeterministicWorkflowPolicy::FailWorkflow =>
            {
                warn!(error = %e, "failing non-deterministic workflow");
                let decision = Decision::fail_workflow_execution(
                    NON_DETERMINISTIC_FAILURE_REASON,
                    Some(e.to_string().into_bytes()),
                );
                self.respond_completed(&task, vec![decision], None).await
            }
            Err(e) => {
                error!(
                    workflow_id = %task.workflow_execution.workflow_id,
                    error = %e,
                    "decision task failed"
                );
                let response = self
                    .service
                    .respond_decision_task_failed(RespondDecisionTaskFailedRequest {
                        task_token: task.task_token.clone(),
                        cause: DecisionTaskFailedCause::WorkflowWorkerUnhandledFailure,
                        details: Some(format!("Workflow execution failed: {}", e).into_bytes()),
                        identity: self.options.identity.clone(),
                    })
                    .await;
                if let Err(respond_error) = response {
                    error!(error = %respond_error, "failed to respond decision task failed");
                }
                Err(e)
            }
        }
    }

    async fn process(&self, task: &DecisionTask) -> Result<DecisionResult, CadenceError> {
        if self.options.disable_sticky_execution {
            let full = self.with_full_history(task).await?;
            let mut decider = self.new_decider(&full)?;
            return Ok(decider.process_decision_task(&full)?);
        }
        match self.decide_cached(task) {
            Attempt::Done(result) => result,
            Attempt::NeedsFullHistory => {
                debug!(run_id = %task.run_id(), "falling back to full history");
                let full = self.with_full_history(task).await?;
                match self.decide_cached(&full) {
                    Attempt::Done(result) => result,
                    Attempt::NeedsFullHistory => Err(CadenceError::Other(format!(
                        "run {} cannot be replayed from full history",
                        task.run_id()
                    ))),
                }
            }
        }
    }

    fn decide_cached(&self, task: &DecisionTask) -> Attempt {
        let run_id = task.run_id();
        let decider = match self.cache.get_or_create(task, || self.new_decider(task)) {
            Ok(decider) => decider,
            Err(CacheError::CacheMiss { .. }) => return Attempt::NeedsFullHistory,
            Err(CacheError::Decider(e)) => return Attempt::Done(Err(e.into())),
            Err(e) => return Attempt::Done(Err(CadenceError::InvalidArgument(e.to_string()))),
        };

        let result = decider.lock().process_decision_task(task);
        if matches!(&result, Ok(r) if !r.is_workflow_closed()) {
            // still pinned, so a concurrent eviction cannot close it first
            self.cache.add_to_cache(task, decider);
        }
        self.cache.mark_processing_done(run_id);
        match result {
            Ok(result) => {
                if result.is_workflow_closed() {
                    self.cache.invalidate(run_id);
                }
                Attempt::Done(Ok(result))
            }
            Err(DeciderError::RoundDiscarded { started_event_id }) if !task.history.is_full() => {
                debug!(run_id = %run_id, started_event_id, "cached round was discarded");
                self.cache.invalidate(run_id);
                Attempt::NeedsFullHistory
            }
            Err(e) => {
                self.cache.invalidate(run_id);
                Attempt::Done(Err(e.into()))
            }
        }
    }

    async fn handle_query(
        &self,
        task: &DecisionTask,
        query: &WorkflowQuery,
    ) -> Result<(), CadenceError> {
        let full = self.with_full_history(task).await?;
        let args = query.query_args.clone().unwrap_or_default();
        let answer = self
            .new_decider(&full)
            .and_then(|mut decider| decider.query(&full, &query.query_type, &args));
        let query_result = match answer {
            Ok(answer) => WorkflowQueryResult::answered(answer),
            Err(e) => {
                warn!(query_type = %query.query_type, error = %e, "query failed");
                WorkflowQueryResult::failed(e.to_string())
            }
        };
        self.respond_completed(task, Vec::new(), Some(query_result))
            .await
    }

    fn new_decider(&self, task: &DecisionTask) -> Result<ReplayDecider, DeciderError> {
        let workflow = self
            .registry
            .get_workflow(&task.workflow_type.name)
            .ok_or_else(|| DeciderError::UnknownWorkflowType(task.workflow_type.name.clone()))?;
        Ok(ReplayDecider::new(
            task.domain.clone(),
            task.workflow_execution.clone(),
            task.workflow_type.clone(),
            workflow,
        ))
    }

    /// The task with its history replaced by the run's full history up to
    /// the task's started event.
    async fn with_full_history(&self, task: &DecisionTask) -> Result<DecisionTask, CadenceError> {
        if task.history.is_full() {
            return Ok(task.clone());
        }
        let mut history = self
            .service
            .get_workflow_execution_history(&task.domain, &task.workflow_execution)
            .await?;
        if task.started_event_id > 0 {
            history.events.retain(|e| e.event_id <= task.started_event_id);
        }
        Ok(DecisionTask {
            history: History::new(history.events),
            ..task.clone()
        })
    }

    async fn respond_completed(
        &self,
        task: &DecisionTask,
        decisions: Vec<Decision>,
        query_result: Option<WorkflowQueryResult>,
    ) -> Result<(), CadenceError> {
        let response = self
            .service
            .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
                task_token: task.task_token.clone(),
                decisions,
                identity: self.options.identity.clone(),
                query_result,
                sticky_task_list: self.sticky_task_list(),
            })
            .await;
        match &response {
            Ok(_) => debug!("successfully responded to decision task"),
            Err(e) => error!(error = %e, "failed to respond to decision task"),
        }
        response
    }
}

impl std::fmt::Debug for DecisionTaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionTaskHandler")
            .field("domain", &self.domain)
            .field("cache", &self.cache)
            .field("options", &self.options)
            .finish()
    }
}

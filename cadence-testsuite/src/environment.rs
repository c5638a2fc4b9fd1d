//! Test workflow environment.
//!
//! Wires a [`TestWorkflowService`], a workflow registry and a decision task
//! handler together so a test can start a workflow and drive its decision
//! rounds to quiescence.

use std::sync::Arc;

use cadence_core::{CadenceError, WorkflowExecution};
use cadence_worker::{
    DecisionTaskHandler, Registry, Workflow, WorkerOptions, WorkflowRegistry, WorkflowService,
};
use tracing::debug;

use crate::service::{StartWorkflowRequest, TestWorkflowService, DEFAULT_DOMAIN};

pub const DEFAULT_TASK_LIST: &str = "test-task-list";

/// Rounds a single drive may take before it is treated as a livelock
const MAX_ROUNDS: usize = 1000;

pub struct TestWorkflowEnvironment {
    service: Arc<TestWorkflowService>,
    registry: Arc<WorkflowRegistry>,
    worker: DecisionTaskHandler,
    task_list: String,
}

impl TestWorkflowEnvironment {
    pub fn new() -> Self {
        Self::with_options(WorkerOptions::default().with_identity("test-worker"))
    }

    pub fn with_options(options: WorkerOptions) -> Self {
        let service = Arc::new(TestWorkflowService::new());
        let registry = Arc::new(WorkflowRegistry::new());
        let worker = DecisionTaskHandler::new(
            DEFAULT_DOMAIN,
            service.clone(),
            registry.clone(),
            options,
        );
        Self {
            service,
            registry,
            worker,
            task_list: DEFAULT_TASK_LIST.to_string(),
        }
    }

    pub fn register_workflow(&self, name: &str, workflow: impl Workflow + 'static) {
        self.registry.register_workflow(name, Box::new(workflow));
    }

    pub fn service(&self) -> &Arc<TestWorkflowService> {
        &self.service
    }

    pub fn worker(&self) -> &DecisionTaskHandler {
        &self.worker
    }

    pub fn task_list(&self) -> &str {
        &self.task_list
    }

    /// A second worker polling the same service and registry, as another
    /// process hosting the same workflows would.
    pub fn new_worker(&self, options: WorkerOptions) -> DecisionTaskHandler {
        DecisionTaskHandler::new(
            DEFAULT_DOMAIN,
            self.service.clone() as Arc<dyn WorkflowService>,
            self.registry.clone() as Arc<dyn Registry>,
            options,
        )
    }

    pub fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        input: Option<&[u8]>,
    ) -> Result<WorkflowExecution, CadenceError> {
        let mut request = StartWorkflowRequest::new(workflow_id, workflow_type, &self.task_list);
        if let Some(input) = input {
            request = request.with_input(input);
        }
        Ok(self.service.start_workflow(request)?)
    }

    /// Handles decision tasks with `worker` until none is left; returns how
    /// many were handled.
    pub async fn drive(&self, worker: &DecisionTaskHandler) -> Result<usize, CadenceError> {
        let mut rounds = 0;
        while worker.poll_and_handle(&self.task_list).await? {
            rounds += 1;
            if rounds >= MAX_ROUNDS {
                return Err(CadenceError::Other(format!(
                    "no quiescence after {} decision tasks",
                    rounds
                )));
            }
        }
        debug!(rounds, "decision tasks drained");
        Ok(rounds)
    }

    /// [`drive`](Self::drive) with the environment's own worker.
    pub async fn run_decision_tasks(&self) -> Result<usize, CadenceError> {
        self.drive(&self.worker).await
    }
}

impl Default for TestWorkflowEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestWorkflowEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorkflowEnvironment")
            .field("service", &self.service)
            .field("registry", &self.registry)
            .field("task_list", &self.task_list)
            .finish()
    }
}

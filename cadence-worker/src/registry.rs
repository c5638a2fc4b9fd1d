//! Workflow registry.
//!
//! Maps workflow type names to cloneable workflow implementations.

use std::future::Future;
use std::sync::Arc;

use cadence_workflow::{WorkflowContext, WorkflowError, WorkflowFuture};
use dashmap::DashMap;
use dyn_clone::DynClone;

/// Workflow trait
pub trait Workflow: Send + Sync + DynClone {
    fn execute(&self, ctx: WorkflowContext, input: Option<Vec<u8>>) -> WorkflowFuture;
}

dyn_clone::clone_trait_object!(Workflow);

impl<F, Fut> Workflow for F
where
    F: Fn(WorkflowContext, Option<Vec<u8>>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, WorkflowError>> + Send + 'static,
{
    fn execute(&self, ctx: WorkflowContext, input: Option<Vec<u8>>) -> WorkflowFuture {
        Box::pin(self(ctx, input))
    }
}

/// Registry trait
pub trait Registry: Send + Sync {
    fn register_workflow(&self, name: &str, workflow: Box<dyn Workflow>);

    fn get_registered_workflows(&self) -> Vec<String>;

    fn get_workflow(&self, name: &str) -> Option<Box<dyn Workflow>>;
}

/// Workflow registry implementation using DashMap for concurrent access
pub struct WorkflowRegistry {
    workflows: Arc<DashMap<String, Box<dyn Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(DashMap::new()),
        }
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WorkflowRegistry {
    fn clone(&self) -> Self {
        Self {
            workflows: Arc::clone(&self.workflows),
        }
    }
}

impl Registry for WorkflowRegistry {
    fn register_workflow(&self, name: &str, workflow: Box<dyn Workflow>) {
        self.workflows.insert(name.to_string(), workflow);
    }

    fn get_registered_workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn get_workflow(&self, name: &str) -> Option<Box<dyn Workflow>> {
        self.workflows.get(name).map(|entry| entry.clone())
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.get_registered_workflows())
            .finish()
    }
}

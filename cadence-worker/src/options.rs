//! Worker options.

use cadence_core::{NonDeterministicWorkflowPolicy, WorkerIdentity};

/// Worker options for configuration
#[derive(Clone)]
pub struct WorkerOptions {
    /// Identity reported to the service with every poll and response
    pub identity: String,
    /// Maximum number of workflow runs kept warm for sticky continuation
    pub sticky_cache_size: usize,
    /// Disable sticky execution; every decision task then replays full history
    pub disable_sticky_execution: bool,
    /// What to do with a run whose replay diverges from its history
    pub non_deterministic_workflow_policy: NonDeterministicWorkflowPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            identity: WorkerIdentity::default().name,
            sticky_cache_size: 600,
            disable_sticky_execution: false,
            non_deterministic_workflow_policy: NonDeterministicWorkflowPolicy::BlockWorkflow,
        }
    }
}

impl WorkerOptions {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_sticky_cache_size(mut self, size: usize) -> Self {
        self.sticky_cache_size = size;
        self
    }

    pub fn with_non_deterministic_workflow_policy(
        mut self,
        policy: NonDeterministicWorkflowPolicy,
    ) -> Self {
        self.non_deterministic_workflow_policy = policy;
        self
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("identity", &self.identity)
            .field("sticky_cache_size", &self.sticky_cache_size)
            .field("disable_sticky_execution", &self.disable_sticky_execution)
            .field(
                "non_deterministic_workflow_policy",
                &self.non_deterministic_workflow_policy,
            )
            .finish()
    }
}

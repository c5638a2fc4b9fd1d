//! Workflow execution on the worker side.
//!
//! History batching, the replay decider that drives a workflow runner from
//! history, and the cache keeping deciders warm between decision tasks.

pub mod cache;
pub mod decider;
pub mod decisions;
pub mod history;

pub use cache::{CacheError, CacheStats, DeciderCache, SharedDecider};
pub use decider::{DeciderError, DecisionResult, ReplayDecider};
pub use decisions::{DecisionsHelper, ReplayCommandSink};
pub use history::{split_previous_round, DecisionEvents, DecisionEventsIterator};

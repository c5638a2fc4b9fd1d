//! Cadence worker implementation.
//!
//! This crate hosts workflow implementations: it replays decision task
//! history through a deterministic runner, keeps warm deciders in a sticky
//! cache and answers decision tasks through the workflow service.

pub mod executor;
pub mod handlers;
pub mod options;
pub mod registry;
pub mod service;

pub use executor::{
    CacheError, CacheStats, DeciderCache, DeciderError, DecisionResult, ReplayDecider,
};
pub use handlers::*;
pub use options::*;
pub use registry::*;
pub use service::*;

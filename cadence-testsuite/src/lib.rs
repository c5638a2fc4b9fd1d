//! Testing utilities for deterministic workflows.
//!
//! [`TestWorkflowService`] is an in-memory service driving the entity state
//! machines; [`TestWorkflowEnvironment`] pairs it with a decision task
//! handler so workflows can be run end to end without a server.

pub mod environment;
pub mod logging;
pub mod service;

pub use environment::*;
pub use logging::init_test_tracing;
pub use service::*;

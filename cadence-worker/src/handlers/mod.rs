//! Task handlers for processing decision tasks.
//!
//! This module provides the handler that processes decision tasks polled
//! from the workflow service.

pub mod decision;

pub use decision::{DecisionTaskHandler, NON_DETERMINISTIC_FAILURE_REASON};

//! Core types for the Cadence deterministic workflow runtime.
//!
//! This crate provides the history and decision model, the identifiers and
//! options shared between the runtime and the worker, and the common error
//! types.

pub mod decision;
pub mod error;
pub mod history;
pub mod types;

pub use decision::*;
pub use error::*;
pub use history::*;
pub use types::*;

//! Deterministic execution runtime for Cadence workflows.
//!
//! Workflow code runs as cooperative logical threads inside a
//! [`DeterministicRunner`]. It reaches the runtime only through the
//! [`WorkflowContext`] handed to every thread body: awaiting conditions,
//! sleeping, spawning threads, cancellation scopes, promises, signals,
//! queries, side effects, activities and retries.
//!
//! The [`state_machine`] module holds the per-entity lifecycle tables
//! (workflow, decision task, activity task, timer) used to build and check
//! history.

pub mod cancellation;
pub mod channel;
pub mod clock;
pub mod commands;
pub mod context;
pub mod future;
pub mod runner;
pub mod side_effect_serialization;
pub mod state_machine;
pub mod thread;
pub mod timers;

pub use cancellation::CancellationScope;
pub use channel::{SignalChannel, WorkflowPromise};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use commands::*;
pub use context::WorkflowContext;
pub use future::*;
pub use runner::{
    DeterministicRunner, QueryHandler, RunnerBuilder, RunnerError, RunnerStatus, SignalSender,
    STACK_TRACE_QUERY_NAME,
};
pub use side_effect_serialization::*;
pub use thread::{ThreadId, ThreadSnapshot, ThreadStatus, WorkflowThread};
pub use timers::{TimerCallback, TimerError, TimerHandle, WorkflowTimers};

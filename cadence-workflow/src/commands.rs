//! Commands workflow code hands to its environment.
//!
//! The context never talks to a service. Everything with an external effect
//! is submitted as a [`WorkflowCommand`] to a [`CommandSink`]. A standalone
//! runner uses [`LocalCommandSink`], which serves timers from the runner's own
//! timer set; a replay decider turns commands into decisions.
//!
//! Recorded values a replay must reproduce (side effects, versions) are read
//! back through the sink as well.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{ActivityOptions, ChildWorkflowOptions};
use parking_lot::Mutex;
use tracing::trace;

use crate::channel::WorkflowPromise;
use crate::clock::Clock;
use crate::future::WorkflowError;
use crate::timers::{TimerHandle, WorkflowTimers};

#[derive(Debug)]
pub enum WorkflowCommand {
    ScheduleActivity(ScheduleActivityCommand),
    RequestCancelActivity(RequestCancelActivityCommand),
    StartTimer(StartTimerCommand),
    CancelTimer(CancelTimerCommand),
    RecordMarker(RecordMarkerCommand),
    StartChildWorkflow(StartChildWorkflowCommand),
}

#[derive(Debug)]
pub struct ScheduleActivityCommand {
    pub activity_id: String,
    pub activity_type: String,
    pub args: Option<Vec<u8>>,
    pub options: ActivityOptions,
}

#[derive(Debug)]
pub struct RequestCancelActivityCommand {
    pub activity_id: String,
}

#[derive(Debug)]
pub struct StartTimerCommand {
    pub timer_id: String,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct CancelTimerCommand {
    pub timer_id: String,
}

#[derive(Debug)]
pub struct StartChildWorkflowCommand {
    pub workflow_id: String,
    pub workflow_type: String,
    pub args: Option<Vec<u8>>,
    pub options: ChildWorkflowOptions,
}

#[derive(Debug)]
pub struct RecordMarkerCommand {
    pub marker_name: String,
    pub details: Vec<u8>,
}

/// What a sink hands back for a submitted command.
#[derive(Debug)]
pub enum CommandResult {
    /// Completes when the command's outcome is known
    Pending(WorkflowPromise<Vec<u8>>),
    /// Nothing to wait for
    Accepted,
}

impl CommandResult {
    pub fn into_promise(self) -> Result<WorkflowPromise<Vec<u8>>, WorkflowError> {
        match self {
            CommandResult::Pending(promise) => Ok(promise),
            CommandResult::Accepted => Err(WorkflowError::Internal(
                "command sink returned no result to wait for".to_string(),
            )),
        }
    }
}

/// Receives commands submitted by workflow code.
pub trait CommandSink: Send + Sync {
    fn submit(&self, command: WorkflowCommand) -> Result<CommandResult, WorkflowError>;

    /// True while re-executing already recorded history.
    fn is_replaying(&self) -> bool {
        false
    }

    /// Value recorded for side effect `side_effect_id` in history, if replaying.
    fn recorded_side_effect(&self, _side_effect_id: u64) -> Result<Option<Vec<u8>>, WorkflowError> {
        Ok(None)
    }

    /// Version recorded for `change_id` in history, if any.
    fn recorded_version(&self, _change_id: &str) -> Result<Option<i32>, WorkflowError> {
        Ok(None)
    }
}

/// Sink used when the runner executes without a decider.
///
/// Timers are entries in the runner's own timer set and fire from the
/// runner's clock. Activities and child workflows cannot run locally.
pub struct LocalCommandSink {
    timers: Arc<Mutex<WorkflowTimers>>,
    clock: Arc<dyn Clock>,
    started: Mutex<HashMap<String, (TimerHandle, WorkflowPromise<Vec<u8>>)>>,
}

impl LocalCommandSink {
    pub fn new(timers: Arc<Mutex<WorkflowTimers>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            timers,
            clock,
            started: Mutex::new(HashMap::new()),
        }
    }
}

impl CommandSink for LocalCommandSink {
    fn submit(&self, command: WorkflowCommand) -> Result<CommandResult, WorkflowError> {
        match command {
            WorkflowCommand::StartTimer(cmd) => {
                let promise = WorkflowPromise::new();
                let fire_time = self.clock.current_time_millis() + cmd.duration.as_millis() as i64;
                let completion = promise.clone();
                let handle = self.timers.lock().add_timer(
                    fire_time,
                    Box::new(move |_| {
                        completion.complete(Vec::new());
                    }),
                );
                trace!(timer_id = %cmd.timer_id, fire_time, "local timer started");
                self.started
                    .lock()
                    .insert(cmd.timer_id, (handle, promise.clone()));
                Ok(CommandResult::Pending(promise))
            }
            WorkflowCommand::CancelTimer(cmd) => {
                let (handle, promise) = self.started.lock().remove(&cmd.timer_id).ok_or_else(|| {
                    WorkflowError::Internal(format!("unknown timer {}", cmd.timer_id))
                })?;
                if !promise.is_done() {
                    self.timers
                        .lock()
                        .remove_timer(handle)
                        .map_err(|e| WorkflowError::Internal(e.to_string()))?;
                    promise.fail(WorkflowError::Canceled(format!("timer {} canceled", cmd.timer_id)));
                }
                Ok(CommandResult::Accepted)
            }
            WorkflowCommand::RecordMarker(_) => Ok(CommandResult::Accepted),
            WorkflowCommand::ScheduleActivity(cmd) => Err(WorkflowError::Generic(format!(
                "activity {} cannot run without a decider",
                cmd.activity_type
            ))),
            WorkflowCommand::RequestCancelActivity(_) => Ok(CommandResult::Accepted),
            WorkflowCommand::StartChildWorkflow(cmd) => Err(WorkflowError::Generic(format!(
                "child workflow {} cannot run without a decider",
                cmd.workflow_type
            ))),
        }
    }
}

impl fmt::Debug for LocalCommandSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommandSink")
            .field("clock", &self.clock)
            .field("started", &self.started.lock().len())
            .finish()
    }
}

//! Workflow history model.
//!
//! A history is the ordered, immutable record of everything that happened to
//! one workflow run. Event ids are assigned by the service, start at 1 and
//! increase by one per event.

use serde::{Deserialize, Serialize};

use crate::types::{ActivityType, TaskList, TimeoutType, WorkflowExecution, WorkflowType};

/// Represents a single event in workflow history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    /// Unix nanoseconds
    pub timestamp: i64,
    pub event_type: EventType,
    pub attributes: Option<EventAttributes>,
}

impl HistoryEvent {
    pub fn new(
        event_id: i64,
        timestamp: i64,
        event_type: EventType,
        attributes: EventAttributes,
    ) -> Self {
        Self {
            event_id,
            timestamp,
            event_type,
            attributes: Some(attributes),
        }
    }

    /// Timestamp truncated to milliseconds, the resolution of workflow clocks.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp / 1_000_000
    }

    /// Scheduled event id of activity lifecycle events, `None` for anything else.
    pub fn activity_scheduled_event_id(&self) -> Option<i64> {
        match self.attributes.as_ref()? {
            EventAttributes::ActivityTaskStartedEventAttributes(a) => Some(a.scheduled_event_id),
            EventAttributes::ActivityTaskCompletedEventAttributes(a) => Some(a.scheduled_event_id),
            EventAttributes::ActivityTaskFailedEventAttributes(a) => Some(a.scheduled_event_id),
            EventAttributes::ActivityTaskTimedOutEventAttributes(a) => Some(a.scheduled_event_id),
            EventAttributes::ActivityTaskCanceledEventAttributes(a) => Some(a.scheduled_event_id),
            _ => None,
        }
    }

    /// Initiated event id of child workflow lifecycle events, `None` for anything else.
    pub fn child_initiated_event_id(&self) -> Option<i64> {
        match self.attributes.as_ref()? {
            EventAttributes::StartChildWorkflowExecutionFailedEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            EventAttributes::ChildWorkflowExecutionStartedEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            EventAttributes::ChildWorkflowExecutionCompletedEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            EventAttributes::ChildWorkflowExecutionFailedEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            EventAttributes::ChildWorkflowExecutionCanceledEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            EventAttributes::ChildWorkflowExecutionTimedOutEventAttributes(a) => {
                Some(a.initiated_event_id)
            }
            _ => None,
        }
    }

    pub fn marker_attributes(&self) -> Option<&MarkerRecordedEventAttributes> {
        match self.attributes.as_ref()? {
            EventAttributes::MarkerRecordedEventAttributes(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventType {
    WorkflowExecutionStarted = 0,
    WorkflowExecutionCompleted = 1,
    WorkflowExecutionFailed = 2,
    WorkflowExecutionTimedOut = 3,
    DecisionTaskScheduled = 4,
    DecisionTaskStarted = 5,
    DecisionTaskCompleted = 6,
    DecisionTaskTimedOut = 7,
    DecisionTaskFailed = 8,
    ActivityTaskScheduled = 9,
    ActivityTaskStarted = 10,
    ActivityTaskCompleted = 11,
    ActivityTaskFailed = 12,
    ActivityTaskTimedOut = 13,
    ActivityTaskCancelRequested = 14,
    ActivityTaskCanceled = 15,
    TimerStarted = 16,
    TimerFired = 17,
    TimerCanceled = 18,
    WorkflowExecutionCancelRequested = 19,
    WorkflowExecutionCanceled = 20,
    MarkerRecorded = 24,
    WorkflowExecutionSignaled = 25,
    StartChildWorkflowExecutionInitiated = 28,
    StartChildWorkflowExecutionFailed = 29,
    ChildWorkflowExecutionStarted = 30,
    ChildWorkflowExecutionCompleted = 31,
    ChildWorkflowExecutionFailed = 32,
    ChildWorkflowExecutionCanceled = 33,
    ChildWorkflowExecutionTimedOut = 34,
}

impl EventType {
    /// Events the service writes as a direct consequence of a decision.
    ///
    /// They follow `DecisionTaskCompleted` contiguously and are what replay
    /// compares the re-executed workflow's commands against.
    pub fn is_decision_event(self) -> bool {
        matches!(
            self,
            EventType::ActivityTaskScheduled
                | EventType::ActivityTaskCancelRequested
                | EventType::TimerStarted
                | EventType::TimerCanceled
                | EventType::MarkerRecorded
                | EventType::StartChildWorkflowExecutionInitiated
                | EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionCanceled
        )
    }

    pub fn is_decision_task_event(self) -> bool {
        matches!(
            self,
            EventType::DecisionTaskScheduled
                | EventType::DecisionTaskStarted
                | EventType::DecisionTaskCompleted
                | EventType::DecisionTaskTimedOut
                | EventType::DecisionTaskFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventAttributes {
    WorkflowExecutionStartedEventAttributes(Box<WorkflowExecutionStartedEventAttributes>),
    WorkflowExecutionCompletedEventAttributes(Box<WorkflowExecutionCompletedEventAttributes>),
    WorkflowExecutionFailedEventAttributes(Box<WorkflowExecutionFailedEventAttributes>),
    WorkflowExecutionTimedOutEventAttributes(Box<WorkflowExecutionTimedOutEventAttributes>),
    WorkflowExecutionCancelRequestedEventAttributes(
        Box<WorkflowExecutionCancelRequestedEventAttributes>,
    ),
    WorkflowExecutionCanceledEventAttributes(Box<WorkflowExecutionCanceledEventAttributes>),
    DecisionTaskScheduledEventAttributes(Box<DecisionTaskScheduledEventAttributes>),
    DecisionTaskStartedEventAttributes(Box<DecisionTaskStartedEventAttributes>),
    DecisionTaskCompletedEventAttributes(Box<DecisionTaskCompletedEventAttributes>),
    DecisionTaskTimedOutEventAttributes(Box<DecisionTaskTimedOutEventAttributes>),
    DecisionTaskFailedEventAttributes(Box<DecisionTaskFailedEventAttributes>),
    ActivityTaskScheduledEventAttributes(Box<ActivityTaskScheduledEventAttributes>),
    ActivityTaskStartedEventAttributes(Box<ActivityTaskStartedEventAttributes>),
    ActivityTaskCompletedEventAttributes(Box<ActivityTaskCompletedEventAttributes>),
    ActivityTaskFailedEventAttributes(Box<ActivityTaskFailedEventAttributes>),
    ActivityTaskTimedOutEventAttributes(Box<ActivityTaskTimedOutEventAttributes>),
    ActivityTaskCancelRequestedEventAttributes(Box<ActivityTaskCancelRequestedEventAttributes>),
    ActivityTaskCanceledEventAttributes(Box<ActivityTaskCanceledEventAttributes>),
    TimerStartedEventAttributes(Box<TimerStartedEventAttributes>),
    TimerFiredEventAttributes(Box<TimerFiredEventAttributes>),
    TimerCanceledEventAttributes(Box<TimerCanceledEventAttributes>),
    MarkerRecordedEventAttributes(Box<MarkerRecordedEventAttributes>),
    WorkflowExecutionSignaledEventAttributes(Box<WorkflowExecutionSignaledEventAttributes>),
    StartChildWorkflowExecutionInitiatedEventAttributes(
        Box<StartChildWorkflowExecutionInitiatedEventAttributes>,
    ),
    StartChildWorkflowExecutionFailedEventAttributes(
        Box<StartChildWorkflowExecutionFailedEventAttributes>,
    ),
    ChildWorkflowExecutionStartedEventAttributes(Box<ChildWorkflowExecutionStartedEventAttributes>),
    ChildWorkflowExecutionCompletedEventAttributes(
        Box<ChildWorkflowExecutionCompletedEventAttributes>,
    ),
    ChildWorkflowExecutionFailedEventAttributes(Box<ChildWorkflowExecutionFailedEventAttributes>),
    ChildWorkflowExecutionCanceledEventAttributes(
        Box<ChildWorkflowExecutionCanceledEventAttributes>,
    ),
    ChildWorkflowExecutionTimedOutEventAttributes(
        Box<ChildWorkflowExecutionTimedOutEventAttributes>,
    ),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionStartedEventAttributes {
    pub workflow_type: WorkflowType,
    pub task_list: TaskList,
    pub input: Vec<u8>,
    pub execution_start_to_close_timeout_seconds: i32,
    pub task_start_to_close_timeout_seconds: i32,
    pub identity: String,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionCompletedEventAttributes {
    pub result: Option<Vec<u8>>,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionFailedEventAttributes {
    pub reason: Option<String>,
    pub details: Option<Vec<u8>>,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionTimedOutEventAttributes {
    pub timeout_type: TimeoutType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionCancelRequestedEventAttributes {
    pub cause: Option<String>,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionCanceledEventAttributes {
    pub decision_task_completed_event_id: i64,
    pub details: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTaskScheduledEventAttributes {
    pub task_list: TaskList,
    pub start_to_close_timeout_seconds: i32,
    pub attempt: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTaskStartedEventAttributes {
    pub scheduled_event_id: i64,
    pub identity: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTaskCompletedEventAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTaskTimedOutEventAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub timeout_type: TimeoutType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTaskFailedEventAttributes {
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub cause: String,
    pub details: Option<Vec<u8>>,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskScheduledEventAttributes {
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub task_list: TaskList,
    pub input: Option<Vec<u8>>,
    pub schedule_to_close_timeout_seconds: i32,
    pub schedule_to_start_timeout_seconds: i32,
    pub start_to_close_timeout_seconds: i32,
    pub heartbeat_timeout_seconds: i32,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskStartedEventAttributes {
    pub scheduled_event_id: i64,
    pub identity: String,
    pub request_id: String,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskCompletedEventAttributes {
    pub result: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskFailedEventAttributes {
    pub reason: Option<String>,
    pub details: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskTimedOutEventAttributes {
    pub details: Option<Vec<u8>>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub timeout_type: TimeoutType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskCancelRequestedEventAttributes {
    pub activity_id: String,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTaskCanceledEventAttributes {
    pub details: Option<Vec<u8>>,
    pub latest_cancel_requested_event_id: i64,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStartedEventAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_seconds: i64,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerFiredEventAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerCanceledEventAttributes {
    pub timer_id: String,
    pub started_event_id: i64,
    pub decision_task_completed_event_id: i64,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecordedEventAttributes {
    pub marker_name: String,
    pub details: Vec<u8>,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionSignaledEventAttributes {
    pub signal_name: String,
    pub input: Option<Vec<u8>>,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionInitiatedEventAttributes {
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub task_list: TaskList,
    pub input: Option<Vec<u8>>,
    pub execution_start_to_close_timeout_seconds: i32,
    pub task_start_to_close_timeout_seconds: i32,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionFailedEventAttributes {
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub cause: String,
    pub initiated_event_id: i64,
    pub decision_task_completed_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionStartedEventAttributes {
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub initiated_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionCompletedEventAttributes {
    pub result: Option<Vec<u8>>,
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub initiated_event_id: i64,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionFailedEventAttributes {
    pub reason: Option<String>,
    pub details: Option<Vec<u8>>,
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub initiated_event_id: i64,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionCanceledEventAttributes {
    pub details: Option<Vec<u8>>,
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub initiated_event_id: i64,
    pub started_event_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionTimedOutEventAttributes {
    pub timeout_type: TimeoutType,
    pub domain: String,
    pub workflow_execution: WorkflowExecution,
    pub workflow_type: WorkflowType,
    pub initiated_event_id: i64,
    pub started_event_id: i64,
}

/// History of a workflow execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub events: Vec<HistoryEvent>,
}

impl History {
    pub fn new(events: Vec<HistoryEvent>) -> Self {
        Self { events }
    }

    /// A full history starts at the first event of the run.
    pub fn is_full(&self) -> bool {
        self.events
            .first()
            .map(|e| e.event_id == 1)
            .unwrap_or(false)
    }

    pub fn first_event_id(&self) -> Option<i64> {
        self.events.first().map(|e| e.event_id)
    }

    pub fn last_event_id(&self) -> Option<i64> {
        self.events.last().map(|e| e.event_id)
    }
}

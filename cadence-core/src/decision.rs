//! Decisions: the commands a decider sends back for one decision task.

use serde::{Deserialize, Serialize};

use crate::history::EventType;
use crate::types::{ActivityType, TaskList, WorkflowType};

/// Decision types for decision tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum DecisionType {
    ScheduleActivityTask = 0,
    RequestCancelActivityTask = 1,
    StartTimer = 2,
    CompleteWorkflowExecution = 3,
    FailWorkflowExecution = 4,
    CancelTimer = 5,
    CancelWorkflowExecution = 6,
    RecordMarker = 8,
    StartChildWorkflowExecution = 10,
}

impl DecisionType {
    /// History event the service records when it accepts this decision.
    pub fn resulting_event_type(self) -> EventType {
        match self {
            DecisionType::ScheduleActivityTask => EventType::ActivityTaskScheduled,
            DecisionType::RequestCancelActivityTask => EventType::ActivityTaskCancelRequested,
            DecisionType::StartTimer => EventType::TimerStarted,
            DecisionType::CompleteWorkflowExecution => EventType::WorkflowExecutionCompleted,
            DecisionType::FailWorkflowExecution => EventType::WorkflowExecutionFailed,
            DecisionType::CancelTimer => EventType::TimerCanceled,
            DecisionType::CancelWorkflowExecution => EventType::WorkflowExecutionCanceled,
            DecisionType::RecordMarker => EventType::MarkerRecorded,
            DecisionType::StartChildWorkflowExecution => {
                EventType::StartChildWorkflowExecutionInitiated
            }
        }
    }
}

/// A decision to be made by the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_type: DecisionType,
    pub attributes: Option<DecisionAttributes>,
}

impl Decision {
    pub fn schedule_activity_task(attributes: ScheduleActivityTaskDecisionAttributes) -> Self {
        Self {
            decision_type: DecisionType::ScheduleActivityTask,
            attributes: Some(DecisionAttributes::ScheduleActivityTaskDecisionAttributes(
                Box::new(attributes),
            )),
        }
    }

    pub fn request_cancel_activity_task(activity_id: impl Into<String>) -> Self {
        Self {
            decision_type: DecisionType::RequestCancelActivityTask,
            attributes: Some(
                DecisionAttributes::RequestCancelActivityTaskDecisionAttributes(Box::new(
                    RequestCancelActivityTaskDecisionAttributes {
                        activity_id: activity_id.into(),
                    },
                )),
            ),
        }
    }

    pub fn start_timer(timer_id: impl Into<String>, start_to_fire_timeout_seconds: i64) -> Self {
        Self {
            decision_type: DecisionType::StartTimer,
            attributes: Some(DecisionAttributes::StartTimerDecisionAttributes(Box::new(
                StartTimerDecisionAttributes {
                    timer_id: timer_id.into(),
                    start_to_fire_timeout_seconds,
                },
            ))),
        }
    }

    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self {
            decision_type: DecisionType::CancelTimer,
            attributes: Some(DecisionAttributes::CancelTimerDecisionAttributes(Box::new(
                CancelTimerDecisionAttributes {
                    timer_id: timer_id.into(),
                },
            ))),
        }
    }

    pub fn record_marker(marker_name: impl Into<String>, details: Vec<u8>) -> Self {
        Self {
            decision_type: DecisionType::RecordMarker,
            attributes: Some(DecisionAttributes::RecordMarkerDecisionAttributes(Box::new(
                RecordMarkerDecisionAttributes {
                    marker_name: marker_name.into(),
                    details,
                },
            ))),
        }
    }

    pub fn start_child_workflow_execution(
        attributes: StartChildWorkflowExecutionDecisionAttributes,
    ) -> Self {
        Self {
            decision_type: DecisionType::StartChildWorkflowExecution,
            attributes: Some(
                DecisionAttributes::StartChildWorkflowExecutionDecisionAttributes(Box::new(
                    attributes,
                )),
            ),
        }
    }

    pub fn complete_workflow_execution(result: Option<Vec<u8>>) -> Self {
        Self {
            decision_type: DecisionType::CompleteWorkflowExecution,
            attributes: Some(
                DecisionAttributes::CompleteWorkflowExecutionDecisionAttributes(Box::new(
                    CompleteWorkflowExecutionDecisionAttributes { result },
                )),
            ),
        }
    }

    pub fn fail_workflow_execution(reason: impl Into<String>, details: Option<Vec<u8>>) -> Self {
        Self {
            decision_type: DecisionType::FailWorkflowExecution,
            attributes: Some(DecisionAttributes::FailWorkflowExecutionDecisionAttributes(
                Box::new(FailWorkflowExecutionDecisionAttributes {
                    reason: Some(reason.into()),
                    details,
                }),
            )),
        }
    }

    pub fn cancel_workflow_execution(details: Option<Vec<u8>>) -> Self {
        Self {
            decision_type: DecisionType::CancelWorkflowExecution,
            attributes: Some(
                DecisionAttributes::CancelWorkflowExecutionDecisionAttributes(Box::new(
                    CancelWorkflowExecutionDecisionAttributes { details },
                )),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecisionAttributes {
    ScheduleActivityTaskDecisionAttributes(Box<ScheduleActivityTaskDecisionAttributes>),
    RequestCancelActivityTaskDecisionAttributes(Box<RequestCancelActivityTaskDecisionAttributes>),
    StartTimerDecisionAttributes(Box<StartTimerDecisionAttributes>),
    CancelTimerDecisionAttributes(Box<CancelTimerDecisionAttributes>),
    CompleteWorkflowExecutionDecisionAttributes(Box<CompleteWorkflowExecutionDecisionAttributes>),
    FailWorkflowExecutionDecisionAttributes(Box<FailWorkflowExecutionDecisionAttributes>),
    CancelWorkflowExecutionDecisionAttributes(Box<CancelWorkflowExecutionDecisionAttributes>),
    RecordMarkerDecisionAttributes(Box<RecordMarkerDecisionAttributes>),
    StartChildWorkflowExecutionDecisionAttributes(
        Box<StartChildWorkflowExecutionDecisionAttributes>,
    ),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivityTaskDecisionAttributes {
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub task_list: TaskList,
    pub input: Option<Vec<u8>>,
    pub schedule_to_close_timeout_seconds: i32,
    pub schedule_to_start_timeout_seconds: i32,
    pub start_to_close_timeout_seconds: i32,
    pub heartbeat_timeout_seconds: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelActivityTaskDecisionAttributes {
    pub activity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTimerDecisionAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelTimerDecisionAttributes {
    pub timer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteWorkflowExecutionDecisionAttributes {
    pub result: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailWorkflowExecutionDecisionAttributes {
    pub reason: Option<String>,
    pub details: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelWorkflowExecutionDecisionAttributes {
    pub details: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMarkerDecisionAttributes {
    pub marker_name: String,
    pub details: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionDecisionAttributes {
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub task_list: TaskList,
    pub input: Option<Vec<u8>>,
    pub execution_start_to_close_timeout_seconds: i32,
    pub task_start_to_close_timeout_seconds: i32,
}

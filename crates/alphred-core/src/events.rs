//! Event types for the task audit log.

use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskCreated,
    TaskClaimed,
    TurnStarted,
    ToolDispatched,
    TaskCompleted,
    TaskFailed,
    /// An IN_PROGRESS task whose lease expired was failed by the dispatcher.
    TaskReclaimed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskClaimed => "TASK_CLAIMED",
            Self::TurnStarted => "TURN_STARTED",
            Self::ToolDispatched => "TOOL_DISPATCHED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TaskReclaimed => "TASK_RECLAIMED",
        }
    }
}

/// Payload for TASK_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreatedPayload {
    pub title: String,
}

/// Payload for TASK_CLAIMED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaimedPayload {
    pub skill: String,
    /// Lease expiry as epoch milliseconds.
    pub lease_expires_at: i64,
}

/// Payload for TURN_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartedPayload {
    pub turn: u32,
    pub catalog_size: usize,
}

/// Payload for TOOL_DISPATCHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDispatchedPayload {
    pub turn: u32,
    pub tool: String,
    /// `content`, `error` or `provider_lost`.
    pub outcome: String,
}

/// Payload for TASK_COMPLETED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub turns: u32,
}

/// Payload for TASK_FAILED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub reason: String,
}

/// Payload for TASK_RECLAIMED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReclaimedPayload {
    pub lease_expired_at: i64,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    TaskCreated(TaskCreatedPayload),
    TaskClaimed(TaskClaimedPayload),
    TurnStarted(TurnStartedPayload),
    ToolDispatched(ToolDispatchedPayload),
    TaskCompleted(TaskCompletedPayload),
    TaskFailed(TaskFailedPayload),
    TaskReclaimed(TaskReclaimedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskCreated(_) => EventType::TaskCreated,
            Self::TaskClaimed(_) => EventType::TaskClaimed,
            Self::TurnStarted(_) => EventType::TurnStarted,
            Self::ToolDispatched(_) => EventType::ToolDispatched,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::TaskFailed(_) => EventType::TaskFailed,
            Self::TaskReclaimed(_) => EventType::TaskReclaimed,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

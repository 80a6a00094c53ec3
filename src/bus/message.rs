//! Bus message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::{BackendType, ExecutionResult, PoolStatus, Task};

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskDelegate,
    ResultShare,
    StatusUpdate,
    Heartbeat,
    PoolCreated,
    PoolClosed,
    TaskCompleted,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        Self::TaskDelegate,
        Self::ResultShare,
        Self::StatusUpdate,
        Self::Heartbeat,
        Self::PoolCreated,
        Self::PoolClosed,
        Self::TaskCompleted,
    ];
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskDelegate => "TASK_DELEGATE",
            Self::ResultShare => "RESULT_SHARE",
            Self::StatusUpdate => "STATUS_UPDATE",
            Self::Heartbeat => "HEARTBEAT",
            Self::PoolCreated => "POOL_CREATED",
            Self::PoolClosed => "POOL_CLOSED",
            Self::TaskCompleted => "TASK_COMPLETED",
        };
        write!(f, "{s}")
    }
}

/// Typed payload, one variant per message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    /// Ask the target pool to run a task and share the result back.
    TaskDelegate {
        task: Task,
        /// Owner that should receive the `ResultShare`. Defaults to the source.
        reply_to: Option<String>,
    },
    /// Result of a delegated task, or of a failed delegation.
    ResultShare {
        result: Option<ExecutionResult>,
        error: Option<String>,
        request_id: Option<Uuid>,
    },
    StatusUpdate {
        status: PoolStatus,
        worker_count: usize,
        detail: Option<String>,
    },
    Heartbeat { seq: u64 },
    PoolCreated { backend_type: BackendType, name: String },
    PoolClosed { reason: Option<String> },
    TaskCompleted {
        worker_id: String,
        success: bool,
        duration_ms: u64,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TaskDelegate { .. } => MessageType::TaskDelegate,
            Self::ResultShare { .. } => MessageType::ResultShare,
            Self::StatusUpdate { .. } => MessageType::StatusUpdate,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::PoolCreated { .. } => MessageType::PoolCreated,
            Self::PoolClosed { .. } => MessageType::PoolClosed,
            Self::TaskCompleted { .. } => MessageType::TaskCompleted,
        }
    }
}

/// One inter-pool message. `target_pool_id = None` means broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub source_pool_id: String,
    pub target_pool_id: Option<String>,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn broadcast(source: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_pool_id: source.into(),
            target_pool_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn direct(
        source: impl Into<String>,
        target: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            target_pool_id: Some(target.into()),
            ..Self::broadcast(source, payload)
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_pool_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_follows_payload() {
        let msg = Message::broadcast("p1", MessagePayload::Heartbeat { seq: 7 });
        assert_eq!(msg.message_type(), MessageType::Heartbeat);
        assert!(msg.is_broadcast());

        let msg = Message::direct(
            "p1",
            "p2",
            MessagePayload::TaskDelegate {
                task: Task::prompt("lint"),
                reply_to: None,
            },
        );
        assert_eq!(msg.message_type(), MessageType::TaskDelegate);
        assert_eq!(msg.target_pool_id.as_deref(), Some("p2"));
    }

    #[test]
    fn payload_wire_format() {
        let json = serde_json::to_value(MessagePayload::PoolClosed { reason: None }).unwrap();
        assert_eq!(json["type"], "POOL_CLOSED");
        assert_eq!(MessageType::StatusUpdate.to_string(), "STATUS_UPDATE");
        assert_eq!(
            serde_json::to_string(&MessageType::TaskDelegate).unwrap(),
            "\"TASK_DELEGATE\""
        );
    }
}

//! Task model: types, states, keys and submission payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sync::SyncStrategy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Login,
    Sync,
    SyncFolders,
    Download,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Login => "login",
            TaskType::Sync => "sync",
            TaskType::SyncFolders => "sync_folders",
            TaskType::Download => "download",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "login" => Ok(TaskType::Login),
            "sync" => Ok(TaskType::Sync),
            "sync_folders" => Ok(TaskType::SyncFolders),
            "download" => Ok(TaskType::Download),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

/// `pending → running → success | failure | cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Payload stored under the status key; the admin surface polls these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    pub task_id: String,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskStatus {
    pub fn new(task_id: &str, status: TaskState, message: impl Into<String>) -> Self {
        Self {
            status,
            task_id: task_id.to_string(),
            message: message.into(),
            updated_at: Utc::now(),
            result: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Role decides the per-user concurrency cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Member,
}

impl UserRole {
    /// Maximum in-flight tasks for one user.
    pub fn concurrency_cap(&self) -> i64 {
        match self {
            UserRole::Admin => 30,
            UserRole::Member => 10,
        }
    }
}

/// Per-type work description.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Login { auto_sync: bool },
    Sync { strategy: SyncStrategy },
    SyncFolders,
    Download { message_ids: Vec<i64> },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Login { .. } => TaskType::Login,
            TaskPayload::Sync { .. } => TaskType::Sync,
            TaskPayload::SyncFolders => TaskType::SyncFolders,
            TaskPayload::Download { .. } => TaskType::Download,
        }
    }
}

/// A submission: who wants what done for which group.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub user_id: i64,
    pub role: UserRole,
    pub group_id: String,
    pub payload: TaskPayload,
}

impl TaskSpec {
    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    /// Logical identity used to deduplicate concurrent submissions.
    pub fn task_key(&self) -> String {
        task_key(self.task_type(), &self.group_id)
    }
}

pub fn task_key(task_type: TaskType, group_id: &str) -> String {
    format!("{}_{}", task_type, group_id)
}

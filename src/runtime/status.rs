//! Task status reporting through the broker.
//!
//! One key per (user, task type, group). Non-terminal states carry a long
//! TTL so in-flight work survives worker restarts; terminal states carry a
//! short TTL so the UI can observe completion and then forget. Writes are
//! last-write-wins; cancellation terminality is enforced by the worker, not
//! here.

use crate::broker::{keys, Broker, BrokerError};
use crate::runtime::task::{TaskState, TaskStatus, TaskType};

/// TTL while a task is pending or running.
pub const NONTERMINAL_TTL_SECS: u64 = 3600;
/// TTL once a task reached a terminal state.
pub const TERMINAL_TTL_SECS: u64 = 60;

#[derive(Clone)]
pub struct StatusStore {
    broker: Broker,
}

impl StatusStore {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    pub async fn set(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
        status: &TaskStatus,
    ) -> Result<(), BrokerError> {
        let key = keys::task_status(user_id, task_type.as_str(), group_id);
        let ttl = if status.status.is_terminal() {
            TERMINAL_TTL_SECS
        } else {
            NONTERMINAL_TTL_SECS
        };
        let payload = serde_json::to_string(status)
            .expect("task status serializes");
        self.broker.setex(&key, ttl, &payload).await
    }

    pub async fn get(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
    ) -> Result<Option<TaskStatus>, BrokerError> {
        let key = keys::task_status(user_id, task_type.as_str(), group_id);
        let raw = self.broker.get(&key).await?;
        Ok(raw.and_then(|payload| serde_json::from_str(&payload).ok()))
    }

    /// Every live status of one user and task type, newest first. This is
    /// the admin surface's status-list contract.
    pub async fn list(
        &self,
        user_id: i64,
        task_type: TaskType,
    ) -> Result<Vec<TaskStatus>, BrokerError> {
        let pattern = keys::task_status_pattern(user_id, task_type.as_str());
        let found = self.broker.keys(&pattern).await?;

        let mut statuses = Vec::with_capacity(found.len());
        for key in found {
            if let Some(raw) = self.broker.get(&key).await? {
                if let Ok(status) = serde_json::from_str::<TaskStatus>(&raw) {
                    statuses.push(status);
                }
            }
        }
        statuses.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(statuses)
    }

    /// True when the recorded state for the slot is still active.
    pub async fn is_active(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self
            .get(user_id, task_type, group_id)
            .await?
            .map(|status| status.status.is_active())
            .unwrap_or(false))
    }

    /// True when the slot currently records `cancelled`. Workers consult
    /// this before writing a terminal state so cancellation stays terminal.
    pub async fn is_cancelled(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self
            .get(user_id, task_type, group_id)
            .await?
            .map(|status| status.status == TaskState::Cancelled)
            .unwrap_or(false))
    }
}

//! Broker key layout.
//!
//! Status keys are the contract with the admin surface: the UI polls them by
//! pattern, so changing a template here is a wire-format change.

/// Pending store writes, drained by the writer daemon.
pub const WRITE_QUEUE: &str = "sys:db_write_queue";

/// Dead letters: batches that failed repeatedly and need human attention.
pub const WRITE_FAILED: &str = "sys:db_write_failed";

/// Status key for one (user, task type, group) slot.
pub fn task_status(user_id: i64, task_type: &str, group_id: &str) -> String {
    format!(
        "sys:status:user:{}:type:{}:group:{}",
        user_id, task_type, group_id
    )
}

/// Glob matching every status key of one user and task type.
pub fn task_status_pattern(user_id: i64, task_type: &str) -> String {
    format!("sys:status:user:{}:type:{}:group:*", user_id, task_type)
}

/// Per-user in-flight task counter.
pub fn user_concurrency(user_id: i64) -> String {
    format!("sys:concurrency:user:{}", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_key_matches_its_pattern() {
        let key = task_status(7, "sync", "grp-1");
        assert_eq!(key, "sys:status:user:7:type:sync:group:grp-1");

        let pattern = task_status_pattern(7, "sync");
        let prefix = pattern.trim_end_matches('*');
        assert!(key.starts_with(prefix));
    }
}

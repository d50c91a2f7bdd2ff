//! Version snapshots of account groups.
//!
//! Every mutation of a group's account data appends a snapshot row capturing
//! the group's aliases, credentials and recovery contacts as JSON. Snapshots
//! are immutable once written; restore replays one onto the live rows and
//! appends a new snapshot recording the restore itself.

use sqlx::SqliteConnection;
use thiserror::Error;

use crate::models::VersionSnapshot;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("group {group_id} has no snapshot version {version}")]
    VersionNotFound { group_id: String, version: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for SnapshotError {
    fn from(e: sqlx::Error) -> Self {
        SnapshotError::Store(StoreError::Database(e))
    }
}

/// Append a snapshot of the account's group to `account_version`. Runs on
/// the caller's connection so it can join the surrounding transaction.
pub async fn insert_version_snapshot(
    conn: &mut SqliteConnection,
    account_id: i64,
    note: Option<&str>,
    created_by: Option<&str>,
) -> Result<(), SnapshotError> {
    let account: Option<(String, i64, Option<String>, String, Option<String>, Option<String>)> =
        sqlx::query_as(
            "SELECT group_id, version, password, status, username, birthday \
             FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some((group_id, version, password, status, username, birthday)) = account else {
        return Err(SnapshotError::AccountNotFound(account_id));
    };

    let emails: Vec<(String,)> =
        sqlx::query_as("SELECT email FROM accounts WHERE group_id = ? ORDER BY email")
            .bind(&group_id)
            .fetch_all(&mut *conn)
            .await?;
    let recovery_emails: Vec<(String,)> = sqlx::query_as(
        "SELECT email FROM account_recovery_email WHERE group_id = ? ORDER BY email",
    )
    .bind(&group_id)
    .fetch_all(&mut *conn)
    .await?;
    let recovery_phones: Vec<(String,)> = sqlx::query_as(
        "SELECT phone FROM account_recovery_phone WHERE group_id = ? ORDER BY phone",
    )
    .bind(&group_id)
    .fetch_all(&mut *conn)
    .await?;

    let to_json = |rows: Vec<(String,)>| {
        serde_json::to_string(&rows.into_iter().map(|(v,)| v).collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_string())
    };

    sqlx::query(
        "INSERT INTO account_version \
         (group_id, version, emails_snapshot_json, password, status, username, birthday, \
          recovery_emails_json, recovery_phones_json, note, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&group_id)
    .bind(version)
    .bind(to_json(emails))
    .bind(password)
    .bind(status)
    .bind(username)
    .bind(birthday)
    .bind(to_json(recovery_emails))
    .bind(to_json(recovery_phones))
    .bind(note)
    .bind(created_by)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// All snapshots of a group, newest first.
pub async fn list_versions(
    store: &Store,
    group_id: &str,
) -> Result<Vec<VersionSnapshot>, SnapshotError> {
    let versions = sqlx::query_as::<_, VersionSnapshot>(
        "SELECT id, group_id, version, emails_snapshot_json, password, status, username, \
                birthday, recovery_emails_json, recovery_phones_json, note, created_by, created_at \
         FROM account_version WHERE group_id = ? ORDER BY id DESC",
    )
    .bind(group_id)
    .fetch_all(store.pool())
    .await?;

    Ok(versions)
}

/// Replay one snapshot onto the group's accounts and recovery contacts,
/// bumping the version and recording the restore as a new snapshot.
pub async fn restore_version(
    store: &Store,
    group_id: &str,
    version: i64,
    restored_by: Option<&str>,
) -> Result<(), SnapshotError> {
    let mut conn = store.acquire().await?;
    let mut tx = conn.begin().await?;

    let snapshot = sqlx::query_as::<_, VersionSnapshot>(
        "SELECT id, group_id, version, emails_snapshot_json, password, status, username, \
                birthday, recovery_emails_json, recovery_phones_json, note, created_by, created_at \
         FROM account_version WHERE group_id = ? AND version = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(group_id)
    .bind(version)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(snapshot) = snapshot else {
        return Err(SnapshotError::VersionNotFound {
            group_id: group_id.to_string(),
            version,
        });
    };

    sqlx::query(
        "UPDATE accounts SET password = COALESCE(?, password), \
                             status = COALESCE(?, status), \
                             username = ?, birthday = ?, \
                             version = version + 1 \
         WHERE group_id = ?",
    )
    .bind(&snapshot.password)
    .bind(&snapshot.status)
    .bind(&snapshot.username)
    .bind(&snapshot.birthday)
    .bind(group_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM account_recovery_email WHERE group_id = ?")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM account_recovery_phone WHERE group_id = ?")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

    let recovery_emails: Vec<String> =
        serde_json::from_str(&snapshot.recovery_emails_json).unwrap_or_default();
    for email in recovery_emails {
        sqlx::query("INSERT OR IGNORE INTO account_recovery_email (group_id, email) VALUES (?, ?)")
            .bind(group_id)
            .bind(email)
            .execute(&mut *tx)
            .await?;
    }
    let recovery_phones: Vec<String> =
        serde_json::from_str(&snapshot.recovery_phones_json).unwrap_or_default();
    for phone in recovery_phones {
        sqlx::query("INSERT OR IGNORE INTO account_recovery_phone (group_id, phone) VALUES (?, ?)")
            .bind(group_id)
            .bind(phone)
            .execute(&mut *tx)
            .await?;
    }

    // Record the restore as its own version.
    let primary: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM accounts WHERE group_id = ? ORDER BY id LIMIT 1")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some((account_id,)) = primary {
        insert_version_snapshot(
            &mut *tx,
            account_id,
            Some(&format!("restored from version {}", version)),
            restored_by,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_group(store: &Store) -> i64 {
        sqlx::query(
            "INSERT INTO accounts (group_id, email, password, status, username) \
             VALUES ('g1', 'main@example.com', 'pw-1', 'success', 'Main User')",
        )
        .execute(store.pool())
        .await
        .expect("account");
        sqlx::query(
            "INSERT INTO account_recovery_email (group_id, email) VALUES ('g1', 'rescue@example.com')",
        )
        .execute(store.pool())
        .await
        .expect("recovery");

        let (account_id,): (i64,) =
            sqlx::query_as("SELECT id FROM accounts WHERE email = 'main@example.com'")
                .fetch_one(store.pool())
                .await
                .expect("account id");
        account_id
    }

    #[tokio::test]
    async fn snapshot_captures_group_state() {
        let store = Store::in_memory().await.expect("store");
        let account_id = seed_group(&store).await;

        let mut conn = store.acquire().await.expect("acquire");
        insert_version_snapshot(&mut *conn, account_id, Some("initial import"), Some("admin"))
            .await
            .expect("snapshot");
        drop(conn);

        let versions = list_versions(&store, "g1").await.expect("list");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].note.as_deref(), Some("initial import"));
        assert!(versions[0].emails_snapshot_json.contains("main@example.com"));
        assert!(versions[0].recovery_emails_json.contains("rescue@example.com"));
    }

    #[tokio::test]
    async fn restore_replays_password_and_recovery() {
        let store = Store::in_memory().await.expect("store");
        let account_id = seed_group(&store).await;

        let mut conn = store.acquire().await.expect("acquire");
        insert_version_snapshot(&mut *conn, account_id, None, None)
            .await
            .expect("snapshot");
        drop(conn);

        // Mutate the live rows away from the snapshot.
        sqlx::query("UPDATE accounts SET password = 'pw-2' WHERE id = ?")
            .bind(account_id)
            .execute(store.pool())
            .await
            .expect("mutate");
        sqlx::query("DELETE FROM account_recovery_email WHERE group_id = 'g1'")
            .execute(store.pool())
            .await
            .expect("drop recovery");

        restore_version(&store, "g1", 1, Some("admin"))
            .await
            .expect("restore");

        let (password,): (String,) =
            sqlx::query_as("SELECT password FROM accounts WHERE id = ?")
                .bind(account_id)
                .fetch_one(store.pool())
                .await
                .expect("password");
        assert_eq!(password, "pw-1");

        let (recovery,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM account_recovery_email WHERE group_id = 'g1'",
        )
        .fetch_one(store.pool())
        .await
        .expect("recovery count");
        assert_eq!(recovery, 1);

        // The restore appended its own snapshot.
        let versions = list_versions(&store, "g1").await.expect("list");
        assert_eq!(versions.len(), 2);
        assert!(versions[0]
            .note
            .as_deref()
            .unwrap_or_default()
            .contains("restored from version 1"));
    }

    #[tokio::test]
    async fn restoring_missing_version_errors() {
        let store = Store::in_memory().await.expect("store");
        seed_group(&store).await;

        match restore_version(&store, "g1", 99, None).await {
            Err(SnapshotError::VersionNotFound { version, .. }) => assert_eq!(version, 99),
            other => panic!("expected VersionNotFound, got {:?}", other.map(|_| ())),
        }
    }
}

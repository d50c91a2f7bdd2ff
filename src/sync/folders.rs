//! Folder tree persistence and cursor state.
//!
//! Discovery upserts run synchronously so the sync round that walked the
//! tree can see it. The upsert refreshes names and counters but never
//! touches the cursor columns (`delta_link`, `last_sync_at`,
//! `synced_count`); those advance only through [`update_folder_state`] after
//! a folder's fetched pages were queued.

use chrono::{DateTime, Utc};

use crate::graph::RemoteFolder;
use crate::models::MailFolder;
use crate::store::{Store, StoreError};

/// Post-sync cursor advance for one folder.
#[derive(Debug, Clone)]
pub struct FolderStateUpdate {
    /// Start time of the sync round that just finished.
    pub last_sync_at: DateTime<Utc>,
    /// Messages queued for this folder in the round.
    pub synced_delta: i64,
    /// Fresh cursor, only when the round obtained one; `None` leaves the
    /// stored cursor untouched.
    pub delta_link: Option<String>,
}

/// Upsert the discovered folder tree in one transaction. Returns the number
/// of rows written.
pub async fn upsert_folder_tree(
    store: &Store,
    group_id: &str,
    folders: &[RemoteFolder],
) -> Result<usize, StoreError> {
    if folders.is_empty() {
        return Ok(0);
    }

    let mut conn = store.acquire().await?;
    let mut tx = conn.begin().await?;

    for folder in folders {
        sqlx::query(
            r#"INSERT INTO mail_folders
                   (folder_id, group_id, display_name, well_known_name,
                    parent_folder_id, total_count, unread_count, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
               ON CONFLICT(folder_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   parent_folder_id = excluded.parent_folder_id,
                   total_count = excluded.total_count,
                   unread_count = excluded.unread_count,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&folder.id)
        .bind(group_id)
        .bind(&folder.display_name)
        .bind(&folder.well_known_name)
        .bind(&folder.parent_folder_id)
        .bind(folder.total_item_count)
        .bind(folder.unread_item_count)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(folders.len())
}

/// All folder rows of a group, cursor state included.
pub async fn load_group_folders(
    store: &Store,
    group_id: &str,
) -> Result<Vec<MailFolder>, StoreError> {
    let folders = sqlx::query_as::<_, MailFolder>(
        r#"SELECT folder_id, group_id, display_name, well_known_name,
                  parent_folder_id, total_count, unread_count,
                  delta_link, last_sync_at, synced_count
           FROM mail_folders
           WHERE group_id = ?
           ORDER BY display_name"#,
    )
    .bind(group_id)
    .fetch_all(store.pool())
    .await?;

    Ok(folders)
}

/// Advance a folder's cursor after its pages were queued. Written as an
/// upsert carrying the folder's identity so the advance also lands when the
/// discovery row has not been flushed yet.
pub async fn update_folder_state(
    store: &Store,
    folder: &MailFolder,
    update: &FolderStateUpdate,
) -> Result<(), StoreError> {
    let mut conn = store.acquire().await?;
    sqlx::query(
        r#"INSERT INTO mail_folders
               (folder_id, group_id, display_name, well_known_name,
                parent_folder_id, total_count, unread_count,
                delta_link, last_sync_at, synced_count, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
           ON CONFLICT(folder_id) DO UPDATE SET
               last_sync_at = excluded.last_sync_at,
               synced_count = mail_folders.synced_count + ?,
               delta_link = COALESCE(excluded.delta_link, mail_folders.delta_link),
               updated_at = excluded.updated_at"#,
    )
    .bind(&folder.folder_id)
    .bind(&folder.group_id)
    .bind(&folder.display_name)
    .bind(&folder.well_known_name)
    .bind(&folder.parent_folder_id)
    .bind(folder.total_count)
    .bind(folder.unread_count)
    .bind(&update.delta_link)
    .bind(update.last_sync_at)
    .bind(update.synced_delta)
    .bind(update.synced_delta)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

//! Domain rows shared across the store, the sync engine and the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Individual alias account. One or more aliases share a `group_id` and the
/// group's single token row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    /// Database identifier.
    pub id: i64,
    /// Stable group key; all per-group state hangs off this.
    pub group_id: String,
    pub email: String,
    pub password: String,
    /// One of `not-logged-in`, `success`, `failure`, `password-error`,
    /// `phone-verify`.
    pub status: String,
    /// Tombstone flag; groups are never hard-deleted.
    pub is_deleted: i64,
}

/// The group's OAuth token triple. Exactly one row per group; `refresh_token`
/// is never null once the row exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenRecord {
    pub group_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: Option<String>,
    /// Access-token expiry, epoch seconds.
    pub at_expires_at: i64,
    /// Refresh-token expiry, epoch seconds.
    pub rt_expires_at: i64,
    pub scope: Option<String>,
    pub tenant_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Provider folder with local sync cursor state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailFolder {
    /// Provider-assigned folder id.
    pub folder_id: String,
    pub group_id: String,
    pub display_name: String,
    /// Provider canonical name for system folders (inbox, sentitems, ...).
    pub well_known_name: Option<String>,
    pub parent_folder_id: Option<String>,
    pub total_count: i64,
    pub unread_count: i64,
    /// Opaque change-tracking cursor; replaced only after the page chain that
    /// consumed it completed.
    pub delta_link: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub synced_count: i64,
}

/// Message summary row. Unique on `(group_id, msg_uid)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailMessage {
    pub id: i64,
    pub group_id: String,
    pub account_id: Option<i64>,
    /// Provider-unique message id.
    pub msg_uid: String,
    /// RFC internet message id.
    pub msg_id: Option<String>,
    pub subject: String,
    pub from_addr: String,
    pub from_name: String,
    /// Comma-separated recipient list.
    pub to_joined: String,
    pub folder_id: Option<String>,
    pub sent_at: Option<String>,
    pub received_at: Option<String>,
    pub size_bytes: i64,
    pub has_attachments: i64,
    /// Semicolon-separated flag set, e.g. `Flagged;Read`.
    pub flags: String,
    pub snippet: String,
}

/// Lazily-downloaded message body, keyed by the summary row id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailBody {
    pub message_id: i64,
    pub headers: Option<String>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
}

/// Attachment metadata; the bytes themselves are never stored by the core.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailAttachment {
    pub message_id: i64,
    pub attachment_id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: i64,
    pub is_inline: i64,
    pub content_id: Option<String>,
    pub download_status: Option<String>,
}

/// Append-only audit snapshot of a group's account state, used for restore.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VersionSnapshot {
    pub id: i64,
    pub group_id: String,
    pub version: i64,
    /// All aliases of the group at snapshot time, JSON array.
    pub emails_snapshot_json: String,
    pub password: Option<String>,
    pub status: Option<String>,
    pub username: Option<String>,
    pub birthday: Option<String>,
    pub recovery_emails_json: String,
    pub recovery_phones_json: String,
    pub note: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Authorization edge: a non-admin user sees only messages whose account
/// appears in their assignment set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectAssignment {
    pub project_id: i64,
    pub account_id: i64,
    pub user_id: i64,
}

/// Paged query result shared by the mail search operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, size: i64) -> Self {
        let pages = if size > 0 { (total + size - 1) / size } else { 0 };
        Self {
            items,
            total,
            page,
            size,
            pages,
        }
    }
}

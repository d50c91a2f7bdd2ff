//! Search, read and flag operations over the local message store.
//!
//! Authorization model: admins see everything; other users see only
//! messages whose account appears in their project-assignment set. The
//! permission check is a single probe against the assignment edge, not a
//! join on every row.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::models::{MailAttachment, MailBody, MailMessage, Page};
use crate::runtime::UserRole;
use crate::store::{Store, StoreError};

/// Columns returned by list queries; bodies stay out of search results.
const SUMMARY_COLUMNS: &str = "id, group_id, account_id, msg_uid, msg_id, subject, from_addr, \
from_name, to_joined, folder_id, sent_at, received_at, size_bytes, has_attachments, flags, snippet";

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub role: UserRole,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Search parameters; everything optional except paging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailSearchRequest {
    /// Keyword matched against subject, sender and recipients.
    pub query: Option<String>,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub folder_id: Option<String>,
    pub has_attachments: Option<bool>,
    pub is_unread: Option<bool>,
    pub is_flagged: Option<bool>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: i64,
    pub size: i64,
}

impl MailSearchRequest {
    fn page(&self) -> i64 {
        self.page.max(1)
    }

    fn size(&self) -> i64 {
        if self.size <= 0 {
            50
        } else {
            self.size.min(200)
        }
    }
}

/// Full message view: summary plus lazily-downloaded parts.
#[derive(Debug, Clone, Serialize)]
pub struct MailDetail {
    pub message: MailMessage,
    pub body: Option<MailBody>,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagAction {
    Add,
    Remove,
}

#[derive(Clone)]
pub struct MailService {
    store: Store,
}

impl MailService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// One summary row, group-scoped.
    pub async fn get_message(
        &self,
        group_id: &str,
        message_id: i64,
    ) -> Result<Option<MailMessage>, StoreError> {
        let message = sqlx::query_as::<_, MailMessage>(&format!(
            "SELECT {} FROM mail_message WHERE group_id = ? AND id = ?",
            SUMMARY_COLUMNS
        ))
        .bind(group_id)
        .bind(message_id)
        .fetch_optional(self.store.pool())
        .await?;

        Ok(message)
    }

    /// Summary plus body and attachments, if downloaded.
    pub async fn get_detail(&self, message_id: i64) -> Result<Option<MailDetail>, StoreError> {
        let message = sqlx::query_as::<_, MailMessage>(&format!(
            "SELECT {} FROM mail_message WHERE id = ?",
            SUMMARY_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(message) = message else {
            return Ok(None);
        };

        let body = sqlx::query_as::<_, MailBody>(
            "SELECT message_id, headers, body_plain, body_html FROM mail_body WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(self.store.pool())
        .await?;

        let attachments = sqlx::query_as::<_, MailAttachment>(
            "SELECT message_id, attachment_id, filename, content_type, size, is_inline, \
                    content_id, download_status \
             FROM mail_attachment WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(self.store.pool())
        .await?;

        Ok(Some(MailDetail {
            message,
            body,
            attachments,
        }))
    }

    /// True when the user holds any assignment on an account of the group.
    pub async fn has_group_permission(
        &self,
        group_id: &str,
        user_id: i64,
    ) -> Result<bool, StoreError> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM accounts a \
             JOIN project_assignments pa ON a.id = pa.account_id \
             WHERE a.group_id = ? AND pa.user_id = ? LIMIT 1",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(self.store.pool())
        .await?;

        Ok(found.is_some())
    }

    /// Search one group's messages, permission-gated for non-admins.
    pub async fn search_group(
        &self,
        group_id: &str,
        search: &MailSearchRequest,
        user: &CurrentUser,
    ) -> Result<Page<MailMessage>, StoreError> {
        if !user.is_admin() && !self.has_group_permission(group_id, user.id).await? {
            return Ok(Page::new(Vec::new(), 0, search.page(), search.size()));
        }

        self.execute_search(
            |qb| {
                qb.push("group_id = ").push_bind(group_id.to_string());
            },
            search,
        )
        .await
    }

    /// Search across groups, scoped by role and optional project:
    /// admin + project sees the project's accounts, admin alone sees all,
    /// a member sees their assigned accounts (optionally within a project).
    pub async fn search_all(
        &self,
        search: &MailSearchRequest,
        user: &CurrentUser,
        project_id: Option<i64>,
    ) -> Result<Page<MailMessage>, StoreError> {
        let user_id = user.id;
        let admin = user.is_admin();

        self.execute_search(
            move |qb| match (admin, project_id) {
                (true, Some(project)) => {
                    qb.push(
                        "account_id IN (SELECT account_id FROM project_assignments WHERE project_id = ",
                    )
                    .push_bind(project)
                    .push(")");
                }
                (true, None) => {
                    qb.push("1 = 1");
                }
                (false, Some(project)) => {
                    qb.push(
                        "account_id IN (SELECT account_id FROM project_assignments WHERE user_id = ",
                    )
                    .push_bind(user_id)
                    .push(" AND project_id = ")
                    .push_bind(project)
                    .push(")");
                }
                (false, None) => {
                    qb.push(
                        "account_id IN (SELECT account_id FROM project_assignments WHERE user_id = ",
                    )
                    .push_bind(user_id)
                    .push(")");
                }
            },
            search,
        )
        .await
    }

    /// Add or remove one flag on a set of messages. Only rows whose flag set
    /// actually changes are written. Returns the number updated.
    pub async fn batch_update_flags(
        &self,
        group_id: &str,
        message_ids: &[i64],
        action: FlagAction,
        flag: &str,
    ) -> Result<usize, StoreError> {
        if message_ids.is_empty() || flag.is_empty() {
            return Ok(0);
        }

        let mut conn = self.store.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, flags FROM mail_message WHERE group_id = ");
        qb.push_bind(group_id).push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in message_ids {
            separated.push_bind(*id);
        }
        qb.push(")");

        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&mut *tx).await?;

        let mut updated = 0;
        for (id, flags) in rows {
            if let Some(new_flags) = apply_flag(&flags, action, flag) {
                sqlx::query("UPDATE mail_message SET flags = ? WHERE id = ?")
                    .bind(&new_flags)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                updated += 1;
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    /// Delete a set of messages, group-checked so a caller can never delete
    /// across groups. Bodies and attachment metadata go with them.
    pub async fn batch_delete(
        &self,
        group_id: &str,
        message_ids: &[i64],
    ) -> Result<usize, StoreError> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.store.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM mail_message WHERE group_id = ");
        qb.push_bind(group_id).push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in message_ids {
            separated.push_bind(*id);
        }
        qb.push(")");
        let owned: Vec<(i64,)> = qb.build_query_as().fetch_all(&mut *tx).await?;

        let mut deleted = 0;
        for (id,) in owned {
            sqlx::query("DELETE FROM mail_body WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM mail_attachment WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM mail_message WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += 1;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn execute_search<B>(
        &self,
        base_condition: B,
        search: &MailSearchRequest,
    ) -> Result<Page<MailMessage>, StoreError>
    where
        B: Fn(&mut QueryBuilder<'_, Sqlite>) + Send + Sync,
    {
        let page = search.page();
        let size = search.size();

        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM mail_message WHERE ");
        base_condition(&mut count_builder);
        push_search_filters(&mut count_builder, search);

        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(self.store.pool())
            .await?;

        let mut data_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM mail_message WHERE ",
            SUMMARY_COLUMNS
        ));
        base_condition(&mut data_builder);
        push_search_filters(&mut data_builder, search);
        data_builder.push(" ORDER BY received_at DESC");
        data_builder.push(" LIMIT ").push_bind(size);
        data_builder
            .push(" OFFSET ")
            .push_bind((page - 1) * size);

        let items = data_builder
            .build_query_as::<MailMessage>()
            .fetch_all(self.store.pool())
            .await?;

        Ok(Page::new(items, total, page, size))
    }
}

fn push_search_filters(qb: &mut QueryBuilder<'_, Sqlite>, search: &MailSearchRequest) {
    if let Some(query) = &search.query {
        let term = format!("%{}%", query);
        qb.push(" AND (subject LIKE ")
            .push_bind(term.clone())
            .push(" OR from_addr LIKE ")
            .push_bind(term.clone())
            .push(" OR to_joined LIKE ")
            .push_bind(term)
            .push(")");
    }
    if let Some(subject) = &search.subject {
        qb.push(" AND subject LIKE ")
            .push_bind(format!("%{}%", subject));
    }
    if let Some(from_addr) = &search.from_addr {
        qb.push(" AND from_addr LIKE ")
            .push_bind(format!("%{}%", from_addr));
    }
    if let Some(to_addr) = &search.to_addr {
        qb.push(" AND to_joined LIKE ")
            .push_bind(format!("%{}%", to_addr));
    }
    if let Some(folder_id) = &search.folder_id {
        qb.push(" AND folder_id = ").push_bind(folder_id.clone());
    }
    if let Some(has_attachments) = search.has_attachments {
        if has_attachments {
            qb.push(" AND has_attachments > 0");
        } else {
            qb.push(" AND has_attachments = 0");
        }
    }
    // Flag matches are anchored on the ';' delimiter: LIKE is ASCII
    // case-insensitive, so a bare '%Read%' would also match the UNREAD
    // sentinel.
    if let Some(is_unread) = search.is_unread {
        if is_unread {
            qb.push(" AND (';' || flags || ';') NOT LIKE '%;Read;%'");
        } else {
            qb.push(" AND (';' || flags || ';') LIKE '%;Read;%'");
        }
    }
    if let Some(is_flagged) = search.is_flagged {
        if is_flagged {
            qb.push(" AND (';' || flags || ';') LIKE '%;Flagged;%'");
        } else {
            qb.push(" AND (';' || flags || ';') NOT LIKE '%;Flagged;%'");
        }
    }
    if let Some(date_from) = &search.date_from {
        qb.push(" AND received_at >= ").push_bind(date_from.clone());
    }
    if let Some(date_to) = &search.date_to {
        qb.push(" AND received_at <= ").push_bind(date_to.clone());
    }
}

/// Apply one flag mutation to a semicolon-joined flag set. Returns the new
/// string only when the set actually changed; the stored order is sorted so
/// equal sets compare equal.
fn apply_flag(current: &str, action: FlagAction, flag: &str) -> Option<String> {
    let mut flags: Vec<&str> = current
        .split(';')
        .filter(|f| !f.is_empty() && *f != "UNREAD")
        .collect();

    let present = flags.contains(&flag);
    match action {
        FlagAction::Add if !present => flags.push(flag),
        FlagAction::Remove if present => flags.retain(|f| *f != flag),
        _ => return None,
    }

    flags.sort_unstable();
    if flags.is_empty() {
        Some("UNREAD".to_string())
    } else {
        Some(flags.join(";"))
    }
}

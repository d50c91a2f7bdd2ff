//! Write-behind writer daemon.
//!
//! A long-lived loop that drains the write queue and bulk-writes to the
//! store. A flush fires when the buffer reaches [`BATCH_SIZE`] or when
//! [`FLUSH_INTERVAL`] has passed since the last one, whichever comes first;
//! an empty buffer never flushes. Each flush is one transaction: either
//! every item of the batch lands or the whole batch goes back to the
//! consumer end of the queue in its original order. Batches that keep
//! failing are moved to the dead-letter list for human attention.

use std::time::Duration;

use sqlx::{QueryBuilder, Sqlite};
use tokio::time::Instant;

use crate::broker::{keys, Broker};
use crate::store::{Store, StoreError};
use crate::writeop::{AttachmentRecord, BodyRecord, FolderRecord, MessageRecord, WriteOp};

/// Flush once this many items are buffered.
pub const BATCH_SIZE: usize = 500;
/// Flush a non-empty buffer at least this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
/// Sleep when the queue is empty, to avoid a busy loop.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// After this many consecutive failed flushes the batch is dead-lettered.
const MAX_FLUSH_ATTEMPTS: u32 = 5;
/// Rows per bulk statement; keeps bind counts well under sqlite's limit.
const ROWS_PER_STATEMENT: usize = 100;

pub struct WriterDaemon {
    store: Store,
    broker: Broker,
}

impl WriterDaemon {
    pub fn new(store: Store, broker: Broker) -> Self {
        Self { store, broker }
    }

    /// Run the drain loop forever.
    pub async fn run(self) -> ! {
        log::info!("writer daemon started");

        let mut buffer: Vec<String> = Vec::with_capacity(BATCH_SIZE);
        let mut last_flush = Instant::now();
        let mut consecutive_failures: u32 = 0;

        loop {
            match self.broker.rpop(keys::WRITE_QUEUE).await {
                Ok(Some(raw)) => buffer.push(raw),
                Ok(None) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    log::error!("writer: queue pop failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            }

            let batch_full = buffer.len() >= BATCH_SIZE;
            let timed_out = !buffer.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL;
            if !(batch_full || timed_out) {
                continue;
            }

            match self.flush(&buffer).await {
                Ok(written) => {
                    log::info!("writer: flushed {} records", written);
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::error!(
                        "writer: flush failed (attempt {}): {}",
                        consecutive_failures,
                        e
                    );
                    if consecutive_failures >= MAX_FLUSH_ATTEMPTS {
                        self.dead_letter(&buffer).await;
                        consecutive_failures = 0;
                    } else {
                        self.requeue(&buffer).await;
                        // Back off before the batch comes around again.
                        tokio::time::sleep(Duration::from_secs(
                            consecutive_failures as u64,
                        ))
                        .await;
                    }
                }
            }

            buffer.clear();
            last_flush = Instant::now();
        }
    }

    /// Decode, group and write one batch in a single transaction.
    pub async fn flush(&self, raw_items: &[String]) -> Result<usize, StoreError> {
        let (ops, discarded) = partition(raw_items);
        if discarded > 0 {
            log::warn!("writer: discarded {} malformed queue items", discarded);
        }
        if ops.is_empty() {
            return Ok(0);
        }
        write_ops(&self.store, &ops).await
    }

    /// Put a failed batch back at the consumer end, preserving pop order:
    /// the item popped first must pop first again, so it is pushed last.
    async fn requeue(&self, raw_items: &[String]) {
        let reversed: Vec<String> = raw_items.iter().rev().cloned().collect();
        if let Err(e) = self.broker.rpush_many(keys::WRITE_QUEUE, &reversed).await {
            log::error!("writer: requeue failed, {} items at risk: {}", raw_items.len(), e);
        } else {
            log::warn!("writer: requeued {} items", raw_items.len());
        }
    }

    async fn dead_letter(&self, raw_items: &[String]) {
        log::error!(
            "writer: moving {} items to dead-letter list after {} failed flushes",
            raw_items.len(),
            MAX_FLUSH_ATTEMPTS
        );
        if let Err(e) = self.broker.lpush_many(keys::WRITE_FAILED, raw_items).await {
            log::error!("writer: dead-letter push failed: {}", e);
        }
    }
}

/// Decode raw queue items, dropping malformed ones.
pub fn partition(raw_items: &[String]) -> (Vec<WriteOp>, usize) {
    let mut ops = Vec::with_capacity(raw_items.len());
    let mut discarded = 0;

    for raw in raw_items {
        match WriteOp::decode(raw) {
            Ok(op) => ops.push(op),
            Err(e) => {
                log::error!("writer: dropping malformed item: {}", e);
                discarded += 1;
            }
        }
    }

    (ops, discarded)
}

/// Write a decoded batch: group by table, one transaction, one bulk
/// statement per table chunk. `REPLACE` for bodies, `IGNORE` elsewhere.
pub async fn write_ops(store: &Store, ops: &[WriteOp]) -> Result<usize, StoreError> {
    let mut messages: Vec<&MessageRecord> = Vec::new();
    let mut bodies: Vec<&BodyRecord> = Vec::new();
    let mut attachments: Vec<&AttachmentRecord> = Vec::new();
    let mut folders: Vec<&FolderRecord> = Vec::new();

    for op in ops {
        match op {
            WriteOp::InsertMessage(r) => messages.push(r),
            WriteOp::UpsertBody(r) => bodies.push(r),
            WriteOp::InsertAttachment(r) => attachments.push(r),
            WriteOp::InsertFolder(r) => folders.push(r),
        }
    }

    let mut conn = store.acquire().await?;
    let mut tx = conn.begin().await?;

    for chunk in messages.chunks(ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO mail_message \
             (group_id, account_id, msg_uid, msg_id, subject, from_addr, from_name, \
              to_joined, folder_id, sent_at, received_at, size_bytes, has_attachments, \
              flags, snippet, created_at, updated_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(&r.group_id)
                .push_bind(r.account_id)
                .push_bind(&r.msg_uid)
                .push_bind(&r.msg_id)
                .push_bind(&r.subject)
                .push_bind(&r.from_addr)
                .push_bind(&r.from_name)
                .push_bind(&r.to_joined)
                .push_bind(&r.folder_id)
                .push_bind(&r.sent_at)
                .push_bind(&r.received_at)
                .push_bind(r.size_bytes)
                .push_bind(r.has_attachments)
                .push_bind(&r.flags)
                .push_bind(&r.snippet)
                .push_bind(&r.created_at)
                .push_bind(&r.updated_at);
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in bodies.chunks(ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR REPLACE INTO mail_body (message_id, headers, body_plain, body_html) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.message_id)
                .push_bind(&r.headers)
                .push_bind(&r.body_plain)
                .push_bind(&r.body_html);
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in attachments.chunks(ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO mail_attachment \
             (message_id, attachment_id, filename, content_type, size, is_inline, \
              content_id, download_status) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.message_id)
                .push_bind(&r.attachment_id)
                .push_bind(&r.filename)
                .push_bind(&r.content_type)
                .push_bind(r.size)
                .push_bind(r.is_inline)
                .push_bind(&r.content_id)
                .push_bind(&r.download_status);
        });
        qb.build().execute(&mut *tx).await?;
    }

    for chunk in folders.chunks(ROWS_PER_STATEMENT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO mail_folders \
             (folder_id, group_id, display_name, well_known_name, parent_folder_id, \
              total_count, unread_count, updated_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(&r.folder_id)
                .push_bind(&r.group_id)
                .push_bind(&r.display_name)
                .push_bind(&r.well_known_name)
                .push_bind(&r.parent_folder_id)
                .push_bind(r.total_count)
                .push_bind(r.unread_count)
                .push_bind(&r.updated_at);
        });
        qb.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    Ok(messages.len() + bodies.len() + attachments.len() + folders.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(uid: &str) -> WriteOp {
        let stamp = Utc::now().to_rfc3339();
        WriteOp::InsertMessage(MessageRecord {
            group_id: "g1".to_string(),
            account_id: None,
            msg_uid: uid.to_string(),
            msg_id: Some(format!("<{}@example.com>", uid)),
            subject: "s".to_string(),
            from_addr: "a@example.com".to_string(),
            from_name: "A".to_string(),
            to_joined: "b@example.com".to_string(),
            folder_id: Some("f1".to_string()),
            sent_at: None,
            received_at: Some(stamp.clone()),
            size_bytes: 0,
            has_attachments: 0,
            flags: "UNREAD".to_string(),
            snippet: String::new(),
            created_at: stamp.clone(),
            updated_at: stamp,
        })
    }

    fn body(message_id: i64, html: &str) -> WriteOp {
        WriteOp::UpsertBody(BodyRecord {
            message_id,
            headers: Some("Subject: s".to_string()),
            body_plain: None,
            body_html: Some(html.to_string()),
        })
    }

    fn attachment(message_id: i64, attachment_id: &str) -> WriteOp {
        WriteOp::InsertAttachment(AttachmentRecord {
            message_id,
            attachment_id: attachment_id.to_string(),
            filename: "report.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            size: 2048,
            is_inline: 0,
            content_id: None,
            download_status: None,
        })
    }

    #[test]
    fn malformed_items_are_discarded_not_fatal() {
        let raw = vec![
            message("u1").encode().unwrap(),
            "{not json".to_string(),
            r#"{"table":"mail_unknown","data":{}}"#.to_string(),
        ];
        let (ops, discarded) = partition(&raw);
        assert_eq!(ops.len(), 1);
        assert_eq!(discarded, 2);
    }

    #[tokio::test]
    async fn batch_is_written_atomically_and_grouped() {
        let store = Store::in_memory().await.expect("store");
        let ops = vec![message("u1"), message("u2"), body(1, "<p>one</p>")];

        let written = write_ops(&store, &ops).await.expect("write");
        assert_eq!(written, 3);

        let (messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_message")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(messages, 2);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let store = Store::in_memory().await.expect("store");
        let ops = vec![message("u1"), body(1, "<p>first</p>"), attachment(1, "att-1")];

        write_ops(&store, &ops).await.expect("first write");
        // Same batch again, body updated: message and attachment dedupe,
        // body replaces.
        let ops = vec![message("u1"), body(1, "<p>second</p>"), attachment(1, "att-1")];
        write_ops(&store, &ops).await.expect("second write");

        let (messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_message")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(messages, 1);

        let (html,): (String,) =
            sqlx::query_as("SELECT body_html FROM mail_body WHERE message_id = 1")
                .fetch_one(store.pool())
                .await
                .expect("body");
        assert_eq!(html, "<p>second</p>");

        let (attachments,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM mail_attachment WHERE message_id = 1")
                .fetch_one(store.pool())
                .await
                .expect("attachments");
        assert_eq!(attachments, 1);
    }

    #[tokio::test]
    async fn folder_ops_create_rows_without_clobbering() {
        let store = Store::in_memory().await.expect("store");
        let folder = WriteOp::InsertFolder(FolderRecord {
            folder_id: "f1".to_string(),
            group_id: "g1".to_string(),
            display_name: "Inbox".to_string(),
            well_known_name: Some("inbox".to_string()),
            parent_folder_id: None,
            total_count: 5,
            unread_count: 1,
            updated_at: Utc::now().to_rfc3339(),
        });

        write_ops(&store, &[folder.clone()]).await.expect("first");
        write_ops(&store, &[folder]).await.expect("second");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_folders")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }
}

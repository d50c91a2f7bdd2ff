//! Batch body download.
//!
//! A composite worker: resolve which of the requested messages still lack a
//! body, fetch one access token per group and reuse it across that group's
//! downloads, then fan the per-message fetches out with bounded concurrency.
//! Results flow through the write queue like everything else; partial
//! failures are recorded and do not abort peers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{keys, Broker};
use crate::error::TaskError;
use crate::graph::{GraphClient, MessageDetail};
use crate::store::{Store, StoreError};
use crate::token::{TokenError, TokenManager};
use crate::writeop::{AttachmentRecord, BodyRecord, WriteOp};

/// Aggregate counts returned as the task's final result.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DownloadReport {
    pub requested: usize,
    /// Bodies that already existed locally.
    pub skipped: usize,
    pub downloaded: usize,
    /// group_id -> message ids that could not be authorized.
    pub auth_errors: HashMap<String, Vec<i64>>,
    pub download_errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingDownload {
    message_id: i64,
    msg_uid: String,
    group_id: String,
}

pub struct BatchDownloader {
    store: Store,
    broker: Broker,
    tokens: TokenManager,
    graph: GraphClient,
    fanout: usize,
}

impl BatchDownloader {
    pub fn new(
        store: Store,
        broker: Broker,
        tokens: TokenManager,
        graph: GraphClient,
        fanout: usize,
    ) -> Self {
        Self {
            store,
            broker,
            tokens,
            graph,
            fanout: fanout.max(1),
        }
    }

    pub async fn run<F>(
        &self,
        message_ids: &[i64],
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<DownloadReport, TaskError>
    where
        F: Fn(&str) + Send + Sync,
    {
        let mut report = DownloadReport {
            requested: message_ids.len(),
            ..DownloadReport::default()
        };
        if message_ids.is_empty() {
            return Ok(report);
        }

        let pending = self.resolve_pending(message_ids).await?;
        report.skipped = message_ids.len() - pending.len();
        if pending.is_empty() {
            progress("all requested bodies already present");
            return Ok(report);
        }

        // One token per group, reused for every download of that group.
        let mut by_group: HashMap<String, Vec<PendingDownload>> = HashMap::new();
        for item in pending {
            by_group.entry(item.group_id.clone()).or_default().push(item);
        }

        let mut authorized: Vec<(PendingDownload, String)> = Vec::new();
        for (group_id, items) in by_group {
            match self.tokens.access_token(&group_id).await {
                Ok(token) => {
                    for item in items {
                        authorized.push((item, token.clone()));
                    }
                }
                Err(e) => {
                    log::warn!("download: auth failed for group {}: {}", group_id, e);
                    // Store failures should fail the task rather than
                    // masquerade as an auth problem.
                    if let TokenError::Store(inner) = e {
                        return Err(inner.into());
                    }
                    report
                        .auth_errors
                        .insert(group_id, items.into_iter().map(|i| i.message_id).collect());
                }
            }
        }

        let total = authorized.len();
        let semaphore = Arc::new(Semaphore::new(self.fanout));
        let mut join_set: JoinSet<(PendingDownload, Result<MessageDetail, String>)> =
            JoinSet::new();

        for (item, token) in authorized {
            if cancel.is_cancelled() {
                join_set.abort_all();
                return Err(TaskError::Cancelled);
            }
            let semaphore = semaphore.clone();
            let graph = self.graph.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = graph
                    .get_message(&token, &item.msg_uid)
                    .await
                    .map_err(|e| e.to_string());
                (item, result)
            });
        }

        let mut completed = 0;
        while let Some(joined) = join_set.join_next().await {
            let (item, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    report.download_errors.push(format!("worker panicked: {}", e));
                    continue;
                }
            };
            completed += 1;

            match result {
                Ok(detail) => {
                    self.queue_result(&item, &detail).await?;
                    report.downloaded += 1;
                }
                Err(e) => {
                    report
                        .download_errors
                        .push(format!("message {}: {}", item.message_id, e));
                }
            }

            progress(&format!("downloaded {}/{}", completed, total));
        }

        Ok(report)
    }

    /// Requested ids that have a summary row but no body yet.
    async fn resolve_pending(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<PendingDownload>, TaskError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT m.id, m.msg_uid, m.group_id \
             FROM mail_message m \
             LEFT JOIN mail_body b ON b.message_id = m.id \
             WHERE b.message_id IS NULL AND m.id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in message_ids {
            separated.push_bind(*id);
        }
        qb.push(")");

        let rows: Vec<(i64, String, String)> = qb
            .build_query_as()
            .fetch_all(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|(message_id, msg_uid, group_id)| PendingDownload {
                message_id,
                msg_uid,
                group_id,
            })
            .collect())
    }

    /// Serialize one download result: one body row plus its attachments.
    async fn queue_result(
        &self,
        item: &PendingDownload,
        detail: &MessageDetail,
    ) -> Result<(), TaskError> {
        let (body_plain, body_html) = match detail.body.as_ref() {
            Some(body) => {
                let content = body.content.clone().unwrap_or_default();
                if body
                    .content_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case("text"))
                    .unwrap_or(false)
                {
                    (Some(content), None)
                } else {
                    (None, Some(content))
                }
            }
            None => (None, None),
        };

        let mut items = vec![WriteOp::UpsertBody(BodyRecord {
            message_id: item.message_id,
            headers: Some(detail.headers_text()),
            body_plain,
            body_html,
        })];

        for attachment in &detail.attachments {
            items.push(WriteOp::InsertAttachment(AttachmentRecord {
                message_id: item.message_id,
                attachment_id: attachment.id.clone(),
                filename: attachment.name.clone(),
                content_type: attachment.content_type.clone(),
                size: attachment.size,
                is_inline: if attachment.is_inline { 1 } else { 0 },
                content_id: attachment.content_id.clone(),
                download_status: None,
            }));
        }

        let encoded: Vec<String> = items
            .iter()
            .filter_map(|op| match op.encode() {
                Ok(raw) => Some(raw),
                Err(e) => {
                    log::error!("download: encode failed for {}: {}", item.message_id, e);
                    None
                }
            })
            .collect();

        self.broker.lpush_many(keys::WRITE_QUEUE, &encoded).await?;
        Ok(())
    }
}

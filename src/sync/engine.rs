use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::folders::{self, FolderStateUpdate};
use super::normalize::normalize_message;
use crate::broker::{keys, Broker, BrokerError};
use crate::graph::{
    extract_skip_token, GraphClient, GraphError, ListMessagesRequest, MessagePage, RemoteFolder,
};
use crate::models::MailFolder;
use crate::store::{Store, StoreError};
use crate::writeop::WriteOp;

/// Provider page size for message listings.
const PAGE_SIZE: u32 = 50;
/// Top-limit for folder listings; the root rarely has more.
const FOLDER_LIST_TOP: u32 = 100;
/// Safety cap: a single folder never fetches more than this many pages in
/// one round.
const MAX_BATCHES_PER_FOLDER: usize = 50;
/// Transient provider errors are retried this many times per page.
const FETCH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("group {0} has no local folders")]
    NoFolders(String),
    #[error("sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Provider(#[from] GraphError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Auto,
    Full,
    Delta,
    Incremental,
    Recent,
    Check,
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(SyncStrategy::Auto),
            "full" => Ok(SyncStrategy::Full),
            "delta" => Ok(SyncStrategy::Delta),
            "incremental" => Ok(SyncStrategy::Incremental),
            "recent" => Ok(SyncStrategy::Recent),
            "check" => Ok(SyncStrategy::Check),
            other => Err(format!("unknown sync strategy: {}", other)),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStrategy::Auto => "auto",
            SyncStrategy::Full => "full",
            SyncStrategy::Delta => "delta",
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Recent => "recent",
            SyncStrategy::Check => "check",
        };
        f.write_str(name)
    }
}

/// Outcome of one sync round over a group.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Folder rows written during discovery.
    pub folders: usize,
    /// Messages queued for persistence.
    pub synced: usize,
    /// Messages fetched from the provider (queued or skipped).
    pub fetched: usize,
    /// Per-folder failures; the round continues past them.
    pub errors: Vec<String>,
}

/// Synchronizes one account group per invocation.
#[derive(Clone)]
pub struct SyncEngine {
    store: Store,
    broker: Broker,
    graph: GraphClient,
    recent_window_days: i64,
}

impl SyncEngine {
    pub fn new(store: Store, broker: Broker, graph: GraphClient, recent_window_days: i64) -> Self {
        Self {
            store,
            broker,
            graph,
            recent_window_days,
        }
    }

    /// Walk the provider folder tree breadth-first and upsert it. Hidden
    /// folders are excluded; a folder reachable twice (a cycle through
    /// parent pointers) is ingested once and the duplicate edge dropped.
    pub async fn discover_folders(
        &self,
        group_id: &str,
        access_token: &str,
    ) -> Result<Vec<RemoteFolder>, SyncError> {
        let root = self
            .graph
            .list_mail_folders(access_token, FOLDER_LIST_TOP)
            .await?;

        let mut worklist: Vec<RemoteFolder> = root.value;
        let mut seen: HashSet<String> = worklist.iter().map(|f| f.id.clone()).collect();
        let mut index = 0;

        while index < worklist.len() {
            let current = worklist[index].clone();
            index += 1;

            if current.child_folder_count > 0 {
                match self
                    .graph
                    .list_child_folders(access_token, &current.id, FOLDER_LIST_TOP)
                    .await
                {
                    Ok(page) => {
                        for child in page.value {
                            if child.is_hidden {
                                continue;
                            }
                            if !seen.insert(child.id.clone()) {
                                log::warn!(
                                    "folder {} reachable twice under group {}, dropping duplicate edge",
                                    child.id,
                                    group_id
                                );
                                continue;
                            }
                            worklist.push(child);
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "listing children of folder {} failed: {}",
                            current.id,
                            e
                        );
                    }
                }
            }
        }

        worklist.retain(|f| !f.is_hidden);
        folders::upsert_folder_tree(&self.store, group_id, &worklist).await?;

        log::info!(
            "group {}: discovered {} folders",
            group_id,
            worklist.len()
        );
        Ok(worklist)
    }

    /// Run one sync round over the group with the requested strategy.
    pub async fn sync_group<F>(
        &self,
        group_id: &str,
        access_token: &str,
        strategy: SyncStrategy,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<SyncReport, SyncError>
    where
        F: Fn(&str) + Send + Sync,
    {
        if strategy == SyncStrategy::Check {
            return self.liveness_check(access_token).await;
        }

        progress(&format!("discovering folders (strategy {})", strategy));
        let discovered = self.discover_folders(group_id, access_token).await?;

        let local_folders = folders::load_group_folders(&self.store, group_id).await?;
        if local_folders.is_empty() {
            return Err(SyncError::NoFolders(group_id.to_string()));
        }

        let account_id = self.primary_account_id(group_id).await?;
        let round_start = Utc::now();

        let mut report = SyncReport {
            folders: discovered.len(),
            ..SyncReport::default()
        };

        for folder in &local_folders {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if folder.total_count == 0 {
                // Nothing to fetch, but the folder still took part in the
                // round, so its sync time advances.
                folders::update_folder_state(
                    &self.store,
                    folder,
                    &FolderStateUpdate {
                        last_sync_at: round_start,
                        synced_delta: 0,
                        delta_link: None,
                    },
                )
                .await?;
                continue;
            }

            let effective = effective_strategy(strategy, folder);
            progress(&format!(
                "syncing folder {} ({})",
                folder.display_name, effective
            ));

            let result = match effective {
                SyncStrategy::Delta => {
                    self.sync_folder_delta(
                        group_id,
                        access_token,
                        account_id,
                        folder,
                        round_start,
                        cancel,
                    )
                    .await
                }
                SyncStrategy::Incremental => {
                    let since = folder
                        .last_sync_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    self.sync_folder_pages(
                        group_id,
                        access_token,
                        account_id,
                        folder,
                        Some(format!("receivedDateTime gt {}", since)),
                        round_start,
                        false,
                        cancel,
                    )
                    .await
                }
                SyncStrategy::Recent => {
                    let since = Utc::now() - ChronoDuration::days(self.recent_window_days);
                    self.sync_folder_pages(
                        group_id,
                        access_token,
                        account_id,
                        folder,
                        Some(format!("receivedDateTime gt {}", since.to_rfc3339())),
                        round_start,
                        true,
                        cancel,
                    )
                    .await
                }
                SyncStrategy::Full => {
                    self.sync_folder_pages(
                        group_id,
                        access_token,
                        account_id,
                        folder,
                        None,
                        round_start,
                        true,
                        cancel,
                    )
                    .await
                }
                // Auto resolved above, Check handled before the loop.
                SyncStrategy::Auto | SyncStrategy::Check => unreachable!(),
            };

            match result {
                Ok((synced, fetched)) => {
                    report.synced += synced;
                    report.fetched += fetched;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    let message =
                        format!("folder {} sync failed: {}", folder.display_name, e);
                    log::warn!("group {}: {}", group_id, message);
                    report.errors.push(message);
                }
            }
        }

        progress(&format!(
            "sync complete, {} messages queued ({} errors)",
            report.synced,
            report.errors.len()
        ));
        Ok(report)
    }

    /// One unauthenticated-state probe: a single page, nothing persisted.
    async fn liveness_check(&self, access_token: &str) -> Result<SyncReport, SyncError> {
        let page = self
            .graph
            .list_messages(
                access_token,
                &ListMessagesRequest {
                    folder_id: None,
                    top: 1,
                    orderby: Some("receivedDateTime desc".to_string()),
                    ..ListMessagesRequest::default()
                },
            )
            .await?;

        Ok(SyncReport {
            fetched: page.value.len(),
            ..SyncReport::default()
        })
    }

    /// Delta walk from the folder's stored cursor. The new cursor is saved
    /// only when the chain terminates with a delta link; an aborted or
    /// capped chain leaves the old cursor in place.
    #[allow(clippy::too_many_arguments)]
    async fn sync_folder_delta(
        &self,
        group_id: &str,
        access_token: &str,
        account_id: Option<i64>,
        folder: &MailFolder,
        round_start: chrono::DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), SyncError> {
        let mut link = folder.delta_link.clone();
        let mut new_delta: Option<String> = None;
        let mut synced = 0;
        let mut fetched = 0;

        for _ in 0..MAX_BATCHES_PER_FOLDER {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let page = self
                .fetch_with_retry(|| {
                    self.graph
                        .get_messages_delta(access_token, &folder.folder_id, link.as_deref())
                })
                .await?;

            fetched += page.value.len();
            synced += self
                .queue_messages(group_id, account_id, &page)
                .await?;

            if let Some(delta_link) = page.delta_link {
                new_delta = Some(delta_link);
                break;
            }
            match page.next_link {
                Some(next) => link = Some(next),
                None => break,
            }
        }

        if let Some(delta_link) = new_delta {
            folders::update_folder_state(
                &self.store,
                folder,
                &FolderStateUpdate {
                    last_sync_at: round_start,
                    synced_delta: synced as i64,
                    delta_link: Some(delta_link),
                },
            )
            .await?;
        } else {
            log::warn!(
                "group {}: delta chain for folder {} did not complete, keeping old cursor",
                group_id,
                folder.folder_id
            );
        }

        Ok((synced, fetched))
    }

    /// Shared pagination loop for full, recent and incremental rounds.
    #[allow(clippy::too_many_arguments)]
    async fn sync_folder_pages(
        &self,
        group_id: &str,
        access_token: &str,
        account_id: Option<i64>,
        folder: &MailFolder,
        filter: Option<String>,
        round_start: chrono::DateTime<Utc>,
        probe_delta: bool,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), SyncError> {
        let mut skip_token: Option<String> = None;
        let mut synced = 0;
        let mut fetched = 0;

        for _ in 0..MAX_BATCHES_PER_FOLDER {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let request = ListMessagesRequest {
                folder_id: Some(folder.folder_id.clone()),
                top: PAGE_SIZE,
                filter: filter.clone(),
                orderby: Some("receivedDateTime desc".to_string()),
                skip_token: skip_token.clone(),
            };

            let page = self
                .fetch_with_retry(|| self.graph.list_messages(access_token, &request))
                .await?;

            if page.value.is_empty() {
                break;
            }

            fetched += page.value.len();
            synced += self.queue_messages(group_id, account_id, &page).await?;

            match page.next_link.as_deref().and_then(extract_skip_token) {
                Some(token) => skip_token = Some(token),
                None => break,
            }
        }

        // First successful non-delta round: probe a cursor so future rounds
        // can switch to delta. Some folders do not support it; that is fine.
        let mut delta_link = None;
        if probe_delta {
            match self
                .graph
                .get_messages_delta(access_token, &folder.folder_id, None)
                .await
            {
                Ok(page) => delta_link = page.delta_link,
                Err(e) => {
                    log::debug!(
                        "delta probe for folder {} failed: {}",
                        folder.folder_id,
                        e
                    );
                }
            }
        }

        folders::update_folder_state(
            &self.store,
            folder,
            &FolderStateUpdate {
                last_sync_at: round_start,
                synced_delta: synced as i64,
                delta_link,
            },
        )
        .await?;

        Ok((synced, fetched))
    }

    /// Normalize a page and push it to the write queue in one pipelined
    /// batch. Returns the number of records queued.
    async fn queue_messages(
        &self,
        group_id: &str,
        account_id: Option<i64>,
        page: &MessagePage,
    ) -> Result<usize, SyncError> {
        let now = Utc::now();
        let mut items = Vec::with_capacity(page.value.len());

        for message in &page.value {
            // Delta responses mark deletions; the tombstone carries no
            // message payload worth persisting.
            if message.removed.is_some() {
                log::debug!("skipping removed message {}", message.id);
                continue;
            }
            let record = normalize_message(group_id, account_id, message, now);
            match WriteOp::InsertMessage(record).encode() {
                Ok(encoded) => items.push(encoded),
                Err(e) => log::error!("failed to encode message {}: {}", message.id, e),
            }
        }

        if items.is_empty() {
            return Ok(0);
        }

        self.broker.lpush_many(keys::WRITE_QUEUE, &items).await?;
        Ok(items.len())
    }

    async fn fetch_with_retry<T, Fut, F>(&self, call: F) -> Result<T, GraphError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, GraphError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < FETCH_ATTEMPTS => {
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let backoff = Duration::from_millis(200 * attempt as u64 + jitter);
                    log::warn!(
                        "transient provider error (attempt {}/{}): {}, backing off {:?}",
                        attempt,
                        FETCH_ATTEMPTS,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The group's first account id, attached to message rows for the
    /// assignment-based permission checks.
    async fn primary_account_id(&self, group_id: &str) -> Result<Option<i64>, SyncError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM accounts WHERE group_id = ? AND is_deleted = 0 ORDER BY id LIMIT 1",
        )
        .bind(group_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(row.map(|(id,)| id))
    }
}

/// Resolve `auto` to a concrete per-folder strategy, and degrade strategies
/// whose precondition the folder does not meet.
fn effective_strategy(requested: SyncStrategy, folder: &MailFolder) -> SyncStrategy {
    match requested {
        SyncStrategy::Auto => {
            if folder.delta_link.is_some() {
                SyncStrategy::Delta
            } else if folder.last_sync_at.is_some() {
                SyncStrategy::Incremental
            } else {
                SyncStrategy::Recent
            }
        }
        SyncStrategy::Delta if folder.delta_link.is_none() => {
            if folder.last_sync_at.is_some() {
                SyncStrategy::Incremental
            } else {
                SyncStrategy::Recent
            }
        }
        SyncStrategy::Incremental if folder.last_sync_at.is_none() => SyncStrategy::Recent,
        other => other,
    }
}

//! Worker pool and task lifecycle.
//!
//! Submissions are deduplicated on the task key: while a key has an active
//! task, resubmitting returns the existing task id. Each accepted task runs
//! on the shared tokio pool behind two gates: a process-wide worker cap and
//! the per-user broker counter. A task that cannot take a user slot stays
//! `pending` and retries with jittered backoff; it never fails just for
//! being oversubscribed.
//!
//! Cancellation is cooperative: the status key flips to `cancelled`
//! immediately, the worker's token is triggered, and the worker observes it
//! at its next batch boundary. A worker that finishes anyway never
//! overwrites the cancelled status.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::download::BatchDownloader;
use super::status::StatusStore;
use super::task::{TaskPayload, TaskSpec, TaskState, TaskStatus, TaskType};
use crate::broker::{keys, Broker};
use crate::error::TaskError;
use crate::store::{Store, StoreError};
use crate::sync::{SyncEngine, SyncStrategy};
use crate::token::{CredentialAutomation, LoginRequest, TokenManager};

/// Backoff base while waiting for a user slot.
const SLOT_RETRY_BASE: Duration = Duration::from_millis(500);

struct ActiveTask {
    task_id: String,
    cancel: CancellationToken,
}

/// What a finished task hands back to the pool.
struct TaskOutcome {
    message: String,
    result: Option<serde_json::Value>,
    follow_up: Option<TaskSpec>,
}

impl TaskOutcome {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result: None,
            follow_up: None,
        }
    }
}

struct RuntimeInner {
    store: Store,
    broker: Broker,
    status: StatusStore,
    tokens: TokenManager,
    engine: SyncEngine,
    downloader: BatchDownloader,
    automation: Option<Arc<dyn CredentialAutomation>>,
    active: DashMap<String, ActiveTask>,
    pool_slots: Arc<Semaphore>,
}

/// Handle to the task runtime; cheap to clone.
#[derive(Clone)]
pub struct TaskRuntime {
    inner: Arc<RuntimeInner>,
}

impl TaskRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        broker: Broker,
        tokens: TokenManager,
        engine: SyncEngine,
        downloader: BatchDownloader,
        worker_pool_size: usize,
        automation: Option<Arc<dyn CredentialAutomation>>,
    ) -> Self {
        let status = StatusStore::new(broker.clone());
        Self {
            inner: Arc::new(RuntimeInner {
                store,
                broker,
                status,
                tokens,
                engine,
                downloader,
                automation,
                active: DashMap::new(),
                pool_slots: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            }),
        }
    }

    /// Submit a task. Returns the task id; for a key that already has an
    /// active task, the existing id.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because
    /// `execute` calls back into `submit` for follow-up tasks; two plain
    /// `async fn`s recursing through a spawned boxed future otherwise form
    /// a cycle the compiler can't resolve when proving `Send`.
    pub fn submit(
        &self,
        spec: TaskSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, TaskError>> + Send + '_>>
    {
        Box::pin(async move {
            let key = spec.task_key();

            let (task_id, cancel) = match self.inner.active.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    let existing_id = existing.get().task_id.clone();
                    log::info!(
                        "task key {} already active as {}, returning existing id",
                        key,
                        existing_id
                    );
                    return Ok(existing_id);
                }
                Entry::Vacant(vacant) => {
                    let task_id = Uuid::new_v4().to_string();
                    let cancel = CancellationToken::new();
                    vacant.insert(ActiveTask {
                        task_id: task_id.clone(),
                        cancel: cancel.clone(),
                    });
                    (task_id, cancel)
                }
            };

            let pending = TaskStatus::new(&task_id, TaskState::Pending, "queued");
            if let Err(e) = self
                .inner
                .status
                .set(spec.user_id, spec.task_type(), &spec.group_id, &pending)
                .await
            {
                self.remove_active(&key, &task_id);
                return Err(e.into());
            }

            log::info!(
                "submitted task {} ({}) for group {}",
                task_id,
                key,
                spec.group_id
            );

            let runtime = self.clone();
            let spawned_id = task_id.clone();
            // Boxed as dyn: execute can submit a follow-up task, so the worker
            // future would otherwise be recursively sized.
            let worker: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                Box::pin(async move {
                    runtime.execute(key, spawned_id, spec, cancel).await;
                });
            tokio::spawn(worker);

            Ok(task_id)
        })
    }

    /// Cancel by (user, task type, group). Records `cancelled` and triggers
    /// the worker's token; returns false when no task is active on the key.
    pub async fn cancel(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
    ) -> Result<bool, TaskError> {
        let key = super::task::task_key(task_type, group_id);
        let Some(active) = self.inner.active.get(&key) else {
            return Ok(false);
        };

        let status = TaskStatus::new(&active.task_id, TaskState::Cancelled, "cancelled by user");
        self.inner
            .status
            .set(user_id, task_type, group_id, &status)
            .await?;
        active.cancel.cancel();

        log::info!("cancelled task {} ({})", active.task_id, key);
        Ok(true)
    }

    pub async fn status_of(
        &self,
        user_id: i64,
        task_type: TaskType,
        group_id: &str,
    ) -> Result<Option<TaskStatus>, TaskError> {
        Ok(self.inner.status.get(user_id, task_type, group_id).await?)
    }

    /// Status-list contract with the admin surface.
    pub async fn list_statuses(
        &self,
        user_id: i64,
        task_type: TaskType,
    ) -> Result<Vec<TaskStatus>, TaskError> {
        Ok(self.inner.status.list(user_id, task_type).await?)
    }

    /// Number of keys with an in-process active task.
    pub fn active_tasks(&self) -> usize {
        self.inner.active.len()
    }

    async fn execute(
        &self,
        key: String,
        task_id: String,
        spec: TaskSpec,
        cancel: CancellationToken,
    ) {
        // Process-wide worker cap first; the permit maps one task to one
        // pool worker for its whole run.
        let permit = match self.inner.pool_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let user_key = keys::user_concurrency(spec.user_id);
        let mut slot_held = false;

        while !cancel.is_cancelled() {
            match self.inner.broker.incr(&user_key).await {
                Ok(n) if n <= spec.role.concurrency_cap() => {
                    slot_held = true;
                    break;
                }
                Ok(_) => {
                    // Over cap: give the slot back and retry later. The task
                    // stays pending the whole time.
                    let _ = self.inner.broker.decr(&user_key).await;
                    let jitter = rand::thread_rng().gen_range(0..500);
                    tokio::time::sleep(SLOT_RETRY_BASE + Duration::from_millis(jitter)).await;
                }
                Err(e) => {
                    self.finish(&spec, &task_id, Err(e.into()), &cancel).await;
                    self.remove_active(&key, &task_id);
                    drop(permit);
                    return;
                }
            }
        }

        if !slot_held {
            // Cancelled while pending; the cancelled status is already
            // recorded.
            self.remove_active(&key, &task_id);
            drop(permit);
            return;
        }

        let running = TaskStatus::new(&task_id, TaskState::Running, "running");
        let _ = self
            .inner
            .status
            .set(spec.user_id, spec.task_type(), &spec.group_id, &running)
            .await;

        let result = self.dispatch(&spec, &task_id, &cancel).await;
        let follow_up = match &result {
            Ok(outcome) => outcome.follow_up.clone(),
            Err(_) => None,
        };

        self.finish(&spec, &task_id, result, &cancel).await;

        let _ = self.inner.broker.decr(&user_key).await;
        self.remove_active(&key, &task_id);
        drop(permit);

        if let Some(next) = follow_up {
            if let Err(e) = self.submit(next).await {
                log::warn!("follow-up submission after {} failed: {}", task_id, e);
            }
        }
    }

    /// Dispatch on task type. Progress messages flow through a channel so
    /// the last one is always written before the terminal status.
    async fn dispatch(
        &self,
        spec: &TaskSpec,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let updater = {
            let status = self.inner.status.clone();
            let task_id = task_id.to_string();
            let user_id = spec.user_id;
            let task_type = spec.task_type();
            let group_id = spec.group_id.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let update = TaskStatus::new(&task_id, TaskState::Running, message);
                    if let Err(e) = status.set(user_id, task_type, &group_id, &update).await {
                        log::debug!("progress update for {} failed: {}", task_id, e);
                    }
                }
            })
        };
        let progress = move |message: &str| {
            let _ = tx.send(message.to_string());
        };

        let result = match &spec.payload {
            TaskPayload::Sync { strategy } => {
                self.run_sync(spec, *strategy, cancel, &progress).await
            }
            TaskPayload::SyncFolders => self.run_sync_folders(spec, &progress).await,
            TaskPayload::Download { message_ids } => {
                self.run_download(message_ids, cancel, &progress).await
            }
            TaskPayload::Login { auto_sync } => {
                self.run_login(spec, *auto_sync, cancel, &progress).await
            }
        };

        drop(progress);
        let _ = updater.await;

        result
    }

    async fn run_sync(
        &self,
        spec: &TaskSpec,
        strategy: SyncStrategy,
        cancel: &CancellationToken,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TaskOutcome, TaskError> {
        let token = self.inner.tokens.access_token(&spec.group_id).await?;
        let report = self
            .inner
            .engine
            .sync_group(&spec.group_id, &token, strategy, cancel, progress)
            .await?;

        let message = if report.errors.is_empty() {
            format!("synced {} messages", report.synced)
        } else {
            format!(
                "synced {} messages with {} folder errors",
                report.synced,
                report.errors.len()
            )
        };

        Ok(TaskOutcome {
            message,
            result: Some(serde_json::json!({
                "synced": report.synced,
                "fetched": report.fetched,
                "folders": report.folders,
                "errors": report.errors,
            })),
            follow_up: None,
        })
    }

    async fn run_sync_folders(
        &self,
        spec: &TaskSpec,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TaskOutcome, TaskError> {
        progress("discovering folder tree");
        let token = self.inner.tokens.access_token(&spec.group_id).await?;
        let folders = self
            .inner
            .engine
            .discover_folders(&spec.group_id, &token)
            .await?;

        Ok(TaskOutcome::message(format!(
            "synced {} folders",
            folders.len()
        )))
    }

    async fn run_download(
        &self,
        message_ids: &[i64],
        cancel: &CancellationToken,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TaskOutcome, TaskError> {
        let report = self
            .inner
            .downloader
            .run(message_ids, cancel, progress)
            .await?;

        // Partial failure does not fail the task; the counts tell the story.
        let message = format!(
            "downloaded {} of {} ({} skipped, {} auth errors, {} download errors)",
            report.downloaded,
            report.requested,
            report.skipped,
            report.auth_errors.values().map(Vec::len).sum::<usize>(),
            report.download_errors.len()
        );

        Ok(TaskOutcome {
            message,
            result: serde_json::to_value(&report).ok(),
            follow_up: None,
        })
    }

    async fn run_login(
        &self,
        spec: &TaskSpec,
        auto_sync: bool,
        cancel: &CancellationToken,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TaskOutcome, TaskError> {
        let group_id = &spec.group_id;

        let accounts: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT id, email, password FROM accounts \
             WHERE group_id = ? AND is_deleted = 0 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(self.inner.store.pool())
        .await
        .map_err(StoreError::from)?;

        if accounts.is_empty() {
            return Err(TaskError::Other(format!(
                "group {} has no accounts",
                group_id
            )));
        }

        let (recovery_email, recovery_phone) = self.recovery_contacts(group_id).await?;

        let total = accounts.len();
        let mut succeeded = 0;

        for (account_id, email, password) in accounts {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            // A still-valid group token covers every alias.
            if self.inner.tokens.access_token(group_id).await.is_ok() {
                progress(&format!("token valid, skipping login for {}", email));
                succeeded += 1;
                continue;
            }

            let Some(automation) = self.inner.automation.as_ref() else {
                return Err(TaskError::AuthRequired(
                    "no credential automation configured and no valid token".to_string(),
                ));
            };

            progress(&format!("logging in {}", email));
            let request = LoginRequest {
                auth_url: self.inner.tokens.authorize_url(),
                email: email.clone(),
                password,
                recovery_email: recovery_email.clone(),
                recovery_phone: recovery_phone.clone(),
            };

            match automation.authorize(request).await {
                Ok(handoff) => match handoff.authorization_code() {
                    Some(code) => {
                        match self.inner.tokens.exchange_code(group_id, &code).await {
                            Ok(_) => {
                                self.set_account_status(account_id, "success").await?;
                                succeeded += 1;
                            }
                            Err(e) => {
                                log::warn!("code exchange failed for {}: {}", email, e);
                                self.set_account_status(account_id, "failure").await?;
                            }
                        }
                    }
                    None => {
                        log::warn!("login flow for {} returned no authorization code", email);
                        self.set_account_status(account_id, "failure").await?;
                    }
                },
                Err(e) => {
                    let status = match &e {
                        crate::token::AutomationError::PasswordError => "password-error",
                        crate::token::AutomationError::PhoneVerify => "phone-verify",
                        crate::token::AutomationError::Flow(_) => "failure",
                    };
                    log::warn!("automation login failed for {}: {}", email, e);
                    self.set_account_status(account_id, status).await?;
                }
            }
        }

        if succeeded == 0 {
            return Err(TaskError::AuthRequired(format!(
                "all {} accounts of group {} failed to log in",
                total, group_id
            )));
        }

        let follow_up = auto_sync.then(|| TaskSpec {
            user_id: spec.user_id,
            role: spec.role,
            group_id: group_id.clone(),
            payload: TaskPayload::Sync {
                strategy: SyncStrategy::Auto,
            },
        });

        Ok(TaskOutcome {
            message: format!("logged in {}/{} accounts", succeeded, total),
            result: Some(serde_json::json!({
                "success_count": succeeded,
                "total_count": total,
            })),
            follow_up,
        })
    }

    async fn recovery_contacts(
        &self,
        group_id: &str,
    ) -> Result<(Option<String>, Option<String>), TaskError> {
        let email: Option<(String,)> = sqlx::query_as(
            "SELECT email FROM account_recovery_email WHERE group_id = ? ORDER BY email LIMIT 1",
        )
        .bind(group_id)
        .fetch_optional(self.inner.store.pool())
        .await
        .map_err(StoreError::from)?;

        let phone: Option<(String,)> = sqlx::query_as(
            "SELECT phone FROM account_recovery_phone WHERE group_id = ? ORDER BY phone LIMIT 1",
        )
        .bind(group_id)
        .fetch_optional(self.inner.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok((email.map(|(e,)| e), phone.map(|(p,)| p)))
    }

    async fn set_account_status(&self, account_id: i64, status: &str) -> Result<(), TaskError> {
        let mut conn = self.inner.store.acquire().await?;
        sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
            .bind(status)
            .bind(account_id)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Write the terminal status unless the task was cancelled; a cancelled
    /// slot is never overwritten by a late success or failure.
    async fn finish(
        &self,
        spec: &TaskSpec,
        task_id: &str,
        result: Result<TaskOutcome, TaskError>,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            log::info!("task {} finished after cancellation, keeping cancelled state", task_id);
            return;
        }

        let status = match result {
            Ok(outcome) => {
                let status = TaskStatus::new(task_id, TaskState::Success, outcome.message);
                match outcome.result {
                    Some(result) => status.with_result(result),
                    None => status,
                }
            }
            Err(TaskError::Cancelled) => {
                TaskStatus::new(task_id, TaskState::Cancelled, "cancelled")
            }
            Err(e) => {
                log::warn!("task {} failed: {}", task_id, e);
                TaskStatus::new(task_id, TaskState::Failure, e.to_string())
            }
        };

        if let Err(e) = self
            .inner
            .status
            .set(spec.user_id, spec.task_type(), &spec.group_id, &status)
            .await
        {
            log::error!("writing terminal status for {} failed: {}", task_id, e);
        }
    }

    fn remove_active(&self, key: &str, task_id: &str) {
        self.inner
            .active
            .remove_if(key, |_, active| active.task_id == task_id);
    }
}


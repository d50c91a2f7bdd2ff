//! Application context.
//!
//! Everything long-lived is constructed once at startup and handed to the
//! workers explicitly; there are no module-level singletons. The context is
//! cheap to clone — every component inside is an `Arc` or a pooled handle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broker::{Broker, BrokerError};
use crate::config::AppConfig;
use crate::graph::{GraphClient, GraphError};
use crate::mail::MailService;
use crate::runtime::{BatchDownloader, MaintenanceWatchdog, TaskRuntime, WriterDaemon};
use crate::store::{Store, StoreError};
use crate::sync::SyncEngine;
use crate::token::{CredentialAutomation, TokenError, TokenManager};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("store init failed: {0}")]
    Store(#[from] StoreError),
    #[error("broker init failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("token manager init failed: {0}")]
    Token(#[from] TokenError),
    #[error("provider client init failed: {0}")]
    Graph(#[from] GraphError),
}

#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub store: Store,
    pub broker: Broker,
    pub tokens: TokenManager,
    pub graph: GraphClient,
    pub engine: SyncEngine,
    pub mail: MailService,
    pub runtime: TaskRuntime,
}

impl AppContext {
    /// Construct every component against the given configuration. The
    /// automation collaborator is optional; without it, login tasks require
    /// an existing token row.
    pub async fn init(
        config: AppConfig,
        automation: Option<Arc<dyn CredentialAutomation>>,
    ) -> Result<Self, InitError> {
        let store = Store::open(
            &config.store_path,
            config.store_pool_size,
            config.store_acquire_timeout,
        )
        .await?;
        let broker = Broker::connect(&config.broker_url).await?;
        let tokens = TokenManager::new(store.clone(), &config)?;
        let graph = GraphClient::new(config.graph_base_url.clone())?;
        let engine = SyncEngine::new(
            store.clone(),
            broker.clone(),
            graph.clone(),
            config.recent_window_days,
        );
        let downloader = BatchDownloader::new(
            store.clone(),
            broker.clone(),
            tokens.clone(),
            graph.clone(),
            config.download_fanout,
        );
        let runtime = TaskRuntime::new(
            store.clone(),
            broker.clone(),
            tokens.clone(),
            engine.clone(),
            downloader,
            config.worker_pool_size,
            automation,
        );
        let mail = MailService::new(store.clone());

        Ok(Self {
            config,
            store,
            broker,
            tokens,
            graph,
            engine,
            mail,
            runtime,
        })
    }

    pub fn writer_daemon(&self) -> WriterDaemon {
        WriterDaemon::new(self.store.clone(), self.broker.clone())
    }

    pub fn maintenance_watchdog(&self, interval: Duration) -> MaintenanceWatchdog {
        MaintenanceWatchdog::new(self.store.clone(), self.runtime.clone(), interval)
    }
}

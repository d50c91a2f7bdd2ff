//! User-facing error kinds.
//!
//! Workers collapse their internal errors into these before writing a task's
//! terminal status, so the message a client polls is stable and actionable
//! regardless of which layer failed.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::graph::GraphError;
use crate::store::StoreError;
use crate::sync::SyncError;
use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// No valid token and no refresh token; the user must log in.
    #[error("login required: {0}")]
    AuthRequired(String),
    /// Token refresh failed transiently; retrying may succeed.
    #[error("authentication temporarily unavailable: {0}")]
    AuthTransient(String),
    /// Provider answered 429.
    #[error("provider rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },
    /// Provider answered with a non-2xx status.
    #[error("provider error: {0}")]
    Provider(String),
    /// Pool exhausted and the ephemeral fallback failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Broker unreachable. Nothing was popped, so nothing is lost.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl From<TokenError> for TaskError {
    fn from(e: TokenError) -> Self {
        if e.is_transient() {
            return TaskError::AuthTransient(e.to_string());
        }
        match e {
            TokenError::Store(inner) => inner.into(),
            other => TaskError::AuthRequired(other.to_string()),
        }
    }
}

impl From<GraphError> for TaskError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::RateLimited { retry_after } => TaskError::RateLimited { retry_after },
            other => TaskError::Provider(other.to_string()),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => TaskError::StoreUnavailable(e.to_string()),
            StoreError::Database(_) => TaskError::Other(e.to_string()),
        }
    }
}

impl From<BrokerError> for TaskError {
    fn from(e: BrokerError) -> Self {
        TaskError::QueueUnavailable(e.to_string())
    }
}

impl From<SyncError> for TaskError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Cancelled => TaskError::Cancelled,
            SyncError::Provider(inner) => inner.into(),
            SyncError::Broker(inner) => inner.into(),
            SyncError::Store(inner) => inner.into(),
            other => TaskError::Other(other.to_string()),
        }
    }
}

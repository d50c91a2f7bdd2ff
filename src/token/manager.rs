use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::models::TokenRecord;
use crate::store::{Store, StoreError};

/// Refresh this many seconds before the access token actually expires.
pub const REFRESH_BUFFER_SECS: i64 = 300;

/// Fallback lifetime when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Debug, Error)]
pub enum TokenError {
    /// No token row for the group: the user has never logged in.
    #[error("no token on record for group {0}, login required")]
    NoToken(String),
    /// The refresh token was rejected; the row has been cleared and the user
    /// must log in again.
    #[error("refresh token expired for group {0}, relogin required")]
    RefreshExpired(String),
    /// Transport-level failure; the caller may retry.
    #[error("token endpoint unreachable: {0}")]
    Network(#[from] reqwest::Error),
    /// The endpoint answered with an unexpected status.
    #[error("token endpoint returned status {status}: {body}")]
    Endpoint { status: StatusCode, body: String },
    /// The endpoint answered 200 but the payload was unusable. The stored
    /// refresh token is left untouched.
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TokenError {
    /// True when a retry might succeed without user involvement.
    pub fn is_transient(&self) -> bool {
        match self {
            TokenError::Network(_) => true,
            TokenError::Endpoint { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// The triple persisted after any successful acquisition or refresh.
#[derive(Debug, Clone)]
pub struct TokenTriple {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: Option<String>,
    pub at_expires_at: i64,
    pub rt_expires_at: i64,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Per-group OAuth token manager backed by the `account_token` table.
#[derive(Clone)]
pub struct TokenManager {
    store: Store,
    http: reqwest::Client,
    client_id: String,
    scope: String,
    token_endpoint: String,
    redirect_uri: String,
    /// One lock per group serializes the refresh window.
    refresh_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Store, config: &AppConfig) -> Result<Self, TokenError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("mailhub/0.1")
            .build()?;

        Ok(Self {
            store,
            http,
            client_id: config.client_id.clone(),
            scope: config.scope_string(),
            token_endpoint: config.token_endpoint(),
            redirect_uri: config.redirect_uri(),
            refresh_locks: Arc::new(DashMap::new()),
        })
    }

    /// A valid access token for the group, refreshing first when the cached
    /// one is inside the refresh buffer.
    pub async fn access_token(&self, group_id: &str) -> Result<String, TokenError> {
        let record = self
            .load(group_id)
            .await?
            .ok_or_else(|| TokenError::NoToken(group_id.to_string()))?;

        if !needs_refresh(&record) {
            return Ok(record.access_token);
        }

        let lock = self.group_lock(group_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent caller may have refreshed
        // while we waited, in which case we reuse its token.
        let record = self
            .load(group_id)
            .await?
            .ok_or_else(|| TokenError::NoToken(group_id.to_string()))?;
        if !needs_refresh(&record) {
            return Ok(record.access_token);
        }

        self.refresh(group_id, &record).await
    }

    /// The raw token row, if any. Used by verification and the admin surface.
    pub async fn peek(&self, group_id: &str) -> Result<Option<TokenRecord>, TokenError> {
        self.load(group_id).await
    }

    /// Persist a first-time triple acquired through the login flow.
    pub async fn store_initial(
        &self,
        group_id: &str,
        triple: &TokenTriple,
    ) -> Result<(), TokenError> {
        self.persist(group_id, triple).await
    }

    /// Exchange an authorization code for a triple and persist it.
    pub async fn exchange_code(
        &self,
        group_id: &str,
        code: &str,
    ) -> Result<TokenTriple, TokenError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let wire = self.post_token(&params, group_id).await?;
        let refresh_token = wire.refresh_token.clone().ok_or_else(|| {
            TokenError::Malformed("code exchange response missing refresh_token".to_string())
        })?;
        let triple = build_triple(wire, refresh_token)?;
        self.persist(group_id, &triple).await?;
        Ok(triple)
    }

    /// Delete the group's token row. Subsequent calls fail with `NoToken`
    /// until the group is re-acquired.
    pub async fn revoke(&self, group_id: &str) -> Result<bool, TokenError> {
        let mut conn = self.store.acquire().await?;
        let result = sqlx::query("DELETE FROM account_token WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// The authorization URL the automation collaborator should open.
    pub fn authorize_url(&self) -> String {
        let authority = self
            .token_endpoint
            .trim_end_matches("/oauth2/v2.0/token")
            .to_string();
        format!(
            "{}/oauth2/v2.0/authorize?client_id={}&response_type=code&redirect_uri={}&scope={}",
            authority,
            self.client_id,
            urlencode(&self.redirect_uri),
            urlencode(&self.scope),
        )
    }

    async fn refresh(
        &self,
        group_id: &str,
        current: &TokenRecord,
    ) -> Result<String, TokenError> {
        log::debug!("refreshing access token for group {}", group_id);

        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let wire = self.post_token(&params, group_id).await?;

        // A refresh response may legitimately omit the refresh token; the
        // previous one stays valid and must be retained.
        let refresh_token = wire
            .refresh_token
            .clone()
            .unwrap_or_else(|| current.refresh_token.clone());
        let triple = build_triple(wire, refresh_token)?;
        self.persist(group_id, &triple).await?;

        log::info!("token refreshed for group {}", group_id);
        Ok(triple.access_token)
    }

    async fn post_token(
        &self,
        params: &[(&str, &str)],
        group_id: &str,
    ) -> Result<WireTokenResponse, TokenError> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str::<WireTokenResponse>(&body)
                .map_err(|e| TokenError::Malformed(format!("invalid JSON: {}", e)));
        }

        // invalid_grant means the refresh token itself is dead; clear the row
        // so the failure surfaces as "relogin required" from now on.
        if let Ok(wire) = serde_json::from_str::<WireTokenResponse>(&body) {
            if wire.error.as_deref() == Some("invalid_grant") {
                log::warn!(
                    "refresh token rejected for group {}: {}",
                    group_id,
                    wire.error_description.as_deref().unwrap_or("invalid_grant")
                );
                self.revoke(group_id).await?;
                return Err(TokenError::RefreshExpired(group_id.to_string()));
            }
        }

        Err(TokenError::Endpoint { status, body })
    }

    async fn load(&self, group_id: &str) -> Result<Option<TokenRecord>, TokenError> {
        let record = sqlx::query_as::<_, TokenRecord>(
            r#"SELECT group_id, access_token, refresh_token, id_token,
                      at_expires_at, rt_expires_at, scope, tenant_id, updated_at
               FROM account_token
               WHERE group_id = ?"#,
        )
        .bind(group_id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(record)
    }

    async fn persist(&self, group_id: &str, triple: &TokenTriple) -> Result<(), TokenError> {
        let mut conn = self.store.acquire().await?;
        sqlx::query(
            r#"INSERT INTO account_token
                   (group_id, access_token, refresh_token, id_token,
                    at_expires_at, rt_expires_at, scope, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
               ON CONFLICT(group_id) DO UPDATE SET
                   access_token = excluded.access_token,
                   refresh_token = excluded.refresh_token,
                   id_token = excluded.id_token,
                   at_expires_at = excluded.at_expires_at,
                   rt_expires_at = excluded.rt_expires_at,
                   scope = excluded.scope,
                   updated_at = excluded.updated_at"#,
        )
        .bind(group_id)
        .bind(&triple.access_token)
        .bind(&triple.refresh_token)
        .bind(&triple.id_token)
        .bind(triple.at_expires_at)
        .bind(triple.rt_expires_at)
        .bind(&triple.scope)
        .execute(&mut *conn)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    fn group_lock(&self, group_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn needs_refresh(record: &TokenRecord) -> bool {
    Utc::now().timestamp() + REFRESH_BUFFER_SECS >= record.at_expires_at
}

fn build_triple(
    wire: WireTokenResponse,
    refresh_token: String,
) -> Result<TokenTriple, TokenError> {
    let access_token = wire.access_token.ok_or_else(|| {
        TokenError::Malformed("token response missing access_token".to_string())
    })?;

    let now = Utc::now().timestamp();
    let at_expires_at = now + wire.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
    // Refresh tokens are rotated by the endpoint well before this horizon.
    let rt_expires_at = now + 90 * 24 * 3600;

    Ok(TokenTriple {
        access_token,
        refresh_token,
        id_token: wire.id_token,
        at_expires_at,
        rt_expires_at,
        scope: wire.scope,
    })
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

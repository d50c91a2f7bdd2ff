//! Runtime configuration.
//!
//! Every setting has an in-code default so the server starts with nothing but
//! a reachable redis and a writable data directory. Environment variables
//! override the defaults; the binary's CLI flags override both.

use std::path::PathBuf;
use std::time::Duration;

/// Default Azure AD public-client id used when none is configured.
const DEFAULT_CLIENT_ID: &str = "f4a5101b-9441-48f4-968f-3ef3da7b7290";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the sqlite store file.
    pub store_path: PathBuf,
    /// Broker connection URL.
    pub broker_url: String,
    /// OAuth public client id.
    pub client_id: String,
    /// OAuth authority, e.g. `https://login.microsoftonline.com/common`.
    pub authority: String,
    /// Requested scopes, space separated on the wire.
    pub scopes: Vec<String>,
    /// Loopback redirect port for the authorization-code flow.
    pub redirect_port: u16,
    /// Provider API base, overridable so tests can point at a local double.
    pub graph_base_url: String,
    /// Bounded store pool size.
    pub store_pool_size: u32,
    /// How long to wait for a pooled connection before falling back to an
    /// ephemeral one.
    pub store_acquire_timeout: Duration,
    /// Number of concurrently executing runtime workers.
    pub worker_pool_size: usize,
    /// Concurrent per-message downloads inside one batch-download task.
    pub download_fanout: usize,
    /// Window for the `recent` sync strategy.
    pub recent_window_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./data/mailhub.db"),
            broker_url: "redis://127.0.0.1:6379/0".to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            authority: "https://login.microsoftonline.com/common".to_string(),
            scopes: vec![
                "User.Read".to_string(),
                "Mail.Read".to_string(),
                "Mail.ReadWrite".to_string(),
                "Mail.Send".to_string(),
            ],
            redirect_port: 53100,
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            store_pool_size: 20,
            store_acquire_timeout: Duration::from_secs(5),
            worker_pool_size: 50,
            download_fanout: 10,
            recent_window_days: 30,
        }
    }
}

impl AppConfig {
    /// Build a configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            store_path: env_var("MAILHUB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            broker_url: env_var("REDIS_URL").unwrap_or(defaults.broker_url),
            client_id: env_var("MSAL_CLIENT_ID").unwrap_or(defaults.client_id),
            authority: env_var("MSAL_AUTHORITY").unwrap_or(defaults.authority),
            scopes: env_var("MSAL_SCOPES")
                .map(|raw| {
                    raw.split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|scopes| !scopes.is_empty())
                .unwrap_or(defaults.scopes),
            redirect_port: env_parse("MSAL_REDIRECT_PORT").unwrap_or(defaults.redirect_port),
            graph_base_url: env_var("GRAPH_BASE_URL").unwrap_or(defaults.graph_base_url),
            store_pool_size: env_parse("DB_POOL_SIZE").unwrap_or(defaults.store_pool_size),
            store_acquire_timeout: env_parse("DB_POOL_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.store_acquire_timeout),
            worker_pool_size: env_parse("WORKER_POOL_SIZE").unwrap_or(defaults.worker_pool_size),
            download_fanout: env_parse("DOWNLOAD_FANOUT").unwrap_or(defaults.download_fanout),
            recent_window_days: env_parse("DEFAULT_SYNC_DAYS").unwrap_or(defaults.recent_window_days),
        }
    }

    /// Scopes as a single space-separated string for the token endpoint.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Loopback redirect URI for the authorization-code flow.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.redirect_port)
    }

    /// OAuth 2.0 token endpoint under the configured authority.
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|value| value.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AppConfig::default();
        assert_eq!(config.redirect_uri(), "http://localhost:53100");
        assert_eq!(
            config.token_endpoint(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert!(config.scope_string().contains("Mail.Read"));
    }
}

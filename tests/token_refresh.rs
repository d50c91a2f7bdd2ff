//! Token lifecycle against a doubled token endpoint.

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailhub::config::AppConfig;
use mailhub::store::Store;
use mailhub::token::{TokenError, TokenManager, TokenTriple, REFRESH_BUFFER_SECS};

fn config_for(server: &MockServer) -> AppConfig {
    AppConfig {
        authority: server.uri(),
        ..AppConfig::default()
    }
}

fn triple(access: &str, refresh: &str, at_expires_at: i64) -> TokenTriple {
    TokenTriple {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        id_token: None,
        at_expires_at,
        rt_expires_at: at_expires_at + 86400,
        scope: None,
    }
}

async fn manager_with_row(server: &MockServer, refresh: &str, at_expires_at: i64) -> TokenManager {
    let store = Store::in_memory().await.expect("store");
    let manager = TokenManager::new(store, &config_for(server)).expect("manager");
    manager
        .store_initial("g1", &triple("at-old", refresh, at_expires_at))
        .await
        .expect("seed token row");
    manager
}

#[tokio::test]
async fn refresh_inside_buffer_returns_new_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/v2.0/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-new",
            "refresh_token": "rt-new",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Expires in 100s: inside the 300s buffer, so a refresh must happen.
    let manager = manager_with_row(&server, "rt-old", Utc::now().timestamp() + 100).await;

    let token = manager.access_token("g1").await.expect("access token");
    assert_eq!(token, "at-new");

    let record = manager.peek("g1").await.expect("peek").expect("row");
    assert_eq!(record.access_token, "at-new");
    assert_eq!(record.refresh_token, "rt-new");
    // Refresh round-trip: the new expiry clears the buffer.
    assert!(record.at_expires_at > Utc::now().timestamp() + REFRESH_BUFFER_SECS);
}

#[tokio::test]
async fn refresh_response_without_refresh_token_retains_previous() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-new",
            "expires_in": 3600,
        })))
        .mount(&server)
        .await;

    let manager = manager_with_row(&server, "rt-old", Utc::now().timestamp() - 10).await;

    let token = manager.access_token("g1").await.expect("access token");
    assert_eq!(token, "at-new");

    let record = manager.peek("g1").await.expect("peek").expect("row");
    assert_eq!(record.refresh_token, "rt-old");
}

#[tokio::test]
async fn invalid_grant_clears_row_and_requires_relogin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70000: refresh token revoked",
        })))
        .mount(&server)
        .await;

    let manager = manager_with_row(&server, "rt-dead", Utc::now().timestamp() - 10).await;

    match manager.access_token("g1").await {
        Err(TokenError::RefreshExpired(group)) => assert_eq!(group, "g1"),
        other => panic!("expected RefreshExpired, got {:?}", other.map(|_| ())),
    }

    assert!(manager.peek("g1").await.expect("peek").is_none());

    // Subsequent calls surface as never-logged-in.
    assert!(matches!(
        manager.access_token("g1").await,
        Err(TokenError::NoToken(_))
    ));
}

#[tokio::test]
async fn concurrent_refreshes_make_one_endpoint_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-new",
            "refresh_token": "rt-new",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager_with_row(&server, "rt-old", Utc::now().timestamp() - 10).await;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.access_token("g1").await })
    };
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.access_token("g1").await })
    };

    let first = first.await.expect("join").expect("first token");
    let second = second.await.expect("join").expect("second token");
    assert_eq!(first, "at-new");
    assert_eq!(second, "at-new");

    // The row was updated exactly once; wiremock verifies the single call
    // on drop.
    let record = manager.peek("g1").await.expect("peek").expect("row");
    assert_eq!(record.refresh_token, "rt-new");
}

#[tokio::test]
async fn unreachable_endpoint_is_transient_and_keeps_row() {
    let config = AppConfig {
        // Nothing listens here.
        authority: "http://127.0.0.1:1".to_string(),
        ..AppConfig::default()
    };
    let store = Store::in_memory().await.expect("store");
    let manager = TokenManager::new(store, &config).expect("manager");
    manager
        .store_initial("g1", &triple("at-old", "rt-old", Utc::now().timestamp() - 10))
        .await
        .expect("seed");

    let err = manager.access_token("g1").await.expect_err("should fail");
    assert!(err.is_transient(), "network error should be transient: {}", err);

    let record = manager.peek("g1").await.expect("peek").expect("row kept");
    assert_eq!(record.refresh_token, "rt-old");
}

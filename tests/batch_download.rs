//! Batch download with partial auth failure.
//!
//! Runs only when `REDIS_TEST_URL` is set; skips itself otherwise.

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailhub::broker::{keys, Broker};
use mailhub::config::AppConfig;
use mailhub::graph::GraphClient;
use mailhub::runtime::{BatchDownloader, WriterDaemon};
use mailhub::store::Store;
use mailhub::token::{TokenManager, TokenTriple};

async fn test_broker() -> Option<Broker> {
    let url = match std::env::var("REDIS_TEST_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping batch download test: REDIS_TEST_URL not set");
            return None;
        }
    };
    Some(Broker::connect(&url).await.expect("connect test broker"))
}

async fn drain(broker: &Broker) -> Vec<String> {
    let mut items = Vec::new();
    while let Some(raw) = broker
        .rpop(keys::WRITE_QUEUE)
        .await
        .expect("drain rpop")
    {
        items.push(raw);
    }
    items
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

async fn seed_message(store: &Store, id: i64, group: &str) {
    sqlx::query(
        "INSERT INTO mail_message (id, group_id, msg_uid, subject, from_addr, from_name, \
         to_joined, flags, snippet) VALUES (?, ?, ?, 'subject', '', '', '', 'UNREAD', '')",
    )
    .bind(id)
    .bind(group)
    .bind(format!("uid-{}", id))
    .execute(store.pool())
    .await
    .expect("seed message");
}

#[tokio::test]
async fn partial_auth_failure_downloads_the_rest() {
    let Some(broker) = test_broker().await else {
        return;
    };
    drain(&broker).await;

    let server = MockServer::start().await;
    let store = Store::in_memory().await.expect("store");
    let config = AppConfig {
        authority: server.uri(),
        ..AppConfig::default()
    };
    let tokens = TokenManager::new(store.clone(), &config).expect("token manager");
    let graph = GraphClient::new(server.uri()).expect("graph client");
    let downloader = BatchDownloader::new(
        store.clone(),
        broker.clone(),
        tokens.clone(),
        graph,
        10,
    );
    let daemon = WriterDaemon::new(store.clone(), broker.clone());

    // Groups A and C hold fresh tokens; group B's refresh token is dead.
    let fresh = Utc::now().timestamp() + 3600;
    let expired = Utc::now().timestamp() - 10;
    tokens
        .store_initial("A", &triple("at-a", "rt-a", fresh))
        .await
        .expect("token A");
    tokens
        .store_initial("B", &triple("at-b", "rt-b", expired))
        .await
        .expect("token B");
    tokens
        .store_initial("C", &triple("at-c", "rt-c", fresh))
        .await
        .expect("token C");

    Mock::given(method("POST"))
        .and(path("/oauth2/v2.0/token"))
        .and(body_string_contains("rt-b"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked",
        })))
        .mount(&server)
        .await;

    // 10 requested messages: 4 in A, 3 in B, 3 in C. Message 1 already has
    // a body and must be skipped.
    for id in 1..=4 {
        seed_message(&store, id, "A").await;
    }
    for id in 5..=7 {
        seed_message(&store, id, "B").await;
    }
    for id in 8..=10 {
        seed_message(&store, id, "C").await;
    }
    sqlx::query("INSERT INTO mail_body (message_id, headers, body_html) VALUES (1, '', '<p>cached</p>')")
        .execute(store.pool())
        .await
        .expect("pre-existing body");

    Mock::given(method("GET"))
        .and(path_regex("^/me/messages/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "remote-id",
            "subject": "subject",
            "body": {"contentType": "html", "content": "<p>downloaded</p>"},
            "internetMessageHeaders": [
                {"name": "Subject", "value": "subject"},
                {"name": "Message-ID", "value": "<x@example.com>"}
            ],
            "attachments": [{
                "id": "att-1",
                "name": "report.pdf",
                "contentType": "application/pdf",
                "size": 2048,
                "isInline": false
            }]
        })))
        .mount(&server)
        .await;

    let ids: Vec<i64> = (1..=10).collect();
    let report = downloader
        .run(&ids, &CancellationToken::new(), |_| {})
        .await
        .expect("download");

    assert_eq!(report.requested, 10);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.downloaded, 6);
    assert!(report.download_errors.is_empty());

    let mut failed_b = report.auth_errors.get("B").cloned().expect("group B failed");
    failed_b.sort_unstable();
    assert_eq!(failed_b, vec![5, 6, 7]);

    // Flush the queued bodies and attachment metadata.
    let queued = drain(&broker).await;
    daemon.flush(&queued).await.expect("flush");

    let (bodies,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_body")
        .fetch_one(store.pool())
        .await
        .expect("bodies");
    assert_eq!(bodies, 7, "six downloads plus the pre-existing body");

    let (attachments,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_attachment")
        .fetch_one(store.pool())
        .await
        .expect("attachments");
    assert_eq!(attachments, 6);

    // Group B's bodies were never written.
    let (b_bodies,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM mail_body b JOIN mail_message m ON m.id = b.message_id \
         WHERE m.group_id = 'B'",
    )
    .fetch_one(store.pool())
    .await
    .expect("B bodies");
    assert_eq!(b_bodies, 0);
}

//! Sync rounds against a doubled provider and a real broker.
//!
//! Runs only when `REDIS_TEST_URL` is set; skips itself otherwise.

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mailhub::broker::{keys, Broker};
use mailhub::graph::GraphClient;
use mailhub::runtime::WriterDaemon;
use mailhub::store::Store;
use mailhub::sync::{load_group_folders, SyncEngine, SyncStrategy};

async fn test_broker() -> Option<Broker> {
    let url = match std::env::var("REDIS_TEST_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping sync engine test: REDIS_TEST_URL not set");
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

#[tokio::test]
async fn first_and_second_round_advance_cursors_idempotently() {
    let Some(broker) = test_broker().await else {
        return;
    };
    drain(&broker).await;

    let server = MockServer::start().await;
    let store = Store::in_memory().await.expect("store");
    let graph = GraphClient::new(server.uri()).expect("graph client");
    let engine = SyncEngine::new(store.clone(), broker.clone(), graph, 30);
    let daemon = WriterDaemon::new(store.clone(), broker.clone());

    // Folder tree: one empty folder and one with a single message.
    Mock::given(method("GET"))
        .and(path("/me/mailFolders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "f-empty",
                    "displayName": "Drafts",
                    "wellKnownName": "drafts",
                    "childFolderCount": 0,
                    "totalItemCount": 0,
                    "unreadItemCount": 0
                },
                {
                    "id": "f-inbox",
                    "displayName": "Inbox",
                    "wellKnownName": "inbox",
                    "childFolderCount": 0,
                    "totalItemCount": 1,
                    "unreadItemCount": 1
                }
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/mailFolders/f-inbox/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "id": "m-1",
                "internetMessageId": "<m1@example.com>",
                "subject": "hello",
                "from": {"emailAddress": {"name": "Alice", "address": "alice@example.com"}},
                "toRecipients": [
                    {"emailAddress": {"name": "Bob", "address": "bob@example.com"}}
                ],
                "receivedDateTime": "2026-07-30T10:00:00Z",
                "sentDateTime": "2026-07-30T09:59:00Z",
                "isRead": false,
                "hasAttachments": false,
                "bodyPreview": "hi there",
                "parentFolderId": "f-inbox"
            }]
        })))
        .mount(&server)
        .await;

    // Fresh-cursor probe after the first (recent) round.
    Mock::given(method("GET"))
        .and(path("/me/mailFolders/f-inbox/messages/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [],
            "@odata.deltaLink": format!("{}/delta-round-2", server.uri()),
        })))
        .mount(&server)
        .await;

    // The second round walks the stored cursor and finds no changes.
    Mock::given(method("GET"))
        .and(path("/delta-round-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [],
            "@odata.deltaLink": format!("{}/delta-round-3", server.uri()),
        })))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();

    // Round 1: no local state, so the inbox syncs via `recent`.
    let report = engine
        .sync_group("g1", "test-token", SyncStrategy::Auto, &cancel, |_| {})
        .await
        .expect("first round");
    assert_eq!(report.folders, 2);
    assert_eq!(report.synced, 1);
    assert!(report.errors.is_empty());

    let folders = load_group_folders(&store, "g1").await.expect("folders");
    assert_eq!(folders.len(), 2);
    for folder in &folders {
        assert!(
            folder.last_sync_at.is_some(),
            "every folder in the round gets a sync time"
        );
    }
    let inbox = folders
        .iter()
        .find(|f| f.folder_id == "f-inbox")
        .expect("inbox");
    assert_eq!(inbox.synced_count, 1);
    assert!(inbox
        .delta_link
        .as_deref()
        .expect("probed cursor")
        .ends_with("/delta-round-2"));

    let queued = drain(&broker).await;
    assert_eq!(queued.len(), 1);
    daemon.flush(&queued).await.expect("flush round 1");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_message")
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(count, 1);

    // Round 2: the inbox now has a cursor, so auto resolves to delta and
    // the provider reports no changes.
    let report = engine
        .sync_group("g1", "test-token", SyncStrategy::Auto, &cancel, |_| {})
        .await
        .expect("second round");
    assert_eq!(report.synced, 0);

    let queued = drain(&broker).await;
    assert!(queued.is_empty(), "no-change round queues nothing");

    let folders = load_group_folders(&store, "g1").await.expect("folders");
    let inbox = folders
        .iter()
        .find(|f| f.folder_id == "f-inbox")
        .expect("inbox");
    assert!(inbox
        .delta_link
        .as_deref()
        .expect("advanced cursor")
        .ends_with("/delta-round-3"));

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_message")
        .fetch_one(store.pool())
        .await
        .expect("recount");
    assert_eq!(count, 1, "second run persists zero new rows");
}

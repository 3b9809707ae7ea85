//! Presence propagation between live clients, including departure cleanup.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use quill_sync::storage::{MemoryStore, SnapshotStore};
use quill_sync::{AwarenessUpdate, ServerConfig, SyncClient, SyncEvent, SyncServer, TokenVerifier};
use tokio::time::{timeout, Duration};

const SECRET: &str = "awareness-test-secret-0123456789abcd";

async fn start_test_server() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        auth_secret: SECRET.to_string(),
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, Some(store as Arc<dyn SnapshotStore>)).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn token() -> String {
    TokenVerifier::new(SECRET)
        .unwrap()
        .issue("tester", StdDuration::from_secs(600))
        .unwrap()
}

async fn wait_for_sync(client: &mut SyncClient) {
    loop {
        match timeout(Duration::from_secs(2), client.recv_event()).await {
            Ok(Some(SyncEvent::Synced)) => return,
            Ok(Some(_)) => continue,
            other => panic!("expected sync, got {other:?}"),
        }
    }
}

async fn next_awareness(client: &mut SyncClient) -> AwarenessUpdate {
    loop {
        match timeout(Duration::from_secs(2), client.recv_event()).await {
            Ok(Some(SyncEvent::Awareness(update))) => return update,
            Ok(Some(_)) => continue,
            other => panic!("expected awareness event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_presence_propagates_to_peer() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let token = token();

    let mut alice = SyncClient::connect(&url, "room", &token).await.unwrap();
    let mut bob = SyncClient::connect(&url, "room", &token).await.unwrap();
    wait_for_sync(&mut alice).await;
    wait_for_sync(&mut bob).await;

    alice.set_awareness(r#"{"name":"alice","cursor":3}"#).unwrap();

    let update = next_awareness(&mut bob).await;
    assert_eq!(update.entries.len(), 1);
    assert_eq!(update.entries[0].0, alice.client_id());
    assert_eq!(update.entries[0].1.state, r#"{"name":"alice","cursor":3}"#);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_presence_update_replaces_previous() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let token = token();

    let mut alice = SyncClient::connect(&url, "room", &token).await.unwrap();
    let mut bob = SyncClient::connect(&url, "room", &token).await.unwrap();
    wait_for_sync(&mut alice).await;
    wait_for_sync(&mut bob).await;

    alice.set_awareness(r#"{"cursor":1}"#).unwrap();
    let first = next_awareness(&mut bob).await;
    alice.set_awareness(r#"{"cursor":2}"#).unwrap();
    let second = next_awareness(&mut bob).await;

    assert_eq!(first.entries[0].1.state, r#"{"cursor":1}"#);
    assert_eq!(second.entries[0].1.state, r#"{"cursor":2}"#);
    assert!(second.entries[0].1.clock > first.entries[0].1.clock);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_disconnect_broadcasts_removal() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let token = token();

    let mut alice = SyncClient::connect(&url, "room", &token).await.unwrap();
    let mut bob = SyncClient::connect(&url, "room", &token).await.unwrap();
    wait_for_sync(&mut alice).await;
    wait_for_sync(&mut bob).await;

    alice.set_awareness(r#"{"name":"alice"}"#).unwrap();
    let joined = next_awareness(&mut bob).await;
    let alice_id = alice.client_id();
    assert_eq!(joined.entries[0].0, alice_id);

    alice.close().await;

    let removal = next_awareness(&mut bob).await;
    assert_eq!(removal.entries.len(), 1);
    assert_eq!(removal.entries[0].0, alice_id);
    assert_eq!(removal.entries[0].1.state, "null");

    bob.close().await;
}

#[tokio::test]
async fn test_late_joiner_receives_presence_snapshot() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let token = token();

    let mut alice = SyncClient::connect(&url, "room", &token).await.unwrap();
    wait_for_sync(&mut alice).await;
    alice.set_awareness(r#"{"name":"alice"}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = SyncClient::connect(&url, "room", &token).await.unwrap();
    let snapshot = next_awareness(&mut late).await;
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].0, alice.client_id());

    alice.close().await;
    late.close().await;
}

#[tokio::test]
async fn test_explicit_clear_removes_presence() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let token = token();

    let mut alice = SyncClient::connect(&url, "room", &token).await.unwrap();
    let mut bob = SyncClient::connect(&url, "room", &token).await.unwrap();
    wait_for_sync(&mut alice).await;
    wait_for_sync(&mut bob).await;

    alice.set_awareness(r#"{"here":true}"#).unwrap();
    next_awareness(&mut bob).await;

    alice.clear_awareness().unwrap();
    let cleared = next_awareness(&mut bob).await;
    assert_eq!(cleared.entries[0].1.state, "null");

    alice.close().await;
    bob.close().await;
}

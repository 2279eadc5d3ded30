//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use atlas_sync::client::{ConnectionState, SyncClient, SyncEvent};
use atlas_sync::{
    ClientMessage, ConnectionRegistry, DocumentCache, DocumentStore, StoreConfig, SyncHub,
    SyncServer, UserDirectory,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    url: String,
    hub: Arc<SyncHub>,
    server: SyncServer,
    _dir: TempDir,
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    start_server_with(256, Duration::from_secs(2)).await
}

async fn start_server_with(outbox_capacity: usize, send_timeout: Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let users = Arc::new(UserDirectory::with_users([("alice", "Alice"), ("bob", "Bob")]));
    let store = Arc::new(
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db")), users).unwrap(),
    );
    let hub = Arc::new(
        SyncHub::start(
            store,
            Arc::new(DocumentCache::new()),
            Arc::new(ConnectionRegistry::new(outbox_capacity)),
        )
        .await
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(hub.clone(), send_timeout);
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.serve(listener).await;
    });

    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        hub,
        server,
        _dir: dir,
    }
}

async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn next_json(ws: &mut RawSocket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn submit_raw(ws: &mut RawSocket, document_id: &str, content: &str, user_id: &str) {
    let text = ClientMessage::new(document_id, content, "", user_id)
        .encode()
        .unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn next_event(rx: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

async fn connected_client(url: &str, user: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match next_event(&mut events).await {
        SyncEvent::Snapshot { .. } => {}
        other => panic!("expected snapshot, got {other:?}"),
    }
    (client, events)
}

#[tokio::test]
async fn test_connect_receives_initial_snapshot() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let mut ws = raw_connect(&server.url).await;
    let initial = next_json(&mut ws).await;

    assert_eq!(initial["type"], "initial");
    assert!(!initial["client_id"].as_str().unwrap().is_empty());
    let docs = initial["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["id"], "d1");
    assert_eq!(docs[0]["content"], "A");
}

#[tokio::test]
async fn test_client_connects_and_gets_client_id() {
    let server = start_test_server().await;
    let (client, _events) = connected_client(&server.url, "alice").await;

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    let client_id = client.client_id().await.unwrap();
    assert!(server.hub.registry().is_registered(&client_id).await);
}

#[tokio::test]
async fn test_edit_broadcast_without_self_echo() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let (x, mut x_events) = connected_client(&server.url, "alice").await;
    let (_y, mut y_events) = connected_client(&server.url, "alice").await;
    let x_id = x.client_id().await.unwrap();

    x.submit("d1", "B").await.unwrap();

    assert_eq!(
        next_event(&mut x_events).await,
        SyncEvent::Acknowledged {
            document_id: "d1".into(),
            version: 2
        }
    );
    match next_event(&mut y_events).await {
        SyncEvent::RemoteUpdate {
            document_id,
            content,
            sender_id,
            version,
            ..
        } => {
            assert_eq!(document_id, "d1");
            assert_eq!(content, "B");
            assert_eq!(sender_id, x_id);
            assert_eq!(version, 2);
        }
        other => panic!("expected remote update, got {other:?}"),
    }

    // Nothing else for X: its own edit is not echoed
    assert!(timeout(Duration::from_millis(200), x_events.recv()).await.is_err());
    assert_eq!(x.document("d1").await.unwrap().content, "B");
    assert!(x.pending().await.is_empty());
}

#[tokio::test]
async fn test_last_writer_wins_over_the_wire() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("D"), "Doc", "A", "alice")
        .await
        .unwrap();

    let (x, mut x_events) = connected_client(&server.url, "alice").await;
    let (y, mut y_events) = connected_client(&server.url, "alice").await;

    x.submit("D", "B").await.unwrap();
    assert!(matches!(
        next_event(&mut x_events).await,
        SyncEvent::Acknowledged { version: 2, .. }
    ));

    // Y submits C whether or not it has applied B yet
    y.submit("D", "C").await.unwrap();

    let mut y_acked = false;
    while !y_acked {
        match next_event(&mut y_events).await {
            SyncEvent::RemoteUpdate { content, .. } => assert_eq!(content, "B"),
            SyncEvent::Acknowledged { version, .. } => {
                assert_eq!(version, 3);
                y_acked = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    match next_event(&mut x_events).await {
        SyncEvent::RemoteUpdate {
            content, version, ..
        } => {
            assert_eq!(content, "C");
            assert_eq!(version, 3);
        }
        other => panic!("expected remote update, got {other:?}"),
    }

    let stored = server.hub.store().get_document("D").unwrap();
    assert_eq!((stored.version, stored.content.as_str()), (3, "C"));
}

#[tokio::test]
async fn test_rejected_edit_is_reported_to_submitter_only() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let (bob, mut bob_events) = connected_client(&server.url, "bob").await;
    let (_alice, mut alice_events) = connected_client(&server.url, "alice").await;

    bob.submit("d1", "hijack").await.unwrap();
    match next_event(&mut bob_events).await {
        SyncEvent::Rejected {
            document_id, error, ..
        } => {
            assert_eq!(document_id.as_deref(), Some("d1"));
            assert_eq!(error, "permission_denied");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(bob.document("d1").await.unwrap().content, "A");
    assert!(bob.pending().await.is_empty());

    bob.submit("nope", "x").await.unwrap();
    assert!(matches!(
        next_event(&mut bob_events).await,
        SyncEvent::Rejected { ref error, .. } if error == "not_found"
    ));

    assert!(timeout(Duration::from_millis(200), alice_events.recv()).await.is_err());
    assert_eq!(server.hub.store().get_document("d1").unwrap().version, 1);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let mut ws = raw_connect(&server.url).await;
    next_json(&mut ws).await;

    ws.send(Message::Text("{\"content\": 5}".to_string().into()))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "validation_error");

    submit_raw(&mut ws, "d1", "B", "alice").await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "ack");
    assert_eq!(reply["version"], 2);
}

#[tokio::test]
async fn test_broken_client_does_not_affect_others() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let mut origin = raw_connect(&server.url).await;
    let mut broken = raw_connect(&server.url).await;
    let mut healthy = raw_connect(&server.url).await;
    next_json(&mut origin).await;
    next_json(&mut broken).await;
    next_json(&mut healthy).await;

    drop(broken);

    submit_raw(&mut origin, "d1", "B", "alice").await;
    let ack = next_json(&mut origin).await;
    assert_eq!(ack["type"], "ack");

    let update = next_json(&mut healthy).await;
    assert_eq!(update["type"], "update");
    assert_eq!(update["content"], "B");

    // The dead connection is unregistered once its task notices
    timeout(Duration::from_secs(2), async {
        while server.hub.registry().len().await != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("broken connection unregistered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_reader_is_dropped_after_send_timeout() {
    // Outbox far larger than the flood, so only the socket write can stall
    let server = start_server_with(100_000, Duration::from_secs(1)).await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let mut stalled = raw_connect(&server.url).await;
    let stalled_id = next_json(&mut stalled).await["client_id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut healthy = raw_connect(&server.url).await;
    next_json(&mut healthy).await;

    let edits = 128;
    let reader = tokio::spawn(async move {
        let mut last = 1;
        while last < edits + 1 {
            let update = next_json(&mut healthy).await;
            assert_eq!(update["type"], "update");
            last = update["version"].as_u64().unwrap();
        }
        last
    });

    // Enough data to fill both socket buffers of the stalled peer
    let content = "x".repeat(256 * 1024);
    for i in 0..edits {
        let doc = server
            .hub
            .apply_edit("d1", &format!("{i}{content}"), "alice", None)
            .await
            .unwrap();
        assert_eq!(doc.version, i + 2);
    }

    timeout(Duration::from_secs(10), async {
        while server.hub.registry().is_registered(&stalled_id).await
            || server.server.stats().await.active_connections != 1
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stalled connection unregistered");

    let stats = server.server.stats().await;
    assert_eq!(stats.delivery_failures, 1);
    assert_eq!(stats.active_connections, 1);

    let last = timeout(Duration::from_secs(30), reader)
        .await
        .expect("healthy client keeps up")
        .unwrap();
    assert_eq!(last, edits + 1);
    assert_eq!(server.hub.get_document("d1").await.unwrap().version, edits + 1);
    drop(stalled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_observer_sees_commit_order() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "", "alice")
        .await
        .unwrap();

    let mut observer = raw_connect(&server.url).await;
    next_json(&mut observer).await;

    let mut writers = Vec::new();
    for w in 0..4 {
        let url = server.url.clone();
        writers.push(tokio::spawn(async move {
            let mut ws = raw_connect(&url).await;
            next_json(&mut ws).await;
            for i in 0..10 {
                submit_raw(&mut ws, "d1", &format!("w{w}-{i}"), "alice").await;
                loop {
                    let reply = next_json(&mut ws).await;
                    if reply["type"] == "ack" {
                        break;
                    }
                }
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let mut last = 1;
    for _ in 0..40 {
        let update = next_json(&mut observer).await;
        assert_eq!(update["type"], "update");
        let version = update["version"].as_u64().unwrap();
        assert_eq!(version, last + 1, "updates arrive in commit order");
        last = version;
    }
    assert_eq!(server.hub.store().get_document("d1").unwrap().version, 41);
}

#[tokio::test]
async fn test_reconnect_starts_from_fresh_snapshot() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let (mut client, mut events) = connected_client(&server.url, "alice").await;
    let first_id = client.client_id().await.unwrap();

    client.disconnect().await;
    assert_eq!(next_event(&mut events).await, SyncEvent::Disconnected);
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    // Committed while we were away
    server.hub.apply_edit("d1", "B", "alice", None).await.unwrap();

    client.connect().await.unwrap();
    match next_event(&mut events).await {
        SyncEvent::Snapshot {
            client_id,
            documents,
        } => {
            assert_ne!(client_id, first_id);
            assert_eq!(documents[0].content, "B");
            assert_eq!(documents[0].version, 2);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert_eq!(client.document("d1").await.unwrap().version, 2);
}

#[tokio::test]
async fn test_creation_is_announced() {
    let server = start_test_server().await;
    let (client, mut events) = connected_client(&server.url, "bob").await;

    let doc = server
        .hub
        .create_document(None, "Fresh", "hello", "bob")
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, SyncEvent::Created(doc.clone()));
    assert_eq!(client.document(&doc.id).await.unwrap(), doc);
}

#[tokio::test]
async fn test_server_stats() {
    let server = start_test_server().await;
    server
        .hub
        .create_document(Some("d1"), "Doc", "A", "alice")
        .await
        .unwrap();

    let mut a = raw_connect(&server.url).await;
    let mut b = raw_connect(&server.url).await;
    next_json(&mut a).await;
    next_json(&mut b).await;

    submit_raw(&mut a, "d1", "B", "alice").await;
    next_json(&mut a).await;
    next_json(&mut b).await;

    let stats = server.server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.messages_received, 1);
    assert!(stats.broadcasts_sent >= 1);

    a.close(None).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while server.server.stats().await.active_connections != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection counted");
}

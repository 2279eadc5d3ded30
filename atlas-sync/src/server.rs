//! WebSocket transport: one task per connection, all writes through the hub.
//!
//! ```text
//! Client A ──┐                       ┌── outbox A ──► socket A
//!            ├── SyncHub.apply_edit ─┤
//! Client B ──┘        │              └── outbox B ──► socket B
//!                     ▼
//!               DocumentStore (RocksDB)
//! ```
//!
//! Per connection:
//! 1. register with the hub and send the `initial` snapshot
//! 2. loop: incoming text frames are edit submissions, answered with
//!    `ack` or `error`; outbox frames are written to the socket
//! 3. on close, error, or a write that exceeds `send_timeout`: unregister
//!
//! A socket write never happens on the broadcast path; the hub only ever
//! enqueues into the outbox.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::DeliveryError;
use crate::hub::SyncHub;
use crate::protocol::{ClientMessage, EncodedFrame, ServerMessage};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub broadcasts_sent: u64,
    pub delivery_failures: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    hub: Arc<SyncHub>,
    send_timeout: Duration,
    counters: Arc<Counters>,
}

impl SyncServer {
    pub fn new(hub: Arc<SyncHub>, send_timeout: Duration) -> Self {
        Self {
            hub,
            send_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn run(&self, addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session = self.hub.open_session().await?;
        let client_id = session.registration.client_id;
        let mut outbox = session.registration.outbox;

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Client {client_id} connected from {addr}");

        // Snapshot goes out before anything queued since registration
        let initial = text_frame(&session.initial);
        if let Err(err) = send_frame(&mut ws_sender, initial, self.send_timeout).await {
            self.hub.registry().drop_failed(&client_id, err).await;
        } else {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let reply = match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                                self.handle_submission(&client_id, text.as_str()).await
                            }
                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Binary frame from {client_id} ignored");
                                encode_reply(ServerMessage::Error {
                                    document_id: None,
                                    error: "validation_error".to_string(),
                                    message: "expected a JSON text frame".to_string(),
                                })
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(err) = send_frame(&mut ws_sender, Message::Pong(data), self.send_timeout).await {
                                    self.hub.registry().drop_failed(&client_id, err).await;
                                    break;
                                }
                                None
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {client_id}: {e}");
                                break;
                            }
                            Some(Ok(_)) => None,
                        };

                        if let Some(frame) = reply {
                            if let Err(err) = send_frame(&mut ws_sender, text_frame(&frame), self.send_timeout).await {
                                self.hub.registry().drop_failed(&client_id, err).await;
                                break;
                            }
                        }
                    }

                    frame = outbox.recv() => {
                        match frame {
                            Some(frame) => {
                                if let Err(err) = send_frame(&mut ws_sender, text_frame(&frame), self.send_timeout).await {
                                    self.hub.registry().drop_failed(&client_id, err).await;
                                    break;
                                }
                            }
                            // Registry dropped us (outbox overflowed)
                            None => break,
                        }
                    }
                }
            }
        }

        self.hub.close_session(&client_id).await;
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        let _ = timeout(self.send_timeout, ws_sender.close()).await;
        log::info!("Client {client_id} disconnected");
        Ok(())
    }

    /// Decode and apply one edit; returns the reply for the submitter.
    async fn handle_submission(&self, client_id: &str, text: &str) -> Option<EncodedFrame> {
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {client_id}: {e}");
                return encode_reply(ServerMessage::malformed(&e));
            }
        };

        self.hub.registry().identify(client_id, &msg.user_id).await;

        let reply = match self
            .hub
            .apply_edit(&msg.document_id, &msg.content, &msg.user_id, Some(client_id))
            .await
        {
            Ok(doc) => ServerMessage::ack(&doc),
            Err(e) => {
                log::info!("Edit to {} from {client_id} rejected: {e}", msg.document_id);
                ServerMessage::rejected(Some(msg.document_id.as_str()), &e)
            }
        };
        encode_reply(reply)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let registry = self.hub.registry().stats().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            broadcasts_sent: registry.broadcasts,
            delivery_failures: registry.delivery_failures,
        }
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

fn encode_reply(msg: ServerMessage) -> Option<EncodedFrame> {
    match msg.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("Failed to encode reply: {e}");
            None
        }
    }
}

fn text_frame(frame: &str) -> Message {
    Message::Text(frame.to_string().into())
}

/// One bounded socket write.
async fn send_frame(sink: &mut WsSink, msg: Message, limit: Duration) -> Result<(), DeliveryError> {
    match timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(DeliveryError::Closed),
        Err(_) => Err(DeliveryError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DocumentCache;
    use crate::identity::UserDirectory;
    use crate::registry::ConnectionRegistry;
    use crate::storage::{DocumentStore, StoreConfig};
    use tempfile::TempDir;

    async fn test_server() -> (SyncServer, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let users = Arc::new(UserDirectory::with_users([("alice", "Alice")]));
        let store = Arc::new(
            DocumentStore::open(StoreConfig::for_testing(dir.path().join("db")), users).unwrap(),
        );
        let hub = SyncHub::start(
            store,
            Arc::new(DocumentCache::new()),
            Arc::new(ConnectionRegistry::new(64)),
        )
        .await
        .unwrap();
        (SyncServer::new(Arc::new(hub), Duration::from_secs(1)), dir)
    }

    fn decode(frame: Option<EncodedFrame>) -> ServerMessage {
        ServerMessage::decode(&frame.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let (server, _dir) = test_server().await;
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.send_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_submission_is_acknowledged() {
        let (server, _dir) = test_server().await;
        let doc = server
            .hub()
            .create_document(None, "T", "A", "alice")
            .await
            .unwrap();

        let text = ClientMessage::new(&doc.id, "B", "", "alice").encode().unwrap();
        match decode(server.handle_submission("c1", &text).await) {
            ServerMessage::Ack {
                document_id,
                version,
                ..
            } => {
                assert_eq!(document_id, doc.id);
                assert_eq!(version, 2);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submission_rejections() {
        let (server, _dir) = test_server().await;
        let doc = server
            .hub()
            .create_document(None, "T", "A", "alice")
            .await
            .unwrap();

        let text = ClientMessage::new(&doc.id, "B", "", "bob").encode().unwrap();
        match decode(server.handle_submission("c1", &text).await) {
            ServerMessage::Error { error, document_id, .. } => {
                assert_eq!(error, "permission_denied");
                assert_eq!(document_id.as_deref(), Some(doc.id.as_str()));
            }
            other => panic!("expected error, got {other:?}"),
        }

        let text = ClientMessage::new("missing", "B", "", "alice").encode().unwrap();
        assert!(matches!(
            decode(server.handle_submission("c1", &text).await),
            ServerMessage::Error { ref error, .. } if error == "not_found"
        ));

        assert!(matches!(
            decode(server.handle_submission("c1", "{not json").await),
            ServerMessage::Error { ref error, .. } if error == "validation_error"
        ));

        // Nothing was committed
        assert_eq!(server.hub().get_document(&doc.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_send_frame_times_out_on_stalled_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}"), stream)
                .await
                .unwrap();
            ws
        });
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Peer stays connected but never reads
        let _peer = peer.await.unwrap();
        let (mut sink, _source) = ws.split();

        let chunk = "x".repeat(1024 * 1024);
        let mut result = Ok(());
        for _ in 0..64 {
            result = send_frame(&mut sink, text_frame(&chunk), Duration::from_millis(200)).await;
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(DeliveryError::Timeout));
    }
}

//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - A local replica of committed documents, seeded by the `initial` snapshot
//! - Edit submission with provisional tracking until `ack` or `error`
//!
//! The server answers submissions on a connection in order, so pending edits
//! are matched to replies first-in first-out. A pending edit is never part of
//! the replica until acknowledged.
//!
//! A dropped connection is not resumed. Pending edits are reported as
//! rejected and the next `connect` starts from a fresh snapshot.

use futures_util::{SinkExt, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::ProtocolError;
use crate::model::Document;
use crate::protocol::{ClientMessage, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Full snapshot received; the replica was replaced
    Snapshot {
        client_id: String,
        documents: Vec<Document>,
    },
    /// Another connection committed an edit
    RemoteUpdate {
        document_id: String,
        content: String,
        sender_id: String,
        user_id: String,
        version: u64,
    },
    /// A document was created
    Created(Document),
    /// Our oldest pending edit was committed
    Acknowledged { document_id: String, version: u64 },
    /// Our oldest pending edit was refused, or lost with the connection
    Rejected {
        document_id: Option<String>,
        error: String,
        message: String,
    },
    /// Connection lost
    Disconnected,
}

/// An edit sent but not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub document_id: String,
    pub content: String,
}

/// State shared between the client handle and its reader task.
#[derive(Default)]
struct Replica {
    client_id: RwLock<Option<String>>,
    documents: RwLock<HashMap<String, Document>>,
    pending: Mutex<VecDeque<PendingEdit>>,
}

impl Replica {
    /// Fold one server frame into the replica.
    ///
    /// Returns `None` for frames that carry nothing new, such as an update
    /// already contained in the snapshot.
    async fn apply(&self, msg: ServerMessage) -> Option<SyncEvent> {
        match msg {
            ServerMessage::Initial {
                documents,
                client_id,
            } => {
                *self.client_id.write().await = Some(client_id.clone());
                let mut replica = self.documents.write().await;
                replica.clear();
                for doc in &documents {
                    replica.insert(doc.id.clone(), doc.clone());
                }
                Some(SyncEvent::Snapshot {
                    client_id,
                    documents,
                })
            }

            ServerMessage::Update {
                document_id,
                content,
                sender_id,
                user_id,
                version,
                timestamp,
            } => {
                let mut replica = self.documents.write().await;
                if let Some(doc) = replica.get_mut(&document_id) {
                    if doc.version >= version {
                        return None;
                    }
                    doc.content = content.clone();
                    doc.version = version;
                    doc.updated_at = timestamp;
                }
                Some(SyncEvent::RemoteUpdate {
                    document_id,
                    content,
                    sender_id,
                    user_id,
                    version,
                })
            }

            ServerMessage::Created { document } => {
                let mut replica = self.documents.write().await;
                if replica.contains_key(&document.id) {
                    return None;
                }
                replica.insert(document.id.clone(), document.clone());
                Some(SyncEvent::Created(document))
            }

            ServerMessage::Ack {
                document_id,
                version,
                timestamp,
            } => {
                let edit = self.pending.lock().await.pop_front();
                if let Some(edit) = edit {
                    let mut replica = self.documents.write().await;
                    if let Some(doc) = replica.get_mut(&document_id) {
                        if doc.version < version {
                            doc.content = edit.content;
                            doc.version = version;
                            doc.updated_at = timestamp;
                        }
                    }
                } else {
                    log::warn!("Ack for {document_id} with no pending edit");
                }
                Some(SyncEvent::Acknowledged {
                    document_id,
                    version,
                })
            }

            ServerMessage::Error {
                document_id,
                error,
                message,
            } => {
                // Only submissions get error replies, so this answers the oldest one
                self.pending.lock().await.pop_front();
                Some(SyncEvent::Rejected {
                    document_id,
                    error,
                    message,
                })
            }
        }
    }

    /// Drop every pending edit, reporting each as rejected.
    async fn abandon_pending(&self) -> Vec<SyncEvent> {
        self.pending
            .lock()
            .await
            .drain(..)
            .map(|edit| SyncEvent::Rejected {
                document_id: Some(edit.document_id),
                error: "connection_closed".to_string(),
                message: "connection lost before the edit was acknowledged".to_string(),
            })
            .collect()
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server, keeps a replica of
/// committed documents, and tracks this client's unacknowledged edits.
pub struct SyncClient {
    /// Identity sent with every edit
    user_id: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Bumped on every connect so a stale reader task can tell it was replaced
    generation: Arc<AtomicU64>,

    replica: Arc<Replica>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,

    /// Upper bound for TCP connect plus WebSocket handshake
    connect_timeout: Duration,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(user_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            replica: Arc::new(Replica::default()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server, replacing any previous connection.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// snapshot arrives as a [`SyncEvent::Snapshot`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Connecting;

        let connecting = tokio_tungstenite::connect_async(&self.server_url);
        let (ws_stream, _) = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(_) => {
                log::warn!("Connecting to {} timed out", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        let replica = self.replica.clone();
        tokio::spawn(async move {
            if !read_frames(&mut ws_reader, &replica, &event_tx, &current, generation).await {
                return;
            }
            *state.write().await = ConnectionState::Disconnected;
            for event in replica.abandon_pending().await {
                let _ = event_tx.send(event).await;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        log::info!("Connected to {} as {}", self.server_url, self.user_id);
        Ok(())
    }

    /// Close the connection. Pending edits are reported as rejected.
    pub async fn disconnect(&mut self) {
        if self.outgoing_tx.take().is_none() {
            return;
        }
        // Detach the old reader so it stays quiet
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
        *self.replica.client_id.write().await = None;
        for event in self.replica.abandon_pending().await {
            let _ = self.event_tx.send(event).await;
        }
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
    }

    /// Submit a full-content edit.
    ///
    /// The edit stays pending until the server answers. Fails immediately when
    /// not connected; nothing is queued for later.
    pub async fn submit(
        &self,
        document_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;

        let edit = PendingEdit {
            document_id: document_id.into(),
            content: content.into(),
        };
        let client_id = self.client_id().await.unwrap_or_default();
        let text = ClientMessage::new(&edit.document_id, &edit.content, client_id, &self.user_id)
            .encode()?;

        // Queue before sending so a fast reply always finds its edit
        self.replica.pending.lock().await.push_back(edit);
        if tx.send(text).await.is_err() {
            self.replica.pending.lock().await.pop_back();
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server-assigned id of the current connection.
    pub async fn client_id(&self) -> Option<String> {
        self.replica.client_id.read().await.clone()
    }

    /// Last committed state of a document as seen by this client.
    pub async fn document(&self, id: &str) -> Option<Document> {
        self.replica.documents.read().await.get(id).cloned()
    }

    pub async fn documents(&self) -> Vec<Document> {
        self.replica.documents.read().await.values().cloned().collect()
    }

    pub async fn pending(&self) -> Vec<PendingEdit> {
        self.replica.pending.lock().await.iter().cloned().collect()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Feed server frames into the replica until the stream ends.
///
/// Returns `false` as soon as a newer connection owns the shared state;
/// frames still buffered for the old connection are discarded.
async fn read_frames<S>(
    frames: &mut S,
    replica: &Replica,
    event_tx: &mpsc::Sender<SyncEvent>,
    current: &AtomicU64,
    generation: u64,
) -> bool
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = frames.next().await {
        if current.load(Ordering::SeqCst) != generation {
            return false;
        }
        match msg {
            Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                Ok(server_msg) => {
                    if let Some(event) = replica.apply(server_msg).await {
                        let _ = event_tx.send(event).await;
                    }
                }
                Err(e) => log::warn!("Undecodable frame from server: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    current.load(Ordering::SeqCst) == generation
}

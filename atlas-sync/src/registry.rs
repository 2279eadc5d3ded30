//! Live connection registry with best-effort fan-out.
//!
//! Each registered connection owns a bounded outbox (an mpsc channel). A
//! broadcast takes a snapshot of the connection set under a read lock,
//! releases it, then `try_send`s the pre-encoded frame into every outbox
//! except the originator's. Nothing in here waits on a socket.
//!
//! A full or closed outbox is a [`DeliveryError`]: that connection is
//! unregistered and delivery to the rest continues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::model::now_millis;
use crate::protocol::EncodedFrame;

/// Public view of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_id: String,
    /// Last user seen submitting on this connection
    pub user_id: Option<String>,
    pub connected_at: u64,
}

struct ConnectionHandle {
    info: ConnectionInfo,
    outbox: mpsc::Sender<EncodedFrame>,
}

/// Receiving end of a connection's bounded event queue.
pub type Outbox = mpsc::Receiver<EncodedFrame>;

/// Returned by [`ConnectionRegistry::register`]; the connection task keeps it.
pub struct Registration {
    pub client_id: String,
    pub outbox: Outbox,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections dropped because delivery failed
    pub failed: Vec<(String, DeliveryError)>,
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicRegistryStats {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    /// Frames buffered per connection before it counts as failed
    outbox_capacity: usize,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            outbox_capacity: outbox_capacity.max(1),
            stats: AtomicRegistryStats::default(),
        }
    }

    /// Register a new connection under a fresh client id.
    ///
    /// Ids are v4 UUIDs and are never handed out twice.
    pub async fn register(&self) -> Registration {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let mut connections = self.connections.write().await;

        let mut client_id = Uuid::new_v4().to_string();
        while connections.contains_key(&client_id) {
            client_id = Uuid::new_v4().to_string();
        }

        connections.insert(
            client_id.clone(),
            ConnectionHandle {
                info: ConnectionInfo {
                    client_id: client_id.clone(),
                    user_id: None,
                    connected_at: now_millis(),
                },
                outbox: tx,
            },
        );
        log::debug!("Registered connection {client_id} ({} live)", connections.len());

        Registration {
            client_id,
            outbox: rx,
        }
    }

    /// Remove a connection. Safe to call repeatedly; returns true only for
    /// the call that actually removed it.
    pub async fn unregister(&self, client_id: &str) -> bool {
        let removed = self.connections.write().await.remove(client_id).is_some();
        if removed {
            log::debug!("Unregistered connection {client_id}");
        }
        removed
    }

    /// Record the user behind a connection.
    pub async fn identify(&self, client_id: &str, user_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(client_id) {
            if conn.info.user_id.as_deref() != Some(user_id) {
                conn.info.user_id = Some(user_id.to_string());
            }
        }
    }

    /// Deliver `frame` to every connection except `exclude`.
    pub async fn broadcast(&self, frame: EncodedFrame, exclude: Option<&str>) -> BroadcastReport {
        // Copy-on-read: never hold the lock while sending
        let targets: Vec<(String, mpsc::Sender<EncodedFrame>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != exclude)
                .map(|(id, conn)| (id.clone(), conn.outbox.clone()))
                .collect()
        };

        let mut report = BroadcastReport::default();
        for (client_id, outbox) in targets {
            match outbox.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.failed.push((client_id, DeliveryError::Full)),
                Err(TrySendError::Closed(_)) => {
                    report.failed.push((client_id, DeliveryError::Closed))
                }
            }
        }

        for (client_id, err) in &report.failed {
            self.drop_failed(client_id, *err).await;
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        report
    }

    /// Unregister a connection whose delivery failed.
    ///
    /// Used by broadcast and by connection tasks whose socket write failed.
    pub async fn drop_failed(&self, client_id: &str, err: DeliveryError) -> bool {
        let removed = self.unregister(client_id).await;
        if removed {
            self.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("Delivery to {client_id} failed ({err}); connection dropped");
        }
        removed
    }

    pub async fn is_registered(&self, client_id: &str) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
            active_connections: self.len().await,
        }
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }
}

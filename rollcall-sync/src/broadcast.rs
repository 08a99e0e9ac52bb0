//! Registry of live connections and best-effort fan-out.
//!
//! Each connection owns a bounded outbound queue drained by its own task.
//! A broadcast encodes once, then `try_send`s the shared frame into every
//! queue: a full queue drops the frame for that connection only and a closed
//! one is skipped. Nothing here awaits a socket, so one slow client cannot
//! stall delivery to the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::rate_limit::Fingerprint;

/// Stable id for a registered connection.
pub type ConnId = Uuid;

/// Registry entry for one open connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub fingerprint: Fingerprint,
    sender: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    pub fn new(
        addr: SocketAddr,
        fingerprint: Fingerprint,
        sender: mpsc::Sender<Utf8Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            fingerprint,
            sender,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Per-call delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Outbound queue was full
    pub dropped: usize,
    /// Connection no longer open
    pub skipped: usize,
}

/// Lifetime delivery counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_connections: usize,
}

struct AtomicBroadcastStats {
    broadcasts: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnId, ConnectionHandle>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            stats: Arc::new(AtomicBroadcastStats {
                broadcasts: AtomicU64::new(0),
                frames_delivered: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub async fn register(&self, handle: ConnectionHandle) {
        self.connections.write().await.insert(handle.id, handle);
    }

    pub async fn deregister(&self, id: &ConnId) -> Option<ConnectionHandle> {
        self.connections.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn contains(&self, id: &ConnId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Whether any registered connection shares `fingerprint`.
    pub async fn has_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|handle| handle.fingerprint == *fingerprint)
    }

    /// Encode once and fan out to every open connection, sender included.
    pub async fn broadcast(&self, msg: &ServerMessage) -> Result<BroadcastReport, ProtocolError> {
        let frame = Utf8Bytes::from(msg.encode()?);
        Ok(self.broadcast_raw(frame).await)
    }

    /// Fan out a pre-encoded frame.
    pub async fn broadcast_raw(&self, frame: Utf8Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let connections = self.connections.read().await;
            for handle in connections.values() {
                match handle.sender.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("Dropping broadcast for slow connection {} ({})", handle.id, handle.addr);
                        report.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => report.skipped += 1,
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_connections: self.len().await,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

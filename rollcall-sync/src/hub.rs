//! WebSocket hub serving the roster document.
//!
//! ```text
//! Client A ──┐                          ┌── DocumentStore (read / write)
//!            ├── /rollcall-ws ── SyncHub ┤
//! Client B ──┘        │                 └── ConnectionRegistry ── fan-out
//!                     │
//!            size gate → JSON parse → RateLimiter → Validator
//! ```
//!
//! A new connection is immediately sent the current roster and settings.
//! `load`/`loadSettings` are answered to the sender only; `save`/`saveSettings`
//! overwrite their half of the document and the stored value is broadcast to
//! every open connection, the sender included.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::USER_AGENT, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ConnectionHandle, ConnectionRegistry};
use crate::model::{Document, PayloadMode};
use crate::protocol::{self, ClientMessage, CloseReason, ProtocolError, ServerMessage};
use crate::rate_limit::{Admission, Fingerprint, RateLimitConfig, RateLimiter};
use crate::storage::{DocumentStore, StoreError};
use crate::validate::Validator;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// The only path upgrades are accepted on
    pub path: String,
    /// Frames above this are closed with 1009 before parsing
    pub max_message_bytes: usize,
    pub rate_limit: RateLimitConfig,
    /// Broadcast frames buffered per connection before drops start
    pub outbound_capacity: usize,
    pub payload_mode: PayloadMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            path: "/rollcall-ws".to_string(),
            max_message_bytes: protocol::MAX_MESSAGE_BYTES,
            rate_limit: RateLimitConfig::default(),
            outbound_capacity: 64,
            payload_mode: PayloadMode::Plain,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub saves_applied: u64,
    pub validation_rejects: u64,
    pub rate_limit_closes: u64,
    pub broadcasts: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    saves_applied: AtomicU64,
    validation_rejects: AtomicU64,
    rate_limit_closes: AtomicU64,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the connection task should do after one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to send (validation failure)
    Ignore,
    /// Answer the sender only
    Reply(ServerMessage),
    /// Already fanned out to every open connection, sender included
    Broadcast(ServerMessage),
    /// Send a close frame and stop serving the connection
    Close(CloseReason),
}

/// Per-connection identity the hub needs while processing frames.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext {
    pub addr: SocketAddr,
    pub fingerprint: Fingerprint,
}

/// The sync hub.
pub struct SyncHub {
    config: HubConfig,
    store: Arc<dyn DocumentStore>,
    registry: ConnectionRegistry,
    limiter: Arc<RateLimiter>,
    validator: Validator,
    /// Serializes read-modify-write of the document
    write_gate: Mutex<()>,
    stats: AtomicHubStats,
}

impl SyncHub {
    pub fn new(config: HubConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            validator: Validator::new(config.payload_mode),
            registry: ConnectionRegistry::new(),
            write_gate: Mutex::new(()),
            stats: AtomicHubStats::default(),
            store,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), HubError> {
        log::info!(
            "Roll-call hub listening on {}{}",
            listener.local_addr()?,
            self.config.path
        );
        let sweeper = self.limiter.spawn_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(HubError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Handshake, register, push the current document, then serve frames.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), HubError> {
        let mut user_agent = String::new();
        let expected_path = self.config.path.as_str();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != expected_path {
                let mut refused = ErrorResponse::new(Some("Not Found".to_string()));
                *refused.status_mut() = StatusCode::NOT_FOUND;
                return Err(refused);
            }
            if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
                user_agent = agent.to_string();
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let ctx = ConnContext {
            addr,
            fingerprint: Fingerprint::derive(addr.ip(), &user_agent),
        };
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let handle = ConnectionHandle::new(addr, ctx.fingerprint, out_tx);
        let conn_id = handle.id;
        self.registry.register(handle).await;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {conn_id} established from {addr} [{}]", ctx.fingerprint);

        let outcome = match self.push_current(&mut ws_sender).await {
            Ok(()) => self.serve_frames(&ctx, &mut ws_sender, ws_receiver, out_rx).await,
            Err(HubError::Store(e)) => {
                log::error!("Could not read document for new connection {addr}: {e}");
                Ok(Some(CloseReason::ServerError))
            }
            Err(e) => Err(e),
        };

        // Release before the close frame goes out so a prompt reconnect is admitted.
        // Siblings with the same fingerprint keep the shared count.
        self.registry.deregister(&conn_id).await;
        if !self.registry.has_fingerprint(&ctx.fingerprint).await {
            self.limiter.release(&ctx.fingerprint);
        }

        let result = match outcome {
            Ok(Some(reason)) => close(&mut ws_sender, reason).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        log::info!("Connection {conn_id} from {addr} closed");
        result
    }

    /// Send the roster, then the settings, to a freshly attached connection.
    async fn push_current(&self, ws_sender: &mut WsSink) -> Result<(), HubError> {
        let doc = self.store.read()?;
        send(ws_sender, &ServerMessage::Attendees(doc.roster)).await?;
        send(ws_sender, &ServerMessage::PublicSettings(doc.settings)).await
    }

    async fn serve_frames(
        &self,
        ctx: &ConnContext,
        ws_sender: &mut WsSink,
        mut ws_receiver: WsSource,
        mut out_rx: mpsc::Receiver<Utf8Bytes>,
    ) -> Result<Option<CloseReason>, HubError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let action = match msg {
                        Some(Ok(Message::Text(text))) => self.process(ctx, text.as_bytes()).await,
                        Some(Ok(Message::Binary(data))) => self.process(ctx, &data).await,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(None),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", ctx.addr);
                            return Ok(None);
                        }
                    };

                    match action {
                        Action::Ignore | Action::Broadcast(_) => {}
                        Action::Reply(reply) => send(ws_sender, &reply).await?,
                        Action::Close(reason) => return Ok(Some(reason)),
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::Text(frame)).await?,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Run one inbound frame through every gate and the document.
    ///
    /// Socket-free so it can be driven directly in tests.
    pub async fn process(&self, ctx: &ConnContext, raw: &[u8]) -> Action {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(raw.len() as u64, Ordering::Relaxed);

        let envelope = match protocol::parse_frame(raw, self.config.max_message_bytes) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Closing {}: {e}", ctx.addr);
                return Action::Close(e.close_reason());
            }
        };

        if let Admission::Limited { count } = self.limiter.check(ctx.fingerprint, Instant::now()) {
            log::warn!(
                "Rate limit exceeded by {} [{}]: {count} messages in window",
                ctx.addr, ctx.fingerprint
            );
            self.stats.rate_limit_closes.fetch_add(1, Ordering::Relaxed);
            return Action::Close(CloseReason::RateLimited);
        }

        let msg = match self.validator.validate(envelope) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring invalid message from {}: {e}", ctx.addr);
                self.stats.validation_rejects.fetch_add(1, Ordering::Relaxed);
                return Action::Ignore;
            }
        };

        let outcome = match msg {
            ClientMessage::Load => self
                .store
                .read()
                .map(|doc| Action::Reply(ServerMessage::Attendees(doc.roster)))
                .map_err(HubError::from),
            ClientMessage::LoadSettings => self
                .store
                .read()
                .map(|doc| Action::Reply(ServerMessage::PublicSettings(doc.settings)))
                .map_err(HubError::from),
            ClientMessage::Save(roster) => self
                .apply(ctx, |doc| doc.roster = roster, |doc| ServerMessage::Attendees(doc.roster))
                .await
                .map(Action::Broadcast),
            ClientMessage::SaveSettings(settings) => self
                .apply(
                    ctx,
                    |doc| doc.settings = settings,
                    |doc| ServerMessage::PublicSettings(doc.settings),
                )
                .await
                .map(Action::Broadcast),
        };

        outcome.unwrap_or_else(|e| {
            log::error!("Failure while serving {}: {e}", ctx.addr);
            Action::Close(CloseReason::ServerError)
        })
    }

    /// Overwrite one half of the document and fan out what is now stored.
    ///
    /// The broadcast is queued before the gate is released, so every
    /// connection receives updates in commit order and the last frame it
    /// gets matches the stored document.
    async fn apply(
        &self,
        ctx: &ConnContext,
        edit: impl FnOnce(&mut Document),
        announce: impl FnOnce(Document) -> ServerMessage,
    ) -> Result<ServerMessage, HubError> {
        let _gate = self.write_gate.lock().await;
        let mut doc = self.store.read()?;
        edit(&mut doc);
        self.store.write(&doc)?;
        self.stats.saves_applied.fetch_add(1, Ordering::Relaxed);

        let update = announce(self.store.read()?);
        let report = self.registry.broadcast(&update).await?;
        log::debug!(
            "Broadcast from {}: {} delivered, {} dropped, {} skipped",
            ctx.addr, report.delivered, report.dropped, report.skipped
        );
        Ok(update)
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        let broadcast = self.registry.stats().await;
        HubStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: broadcast.active_connections,
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            saves_applied: self.stats.saves_applied.load(Ordering::Relaxed),
            validation_rejects: self.stats.validation_rejects.load(Ordering::Relaxed),
            rate_limit_closes: self.stats.rate_limit_closes.load(Ordering::Relaxed),
            broadcasts: broadcast.broadcasts,
            frames_delivered: broadcast.frames_delivered,
            frames_dropped: broadcast.frames_dropped,
        }
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), HubError> {
    ws_sender.send(Message::text(msg.encode()?)).await?;
    Ok(())
}

async fn close(ws_sender: &mut WsSink, reason: CloseReason) -> Result<(), HubError> {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.reason().into(),
    };
    ws_sender.send(Message::Close(Some(frame))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceRecord, Payload, PublicSettings};
    use crate::storage::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct FailingStore;

    impl DocumentStore for FailingStore {
        fn read(&self) -> Result<Document, StoreError> {
            Ok(Document::default())
        }

        fn write(&self, _doc: &Document) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
    }

    fn ctx() -> ConnContext {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000);
        ConnContext {
            addr,
            fingerprint: Fingerprint::derive(addr.ip(), "unit-test"),
        }
    }

    fn hub_with(config: HubConfig) -> SyncHub {
        let store = Arc::new(MemoryStore::new(config.payload_mode));
        SyncHub::new(config, store)
    }

    fn hub() -> SyncHub {
        hub_with(HubConfig::default())
    }

    const SAVE_ALICE: &str = r#"{"type":"save","data":[{"employeeId":"E1","name":"Alice","attending":true,"checkedAt":"2024-01-01T09:05:00Z"}]}"#;

    fn alice() -> AttendanceRecord {
        let mut rec = AttendanceRecord::new("E1", "Alice");
        rec.attending = true;
        rec.checked_at = Some("2024-01-01T09:05:00Z".into());
        rec
    }

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.path, "/rollcall-ws");
        assert_eq!(config.max_message_bytes, 100_000);
        assert_eq!(config.payload_mode, PayloadMode::Plain);
    }

    #[tokio::test]
    async fn test_load_replies_with_empty_roster() {
        let action = hub().process(&ctx(), br#"{"type":"load"}"#).await;
        assert_eq!(action, Action::Reply(ServerMessage::Attendees(Payload::Plain(vec![]))));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let hub = hub();
        let action = hub.process(&ctx(), SAVE_ALICE.as_bytes()).await;
        assert_eq!(
            action,
            Action::Broadcast(ServerMessage::Attendees(Payload::Plain(vec![alice()])))
        );

        let action = hub.process(&ctx(), br#"{"type":"load"}"#).await;
        assert_eq!(action, Action::Reply(ServerMessage::Attendees(Payload::Plain(vec![alice()]))));
        assert_eq!(hub.stats().await.saves_applied, 1);
    }

    #[tokio::test]
    async fn test_save_settings_keeps_roster() {
        let hub = hub();
        hub.process(&ctx(), SAVE_ALICE.as_bytes()).await;
        let action = hub
            .process(&ctx(), br#"{"type":"saveSettings","data":{"showList":true,"publicColumns":{}}}"#)
            .await;
        let expected = PublicSettings {
            show_list: true,
            public_columns: Default::default(),
        };
        assert_eq!(
            action,
            Action::Broadcast(ServerMessage::PublicSettings(Payload::Plain(expected.clone())))
        );

        let doc = hub.store.read().unwrap();
        assert_eq!(doc.roster, Payload::Plain(vec![alice()]));
        assert_eq!(doc.settings, Payload::Plain(expected));
    }

    #[tokio::test]
    async fn test_invalid_message_ignored() {
        let hub = hub();
        assert_eq!(hub.process(&ctx(), br#"{"type":"nuke"}"#).await, Action::Ignore);
        assert_eq!(
            hub.process(&ctx(), br#"{"type":"save","data":[{"employeeId":"","name":"x","attending":true}]}"#)
                .await,
            Action::Ignore
        );
        assert_eq!(hub.stats().await.validation_rejects, 2);
        assert_eq!(hub.store.read().unwrap(), Document::default());
    }

    #[tokio::test]
    async fn test_malformed_json_closes_1011() {
        let action = hub().process(&ctx(), b"{\"type\":").await;
        assert_eq!(action, Action::Close(CloseReason::ServerError));
    }

    #[tokio::test]
    async fn test_oversize_closes_1009_without_applying() {
        let hub = hub();
        let mut raw = SAVE_ALICE.as_bytes().to_vec();
        raw.resize(100_001, b' ');
        assert_eq!(hub.process(&ctx(), &raw).await, Action::Close(CloseReason::TooLarge));
        assert_eq!(hub.store.read().unwrap(), Document::default());
    }

    #[tokio::test]
    async fn test_rate_limit_closes_1008() {
        let hub = hub_with(HubConfig {
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                capacity: 3,
            },
            ..HubConfig::default()
        });
        for _ in 0..3 {
            assert!(matches!(hub.process(&ctx(), br#"{"type":"load"}"#).await, Action::Reply(_)));
        }
        assert_eq!(
            hub.process(&ctx(), br#"{"type":"load"}"#).await,
            Action::Close(CloseReason::RateLimited)
        );
        assert_eq!(hub.stats().await.rate_limit_closes, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_closes_1011() {
        let hub = SyncHub::new(HubConfig::default(), Arc::new(FailingStore));
        assert_eq!(
            hub.process(&ctx(), SAVE_ALICE.as_bytes()).await,
            Action::Close(CloseReason::ServerError)
        );
        assert_eq!(hub.stats().await.saves_applied, 0);
    }

    fn save_frame(records: usize, prefix: &str) -> Vec<u8> {
        let roster = (0..records)
            .map(|i| AttendanceRecord::new(format!("{prefix}{i:04}"), format!("Employee {i}")))
            .collect();
        ClientMessage::Save(Payload::Plain(roster)).encode().unwrap().into_bytes()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_saves_leave_viewers_on_stored_roster() {
        let hub = Arc::new(hub_with(HubConfig {
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                capacity: u32::MAX,
            },
            ..HubConfig::default()
        }));
        let (tx, mut viewer) = mpsc::channel(16);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50001);
        let handle = ConnectionHandle::new(addr, Fingerprint::derive(addr.ip(), "viewer"), tx);
        hub.registry().register(handle).await;

        let large = save_frame(600, "L");
        let small = save_frame(1, "S");
        for _ in 0..200 {
            let (a, b) = (Arc::clone(&hub), Arc::clone(&hub));
            let (large, small) = (large.clone(), small.clone());
            let first = tokio::spawn(async move { a.process(&ctx(), &large).await });
            let second = tokio::spawn(async move { b.process(&ctx(), &small).await });
            assert!(matches!(first.await.unwrap(), Action::Broadcast(_)));
            assert!(matches!(second.await.unwrap(), Action::Broadcast(_)));

            let mut last = None;
            while let Ok(frame) = viewer.try_recv() {
                last = Some(frame);
            }
            let stored = ServerMessage::Attendees(hub.store.read().unwrap().roster)
                .encode()
                .unwrap();
            assert_eq!(last.expect("viewer got no broadcast").as_str(), stored);
        }
    }

    #[tokio::test]
    async fn test_sealed_mode_stores_opaque_blob() {
        let hub = hub_with(HubConfig {
            payload_mode: PayloadMode::Sealed,
            ..HubConfig::default()
        });
        assert_eq!(
            hub.process(&ctx(), br#"{"type":"load"}"#).await,
            Action::Reply(ServerMessage::Attendees(Payload::Sealed(String::new())))
        );
        assert_eq!(hub.process(&ctx(), SAVE_ALICE.as_bytes()).await, Action::Ignore);
        assert_eq!(
            hub.process(&ctx(), br#"{"type":"save","data":"b3BhcXVl"}"#).await,
            Action::Broadcast(ServerMessage::Attendees(Payload::Sealed("b3BhcXVl".into())))
        );
    }
}

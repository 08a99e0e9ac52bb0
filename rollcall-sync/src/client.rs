//! Client sync agent.
//!
//! ```text
//! DISCONNECTED → CONNECTING → OPEN → (CLOSED | FAILED) → RECONNECTING → CONNECTING …
//! ```
//!
//! One background task owns the socket. Requests reach it through an mpsc
//! channel while it is open; every decoded hub message is republished on a
//! broadcast channel that `request_load*` calls and subscriptions listen to.
//!
//! Loads never fail: if the agent is not open within the grace period, or no
//! reply arrives before the timeout, the local cache answers instead. Saves
//! update the cache and are sent only while open; a save issued while
//! disconnected is not queued.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::cache::{LocalCache, ROSTER_KEY, SETTINGS_KEY};
use crate::crypto::{CipherError, PayloadCipher};
use crate::model::{AttendanceRecord, Payload, PublicSettings, Roster};
use crate::protocol::{ClientMessage, ProtocolError, ResponseType, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Open,
    /// The hub closed the connection
    Closed,
    /// The connection could not be opened or broke with an error
    Failed,
    /// Waiting out the reconnect delay
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub url: String,
    /// How long a load waits for the connection to open
    pub open_grace: Duration,
    /// How long a load waits for its reply
    pub response_timeout: Duration,
    /// Flat delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Pre-shared secret; enables sealed payloads
    pub secret: Option<String>,
    pub user_agent: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/rollcall-ws".to_string(),
            open_grace: Duration::from_millis(100),
            response_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
            secret: None,
            user_agent: concat!("rollcall-agent/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl AgentConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short timeouts for tests against a local hub.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            open_grace: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid user agent: {0}")]
    UserAgent(#[from] InvalidHeaderValue),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("received a sealed payload but no shared secret is configured")]
    MissingSecret,
}

/// Converts between domain values and wire payloads.
#[derive(Debug, Clone, Default)]
struct PayloadCodec {
    cipher: Option<PayloadCipher>,
}

impl PayloadCodec {
    fn seal_roster(&self, roster: &[AttendanceRecord]) -> Result<Payload<Roster>, CipherError> {
        match &self.cipher {
            Some(cipher) => cipher.seal_roster(roster).map(Payload::Sealed),
            None => Ok(Payload::Plain(roster.to_vec())),
        }
    }

    fn seal_settings(&self, settings: &PublicSettings) -> Result<Payload<PublicSettings>, CipherError> {
        match &self.cipher {
            Some(cipher) => cipher.seal_settings(settings).map(Payload::Sealed),
            None => Ok(Payload::Plain(settings.clone())),
        }
    }

    fn open_roster(&self, payload: Payload<Roster>) -> Result<Roster, AgentError> {
        match (payload, &self.cipher) {
            (Payload::Plain(roster), _) => Ok(roster),
            (Payload::Sealed(sealed), Some(cipher)) => Ok(cipher.open_roster(&sealed)?),
            (Payload::Sealed(_), None) => Err(AgentError::MissingSecret),
        }
    }

    fn open_settings(&self, payload: Payload<PublicSettings>) -> Result<PublicSettings, AgentError> {
        match (payload, &self.cipher) {
            (Payload::Plain(settings), _) => Ok(settings),
            (Payload::Sealed(sealed), Some(cipher)) => Ok(cipher.open_settings(&sealed)?),
            (Payload::Sealed(_), None) => Err(AgentError::MissingSecret),
        }
    }
}

struct Shared {
    config: AgentConfig,
    codec: PayloadCodec,
    cache: Arc<dyn LocalCache>,
    state: watch::Sender<AgentState>,
    /// Present only while the socket is open
    outgoing: Mutex<Option<mpsc::Sender<Utf8Bytes>>>,
    inbound: broadcast::Sender<ServerMessage>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, state: AgentState) {
        log::debug!("Agent for {} → {state:?}", self.config.url);
        self.state.send_replace(state);
    }

    fn set_outgoing(&self, tx: Option<mpsc::Sender<Utf8Bytes>>) {
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = tx;
        }
    }

    fn outgoing(&self) -> Option<mpsc::Sender<Utf8Bytes>> {
        self.outgoing.lock().ok()?.clone()
    }

    fn dispatch(&self, raw: &str) {
        match ServerMessage::decode(raw) {
            // No receivers is fine: nobody is waiting right now.
            Ok(msg) => {
                let _ = self.inbound.send(msg);
            }
            Err(e) => log::debug!("Ignoring undecodable hub message: {e}"),
        }
    }

    fn cache_json<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) {
        let stored = serde_json::to_string(value)
            .map_err(|e| e.to_string())
            .and_then(|json| self.cache.set(key, &json).map_err(|e| e.to_string()));
        if let Err(e) = stored {
            log::warn!("Could not update local cache `{key}`: {e}");
        }
    }

    fn cached_roster(&self) -> Roster {
        self.cache
            .get(ROSTER_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn cached_settings(&self) -> PublicSettings {
        self.cache
            .get(SETTINGS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

/// A reconnecting connection to the hub.
pub struct SyncAgent {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl SyncAgent {
    /// Start connecting in the background and return immediately.
    pub fn connect(config: AgentConfig, cache: Arc<dyn LocalCache>) -> Result<Self, AgentError> {
        let mut agent = Self::build(config, cache)?;
        agent.start();
        Ok(agent)
    }

    fn build(config: AgentConfig, cache: Arc<dyn LocalCache>) -> Result<Self, AgentError> {
        let cipher = config.secret.as_deref().map(PayloadCipher::new).transpose()?;
        // Fail early rather than on every reconnect
        HeaderValue::from_str(&config.user_agent)?;

        let (inbound, _) = broadcast::channel(64);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                codec: PayloadCodec { cipher },
                cache,
                state: watch::channel(AgentState::Disconnected).0,
                outgoing: Mutex::new(None),
                inbound,
                shutdown: watch::channel(false).0,
            }),
            task: None,
        })
    }

    fn start(&mut self) {
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        self.task = Some(tokio::spawn(run_connection(shared, shutdown)));
    }

    pub fn state(&self) -> AgentState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Wait until the connection is open. Returns false on timeout.
    pub async fn wait_open(&self, within: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        tokio::time::timeout(within, state.wait_for(|s| *s == AgentState::Open))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Fetch the roster from the hub, falling back to the local cache.
    pub async fn request_load(&self) -> Roster {
        let reply = self.request(ClientMessage::Load, ResponseType::Attendees).await;
        let Some(ServerMessage::Attendees(payload)) = reply else {
            log::info!("Serving roster from local cache");
            return self.shared.cached_roster();
        };
        match self.shared.codec.open_roster(payload) {
            Ok(roster) => {
                self.shared.cache_json(ROSTER_KEY, &roster);
                roster
            }
            Err(e) => {
                log::warn!("Could not open roster from hub: {e}");
                self.shared.cached_roster()
            }
        }
    }

    /// Fetch the public settings from the hub, falling back to the local cache.
    pub async fn request_load_settings(&self) -> PublicSettings {
        let reply = self
            .request(ClientMessage::LoadSettings, ResponseType::PublicSettings)
            .await;
        let Some(ServerMessage::PublicSettings(payload)) = reply else {
            log::info!("Serving settings from local cache");
            return self.shared.cached_settings();
        };
        match self.shared.codec.open_settings(payload) {
            Ok(settings) => {
                self.shared.cache_json(SETTINGS_KEY, &settings);
                settings
            }
            Err(e) => {
                log::warn!("Could not open settings from hub: {e}");
                self.shared.cached_settings()
            }
        }
    }

    /// Cache the roster locally and send it if the connection is open.
    ///
    /// Returns whether the save was handed to the socket. Confirmation is the
    /// hub's `attendees` broadcast.
    pub fn request_save(&self, roster: &[AttendanceRecord]) -> bool {
        self.shared.cache_json(ROSTER_KEY, roster);
        match self.shared.codec.seal_roster(roster) {
            Ok(payload) => self.send_now(ClientMessage::Save(payload)),
            Err(e) => {
                log::error!("Could not seal roster: {e}");
                false
            }
        }
    }

    /// Cache the settings locally and send them if the connection is open.
    pub fn request_save_settings(&self, settings: &PublicSettings) -> bool {
        self.shared.cache_json(SETTINGS_KEY, settings);
        match self.shared.codec.seal_settings(settings) {
            Ok(payload) => self.send_now(ClientMessage::SaveSettings(payload)),
            Err(e) => {
                log::error!("Could not seal settings: {e}");
                false
            }
        }
    }

    /// Close the connection and cancel any pending reconnect.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Wait for the background task to finish after [`SyncAgent::shutdown`].
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send_now(&self, msg: ClientMessage) -> bool {
        let kind = msg.message_type();
        let Some(tx) = self.shared.outgoing().filter(|_| self.state() == AgentState::Open) else {
            log::debug!("Dropping {kind} while disconnected");
            return false;
        };
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Could not encode {kind}: {e}");
                return false;
            }
        };
        match tx.try_send(Utf8Bytes::from(frame)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping {kind}: {e}");
                false
            }
        }
    }

    /// Send `msg` and wait for the next hub message of type `expect`.
    async fn request(&self, msg: ClientMessage, expect: ResponseType) -> Option<ServerMessage> {
        let kind = msg.message_type();
        if !self.wait_open(self.shared.config.open_grace).await {
            log::debug!("Agent not open within grace period, skipping {kind}");
            return None;
        }
        let tx = self.shared.outgoing()?;
        let mut inbound = self.shared.inbound.subscribe();

        let frame = msg.encode().ok()?;
        tx.send(Utf8Bytes::from(frame)).await.ok()?;

        let reply = async {
            loop {
                match inbound.recv().await {
                    Ok(reply) if reply.response_type() == expect => return Some(reply),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Skipped {n} hub messages while waiting for {kind}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        match tokio::time::timeout(self.shared.config.response_timeout, reply).await {
            Ok(reply) => reply,
            Err(_) => {
                log::warn!("No reply to {kind} within {:?}", self.shared.config.response_timeout);
                None
            }
        }
    }

    /// Open a dedicated connection that calls `on_update` for every roster
    /// the hub pushes, including the one sent on connect.
    pub fn subscribe_attendees<F>(
        config: AgentConfig,
        cache: Arc<dyn LocalCache>,
        mut on_update: F,
    ) -> Result<Subscription, AgentError>
    where
        F: FnMut(Roster) + Send + 'static,
    {
        Self::subscribe(config, cache, move |codec, msg| {
            if let ServerMessage::Attendees(payload) = msg {
                match codec.open_roster(payload) {
                    Ok(roster) => on_update(roster),
                    Err(e) => log::warn!("Skipping roster update: {e}"),
                }
            }
        })
    }

    /// Like [`SyncAgent::subscribe_attendees`] for public settings.
    pub fn subscribe_settings<F>(
        config: AgentConfig,
        cache: Arc<dyn LocalCache>,
        mut on_update: F,
    ) -> Result<Subscription, AgentError>
    where
        F: FnMut(PublicSettings) + Send + 'static,
    {
        Self::subscribe(config, cache, move |codec, msg| {
            if let ServerMessage::PublicSettings(payload) = msg {
                match codec.open_settings(payload) {
                    Ok(settings) => on_update(settings),
                    Err(e) => log::warn!("Skipping settings update: {e}"),
                }
            }
        })
    }

    fn subscribe<H>(
        config: AgentConfig,
        cache: Arc<dyn LocalCache>,
        mut handle: H,
    ) -> Result<Subscription, AgentError>
    where
        H: FnMut(&PayloadCodec, ServerMessage) + Send + 'static,
    {
        let mut agent = Self::build(config, cache)?;
        // Subscribe before connecting so the initial push is not missed
        let mut inbound = agent.shared.inbound.subscribe();
        let codec = agent.shared.codec.clone();
        agent.start();

        let listener = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(msg) => handle(&codec, msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscription fell behind by {n} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription { agent, listener })
    }
}

impl Drop for SyncAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Live subscription. Dropping it has the same effect as [`Subscription::unsubscribe`].
pub struct Subscription {
    agent: SyncAgent,
    listener: JoinHandle<()>,
}

impl Subscription {
    pub fn state(&self) -> AgentState {
        self.agent.state()
    }

    pub fn agent(&self) -> &SyncAgent {
        &self.agent
    }

    /// Stop callbacks, close the connection and cancel any pending reconnect.
    ///
    /// The teardown lives in `Drop`; consuming `self` runs it.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listener.abort();
        self.agent.shutdown();
    }
}

async fn run_connection(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        shared.set_state(AgentState::Connecting);
        match connect_once(&shared, &mut shutdown).await {
            Ok(()) => shared.set_state(AgentState::Closed),
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", shared.config.url);
                shared.set_state(AgentState::Failed);
            }
        }
        if *shutdown.borrow() {
            break;
        }

        shared.set_state(AgentState::Reconnecting);
        log::info!(
            "Reconnecting to {} in {:?}",
            shared.config.url,
            shared.config.reconnect_delay
        );
        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = shutdown.changed() => {}
        }
    }
    shared.set_outgoing(None);
    shared.set_state(AgentState::Disconnected);
}

/// One connection lifetime: handshake, then pump frames until either side stops.
async fn connect_once(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Result<(), AgentError> {
    let mut request = shared.config.url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(USER_AGENT, HeaderValue::from_str(&shared.config.user_agent)?);

    let ws_stream = tokio::select! {
        res = tokio_tungstenite::connect_async(request) => res?.0,
        _ = shutdown.changed() => return Ok(()),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Utf8Bytes>(64);
    shared.set_outgoing(Some(out_tx));
    shared.set_state(AgentState::Open);
    log::info!("Connected to {}", shared.config.url);

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.dispatch(text),
                    Err(_) => log::debug!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        log::info!("Hub closed connection: {} {}", u16::from(frame.code), frame.reason.as_str());
                    }
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },

            frame = out_rx.recv() => {
                let Some(frame) = frame else { break Ok(()) };
                if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                    break Err(e.into());
                }
            }

            _ = shutdown.changed() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    shared.set_outgoing(None);
    result
}

//! # rollcall-sync: Live roll-call roster synchronization
//!
//! One authoritative hub holds a single roster document and pushes every
//! change to all connected clients over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncAgent   │ ◄─────────────────► │ SyncHub     │
//! │ (per view)  │     JSON envelopes  │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                            ┌──────┴──────────────┐
//! ┌─────────────┐                     │ RateLimiter         │
//! │ LocalCache  │                     │ Validator           │
//! │ (fallback)  │                     │ ConnectionRegistry  │
//! └─────────────┘                     └──────┬──────────────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ DocumentStore │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: roster records, public settings, the persisted document
//! - [`protocol`]: JSON envelopes and close codes
//! - [`validate`]: structural checks on inbound envelopes
//! - [`rate_limit`]: fixed-window per-fingerprint admission
//! - [`broadcast`]: connection registry and non-blocking fan-out
//! - [`storage`]: memory, JSON file and RocksDB document stores
//! - [`hub`]: the WebSocket hub
//! - [`client`]: reconnecting sync agent with local-cache fallback
//! - [`crypto`]: optional sealing of payloads with a shared secret
//! - [`config`]: environment configuration

pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod crypto;
pub mod hub;
pub mod model;
pub mod protocol;
pub mod rate_limit;
pub mod storage;
pub mod validate;

pub use broadcast::{BroadcastReport, BroadcastStats, ConnId, ConnectionRegistry};
pub use cache::{FileCache, LocalCache, MemoryCache};
pub use client::{AgentConfig, AgentError, AgentState, Subscription, SyncAgent};
pub use config::{ConfigError, StoreBackend, StoreSettings};
pub use crypto::{CipherError, PayloadCipher};
pub use hub::{HubConfig, HubError, HubStats, SyncHub};
pub use model::{
    AttendanceRecord, Document, Payload, PayloadMode, PublicSettings, Roster, RosterStats,
};
pub use protocol::{ClientMessage, CloseReason, MessageType, ProtocolError, ServerMessage};
pub use rate_limit::{Fingerprint, RateLimitConfig, RateLimiter};
pub use storage::{open_store, DocumentStore, FileStore, MemoryStore, StoreError};
pub use validate::{ValidationError, Validator};

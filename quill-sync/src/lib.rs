//! # quill-sync — Real-time collaborative document synchronization
//!
//! A WebSocket server that keeps any number of clients editing the same
//! document convergent, using CRDT merge semantics, plus the client to go
//! with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │  SyncServer  │
//! │ (per user)  │   binary frames     │  (hyper)     │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                              auth │ upgrade
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ local yrs   │                     │   Registry   │
//! │ replica     │                     │ (one session │
//! └─────────────┘                     │  per doc)    │
//!                                     └──────┬───────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │   DocSession    │
//!                                   │ doc · awareness │
//!                                   │ fanout · store  │
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire frames (varint-framed sync + awareness)
//! - [`doc`] — CRDT replica seam around yrs
//! - [`awareness`] — ephemeral presence with last-writer-wins clocks
//! - [`broadcast`] — per-document fan-out channel
//! - [`session`] / [`registry`] — document lifecycle and eviction
//! - [`server`] — HTTP front door, auth, connection loop
//! - [`client`] — embeddable sync client
//! - [`storage`] — snapshot persistence (RocksDB or in-memory)

pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod doc;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Claims, TokenVerifier};
pub use awareness::{AwarenessEntry, AwarenessTable, AwarenessUpdate};
pub use broadcast::{BroadcastGroup, Envelope, FanoutStats};
pub use client::{ClientError, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use doc::{DocError, SharedDoc};
pub use protocol::{Frame, ProtocolError};
pub use registry::Registry;
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::DocSession;
pub use storage::{
    DocumentMetadata, MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError,
};

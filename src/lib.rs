//! # tandem-collab — Real-time collaborative text editing backend
//!
//! Multiple authenticated users edit one shared document; each sees the
//! others' edits and cursors within hundreds of milliseconds, and replicas
//! converge even under partitions and reordered delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │   binary frames     │ (rooms)      │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ SharedText  │                     │ SharedText   │
//! │ (local)     │                     │ (authority)  │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastHub  │
//!                                    │ + Storage     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded [`SyncMessage`])
//! - [`auth`] — bearer-token claims and the [`TokenVerifier`] seam
//! - [`engine`] — sequence CRDT over the `shared-text` root
//! - [`room`] — per-document room: clocks, members, op buffer, checkpoints
//! - [`registry`] — DocumentId → live room, hydration from storage
//! - [`session`] — per-connection state machine and dispatch
//! - [`broadcast`] — room fan-out with backpressure
//! - [`presence`] — cursors, color palette, throttling
//! - [`server`] — WebSocket accept loop and configuration
//! - [`client`] — sync client with offline queue and reconnect
//! - [`storage`] — the [`Storage`] trait plus memory and RocksDB backends

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod engine;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{parse_claims, AuthError, ClaimsOnlyVerifier, StaticTokenVerifier, TokenClaims, TokenVerifier};
pub use broadcast::{BroadcastHub, BroadcastStats, OutboundFrame};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use engine::{EngineError, SharedText, SHARED_TEXT_ROOT};
pub use presence::{palette_color, CursorState, CursorThrottle, CursorTracker, CURSOR_PALETTE};
pub use protocol::{
    generate_client_id, ClientId, CursorPayload, DocumentId, ErrorCode, MessageKind, Participant,
    ProtocolError, SyncMessage, UserId,
};
pub use registry::{RegistryError, RoomRegistry};
pub use room::{Room, RoomError};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::Session;
pub use storage::{
    AccessRole, DocumentRecord, MemoryStore, OfflineEntry, OperationRecord, RocksStore,
    SessionRecord, Storage, StoreConfig, StoreError, UserRecord,
};

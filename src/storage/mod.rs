//! Persistence interface for the collaboration core.
//!
//! The core consumes storage exclusively through the [`Storage`] trait:
//! document metadata and snapshots, append-only operation rows, session
//! records, access grants, and per-client offline queues. Two
//! implementations ship with the crate:
//!
//! - [`MemoryStore`] — hash maps behind a mutex; tests and single-process
//!   deployments.
//! - [`RocksStore`] — embedded RocksDB with LZ4-compressed snapshots and
//!   operation rows.
//!
//! Operation rows are append-only with a strictly increasing `version` per
//! document; a snapshot at version V plus all rows with `version > V`
//! reconstructs the live document exactly.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::presence::CursorState;
use crate::protocol::{ClientId, DocumentId, UserId};

/// Document metadata plus the latest checkpoint, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub owner_id: UserId,
    pub snapshot_state: Option<Vec<u8>>,
    pub snapshot_version: u64,
}

/// A user as resolved from the identity provider's `openId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    pub open_id: String,
    pub name: String,
}

/// Role granted on a document. Any grant admits the user to the room;
/// grant/revoke workflows live outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessRole {
    Editor,
    Viewer,
}

/// One accepted update, persisted append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub document_id: DocumentId,
    pub client_id: ClientId,
    pub user_id: UserId,
    pub update: Vec<u8>,
    pub lamport: u64,
    pub vector_clock: HashMap<ClientId, u64>,
    /// Strictly increasing per document; `(document_id, version)` is unique
    pub version: u64,
}

/// A live connection's persisted session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub client_id: ClientId,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub color: String,
    pub cursor: CursorState,
}

/// One queued offline update, FIFO per `(client_id, document_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineEntry {
    pub client_id: ClientId,
    pub document_id: DocumentId,
    pub update: Vec<u8>,
    pub sequence: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "compression error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Data-access operations the core requires.
///
/// Calls are synchronous and expected to be fast for embedded backends;
/// failures on best-effort paths (operation inserts, cursor writes) are
/// logged by callers and retried at the next checkpoint.
pub trait Storage: Send + Sync {
    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Grant lookup for `(document_id, user_id)`; both must match.
    fn check_document_access(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<AccessRole>, StoreError>;

    fn get_user_by_open_id(&self, open_id: &str) -> Result<Option<UserRecord>, StoreError>;

    fn add_operation(&self, op: &OperationRecord) -> Result<(), StoreError>;

    /// Rows with `version > since`, ascending by version.
    fn get_operations_since(
        &self,
        document_id: DocumentId,
        since: u64,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    fn create_session(&self, session: &SessionRecord) -> Result<(), StoreError>;

    fn delete_session(&self, client_id: &str) -> Result<(), StoreError>;

    fn update_session_cursor(
        &self,
        client_id: &str,
        position: u32,
        selection: Option<(u32, u32)>,
    ) -> Result<(), StoreError>;

    /// Persist a checkpoint: full state plus its version.
    fn update_document_snapshot(
        &self,
        document_id: DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError>;

    fn add_offline_operation(&self, entry: &OfflineEntry) -> Result<(), StoreError>;

    /// Queued entries for `(client_id, document_id)`, ascending by sequence.
    fn get_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<Vec<OfflineEntry>, StoreError>;

    fn clear_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<(), StoreError>;
}

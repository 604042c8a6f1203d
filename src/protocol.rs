//! Binary wire protocol for room synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ client_id │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ variable  │ 8 bytes  │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Every message travels as one binary WebSocket frame. The transport
//! delivers frames FIFO per connection; there is no inter-client ordering.
//! Direct replies (`RoomJoined`, `SyncStep2`, `Pong`, `Error`) carry an
//! empty `client_id` when server-originated; broadcast frames carry the
//! origin client so the fan-out layer can exclude it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable document identifier, assigned by the metadata store.
pub type DocumentId = i64;

/// User identifier from the authenticated token.
pub type UserId = i64;

/// Opaque per-connection identity: `{userId}-{epochMs}-{random}`.
/// A reconnecting client mints a fresh one.
pub type ClientId = String;

/// Generate a connection-unique client id for the given user.
pub fn generate_client_id(user_id: UserId) -> ClientId {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("{user_id}-{epoch_ms}-{}", &random[..8])
}

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client requests membership in a document room (carries bearer token)
    JoinRoom = 1,
    /// Server confirms the join: member list + full document state
    RoomJoined = 2,
    /// Client sends its state vector to request a catch-up diff
    SyncStep1 = 3,
    /// Server responds with the delta advancing the client to current state
    SyncStep2 = 4,
    /// Incremental CRDT update
    Update = 5,
    /// Cursor position / selection change
    CursorUpdate = 6,
    /// A member joined the room
    UserJoined = 7,
    /// A member left the room
    UserLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
    /// Error reply (see [`ErrorCode`])
    Error = 11,
}

/// Wire error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing, malformed, or expired token
    AuthFailed,
    /// Token valid, no matching user
    UserNotFound,
    /// Document does not exist
    NotFound,
    /// User lacks permission for the document
    AccessDenied,
    /// Message sent before `join_room` succeeded
    NotInRoom,
    /// Update bytes invalid or rejected by the CRDT
    UpdateFailed,
    /// Unexpected internal failure
    ServerError,
}

impl ErrorCode {
    /// Whether the server closes the connection after emitting this code.
    ///
    /// Join-phase failures are terminal; `NotInRoom`, `UpdateFailed` and
    /// `ServerError` leave the connection open for retry.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed
                | ErrorCode::UserNotFound
                | ErrorCode::NotFound
                | ErrorCode::AccessDenied
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AuthFailed",
            ErrorCode::UserNotFound => "UserNotFound",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AccessDenied => "AccessDenied",
            ErrorCode::NotInRoom => "NotInRoom",
            ErrorCode::UpdateFailed => "UpdateFailed",
            ErrorCode::ServerError => "ServerError",
        };
        write!(f, "{s}")
    }
}

/// Room member identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub name: String,
    /// Hex color assigned round-robin at join (e.g. `"#e06c75"`)
    pub color: String,
}

/// `JoinRoom` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub token: String,
}

/// `RoomJoined` payload. The room's lamport clock rides in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStatePayload {
    pub users: Vec<Participant>,
    /// Full document state as an update against the empty document
    pub doc_state: Vec<u8>,
}

/// `CursorUpdate` payload.
///
/// Clients send `position`/`selection` only; the server stamps identity
/// fields from the session record before fanning out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorPayload {
    pub position: u32,
    pub selection: Option<(u32, u32)>,
    pub user_id: Option<UserId>,
    pub color: Option<String>,
    pub name: Option<String>,
}

/// `Error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub client_id: ClientId,
    pub doc_id: DocumentId,
    /// Lamport clock for logical ordering (0 where not meaningful)
    pub clock: u64,
    /// Payload (varies by kind)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn join_room(client_id: ClientId, doc_id: DocumentId, token: impl Into<String>) -> Self {
        let payload = encode_payload(&JoinPayload { token: token.into() });
        Self { kind: MessageKind::JoinRoom, client_id, doc_id, clock: 0, payload }
    }

    pub fn room_joined(
        client_id: ClientId,
        doc_id: DocumentId,
        users: Vec<Participant>,
        doc_state: Vec<u8>,
        lamport: u64,
    ) -> Self {
        let payload = encode_payload(&RoomStatePayload { users, doc_state });
        Self { kind: MessageKind::RoomJoined, client_id, doc_id, clock: lamport, payload }
    }

    pub fn sync_step1(client_id: ClientId, doc_id: DocumentId, state_vector: Vec<u8>) -> Self {
        Self { kind: MessageKind::SyncStep1, client_id, doc_id, clock: 0, payload: state_vector }
    }

    pub fn sync_step2(doc_id: DocumentId, state_diff: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncStep2,
            client_id: ClientId::new(),
            doc_id,
            clock: 0,
            payload: state_diff,
        }
    }

    pub fn update(client_id: ClientId, doc_id: DocumentId, clock: u64, update: Vec<u8>) -> Self {
        Self { kind: MessageKind::Update, client_id, doc_id, clock, payload: update }
    }

    pub fn cursor_update(client_id: ClientId, doc_id: DocumentId, cursor: &CursorPayload) -> Self {
        Self {
            kind: MessageKind::CursorUpdate,
            client_id,
            doc_id,
            clock: 0,
            payload: encode_payload(cursor),
        }
    }

    pub fn user_joined(doc_id: DocumentId, member: &Participant) -> Self {
        Self {
            kind: MessageKind::UserJoined,
            client_id: member.client_id.clone(),
            doc_id,
            clock: 0,
            payload: encode_payload(member),
        }
    }

    pub fn user_left(doc_id: DocumentId, member: &Participant) -> Self {
        Self {
            kind: MessageKind::UserLeft,
            client_id: member.client_id.clone(),
            doc_id,
            clock: 0,
            payload: encode_payload(member),
        }
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self { kind: MessageKind::Ping, client_id, doc_id: 0, clock: 0, payload: Vec::new() }
    }

    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            client_id: ClientId::new(),
            doc_id: 0,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn error(doc_id: DocumentId, code: ErrorCode, message: impl Into<String>) -> Self {
        let payload = encode_payload(&ErrorPayload { code, message: message.into() });
        Self { kind: MessageKind::Error, client_id: ClientId::new(), doc_id, clock: 0, payload }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a `JoinRoom` payload.
    pub fn join_payload(&self) -> Result<JoinPayload, ProtocolError> {
        self.typed_payload(MessageKind::JoinRoom)
    }

    /// Parse a `RoomJoined` payload.
    pub fn room_state(&self) -> Result<RoomStatePayload, ProtocolError> {
        self.typed_payload(MessageKind::RoomJoined)
    }

    /// Parse a `CursorUpdate` payload.
    pub fn cursor(&self) -> Result<CursorPayload, ProtocolError> {
        self.typed_payload(MessageKind::CursorUpdate)
    }

    /// Parse a `UserJoined`/`UserLeft` payload.
    pub fn participant(&self) -> Result<Participant, ProtocolError> {
        if self.kind != MessageKind::UserJoined && self.kind != MessageKind::UserLeft {
            return Err(ProtocolError::WrongKind);
        }
        decode_payload(&self.payload)
    }

    /// Parse an `Error` payload.
    pub fn error_payload(&self) -> Result<ErrorPayload, ProtocolError> {
        self.typed_payload(MessageKind::Error)
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(
        &self,
        expected: MessageKind,
    ) -> Result<T, ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::WrongKind);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    WrongKind,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::WrongKind => write!(f, "payload accessor used on wrong message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

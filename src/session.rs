//! Per-connection session handling.
//!
//! Each accepted socket runs one task through three phases:
//!
//! ```text
//!     INIT ── join_room(valid) ──▶ JOINED ──────────▶ CLOSED
//!      │                             │  ▲ (update, sync_step1,
//!      │                             │  │  cursor_update, ping)
//!      │                             ▼
//!      └── join_room(invalid) ──▶ rejected ──▶ CLOSED
//! ```
//!
//! INIT accepts only `join_room` (anything else draws `NotInRoom`) and is
//! bounded by the join deadline. JOINED multiplexes socket input, room
//! fan-out, eviction, and the staleness sweep in one `select!` loop. A
//! disconnect cancels nothing the client already committed: in-flight room
//! operations run to completion before the member is removed.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Frame;
use crate::presence::CursorState;
use crate::protocol::{
    generate_client_id, ClientId, DocumentId, ErrorCode, MessageKind, Participant, SyncMessage,
    UserId,
};
use crate::registry::RegistryError;
use crate::room::Room;
use crate::server::ServerContext;
use crate::storage::SessionRecord;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A connection's identity once joined; lifetime = one connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub name: String,
    pub color: String,
    pub joined_at: Instant,
}

/// Everything the joined phase needs.
struct Joined {
    session: Session,
    room: Arc<Room>,
    receiver: broadcast::Receiver<Frame>,
    evict_rx: mpsc::Receiver<()>,
}

impl std::fmt::Debug for Joined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joined").field("session", &self.session).finish_non_exhaustive()
    }
}

/// Handle one socket from handshake to teardown.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), BoxError> {
    let ws_stream = accept_handshake(stream, &ctx).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("websocket connection established from {addr}");

    {
        let mut stats = ctx.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let result = drive(&mut ws_sender, &mut ws_receiver, &ctx, addr).await;

    {
        let mut stats = ctx.stats.write().await;
        stats.active_connections -= 1;
        stats.active_rooms = ctx.registry.room_count().await;
    }
    result
}

/// Complete the WebSocket handshake, enforcing the configured origin.
async fn accept_handshake(
    stream: TcpStream,
    ctx: &ServerContext,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    match &ctx.config.client_origin {
        Some(allowed) => {
            let allowed = allowed.clone();
            tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
                let origin_ok = req
                    .headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .map(|o| o == allowed)
                    .unwrap_or(false);
                if origin_ok {
                    Ok(resp)
                } else {
                    let mut reject = ErrorResponse::new(Some("origin not allowed".to_string()));
                    *reject.status_mut() =
                        tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                    Err(reject)
                }
            })
            .await
        }
        None => tokio_tungstenite::accept_async(stream).await,
    }
}

async fn drive(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    ctx: &Arc<ServerContext>,
    addr: SocketAddr,
) -> Result<(), BoxError> {
    let deadline = ctx.config.join_deadline;
    let joined = match tokio::time::timeout(deadline, join_phase(ws_sender, ws_receiver, ctx, addr))
        .await
    {
        Ok(Ok(Some(joined))) => joined,
        Ok(Ok(None)) => return Ok(()), // rejected or socket closed
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            log::warn!("{addr}: no successful join within {deadline:?}, closing");
            let reply = SyncMessage::error(0, ErrorCode::AuthFailed, "join deadline exceeded");
            let _ = send(ws_sender, &reply).await;
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    joined_loop(ws_sender, ws_receiver, ctx, joined).await
}

/// INIT phase: wait for a valid `join_room`.
async fn join_phase(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    ctx: &Arc<ServerContext>,
    addr: SocketAddr,
) -> Result<Option<Joined>, BoxError> {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                note_message(ctx, bytes.len()).await;

                let sync_msg = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("{addr}: undecodable frame before join: {e}");
                        continue;
                    }
                };

                if sync_msg.kind != MessageKind::JoinRoom {
                    let reply = SyncMessage::error(
                        sync_msg.doc_id,
                        ErrorCode::NotInRoom,
                        "join_room required first",
                    );
                    send(ws_sender, &reply).await?;
                    continue;
                }

                match process_join(&sync_msg, ctx).await {
                    Ok((joined, hello)) => {
                        send(ws_sender, &hello).await?;
                        log::info!(
                            "client {} (user {}) joined doc {}",
                            joined.session.client_id,
                            joined.session.user_id,
                            joined.session.document_id
                        );
                        return Ok(Some(joined));
                    }
                    Err((code, message)) => {
                        log::warn!("{addr}: join_room rejected: {code}: {message}");
                        let reply = SyncMessage::error(sync_msg.doc_id, code, message);
                        send(ws_sender, &reply).await?;
                        // A room opened for a denied join must not linger
                        ctx.registry.drop_if_empty(sync_msg.doc_id).await;
                        if code.closes_connection() {
                            let _ = ws_sender.close().await;
                            return Ok(None);
                        }
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                ws_sender.send(Message::Pong(data)).await?;
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                log::warn!("{addr}: websocket error before join: {e}");
                return Ok(None);
            }
        }
    }
    Ok(None)
}

/// Validate a `join_room` and admit the client into its room.
async fn process_join(
    msg: &SyncMessage,
    ctx: &Arc<ServerContext>,
) -> Result<(Joined, SyncMessage), (ErrorCode, String)> {
    let payload = msg
        .join_payload()
        .map_err(|_| (ErrorCode::AuthFailed, "missing or malformed token".to_string()))?;
    let claims = ctx
        .verifier
        .verify(&payload.token)
        .map_err(|e| (ErrorCode::AuthFailed, e.to_string()))?;

    let user = match ctx.storage.get_user_by_open_id(&claims.open_id) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return Err((ErrorCode::UserNotFound, format!("no user for subject {}", claims.open_id)))
        }
        Err(e) => return Err((ErrorCode::ServerError, e.to_string())),
    };

    let room = match ctx.registry.get_or_create(msg.doc_id).await {
        Ok(room) => room,
        Err(RegistryError::NotFound(id)) => {
            return Err((ErrorCode::NotFound, format!("document {id} does not exist")))
        }
        Err(RegistryError::Store(e)) => return Err((ErrorCode::ServerError, e.to_string())),
    };

    // The owner always passes; everyone else needs a grant on exactly
    // this (document, user) pair.
    if user.id != room.owner_id() {
        match ctx.storage.check_document_access(msg.doc_id, user.id) {
            Ok(Some(_)) => {}
            Ok(None) => return Err((ErrorCode::AccessDenied, "no access grant".to_string())),
            Err(e) => return Err((ErrorCode::ServerError, e.to_string())),
        }
    }

    let client_id = if msg.client_id.is_empty() {
        generate_client_id(user.id)
    } else {
        msg.client_id.clone()
    };
    let color = ctx.next_color();

    let record = SessionRecord {
        client_id: client_id.clone(),
        document_id: msg.doc_id,
        user_id: user.id,
        color: color.clone(),
        cursor: CursorState::default(),
    };
    if let Err(e) = ctx.storage.create_session(&record) {
        log::warn!("session record for {client_id} not persisted: {e}");
    }

    let session = Session {
        client_id: client_id.clone(),
        user_id: user.id,
        document_id: msg.doc_id,
        name: user.name.clone(),
        color: color.clone(),
        joined_at: Instant::now(),
    };

    let info = Participant { client_id: client_id.clone(), user_id: user.id, name: user.name, color };
    let grant = room.admit(info).await;
    let hello = SyncMessage::room_joined(
        client_id,
        msg.doc_id,
        grant.participants,
        grant.doc_state,
        grant.lamport,
    );

    Ok((
        Joined { session, room, receiver: grant.receiver, evict_rx: grant.evict_rx },
        hello,
    ))
}

/// JOINED phase: dispatch until disconnect, eviction, or staleness.
async fn joined_loop(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    ctx: &Arc<ServerContext>,
    joined: Joined,
) -> Result<(), BoxError> {
    let Joined { session, room, mut receiver, mut evict_rx } = joined;

    {
        let mut stats = ctx.stats.write().await;
        stats.active_rooms = ctx.registry.room_count().await;
    }

    let mut last_heartbeat = Instant::now();
    let tick = (ctx.config.heartbeat_timeout / 4).max(Duration::from_millis(25));
    let mut stale_check = tokio::time::interval(tick);
    stale_check.tick().await; // consume the immediate first tick
    let mut evicted = false;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        note_message(ctx, bytes.len()).await;

                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("undecodable frame from {}: {e}", session.client_id);
                                continue;
                            }
                        };

                        match sync_msg.kind {
                            MessageKind::Update => {
                                match room
                                    .apply_remote(sync_msg.payload, &session.client_id, session.user_id)
                                    .await
                                {
                                    Ok(_) => {}
                                    Err(e) => {
                                        log::warn!("update from {} rejected: {e}", session.client_id);
                                        let reply = SyncMessage::error(
                                            session.document_id,
                                            ErrorCode::UpdateFailed,
                                            e.to_string(),
                                        );
                                        send(ws_sender, &reply).await?;
                                    }
                                }
                            }
                            MessageKind::SyncStep1 => {
                                let diff = room.compute_diff(&sync_msg.payload).await;
                                let reply = SyncMessage::sync_step2(session.document_id, diff);
                                send(ws_sender, &reply).await?;
                            }
                            MessageKind::CursorUpdate => {
                                if let Ok(cursor) = sync_msg.cursor() {
                                    last_heartbeat = Instant::now();
                                    room.update_cursor(
                                        &session.client_id,
                                        cursor.position,
                                        cursor.selection,
                                    )
                                    .await;
                                }
                            }
                            MessageKind::Ping => {
                                last_heartbeat = Instant::now();
                                room.touch(&session.client_id).await;
                                send(ws_sender, &SyncMessage::pong()).await?;
                            }
                            MessageKind::JoinRoom => {
                                log::debug!("duplicate join_room from {} ignored", session.client_id);
                            }
                            other => {
                                log::debug!("unhandled {other:?} from {}", session.client_id);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("websocket error from {}: {e}", session.client_id);
                        break;
                    }
                    _ => {}
                }
            }

            frame = receiver.recv() => {
                match frame {
                    Ok(frame) => {
                        // Never echo a client's own updates back at it
                        if frame.origin.as_deref() != Some(session.client_id.as_str()) {
                            ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{} lagged by {n} frames", session.client_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = evict_rx.recv() => {
                log::info!("session {} evicted by reconnect", session.client_id);
                evicted = true;
                break;
            }

            _ = stale_check.tick() => {
                if last_heartbeat.elapsed() > ctx.config.heartbeat_timeout {
                    log::warn!("session {} missed heartbeats, synthetic disconnect", session.client_id);
                    break;
                }
            }
        }
    }

    // Teardown. An evicted session's membership and session record already
    // belong to its successor.
    if !evicted {
        if room.leave(&session.client_id).await {
            ctx.registry.drop_if_empty(session.document_id).await;
        }
        if let Err(e) = ctx.storage.delete_session(&session.client_id) {
            log::warn!("session record for {} not removed: {e}", session.client_id);
        }
    }
    log::info!("session {} closed", session.client_id);
    Ok(())
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    let bytes = msg.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn note_message(ctx: &ServerContext, len: usize) {
    let mut stats = ctx.stats.write().await;
    stats.total_messages += 1;
    stats.total_bytes += len as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::server::ServerConfig;
    use crate::storage::{AccessRole, MemoryStore};

    fn seeded_ctx() -> Arc<ServerContext> {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(1, "open-alice", "Alice");
        store.insert_user(2, "open-bob", "Bob");
        store.insert_document(7, 1);
        store.grant_access(7, 2, AccessRole::Editor);

        let verifier = StaticTokenVerifier::new()
            .accept("tok-alice", "open-alice")
            .accept("tok-bob", "open-bob")
            .accept("tok-ghost", "open-ghost");
        Arc::new(ServerContext::new(ServerConfig::default(), store, Arc::new(verifier)))
    }

    fn join_msg(client_id: &str, doc_id: DocumentId, token: &str) -> SyncMessage {
        SyncMessage::join_room(client_id.into(), doc_id, token)
    }

    #[tokio::test]
    async fn test_join_owner_passes_without_grant() {
        let ctx = seeded_ctx();
        let (joined, hello) = process_join(&join_msg("a-1-x", 7, "tok-alice"), &ctx).await.unwrap();

        assert_eq!(joined.session.user_id, 1);
        assert_eq!(joined.session.document_id, 7);
        assert_eq!(hello.kind, MessageKind::RoomJoined);
        let state = hello.room_state().unwrap();
        assert_eq!(state.users.len(), 1);
        assert_eq!(joined.room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_with_grant_passes() {
        let ctx = seeded_ctx();
        let (joined, _) = process_join(&join_msg("b-2-y", 7, "tok-bob"), &ctx).await.unwrap();
        assert_eq!(joined.session.user_id, 2);
    }

    #[tokio::test]
    async fn test_join_bad_token_is_auth_failed() {
        let ctx = seeded_ctx();
        let err = process_join(&join_msg("a-1-x", 7, "tok-forged"), &ctx).await.unwrap_err();
        assert_eq!(err.0, ErrorCode::AuthFailed);
    }

    #[tokio::test]
    async fn test_join_unknown_subject_is_user_not_found() {
        let ctx = seeded_ctx();
        let err = process_join(&join_msg("g-9-z", 7, "tok-ghost"), &ctx).await.unwrap_err();
        assert_eq!(err.0, ErrorCode::UserNotFound);
    }

    #[tokio::test]
    async fn test_join_missing_document_is_not_found() {
        let ctx = seeded_ctx();
        let err = process_join(&join_msg("a-1-x", 999, "tok-alice"), &ctx).await.unwrap_err();
        assert_eq!(err.0, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_join_without_grant_is_access_denied() {
        let ctx = seeded_ctx();
        let store = Arc::new(MemoryStore::new());
        store.insert_user(3, "open-carol", "Carol");
        store.insert_document(7, 1);
        let verifier = StaticTokenVerifier::new().accept("tok-carol", "open-carol");
        let ctx2 = Arc::new(ServerContext::new(
            ctx.config.clone(),
            store.clone(),
            Arc::new(verifier),
        ));

        let err = process_join(&join_msg("c-3-z", 7, "tok-carol"), &ctx2).await.unwrap_err();
        assert_eq!(err.0, ErrorCode::AccessDenied);
        // No session record persisted for a denied join
        assert!(store.session("c-3-z").is_none());
    }

    #[tokio::test]
    async fn test_join_generates_client_id_when_absent() {
        let ctx = seeded_ctx();
        let (joined, _) = process_join(&join_msg("", 7, "tok-alice"), &ctx).await.unwrap();
        assert!(joined.session.client_id.starts_with("1-"));
    }

    #[tokio::test]
    async fn test_join_persists_session_record() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(1, "open-alice", "Alice");
        store.insert_document(7, 1);
        let verifier = StaticTokenVerifier::new().accept("tok-alice", "open-alice");
        let ctx = Arc::new(ServerContext::new(
            ServerConfig::default(),
            store.clone(),
            Arc::new(verifier),
        ));

        let (joined, _) = process_join(&join_msg("a-1-x", 7, "tok-alice"), &ctx).await.unwrap();
        let record = store.session("a-1-x").unwrap();
        assert_eq!(record.user_id, 1);
        assert_eq!(record.color, joined.session.color);
    }
}

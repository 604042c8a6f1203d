//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with exponential backoff)
//! - Room join with bearer token, update send/receive
//! - Cursor emission with client-side throttling
//! - Offline queue with per-document sequence numbers, drained through the
//!   normal update path after rejoin
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;

use crate::presence::CursorThrottle;
use crate::protocol::{
    generate_client_id, ClientId, CursorPayload, DocumentId, ErrorCode, MessageKind, Participant,
    ProtocolError, SyncMessage, UserId,
};
use crate::storage::{OfflineEntry, Storage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Transport established and `join_room` sent
    Connected,
    /// Transport lost
    Disconnected,
    /// Server confirmed the join
    Joined { users: Vec<Participant>, doc_state: Vec<u8>, lamport: u64 },
    /// A peer's update, already merged by the server
    RemoteUpdate { client_id: ClientId, lamport: u64, update: Vec<u8> },
    /// Catch-up diff answering a `sync_step1`
    SyncDiff(Vec<u8>),
    /// A peer moved its cursor
    RemoteCursor { client_id: ClientId, cursor: CursorPayload },
    PeerJoined(Participant),
    PeerLeft(Participant),
    /// Offline queue drained after rejoin
    QueueRecovered { recovered: usize, conflicts: usize },
    /// Server-side error reply
    ServerError { code: ErrorCode, message: String },
}

/// Durable-order queue for edits made while disconnected.
///
/// Entries carry a monotone sequence per `(client, document)` and replay in
/// order on reconnection. With a storage backend attached the queue
/// survives process restarts.
pub struct OfflineQueue {
    client_id: ClientId,
    document_id: DocumentId,
    entries: VecDeque<OfflineEntry>,
    next_sequence: u64,
    max_size: usize,
    store: Option<Arc<dyn Storage>>,
}

impl OfflineQueue {
    pub fn new(client_id: ClientId, document_id: DocumentId, max_size: usize) -> Self {
        Self {
            client_id,
            document_id,
            entries: VecDeque::with_capacity(max_size.min(1024)),
            next_sequence: 1,
            max_size,
            store: None,
        }
    }

    /// Attach a durable backend, loading any entries a previous process
    /// left behind.
    pub fn attach_store(&mut self, store: Arc<dyn Storage>) {
        match store.get_offline_queue(&self.client_id, self.document_id) {
            Ok(persisted) => {
                for entry in persisted {
                    self.next_sequence = self.next_sequence.max(entry.sequence + 1);
                    self.entries.push_back(entry);
                }
            }
            Err(e) => log::warn!("offline queue for {} not loaded: {e}", self.client_id),
        }
        self.store = Some(store);
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.entries.len() >= self.max_size {
            return false;
        }
        let entry = OfflineEntry {
            client_id: self.client_id.clone(),
            document_id: self.document_id,
            update,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        if let Some(store) = &self.store {
            if let Err(e) = store.add_offline_operation(&entry) {
                log::warn!("offline entry {} not persisted: {e}", entry.sequence);
            }
        }
        self.entries.push_back(entry);
        true
    }

    /// Remove and return all entries in sequence order.
    pub fn drain(&mut self) -> Vec<OfflineEntry> {
        let drained: Vec<OfflineEntry> = self.entries.drain(..).collect();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_offline_queue(&self.client_id, self.document_id) {
                log::warn!("offline queue for {} not cleared: {e}", self.client_id);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.update.len()).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    user_id: UserId,
    token: String,
    doc_id: DocumentId,
    client_id: Arc<RwLock<ClientId>>,
    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<RwLock<u64>>,
    queue: Arc<Mutex<OfflineQueue>>,
    throttle: Mutex<CursorThrottle>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
    was_connected: bool,
}

impl SyncClient {
    pub fn new(
        user_id: UserId,
        token: impl Into<String>,
        doc_id: DocumentId,
        server_url: impl Into<String>,
    ) -> Self {
        let client_id = generate_client_id(user_id);
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id,
            token: token.into(),
            doc_id,
            client_id: Arc::new(RwLock::new(client_id.clone())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            queue: Arc::new(Mutex::new(OfflineQueue::new(client_id, doc_id, 10_000))),
            throttle: Mutex::new(CursorThrottle::new(Duration::from_millis(100))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
            was_connected: false,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Back the offline queue with durable storage.
    pub async fn attach_offline_store(&self, store: Arc<dyn Storage>) {
        self.queue.lock().await.attach_store(store);
    }

    /// Connect, join the document room, and spawn the reader/writer tasks.
    ///
    /// A reconnect mints a fresh client id; the offline queue is drained
    /// after the server confirms the join.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        if self.was_connected {
            *self.client_id.write().await = generate_client_id(self.user_id);
        }
        let client_id = self.client_id.read().await.clone();

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::debug!("connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        self.was_connected = true;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        // Join immediately; the server replies with room_joined
        let join = SyncMessage::join_room(client_id.clone(), self.doc_id, self.token.clone());
        let encoded = join.encode()?;
        out_tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: translate frames into events; drain the offline
        // queue once the join is confirmed.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let queue = self.queue.clone();
        let clock = self.clock.clone();
        let doc_id = self.doc_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(sync_msg) = SyncMessage::decode(&bytes) else {
                            log::warn!("undecodable frame from server");
                            continue;
                        };
                        let event = match sync_msg.kind {
                            MessageKind::RoomJoined => {
                                if let Ok(room) = sync_msg.room_state() {
                                    let joined = SyncEvent::Joined {
                                        users: room.users,
                                        doc_state: room.doc_state,
                                        lamport: sync_msg.clock,
                                    };
                                    let _ = event_tx.send(joined).await;
                                    replay_offline(
                                        &queue, &clock, &out_tx, &client_id, doc_id, &event_tx,
                                    )
                                    .await;
                                }
                                None
                            }
                            MessageKind::Update => Some(SyncEvent::RemoteUpdate {
                                client_id: sync_msg.client_id.clone(),
                                lamport: sync_msg.clock,
                                update: sync_msg.payload,
                            }),
                            MessageKind::SyncStep2 => Some(SyncEvent::SyncDiff(sync_msg.payload)),
                            MessageKind::CursorUpdate => sync_msg.cursor().ok().map(|cursor| {
                                SyncEvent::RemoteCursor {
                                    client_id: sync_msg.client_id.clone(),
                                    cursor,
                                }
                            }),
                            MessageKind::UserJoined => {
                                sync_msg.participant().ok().map(SyncEvent::PeerJoined)
                            }
                            MessageKind::UserLeft => {
                                sync_msg.participant().ok().map(SyncEvent::PeerLeft)
                            }
                            MessageKind::Error => sync_msg.error_payload().ok().map(|e| {
                                SyncEvent::ServerError { code: e.code, message: e.message }
                            }),
                            MessageKind::Pong => None,
                            _ => None,
                        };
                        if let Some(event) = event {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Connect with exponential backoff: 1 s initial, 5 s cap, 5 attempts.
    pub async fn connect_with_backoff(&mut self) -> Result<(), ProtocolError> {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=5u32 {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 5 => return Err(e),
                Err(_) => {
                    *self.state.write().await = ConnectionState::Reconnecting;
                    log::info!("connect attempt {attempt} failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        Err(ProtocolError::ConnectionClosed)
    }

    /// Drop the transport. Queued and future updates accumulate offline
    /// until the next `connect`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a CRDT update; queues it for replay when disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.queue.lock().await;
            if !queue.enqueue(update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let mut clock = self.clock.write().await;
        *clock += 1;
        let msg = SyncMessage::update(
            self.client_id.read().await.clone(),
            self.doc_id,
            *clock,
            update,
        );
        self.send_raw(msg.encode()?).await
    }

    /// Request a catch-up diff for our state vector.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(
            self.client_id.read().await.clone(),
            self.doc_id,
            state_vector,
        );
        self.send_raw(msg.encode()?).await
    }

    /// Emit a cursor move; silently dropped offline and rate-limited to
    /// one emission per throttle interval.
    pub async fn send_cursor(
        &self,
        position: u32,
        selection: Option<(u32, u32)>,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        if !self.throttle.lock().await.should_emit() {
            return Ok(());
        }
        let cursor =
            CursorPayload { position, selection, user_id: None, color: None, name: None };
        let msg = SyncMessage::cursor_update(
            self.client_id.read().await.clone(),
            self.doc_id,
            &cursor,
        );
        self.send_raw(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.client_id.read().await.clone());
        self.send_raw(msg.encode()?).await
    }

    /// Spawn a heartbeat task pinging at `interval` until the connection
    /// drops.
    pub fn start_heartbeat(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        let outgoing = self.outgoing_tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let msg = SyncMessage::ping(client_id.read().await.clone());
                let Ok(encoded) = msg.encode() else { break };
                let Some(tx) = &outgoing else { break };
                if tx.send(encoded).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(bytes).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn client_id(&self) -> ClientId {
        self.client_id.read().await.clone()
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// Drain the offline queue through the normal update path.
///
/// Entries that no longer decode as CRDT updates count as conflicts and
/// are dropped; the rest replay in sequence order. The CRDT's idempotence
/// makes re-delivery safe, so a crash mid-drain at worst repeats entries.
async fn replay_offline(
    queue: &Arc<Mutex<OfflineQueue>>,
    clock: &Arc<RwLock<u64>>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    client_id: &ClientId,
    doc_id: DocumentId,
    event_tx: &mpsc::Sender<SyncEvent>,
) {
    let entries = {
        let mut queue = queue.lock().await;
        if queue.is_empty() {
            return;
        }
        queue.drain()
    };

    let mut recovered = 0;
    let mut conflicts = 0;
    for entry in entries {
        if entry.update.is_empty() || yrs::Update::decode_v1(&entry.update).is_err() {
            conflicts += 1;
            continue;
        }
        let lamport = {
            let mut clock = clock.write().await;
            *clock += 1;
            *clock
        };
        let msg = SyncMessage::update(client_id.clone(), doc_id, lamport, entry.update);
        match msg.encode() {
            Ok(encoded) if out_tx.send(encoded.clone()).await.is_ok() => recovered += 1,
            _ => conflicts += 1,
        }
    }

    log::info!("offline replay: {recovered} recovered, {conflicts} conflicts");
    let _ = event_tx.send(SyncEvent::QueueRecovered { recovered, conflicts }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new(7, "tok", 42, "ws://localhost:9090");
        assert_eq!(client.doc_id(), 42);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = SyncClient::new(7, "tok", 42, "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.client_id().await.starts_with("7-"));
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new(7, "tok", 42, "ws://localhost:9090");
        client.send_update(vec![1, 2, 3]).await.unwrap();
        client.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
        // The lamport clock only moves for updates actually sent
        assert_eq!(client.clock().await, 0);
    }

    #[tokio::test]
    async fn test_send_cursor_offline_noop() {
        let client = SyncClient::new(7, "tok", 42, "ws://localhost:9090");
        client.send_cursor(5, None).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[test]
    fn test_offline_queue_sequences() {
        let mut queue = OfflineQueue::new("c-1-a".into(), 42, 100);
        assert!(queue.is_empty());

        queue.enqueue(vec![1]);
        queue.enqueue(vec![2, 2]);
        queue.enqueue(vec![3]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.total_bytes(), 4);

        let drained = queue.drain();
        assert_eq!(drained.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(queue.is_empty());

        // Sequences keep increasing after a drain
        queue.enqueue(vec![4]);
        assert_eq!(queue.drain()[0].sequence, 4);
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new("c-1-a".into(), 42, 2);
        assert!(queue.enqueue(vec![1]));
        assert!(queue.enqueue(vec![2]));
        assert!(!queue.enqueue(vec![3]));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_offline_queue_durable_backing() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut queue = OfflineQueue::new("c-1-a".into(), 42, 100);
            queue.attach_store(store.clone());
            queue.enqueue(vec![1]);
            queue.enqueue(vec![2]);
        }
        // A later process picks the entries back up
        let mut revived = OfflineQueue::new("c-1-a".into(), 42, 100);
        revived.attach_store(store.clone());
        assert_eq!(revived.len(), 2);
        assert_eq!(revived.next_sequence, 3);

        revived.drain();
        assert!(store.get_offline_queue("c-1-a", 42).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = SyncClient::new(7, "tok", 42, "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_connection_state_values() {
        assert_ne!(ConnectionState::Disconnected, ConnectionState::Connected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Reconnecting);
    }
}

//! Per-document room: the authoritative replica and its members.
//!
//! The room owns the CRDT document, the member set, the Lamport and vector
//! clocks, and the buffer of operations accepted since the last checkpoint.
//! Every mutation runs under one async mutex held across apply + persist +
//! broadcast-send, so all members observe any two accepted updates in the
//! order the room committed them. Rooms for different documents share
//! nothing and proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::broadcast::{BroadcastHub, Frame};
use crate::engine::{EngineError, SharedText};
use crate::presence::CursorState;
use crate::protocol::{ClientId, CursorPayload, DocumentId, Participant, SyncMessage, UserId};
use crate::storage::{OperationRecord, Storage, StoreError};

/// An accepted update not yet folded into a snapshot.
pub struct BufferedOp {
    pub bytes: Vec<u8>,
    pub origin: ClientId,
    pub at: SystemTime,
}

/// Last persisted checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotMark {
    pub version: u64,
    pub at: SystemTime,
}

/// Room errors.
#[derive(Debug)]
pub enum RoomError {
    /// Update bytes rejected by the CRDT engine
    Engine(EngineError),
    /// Storage failure on a non-best-effort path (checkpoint)
    Store(StoreError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Engine(e) => write!(f, "engine: {e}"),
            RoomError::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<EngineError> for RoomError {
    fn from(e: EngineError) -> Self {
        RoomError::Engine(e)
    }
}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        RoomError::Store(e)
    }
}

struct Member {
    info: Participant,
    cursor: CursorState,
    last_heartbeat: Instant,
    /// Nudges the owning connection task to close when the member is
    /// replaced by a reconnect with the same client id.
    evict_tx: mpsc::Sender<()>,
}

struct RoomState {
    text: SharedText,
    members: HashMap<ClientId, Member>,
    lamport: u64,
    vector_clock: HashMap<ClientId, u64>,
    pending_ops: Vec<BufferedOp>,
    snapshot: SnapshotMark,
}

/// Everything a freshly admitted client needs to initialize.
pub struct AdmitGrant {
    /// Full document state against the empty document
    pub doc_state: Vec<u8>,
    pub lamport: u64,
    pub participants: Vec<Participant>,
    /// This member's fan-out subscription
    pub receiver: broadcast::Receiver<Frame>,
    /// Fires if a later connection takes over this client id
    pub evict_rx: mpsc::Receiver<()>,
}

/// Server-side residence for one live document.
pub struct Room {
    document_id: DocumentId,
    owner_id: UserId,
    state: Mutex<RoomState>,
    hub: BroadcastHub,
    storage: Arc<dyn Storage>,
    snapshot_threshold: usize,
}

impl Room {
    pub fn new(
        document_id: DocumentId,
        owner_id: UserId,
        storage: Arc<dyn Storage>,
        snapshot_threshold: usize,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            document_id,
            owner_id,
            state: Mutex::new(RoomState {
                text: SharedText::new(),
                members: HashMap::new(),
                lamport: 0,
                vector_clock: HashMap::new(),
                pending_ops: Vec::new(),
                snapshot: SnapshotMark { version: 0, at: SystemTime::now() },
            }),
            hub: BroadcastHub::new(broadcast_capacity),
            storage,
            snapshot_threshold,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn owner_id(&self) -> UserId {
        self.owner_id
    }

    /// Rebuild state from a snapshot and the operation rows past it.
    ///
    /// Replayed operations re-enter the pending buffer so operation
    /// versions keep increasing across restarts; the next checkpoint folds
    /// them into a fresh snapshot. Undecodable rows are skipped with a
    /// warning — the remaining set still converges.
    pub async fn restore(
        &self,
        snapshot_state: Option<&[u8]>,
        snapshot_version: u64,
        operations: &[OperationRecord],
    ) -> usize {
        let mut state = self.state.lock().await;
        state.snapshot = SnapshotMark { version: snapshot_version, at: SystemTime::now() };
        state.lamport = snapshot_version;

        if let Some(snapshot) = snapshot_state {
            if let Err(e) = state.text.apply_update(snapshot) {
                log::warn!("doc {}: snapshot at v{snapshot_version} unusable: {e}", self.document_id);
            }
        }

        let mut replayed = 0;
        for op in operations {
            match state.text.apply_update(&op.update) {
                Ok(true) => {
                    *state.vector_clock.entry(op.client_id.clone()).or_insert(0) += 1;
                    state.pending_ops.push(BufferedOp {
                        bytes: op.update.clone(),
                        origin: op.client_id.clone(),
                        at: SystemTime::now(),
                    });
                    state.lamport = state.lamport.max(op.lamport);
                    replayed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("doc {}: skipping operation v{}: {e}", self.document_id, op.version);
                }
            }
        }
        replayed
    }

    /// Add a member. A member with the same client id is replaced: its
    /// connection is nudged to close and peers observe `user_left` then
    /// `user_joined` in that order.
    pub async fn admit(&self, info: Participant) -> AdmitGrant {
        let mut state = self.state.lock().await;

        if let Some(old) = state.members.remove(&info.client_id) {
            let _ = old.evict_tx.try_send(());
            let left = SyncMessage::user_left(self.document_id, &old.info);
            let _ = self.hub.send(Some(old.info.client_id.clone()), &left);
            log::info!(
                "doc {}: client {} reconnected, evicting previous session",
                self.document_id,
                info.client_id
            );
        }

        let (evict_tx, evict_rx) = mpsc::channel(1);
        let receiver = self.hub.subscribe();

        state.members.insert(
            info.client_id.clone(),
            Member {
                info: info.clone(),
                cursor: CursorState::default(),
                last_heartbeat: Instant::now(),
                evict_tx,
            },
        );

        let joined = SyncMessage::user_joined(self.document_id, &info);
        let _ = self.hub.send(Some(info.client_id.clone()), &joined);

        AdmitGrant {
            doc_state: state.text.state_as_update(),
            lamport: state.lamport,
            participants: state.members.values().map(|m| m.info.clone()).collect(),
            receiver,
            evict_rx,
        }
    }

    /// Remove a member, notifying peers. When the last member leaves the
    /// room checkpoints itself; the caller then drops it from the registry.
    /// Returns whether the room is now empty.
    pub async fn leave(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().await;

        if let Some(member) = state.members.remove(client_id) {
            let left = SyncMessage::user_left(self.document_id, &member.info);
            let _ = self.hub.send(Some(member.info.client_id.clone()), &left);
        }

        if state.members.is_empty() {
            if let Err(e) = self.checkpoint_locked(&mut state) {
                log::error!("doc {}: checkpoint on close failed: {e}", self.document_id);
            }
            true
        } else {
            false
        }
    }

    /// Merge a client's update, advance the clocks, persist the operation
    /// row, and fan the update out to the other members. Returns the
    /// post-apply lamport time.
    ///
    /// A duplicate delivery (state vector unchanged) is a no-op: no clock
    /// movement, no row, no re-broadcast. A failed merge leaves the room
    /// untouched and only the sender learns of it.
    pub async fn apply_remote(
        &self,
        bytes: Vec<u8>,
        origin: &ClientId,
        user_id: UserId,
    ) -> Result<u64, RoomError> {
        let mut state = self.state.lock().await;

        let advanced = state.text.apply_update(&bytes)?;
        if !advanced {
            log::debug!("doc {}: duplicate update from {origin}", self.document_id);
            return Ok(state.lamport);
        }

        state.lamport += 1;
        *state.vector_clock.entry(origin.clone()).or_insert(0) += 1;
        state.pending_ops.push(BufferedOp {
            bytes: bytes.clone(),
            origin: origin.clone(),
            at: SystemTime::now(),
        });

        let version = state.snapshot.version + state.pending_ops.len() as u64;
        let record = OperationRecord {
            document_id: self.document_id,
            client_id: origin.clone(),
            user_id,
            update: bytes.clone(),
            lamport: state.lamport,
            vector_clock: state.vector_clock.clone(),
            version,
        };
        // Best-effort: the in-memory replica stays authoritative until the
        // next successful checkpoint.
        if let Err(e) = self.storage.add_operation(&record) {
            log::error!("doc {}: operation v{version} not persisted: {e}", self.document_id);
        }

        let lamport = state.lamport;
        let update = SyncMessage::update(origin.clone(), self.document_id, lamport, bytes);
        let _ = self.hub.send(Some(origin.clone()), &update);

        if state.pending_ops.len() > self.snapshot_threshold {
            if let Err(e) = self.checkpoint_locked(&mut state) {
                log::error!("doc {}: threshold checkpoint failed: {e}", self.document_id);
            }
        }

        Ok(lamport)
    }

    /// Delta advancing a peer with the given state vector to current state.
    pub async fn compute_diff(&self, state_vector: &[u8]) -> Vec<u8> {
        let state = self.state.lock().await;
        state.text.diff_since(state_vector)
    }

    /// Record a member's cursor, stamp it with the member's identity, and
    /// fan it out. The session-store write is best-effort. Returns `false`
    /// for unknown members.
    pub async fn update_cursor(
        &self,
        client_id: &str,
        position: u32,
        selection: Option<(u32, u32)>,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.get_mut(client_id) else {
            return false;
        };

        member.cursor = CursorState { position, selection };
        member.last_heartbeat = Instant::now();
        let payload = CursorPayload {
            position,
            selection,
            user_id: Some(member.info.user_id),
            color: Some(member.info.color.clone()),
            name: Some(member.info.name.clone()),
        };
        let msg = SyncMessage::cursor_update(client_id.to_string(), self.document_id, &payload);
        let _ = self.hub.send(Some(client_id.to_string()), &msg);
        drop(state);

        if let Err(e) = self.storage.update_session_cursor(client_id, position, selection) {
            log::warn!("cursor write for {client_id} failed: {e}");
        }
        true
    }

    /// Refresh a member's heartbeat (on ping).
    pub async fn touch(&self, client_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(member) = state.members.get_mut(client_id) {
            member.last_heartbeat = Instant::now();
        }
    }

    /// Whether a member has been silent longer than `timeout`.
    pub async fn is_stale(&self, client_id: &str, timeout: Duration) -> bool {
        let state = self.state.lock().await;
        state
            .members
            .get(client_id)
            .map(|m| m.last_heartbeat.elapsed() > timeout)
            .unwrap_or(false)
    }

    /// Persist the full state and clear the operation buffer.
    pub async fn checkpoint(&self) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        self.checkpoint_locked(&mut state).map_err(RoomError::Store)
    }

    fn checkpoint_locked(&self, state: &mut RoomState) -> Result<(), StoreError> {
        if state.pending_ops.is_empty() {
            return Ok(());
        }
        let version = state.snapshot.version + state.pending_ops.len() as u64;
        let full = state.text.state_as_update();
        // Pending ops survive a failed write and retry at the next trigger
        self.storage.update_document_snapshot(self.document_id, &full, version)?;
        state.pending_ops.clear();
        state.snapshot = SnapshotMark { version, at: SystemTime::now() };
        log::info!("doc {}: checkpoint at v{version}", self.document_id);
        Ok(())
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.state.lock().await.members.values().map(|m| m.info.clone()).collect()
    }

    pub async fn lamport(&self) -> u64 {
        self.state.lock().await.lamport
    }

    pub async fn snapshot_version(&self) -> u64 {
        self.state.lock().await.snapshot.version
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_ops.len()
    }

    /// A member's last known cursor.
    pub async fn cursor_of(&self, client_id: &str) -> Option<CursorState> {
        self.state.lock().await.members.get(client_id).map(|m| m.cursor)
    }

    /// Updates seen from one origin (vector-clock entry).
    pub async fn clock_of(&self, client_id: &str) -> u64 {
        self.state.lock().await.vector_clock.get(client_id).copied().unwrap_or(0)
    }

    /// Current text (authoritative replica).
    pub async fn contents(&self) -> String {
        self.state.lock().await.text.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::storage::MemoryStore;

    fn participant(client_id: &str, user_id: UserId, name: &str) -> Participant {
        Participant {
            client_id: client_id.into(),
            user_id,
            name: name.into(),
            color: "#e06c75".into(),
        }
    }

    fn make_update(base: &SharedText, edit: impl FnOnce(&SharedText)) -> Vec<u8> {
        let before = base.state_vector();
        edit(base);
        base.diff_since(&before)
    }

    fn test_room(store: Arc<MemoryStore>) -> Room {
        store.insert_document(7, 1);
        Room::new(7, 1, store, 100, 64)
    }

    #[tokio::test]
    async fn test_admit_and_leave_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store);

        let grant = room.admit(participant("a-1-x", 1, "Alice")).await;
        assert_eq!(grant.lamport, 0);
        assert_eq!(grant.participants.len(), 1);
        assert_eq!(room.member_count().await, 1);

        assert!(!room.leave("nobody").await); // unknown id, room still occupied
        assert!(room.leave("a-1-x").await);
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_apply_remote_advances_clocks_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store.clone());
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        let source = SharedText::new();
        let update = make_update(&source, |t| t.insert(0, "hi"));

        let lamport = room.apply_remote(update, &"a-1-x".to_string(), 1).await.unwrap();
        assert_eq!(lamport, 1);
        assert_eq!(room.clock_of("a-1-x").await, 1);
        assert_eq!(room.pending_len().await, 1);
        assert_eq!(room.contents().await, "hi");
        assert_eq!(store.operation_count(7), 1);
    }

    #[tokio::test]
    async fn test_duplicate_update_does_not_double_count() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store.clone());
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        let source = SharedText::new();
        let update = make_update(&source, |t| t.insert(0, "once"));

        room.apply_remote(update.clone(), &"a-1-x".to_string(), 1).await.unwrap();
        let lamport = room.apply_remote(update, &"a-1-x".to_string(), 1).await.unwrap();

        assert_eq!(lamport, 1);
        assert_eq!(room.clock_of("a-1-x").await, 1);
        assert_eq!(room.pending_len().await, 1);
        assert_eq!(store.operation_count(7), 1);
        assert_eq!(room.contents().await, "once");
    }

    #[tokio::test]
    async fn test_bad_update_rejected_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store.clone());
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        assert!(room.apply_remote(Vec::new(), &"a-1-x".to_string(), 1).await.is_err());
        assert!(room.apply_remote(vec![0xFF, 0x01], &"a-1-x".to_string(), 1).await.is_err());

        assert_eq!(room.lamport().await, 0);
        assert_eq!(room.pending_len().await, 0);
        assert_eq!(store.operation_count(7), 0);
    }

    #[tokio::test]
    async fn test_update_broadcast_order_and_origin() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store);
        let _a = room.admit(participant("a-1-x", 1, "Alice")).await;
        let mut b = room.admit(participant("b-2-y", 2, "Bob")).await;

        let source = SharedText::new();
        let u1 = make_update(&source, |t| t.insert(0, "1"));
        let u2 = make_update(&source, |t| t.insert(1, "2"));

        room.apply_remote(u1, &"a-1-x".to_string(), 1).await.unwrap();
        room.apply_remote(u2, &"a-1-x".to_string(), 1).await.unwrap();

        // First frame on a fresh subscription is the member's own join
        // notice; the session layer filters it by origin.
        let own_join = b.receiver.recv().await.unwrap();
        assert_eq!(own_join.origin.as_deref(), Some("b-2-y"));

        let f1 = b.receiver.recv().await.unwrap();
        let f2 = b.receiver.recv().await.unwrap();
        let m1 = SyncMessage::decode(&f1.bytes).unwrap();
        let m2 = SyncMessage::decode(&f2.bytes).unwrap();

        assert_eq!(f1.origin.as_deref(), Some("a-1-x"));
        assert_eq!(m1.kind, MessageKind::Update);
        assert_eq!((m1.clock, m2.clock), (1, 2));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_evicts_old_session() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store);

        let mut first = room.admit(participant("x-1-a", 1, "Alice")).await;
        let mut observer = room.admit(participant("o-2-b", 2, "Bob")).await;
        let own_join = observer.receiver.recv().await.unwrap();
        assert_eq!(own_join.origin.as_deref(), Some("o-2-b"));

        let _second = room.admit(participant("x-1-a", 1, "Alice")).await;
        assert_eq!(room.member_count().await, 2);
        assert!(first.evict_rx.try_recv().is_ok());

        // Peers observe user_left then user_joined for the same client id
        let left = SyncMessage::decode(&observer.receiver.recv().await.unwrap().bytes).unwrap();
        let joined = SyncMessage::decode(&observer.receiver.recv().await.unwrap().bytes).unwrap();
        assert_eq!(left.kind, MessageKind::UserLeft);
        assert_eq!(joined.kind, MessageKind::UserJoined);
        assert_eq!(left.client_id, "x-1-a");
        assert_eq!(joined.client_id, "x-1-a");
    }

    #[tokio::test]
    async fn test_threshold_triggers_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        store.insert_document(7, 1);
        let room = Room::new(7, 1, store.clone(), 3, 64);
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        let source = SharedText::new();
        for i in 0..4u32 {
            let update = make_update(&source, |t| t.insert(i, "x"));
            room.apply_remote(update, &"a-1-x".to_string(), 1).await.unwrap();
        }

        // Fourth op exceeded the threshold of 3: buffer folded into snapshot
        assert_eq!(room.pending_len().await, 0);
        assert_eq!(room.snapshot_version().await, 4);
        let doc = store.get_document(7).unwrap().unwrap();
        assert_eq!(doc.snapshot_version, 4);
        assert!(doc.snapshot_state.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store.clone());
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        let source = SharedText::new();
        let u1 = make_update(&source, |t| t.insert(0, "abc"));
        let u2 = make_update(&source, |t| t.insert(3, "def"));
        room.apply_remote(u1, &"a-1-x".to_string(), 1).await.unwrap();
        room.checkpoint().await.unwrap();
        room.apply_remote(u2, &"a-1-x".to_string(), 1).await.unwrap();

        // Simulate restart: new room from snapshot + trailing operations
        let doc = store.get_document(7).unwrap().unwrap();
        let trailing = store.get_operations_since(7, doc.snapshot_version).unwrap();
        assert_eq!(trailing.len(), 1);

        let revived = Room::new(7, 1, store.clone(), 100, 64);
        let replayed = revived
            .restore(doc.snapshot_state.as_deref(), doc.snapshot_version, &trailing)
            .await;
        assert_eq!(replayed, 1);
        assert_eq!(revived.contents().await, "abcdef");
        assert_eq!(revived.contents().await, room.contents().await);
        // Replayed rows re-enter the buffer so versions keep increasing
        assert_eq!(revived.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_cursor_update_stamps_identity() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store);
        let _a = room.admit(participant("a-1-x", 1, "Alice")).await;
        let mut b = room.admit(participant("b-2-y", 2, "Bob")).await;
        let own_join = b.receiver.recv().await.unwrap();
        assert_eq!(own_join.origin.as_deref(), Some("b-2-y"));

        assert!(room.update_cursor("a-1-x", 5, Some((5, 9))).await);
        assert!(!room.update_cursor("ghost", 1, None).await);

        let frame = b.receiver.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame.bytes).unwrap();
        let cursor = msg.cursor().unwrap();
        assert_eq!(msg.client_id, "a-1-x");
        assert_eq!(cursor.position, 5);
        assert_eq!(cursor.selection, Some((5, 9)));
        assert_eq!(cursor.user_id, Some(1));
        assert_eq!(cursor.color.as_deref(), Some("#e06c75"));
        assert_eq!(cursor.name.as_deref(), Some("Alice"));

        let held = room.cursor_of("a-1-x").await.unwrap();
        assert_eq!(held, CursorState { position: 5, selection: Some((5, 9)) });
        assert!(room.cursor_of("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_compute_diff_brings_peer_current() {
        let store = Arc::new(MemoryStore::new());
        let room = test_room(store);
        let _grant = room.admit(participant("a-1-x", 1, "Alice")).await;

        let source = SharedText::new();
        let update = make_update(&source, |t| t.insert(0, "sync me"));
        room.apply_remote(update, &"a-1-x".to_string(), 1).await.unwrap();

        let behind = SharedText::new();
        let diff = room.compute_diff(&behind.state_vector()).await;
        behind.apply_update(&diff).unwrap();
        assert_eq!(behind.contents(), "sync me");
    }
}

//! Process-wide registry of live rooms.
//!
//! One room exists per document exactly while at least one session is
//! joined to it. Creation is race-free: the slow path re-checks under the
//! write lock, so concurrent joins construct at most one room. Creation
//! consults the metadata store and replays the snapshot plus trailing
//! operation rows into a fresh replica.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::DocumentId;
use crate::room::Room;
use crate::storage::{Storage, StoreError};

/// Registry errors.
#[derive(Debug)]
pub enum RegistryError {
    /// Document does not exist in the metadata store
    NotFound(DocumentId),
    Store(StoreError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "document not found: {id}"),
            RegistryError::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}

/// DocumentId → live Room.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<Room>>>,
    storage: Arc<dyn Storage>,
    snapshot_threshold: usize,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        snapshot_threshold: usize,
        broadcast_capacity: usize,
    ) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), storage, snapshot_threshold, broadcast_capacity }
    }

    /// Return the live room for a document, creating and hydrating it if
    /// absent. Fails with `NotFound` when the document does not exist.
    pub async fn get_or_create(&self, document_id: DocumentId) -> Result<Arc<Room>, RegistryError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&document_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            return Ok(room.clone());
        }

        let Some(record) = self.storage.get_document(document_id)? else {
            return Err(RegistryError::NotFound(document_id));
        };
        let trailing = self
            .storage
            .get_operations_since(document_id, record.snapshot_version)?;

        let room = Arc::new(Room::new(
            document_id,
            record.owner_id,
            self.storage.clone(),
            self.snapshot_threshold,
            self.broadcast_capacity,
        ));
        let replayed = room
            .restore(record.snapshot_state.as_deref(), record.snapshot_version, &trailing)
            .await;
        log::info!(
            "doc {document_id}: room opened (snapshot v{}, {replayed} trailing ops)",
            record.snapshot_version
        );

        rooms.insert(document_id, room.clone());
        Ok(room)
    }

    /// Drop a room once its last member has left. No-op if members joined
    /// again in the meantime.
    pub async fn drop_if_empty(&self, document_id: DocumentId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            if room.member_count().await == 0 {
                rooms.remove(&document_id);
                log::info!("doc {document_id}: room closed (empty)");
                return true;
            }
        }
        false
    }

    /// Checkpoint every live room (periodic sweep). Returns how many rooms
    /// were swept; failures are logged and retried at the next sweep.
    pub async fn checkpoint_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let count = rooms.len();
        for room in rooms {
            if let Err(e) = room.checkpoint().await {
                log::error!("doc {}: periodic checkpoint failed: {e}", room.document_id());
            }
        }
        count
    }

    /// Final checkpoint of every live room, then drop them all.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.write().await;
        for (document_id, room) in rooms.drain() {
            if let Err(e) = room.checkpoint().await {
                log::error!("doc {document_id}: shutdown checkpoint failed: {e}");
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SharedText;
    use crate::protocol::Participant;
    use crate::storage::MemoryStore;

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_document(7, 1);
        store
    }

    fn participant(client_id: &str) -> Participant {
        Participant {
            client_id: client_id.into(),
            user_id: 1,
            name: "Alice".into(),
            color: "#e06c75".into(),
        }
    }

    #[tokio::test]
    async fn test_unknown_document_is_not_found() {
        let registry = RoomRegistry::new(seeded_store(), 100, 64);
        assert!(matches!(
            registry.get_or_create(999).await,
            Err(RegistryError::NotFound(999))
        ));
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = RoomRegistry::new(seeded_store(), 100, 64);
        let r1 = registry.get_or_create(7).await.unwrap();
        let r2 = registry.get_or_create(7).await.unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.active_documents().await, vec![7]);
    }

    #[tokio::test]
    async fn test_room_hydrates_from_snapshot_and_ops() {
        let store = seeded_store();

        // First lifetime: accept edits, checkpoint, accept one more
        {
            let registry = RoomRegistry::new(store.clone(), 100, 64);
            let room = registry.get_or_create(7).await.unwrap();
            let _grant = room.admit(participant("a-1-x")).await;

            let source = SharedText::new();
            let sv = source.state_vector();
            source.insert(0, "abc");
            room.apply_remote(source.diff_since(&sv), &"a-1-x".to_string(), 1).await.unwrap();
            room.checkpoint().await.unwrap();

            let sv = source.state_vector();
            source.insert(3, "def");
            room.apply_remote(source.diff_since(&sv), &"a-1-x".to_string(), 1).await.unwrap();
        }

        // Second lifetime: fresh registry rebuilds the exact state
        let registry = RoomRegistry::new(store, 100, 64);
        let room = registry.get_or_create(7).await.unwrap();
        assert_eq!(room.contents().await, "abcdef");
        assert_eq!(room.snapshot_version().await, 1);
    }

    #[tokio::test]
    async fn test_drop_if_empty() {
        let registry = RoomRegistry::new(seeded_store(), 100, 64);
        let room = registry.get_or_create(7).await.unwrap();

        let _grant = room.admit(participant("a-1-x")).await;
        assert!(!registry.drop_if_empty(7).await);

        room.leave("a-1-x").await;
        assert!(registry.drop_if_empty(7).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_rooms() {
        let store = seeded_store();
        let registry = RoomRegistry::new(store.clone(), 100, 64);
        let room = registry.get_or_create(7).await.unwrap();
        let _grant = room.admit(participant("a-1-x")).await;

        let source = SharedText::new();
        let sv = source.state_vector();
        source.insert(0, "bye");
        room.apply_remote(source.diff_since(&sv), &"a-1-x".to_string(), 1).await.unwrap();

        registry.shutdown().await;
        assert_eq!(registry.room_count().await, 0);
        let doc = store.get_document(7).unwrap().unwrap();
        assert_eq!(doc.snapshot_version, 1);
        assert!(doc.snapshot_state.is_some());
    }
}

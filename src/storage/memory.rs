//! In-memory storage backend.
//!
//! Hash maps behind one mutex. Backs the test suites and single-process
//! deployments where durability across restarts is not needed.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    AccessRole, DocumentRecord, OfflineEntry, OperationRecord, SessionRecord, Storage, StoreError,
    UserRecord,
};
use crate::presence::CursorState;
use crate::protocol::{ClientId, DocumentId, UserId};

#[derive(Default)]
struct MemInner {
    documents: HashMap<DocumentId, DocumentRecord>,
    users: HashMap<String, UserRecord>,
    access: HashMap<(DocumentId, UserId), AccessRole>,
    operations: HashMap<DocumentId, Vec<OperationRecord>>,
    sessions: HashMap<ClientId, SessionRecord>,
    offline: HashMap<(ClientId, DocumentId), Vec<OfflineEntry>>,
}

/// Hash-map storage behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document (metadata CRUD lives outside the core).
    pub fn insert_document(&self, id: DocumentId, owner_id: UserId) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .documents
            .insert(id, DocumentRecord { id, owner_id, snapshot_state: None, snapshot_version: 0 });
    }

    /// Seed a user.
    pub fn insert_user(&self, id: UserId, open_id: impl Into<String>, name: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let open_id = open_id.into();
        inner.users.insert(open_id.clone(), UserRecord { id, open_id, name: name.into() });
    }

    /// Seed an access grant.
    pub fn grant_access(&self, document_id: DocumentId, user_id: UserId, role: AccessRole) {
        let mut inner = self.inner.lock().unwrap();
        inner.access.insert((document_id, user_id), role);
    }

    /// Test accessor: the persisted session row, if any.
    pub fn session(&self, client_id: &str) -> Option<SessionRecord> {
        self.inner.lock().unwrap().sessions.get(client_id).cloned()
    }

    /// Test accessor: number of operation rows for a document.
    pub fn operation_count(&self, document_id: DocumentId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .operations
            .get(&document_id)
            .map_or(0, |ops| ops.len())
    }
}

impl Storage for MemoryStore {
    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().documents.get(&id).cloned())
    }

    fn check_document_access(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<AccessRole>, StoreError> {
        Ok(self.inner.lock().unwrap().access.get(&(document_id, user_id)).copied())
    }

    fn get_user_by_open_id(&self, open_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(open_id).cloned())
    }

    fn add_operation(&self, op: &OperationRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.operations.entry(op.document_id).or_default().push(op.clone());
        Ok(())
    }

    fn get_operations_since(
        &self,
        document_id: DocumentId,
        since: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ops: Vec<OperationRecord> = inner
            .operations
            .get(&document_id)
            .map(|ops| ops.iter().filter(|op| op.version > since).cloned().collect())
            .unwrap_or_default();
        ops.sort_by_key(|op| op.version);
        Ok(ops)
    }

    fn create_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    fn delete_session(&self, client_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(client_id);
        Ok(())
    }

    fn update_session_cursor(
        &self,
        client_id: &str,
        position: u32,
        selection: Option<(u32, u32)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get_mut(client_id) {
            Some(session) => {
                session.cursor = CursorState { position, selection };
                Ok(())
            }
            None => Err(StoreError::Database(format!("unknown session {client_id}"))),
        }
    }

    fn update_document_snapshot(
        &self,
        document_id: DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.documents.get_mut(&document_id) {
            Some(doc) => {
                doc.snapshot_state = Some(state.to_vec());
                doc.snapshot_version = version;
                Ok(())
            }
            None => Err(StoreError::Database(format!("unknown document {document_id}"))),
        }
    }

    fn add_offline_operation(&self, entry: &OfflineEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .offline
            .entry((entry.client_id.clone(), entry.document_id))
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn get_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<Vec<OfflineEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut entries = inner
            .offline
            .get(&(client_id.to_string(), document_id))
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    fn clear_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.offline.remove(&(client_id.to_string(), document_id));
        Ok(())
    }
}

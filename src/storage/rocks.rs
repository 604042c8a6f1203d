//! RocksDB-backed storage.
//!
//! Column families:
//! - `documents`  — document rows (owner, snapshot version, timestamps)
//! - `snapshots`  — full document state per checkpoint (LZ4 compressed)
//! - `operations` — accepted updates (LZ4 compressed, keyed by doc:version)
//! - `users`      — user rows keyed by openId
//! - `access`     — grants keyed by doc:user
//! - `sessions`   — live session rows keyed by clientId
//! - `offline`    — per-client offline queues keyed by client:doc:sequence
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{
    AccessRole, DocumentRecord, OfflineEntry, OperationRecord, SessionRecord, Storage, StoreError,
    UserRecord,
};
use crate::presence::CursorState;
use crate::protocol::{DocumentId, UserId};

const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPERATIONS: &str = "operations";
const CF_USERS: &str = "users";
const CF_ACCESS: &str = "access";
const CF_SESSIONS: &str = "sessions";
const CF_OFFLINE: &str = "offline";

const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_SNAPSHOTS,
    CF_OPERATIONS,
    CF_USERS,
    CF_ACCESS,
    CF_SESSIONS,
    CF_OFFLINE,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Document row stored in `documents`; the snapshot body lives in
/// `snapshots` so metadata reads stay cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    owner_id: UserId,
    snapshot_version: u64,
    created_at: u64,
    updated_at: u64,
}

/// Embedded RocksDB storage backend.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, infrequently rewritten
                opts.set_max_write_buffer_number(2);
            }
            CF_OPERATIONS => {
                // Many small writes, prefix-scanned by document
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(8));
            }
            _ => {
                // Point lookups on small rows
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Seeding (metadata CRUD lives outside the core) ───────────────

    /// Insert a document row.
    pub fn put_document(&self, id: DocumentId, owner_id: UserId) -> Result<(), StoreError> {
        let now = unix_now();
        let row =
            DocumentRow { owner_id, snapshot_version: 0, created_at: now, updated_at: now };
        self.db
            .put_cf(&self.cf(CF_DOCUMENTS)?, doc_key(id), encode(&row)?)?;
        Ok(())
    }

    /// Insert a user row.
    pub fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.db
            .put_cf(&self.cf(CF_USERS)?, user.open_id.as_bytes(), encode(user)?)?;
        Ok(())
    }

    /// Insert an access grant.
    pub fn grant_access(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        role: AccessRole,
    ) -> Result<(), StoreError> {
        self.db
            .put_cf(&self.cf(CF_ACCESS)?, access_key(document_id, user_id), encode(&role)?)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_document_row(&self, id: DocumentId) -> Result<Option<DocumentRow>, StoreError> {
        match self.db.get_cf(&self.cf(CF_DOCUMENTS)?, doc_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Storage for RocksStore {
    fn get_document(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let Some(row) = self.load_document_row(id)? else {
            return Ok(None);
        };

        let snapshot_state = match self.db.get_cf(&self.cf(CF_SNAPSHOTS)?, doc_key(id))? {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Some(DocumentRecord {
            id,
            owner_id: row.owner_id,
            snapshot_state,
            snapshot_version: row.snapshot_version,
        }))
    }

    fn check_document_access(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<AccessRole>, StoreError> {
        match self.db.get_cf(&self.cf(CF_ACCESS)?, access_key(document_id, user_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_user_by_open_id(&self, open_id: &str) -> Result<Option<UserRecord>, StoreError> {
        match self.db.get_cf(&self.cf(CF_USERS)?, open_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn add_operation(&self, op: &OperationRecord) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(&encode(op)?);
        let key = op_key(op.document_id, op.version);
        self.db
            .put_cf_opt(&self.cf(CF_OPERATIONS)?, key, compressed, &self.write_opts())?;
        Ok(())
    }

    fn get_operations_since(
        &self,
        document_id: DocumentId,
        since: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = op_key(document_id, since.saturating_add(1));
        let prefix = doc_key(document_id);

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 16 || key[..8] != prefix {
                break;
            }
            let raw = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            ops.push(decode(&raw)?);
        }

        Ok(ops)
    }

    fn create_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.db.put_cf_opt(
            &self.cf(CF_SESSIONS)?,
            session.client_id.as_bytes(),
            encode(session)?,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn delete_session(&self, client_id: &str) -> Result<(), StoreError> {
        self.db.delete_cf(&self.cf(CF_SESSIONS)?, client_id.as_bytes())?;
        Ok(())
    }

    fn update_session_cursor(
        &self,
        client_id: &str,
        position: u32,
        selection: Option<(u32, u32)>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let Some(bytes) = self.db.get_cf(&cf, client_id.as_bytes())? else {
            return Err(StoreError::Database(format!("unknown session {client_id}")));
        };
        let mut session: SessionRecord = decode(&bytes)?;
        session.cursor = CursorState { position, selection };
        self.db
            .put_cf_opt(&cf, client_id.as_bytes(), encode(&session)?, &self.write_opts())?;
        Ok(())
    }

    fn update_document_snapshot(
        &self,
        document_id: DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError> {
        let Some(mut row) = self.load_document_row(document_id)? else {
            return Err(StoreError::Database(format!("unknown document {document_id}")));
        };
        row.snapshot_version = version;
        row.updated_at = unix_now();

        let compressed = lz4_flex::compress_prepend_size(state);

        // Atomic batch: snapshot body + metadata row
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_SNAPSHOTS)?, doc_key(document_id), &compressed);
        batch.put_cf(&self.cf(CF_DOCUMENTS)?, doc_key(document_id), encode(&row)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn add_offline_operation(&self, entry: &OfflineEntry) -> Result<(), StoreError> {
        let key = offline_key(&entry.client_id, entry.document_id, entry.sequence);
        self.db
            .put_cf_opt(&self.cf(CF_OFFLINE)?, key, encode(entry)?, &self.write_opts())?;
        Ok(())
    }

    fn get_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<Vec<OfflineEntry>, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let prefix = offline_prefix(client_id, document_id);
        let start_key = offline_key(client_id, document_id, 0);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < prefix.len() || key[..prefix.len()] != prefix[..] {
                break;
            }
            entries.push(decode(&value)?);
        }

        Ok(entries)
    }

    fn clear_offline_queue(
        &self,
        client_id: &str,
        document_id: DocumentId,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let prefix = offline_prefix(client_id, document_id);
        let start_key = offline_key(client_id, document_id, 0);

        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < prefix.len() || key[..prefix.len()] != prefix[..] {
                break;
            }
            batch.delete_cf(&cf, &key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// 8-byte big-endian document key; keys for one document are contiguous.
fn doc_key(id: DocumentId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Operation key: document (8 bytes) + version (8 bytes big-endian).
fn op_key(document_id: DocumentId, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&doc_key(document_id));
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Access key: document (8 bytes) + user (8 bytes).
fn access_key(document_id: DocumentId, user_id: UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&doc_key(document_id));
    key.extend_from_slice(&user_id.to_be_bytes());
    key
}

/// Offline prefix: client id + NUL + document (8 bytes).
fn offline_prefix(client_id: &str, document_id: DocumentId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 9);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(0);
    prefix.extend_from_slice(&doc_key(document_id));
    prefix
}

/// Offline key: prefix + sequence (8 bytes big-endian).
fn offline_key(client_id: &str, document_id: DocumentId, sequence: u64) -> Vec<u8> {
    let mut key = offline_prefix(client_id, document_id);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

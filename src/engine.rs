//! Sequence-CRDT engine over a single shared text field.
//!
//! Wraps a Yrs document with one text root, `shared-text`. Updates commute
//! and are idempotent, so replicas that have seen the same update set hold
//! byte-identical state regardless of delivery order.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Name of the text root every client binds to.
pub const SHARED_TEXT_ROOT: &str = "shared-text";

/// Engine errors.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Zero-length update bytes
    EmptyUpdate,
    /// Bytes did not decode as a CRDT update, or the merge was rejected
    BadUpdate(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EmptyUpdate => write!(f, "empty update"),
            EngineError::BadUpdate(e) => write!(f, "bad update: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// A collaborative text document.
///
/// One instance is the authoritative replica inside a server room; clients
/// hold their own instance and exchange deltas.
pub struct SharedText {
    doc: yrs::Doc,
}

impl Default for SharedText {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedText {
    pub fn new() -> Self {
        let doc = yrs::Doc::new();
        {
            // Materialize the root so empty-state encodings are stable.
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(SHARED_TEXT_ROOT);
        }
        Self { doc }
    }

    /// Merge an encoded delta into the document.
    ///
    /// Returns `true` when the merge advanced the state, `false` when the
    /// update had already been seen (duplicate delivery). Empty or
    /// undecodable bytes leave the document untouched.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<bool, EngineError> {
        if bytes.is_empty() {
            return Err(EngineError::EmptyUpdate);
        }
        let update = Update::decode_v1(bytes).map_err(|e| EngineError::BadUpdate(e.to_string()))?;

        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::BadUpdate(e.to_string()))?;
        }
        let after = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        Ok(after != before)
    }

    /// Full state as an update against the empty document.
    pub fn state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Delta sufficient to advance a peer with the given state vector to the
    /// current state. An undecodable state vector is treated as the empty
    /// one, which still yields a valid (full-state) delta.
    pub fn diff_since(&self, state_vector: &[u8]) -> Vec<u8> {
        let remote = StateVector::decode_v1(state_vector).unwrap_or_default();
        let txn = self.doc.transact();
        txn.encode_diff_v1(&remote)
    }

    /// Compact summary of applied operations per origin.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Current text contents.
    pub fn contents(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(SHARED_TEXT_ROOT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Character length of the shared text.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        match txn.get_text(SHARED_TEXT_ROOT) {
            Some(text) => text.len(&txn),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a chunk at a character index (local edit).
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(SHARED_TEXT_ROOT);
        text.insert(&mut txn, index, chunk);
    }

    /// Remove a character range (local edit).
    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(SHARED_TEXT_ROOT);
        text.remove_range(&mut txn, index, len);
    }

    /// Observe post-merge update notifications.
    ///
    /// The handler receives the encoded delta of every committed
    /// transaction. Dropping the returned subscription detaches it.
    pub fn on_update<F>(&self, handler: F) -> Result<yrs::Subscription, EngineError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| handler(&event.update))
            .map_err(|e| EngineError::BadUpdate(e.to_string()))
    }
}

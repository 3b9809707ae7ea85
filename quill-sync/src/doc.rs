//! Narrow seam around the CRDT library.
//!
//! The rest of the server treats document state as opaque bytes: apply an
//! update, encode the full state, summarize known state as a state vector,
//! compute a diff against a peer's vector. Everything CRDT-specific stays
//! behind this boundary so the merge algorithm itself is swappable.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Errors from decoding peer-supplied CRDT payloads.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Update bytes could not be decoded or applied.
    InvalidUpdate(String),
    /// State vector bytes could not be decoded.
    InvalidStateVector(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUpdate(e) => write!(f, "invalid update: {e}"),
            Self::InvalidStateVector(e) => write!(f, "invalid state vector: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// A server-side document replica.
///
/// Callers must externally serialize access (the owning session holds this
/// behind a mutex); the type itself performs one transaction per call.
pub struct SharedDoc {
    doc: Doc,
}

impl SharedDoc {
    /// Fresh, empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Restore a document from a persisted full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new();
        doc.apply_update(snapshot)?;
        Ok(doc)
    }

    /// Merge an update into the document.
    ///
    /// Returns `true` when the update changed local state. Merging is
    /// commutative and idempotent, so re-applying a known update returns
    /// `false` and leaves the state untouched.
    pub fn apply_update(&self, update: &[u8]) -> Result<bool, DocError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let after = txn.state_vector();
        Ok(before != after)
    }

    /// Compact summary of which updates this replica already holds.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Minimal diff bringing a replica at `state_vector` up to date.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocError::InvalidStateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Full document state as a single update (the persisted snapshot form).
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Direct access for embedders and tests.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

//! Durable snapshot storage for documents.
//!
//! The server persists documents as full encoded snapshots, overwritten
//! wholesale on every write-back (no incremental log). The [`SnapshotStore`]
//! trait is the seam: the RocksDB implementation backs real deployments,
//! the in-memory one backs tests and storage-less setups.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database unreachable, write rejected).
    Backend(String),
    /// Stored bytes could not be decompressed or decoded.
    Corrupt(String),
    /// Injected or transient unavailability.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "storage backend error: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt stored data: {e}"),
            Self::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Key/value snapshot persistence.
///
/// `save` must be idempotent: repeated writes of identical bytes have no
/// observable effect beyond the overwrite. Implementations are called from
/// async tasks and must be internally thread-safe.
pub trait SnapshotStore: Send + Sync {
    /// Load the persisted snapshot for `name`, if any.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the snapshot for `name` with the full encoded state.
    fn save(&self, name: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Namespaced storage key for a document name.
pub(crate) fn doc_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + name.len());
    key.extend_from_slice(b"doc:");
    key.extend_from_slice(name.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_key_is_namespaced() {
        assert_eq!(doc_key("notes"), b"doc:notes".to_vec());
        assert_eq!(doc_key(""), b"doc:".to_vec());
    }
}

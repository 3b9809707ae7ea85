//! In-memory snapshot store.
//!
//! Backs tests and storage-less deployments. Counts loads so tests can
//! assert a document is read from storage exactly once, and can be switched
//! into a failing mode to exercise write-back error handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{SnapshotStore, StoreError};

/// HashMap-backed store.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    load_count: AtomicU64,
    save_count: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When failing, every load and save returns [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Raw stored bytes, bypassing failure injection.
    pub fn peek(&self, name: &str) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .map(|map| map.get(name).cloned())
            .unwrap_or(None)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        self.load_count.fetch_add(1, Ordering::SeqCst);
        let map = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_string()))?;
        Ok(map.get(name).cloned())
    }

    fn save(&self, name: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        self.save_count.fetch_add(1, Ordering::SeqCst);
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_string()))?;
        map.insert(name.to_string(), snapshot.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_counters() {
        let store = MemoryStore::new();
        assert!(store.load("a").unwrap().is_none());
        store.save("a", &[1, 2]).unwrap();
        assert_eq!(store.load("a").unwrap().unwrap(), vec![1, 2]);
        assert_eq!(store.load_count(), 2);
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryStore::new();
        store.save("a", &[1]).unwrap();

        store.set_failing(true);
        assert!(matches!(store.load("a"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.save("a", &[2]), Err(StoreError::Unavailable(_))));
        // Failed save left stored bytes untouched
        assert_eq!(store.peek("a").unwrap(), vec![1]);

        store.set_failing(false);
        assert_eq!(store.load("a").unwrap().unwrap(), vec![1]);
    }
}

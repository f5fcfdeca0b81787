//! Key-value persistence for consensus data.

use crate::errors::XDPoSResult;
use alloc::vec::Vec;
use core::fmt::Debug;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Byte-oriented store the engine persists snapshots into.
pub trait KeyValueStore: Send + Sync + Debug {
    /// Value stored under `key`
    fn get(&self, key: &[u8]) -> XDPoSResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &[u8], value: &[u8]) -> XDPoSResult<()>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> XDPoSResult<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> XDPoSResult<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}

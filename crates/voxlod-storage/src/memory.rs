use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::{StorageBackend, StorageError};

/// Volatile backend. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<FxHashMap<u64, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(&key).cloned())
    }

    fn put(&self, key: u64, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key, value.to_vec());
        Ok(())
    }

    fn delete(&self, key: u64) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.remove(&key);
        Ok(())
    }

    fn exists(&self, key: u64) -> Result<bool, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.contains_key(&key))
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn storage_size(&self) -> u64 {
        self.entries
            .read()
            .map(|e| e.values().map(|v| v.len() as u64).sum())
            .unwrap_or(0)
    }
}

//! Key-value persistence for serialized sections.
//!
//! Keys are raw packed section keys. Values are opaque byte blobs and every
//! write replaces the whole value. Two backends ship here: [`MemoryStorage`]
//! for tests and persistence-free sessions, and [`LogStorage`], an
//! append-only log file with an in-memory index that stores values LZ4
//! compressed.

mod compression;
mod error;
mod log_storage;
mod memory;

pub use compression::COMPRESSION_THRESHOLD;
pub use error::StorageError;
pub use log_storage::{LOG_FILE_NAME, LogStorage};
pub use memory::MemoryStorage;

/// Storage contract used by the engine.
///
/// Implementations must be safe to call from any thread. Concurrent writes
/// to the same key are not ordered; callers serialize them.
pub trait StorageBackend: Send + Sync {
    /// Current value of `key`, if any.
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the value of `key`.
    fn put(&self, key: u64, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: u64) -> Result<(), StorageError>;

    fn exists(&self, key: u64) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Make every completed write durable.
    fn flush(&self) -> Result<(), StorageError>;

    /// Bytes currently used by the backend.
    fn storage_size(&self) -> u64;
}

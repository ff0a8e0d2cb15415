//! Append-only section log.
//!
//! ## Record Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic bytes `"LVRC"` |
//! | 4 | 8 | Key (`u64` LE) |
//! | 12 | 4 | Stored length N (`u32` LE), `u32::MAX` marks a delete |
//! | 16 | N | Stored value (absent for deletes) |
//!
//! The stored value is a flag byte followed by the value, LZ4 compressed
//! when that pays off (see [`crate::compression`]).
//!
//! The newest record for a key wins. On open the log is replayed into an
//! in-memory index; an incomplete record at the end (a write cut short by a
//! crash) is truncated away. Superseded records stay in the file until
//! [`LogStorage::compact`] rewrites it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::compression::{decode_value, encode_value};
use crate::{StorageBackend, StorageError};

/// File name of the log inside the world directory.
pub const LOG_FILE_NAME: &str = "sections.lvdb";

const MAGIC: [u8; 4] = *b"LVRC";
const HEADER_LEN: u64 = 16;
const TOMBSTONE: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct Slot {
    /// Offset of the value bytes.
    offset: u64,
    len: u32,
}

struct Inner {
    file: File,
    index: FxHashMap<u64, Slot>,
    /// End of the last complete record.
    end: u64,
    /// Bytes of records no longer reachable through the index.
    dead_bytes: u64,
}

impl Inner {
    fn live_bytes(&self) -> u64 {
        self.end - self.dead_bytes
    }

    /// `value` is the stored form, already framed by [`encode_value`].
    fn append(&mut self, key: u64, value: Option<&[u8]>) -> Result<(), StorageError> {
        let len = value.map_or(TOMBSTONE, |v| v.len() as u32);
        let mut record = Vec::with_capacity(HEADER_LEN as usize + value.map_or(0, <[u8]>::len));
        record.extend_from_slice(&MAGIC);
        record.extend_from_slice(&key.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        if let Some(value) = value {
            record.extend_from_slice(value);
        }

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&record)?;

        let start = self.end;
        self.end += record.len() as u64;
        if let Some(old) = self.index.remove(&key) {
            self.dead_bytes += HEADER_LEN + u64::from(old.len);
        }
        match value {
            Some(value) => {
                self.index.insert(
                    key,
                    Slot {
                        offset: start + HEADER_LEN,
                        len: value.len() as u32,
                    },
                );
            }
            // The tombstone itself is dead weight from the moment it is written.
            None => self.dead_bytes += HEADER_LEN,
        }
        Ok(())
    }
}

/// Log-structured [`StorageBackend`] backed by one file.
pub struct LogStorage {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl LogStorage {
    /// Open (or create) `dir/sections.lvdb`.
    ///
    /// With `compact_on_open`, the log is rewritten when it holds more
    /// superseded bytes than live ones.
    pub fn open(dir: &Path, compact_on_open: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let inner = replay(file)?;
        tracing::info!(
            path = %path.display(),
            keys = inner.index.len(),
            bytes = inner.end,
            dead_bytes = inner.dead_bytes,
            "opened section log"
        );

        let storage = Self {
            path,
            inner: Mutex::new(inner),
        };
        if compact_on_open {
            let wasteful = {
                let inner = storage.lock()?;
                inner.dead_bytes > inner.live_bytes()
            };
            if wasteful {
                storage.compact()?;
            }
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.lock().map(|i| i.index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by superseded records and tombstones.
    pub fn dead_bytes(&self) -> u64 {
        self.lock().map(|i| i.dead_bytes).unwrap_or(0)
    }

    /// Rewrite the log with only the live records, then swap it in.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let before = inner.end;

        let tmp_path = self.path.with_extension("lvdb.compact");
        let mut out = File::create(&tmp_path)?;
        let mut new_index = FxHashMap::default();
        new_index.reserve(inner.index.len());

        let mut keys: Vec<(u64, Slot)> = inner.index.iter().map(|(k, s)| (*k, *s)).collect();
        keys.sort_unstable_by_key(|(_, slot)| slot.offset);

        let mut pos = 0u64;
        let mut value = Vec::new();
        for (key, slot) in keys {
            value.resize(slot.len as usize, 0);
            inner.file.seek(SeekFrom::Start(slot.offset))?;
            inner.file.read_exact(&mut value)?;

            out.write_all(&MAGIC)?;
            out.write_all(&key.to_le_bytes())?;
            out.write_all(&slot.len.to_le_bytes())?;
            out.write_all(&value)?;
            new_index.insert(
                key,
                Slot {
                    offset: pos + HEADER_LEN,
                    len: slot.len,
                },
            );
            pos += HEADER_LEN + u64::from(slot.len);
        }
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &self.path)?;
        inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.index = new_index;
        inner.end = pos;
        inner.dead_bytes = 0;

        tracing::info!(before, after = pos, "compacted section log");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

/// Rebuild the index from the log, truncating a torn tail.
fn replay(file: File) -> Result<Inner, StorageError> {
    let file_len = file.metadata()?.len();
    let mut index: FxHashMap<u64, Slot> = FxHashMap::default();
    let mut dead_bytes = 0u64;
    let mut pos = 0u64;

    {
        let mut reader = BufReader::new(&file);
        let mut header = [0u8; HEADER_LEN as usize];
        while pos + HEADER_LEN <= file_len {
            reader.read_exact(&mut header)?;
            if header[..4] != MAGIC {
                return Err(StorageError::Corrupt { offset: pos });
            }
            let key = u64::from_le_bytes(header[4..12].try_into().map_err(|_| {
                StorageError::Corrupt { offset: pos }
            })?);
            let len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

            let value_len = if len == TOMBSTONE { 0 } else { u64::from(len) };
            if pos + HEADER_LEN + value_len > file_len {
                break;
            }

            if let Some(old) = index.remove(&key) {
                dead_bytes += HEADER_LEN + u64::from(old.len);
            }
            if len == TOMBSTONE {
                dead_bytes += HEADER_LEN;
            } else {
                index.insert(
                    key,
                    Slot {
                        offset: pos + HEADER_LEN,
                        len,
                    },
                );
                reader.seek_relative(value_len as i64)?;
            }
            pos += HEADER_LEN + value_len;
        }
    }

    if pos < file_len {
        tracing::warn!(
            valid = pos,
            discarded = file_len - pos,
            "truncating incomplete record at end of section log"
        );
        file.set_len(pos)?;
    }

    Ok(Inner {
        file,
        index,
        end: pos,
        dead_bytes,
    })
}

impl StorageBackend for LogStorage {
    fn get(&self, key: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.lock()?;
        let Some(slot) = inner.index.get(&key).copied() else {
            return Ok(None);
        };
        let corrupt = StorageError::Corrupt {
            offset: slot.offset - HEADER_LEN,
        };
        let mut stored = vec![0u8; slot.len as usize];
        inner.file.seek(SeekFrom::Start(slot.offset))?;
        match inner.file.read_exact(&mut stored) {
            Ok(()) => decode_value(&stored).map(Some).ok_or(corrupt),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(corrupt),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: u64, value: &[u8]) -> Result<(), StorageError> {
        let stored = encode_value(value);
        debug_assert!((stored.len() as u64) < u64::from(TOMBSTONE));
        self.lock()?.append(key, Some(&stored))
    }

    fn delete(&self, key: u64) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        if !inner.index.contains_key(&key) {
            return Ok(());
        }
        inner.append(key, None)
    }

    fn exists(&self, key: u64) -> Result<bool, StorageError> {
        Ok(self.lock()?.index.contains_key(&key))
    }

    fn flush(&self) -> Result<(), StorageError> {
        let inner = self.lock()?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn storage_size(&self) -> u64 {
        self.lock().map(|i| i.end).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_flush_reopen_get() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            storage.put(42, b"hello").unwrap();
            storage.put(u64::MAX - 1, &[7u8; 3000]).unwrap();
            storage.flush().unwrap();
        }
        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert_eq!(storage.get(42).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(storage.get(u64::MAX - 1).unwrap(), Some(vec![7u8; 3000]));
        assert_eq!(storage.get(7).unwrap(), None);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_overwrite_and_delete_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            storage.put(1, b"old").unwrap();
            storage.put(1, b"new value").unwrap();
            storage.put(2, b"doomed").unwrap();
            storage.delete(2).unwrap();
            storage.delete(99).unwrap();
            assert!(!storage.exists(2).unwrap());
            storage.flush().unwrap();
        }
        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert_eq!(storage.get(1).unwrap().as_deref(), Some(&b"new value"[..]));
        assert!(!storage.exists(2).unwrap());
        assert!(storage.dead_bytes() > 0);
    }

    #[test]
    fn test_empty_value() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LogStorage::open(dir.path(), false).unwrap();
        storage.put(5, &[]).unwrap();
        assert_eq!(storage.get(5).unwrap(), Some(Vec::new()));
        assert!(storage.exists(5).unwrap());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let good_len;
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            storage.put(1, b"kept").unwrap();
            storage.flush().unwrap();
            good_len = storage.storage_size();
        }
        {
            // A header promising 100 bytes, followed by only 10.
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE_NAME))
                .unwrap();
            file.write_all(&MAGIC).unwrap();
            file.write_all(&2u64.to_le_bytes()).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[0u8; 10]).unwrap();
        }

        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert_eq!(storage.storage_size(), good_len);
        assert_eq!(storage.get(1).unwrap().as_deref(), Some(&b"kept"[..]));
        assert!(!storage.exists(2).unwrap());

        // New writes land after the valid prefix.
        storage.put(3, b"after").unwrap();
        drop(storage);
        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert_eq!(storage.get(3).unwrap().as_deref(), Some(&b"after"[..]));
    }

    #[test]
    fn test_partial_header_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            storage.put(1, b"x").unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"LVR").unwrap();
        drop(file);

        let storage = LogStorage::open(dir.path(), false).unwrap();
        // Flag byte plus the value.
        assert_eq!(storage.storage_size(), HEADER_LEN + 2);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE_NAME), [0xAB; 40]).unwrap();
        assert!(matches!(
            LogStorage::open(dir.path(), false),
            Err(StorageError::Corrupt { offset: 0 })
        ));
    }

    #[test]
    fn test_compaction_drops_dead_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LogStorage::open(dir.path(), false).unwrap();
        for round in 0..10u8 {
            for key in 0..20u64 {
                storage.put(key, &[round; 64]).unwrap();
            }
        }
        storage.delete(19).unwrap();
        let before = storage.storage_size();
        storage.compact().unwrap();

        assert_eq!(storage.dead_bytes(), 0);
        assert_eq!(storage.storage_size(), 19 * (HEADER_LEN + 1 + 64));
        assert!(storage.storage_size() < before);
        for key in 0..19u64 {
            assert_eq!(storage.get(key).unwrap(), Some(vec![9u8; 64]));
        }
        assert!(!storage.exists(19).unwrap());

        storage.put(100, b"post-compact").unwrap();
        drop(storage);
        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert_eq!(storage.len(), 20);
        assert_eq!(storage.get(100).unwrap().as_deref(), Some(&b"post-compact"[..]));
    }

    #[test]
    fn test_compact_on_open_when_mostly_dead() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            for _ in 0..5 {
                storage.put(1, &[1u8; 256]).unwrap();
            }
        }
        let storage = LogStorage::open(dir.path(), true).unwrap();
        assert_eq!(storage.dead_bytes(), 0);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get(1).unwrap(), Some(vec![1u8; 256]));
    }

    #[test]
    fn test_large_values_are_stored_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let value: Vec<u8> = (0..8192u32).map(|i| (i / 512) as u8).collect();
        {
            let storage = LogStorage::open(dir.path(), false).unwrap();
            storage.put(11, &value).unwrap();
            assert!(storage.storage_size() < HEADER_LEN + value.len() as u64 / 4);
            storage.flush().unwrap();
        }
        let storage = LogStorage::open(dir.path(), true).unwrap();
        assert_eq!(storage.get(11).unwrap(), Some(value));
    }

    #[test]
    fn test_undecodable_value_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = File::create(dir.path().join(LOG_FILE_NAME)).unwrap();
            file.write_all(&MAGIC).unwrap();
            file.write_all(&4u64.to_le_bytes()).unwrap();
            file.write_all(&3u32.to_le_bytes()).unwrap();
            file.write_all(&[0x7E, 1, 2]).unwrap();
        }
        let storage = LogStorage::open(dir.path(), false).unwrap();
        assert!(matches!(storage.get(4), Err(StorageError::Corrupt { offset: 0 })));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(LogStorage::open(dir.path(), false).unwrap());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let storage = std::sync::Arc::clone(&storage);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let key = t * 1000 + i;
                        storage.put(key, &key.to_le_bytes()).unwrap();
                        assert_eq!(storage.get(key).unwrap(), Some(key.to_le_bytes().to_vec()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(storage.len(), 200);
    }
}

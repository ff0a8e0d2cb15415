//! Session-stable mapping between block-state / biome identities and the
//! compact ids stored in sections.
//!
//! State id 0 is air, so zero-filled section memory is empty space. Ids are
//! handed out first-come and never reused within a world. The full identity
//! table is persisted to `mapper.bin`, so reloading a world restores exactly
//! the ids its stored sections were written with.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::section::{AIR, MAX_BIOME_ID, MAX_STATE_ID};

/// File name of the persisted mapper inside a world directory.
pub const MAPPER_FILE_NAME: &str = "mapper.bin";

const MAGIC: [u8; 4] = *b"LVMP";
const FORMAT_VERSION: u8 = 1;

/// Number of allocatable state ids (20 bits).
const STATE_LIMIT: u32 = MAX_STATE_ID + 1;
/// Number of allocatable biome ids (9 bits).
const BIOME_LIMIT: u32 = MAX_BIOME_ID as u32 + 1;

/// Identities that always resolve to [`AIR`].
const AIR_IDENTITIES: [&str; 3] = ["", "air", "minecraft:air"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading or saving `mapper.bin`.
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// Filesystem failure.
    #[error("mapper i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with `LVMP`.
    #[error("invalid mapper magic bytes")]
    InvalidMagic,
    /// The file was written by a newer format version.
    #[error("unsupported mapper format version: {0}")]
    UnsupportedVersion(u8),
    /// The file ends inside a declared entry.
    #[error("mapper data truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required to continue.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// An identity string is not valid UTF-8.
    #[error("identity at byte {offset} is not valid UTF-8")]
    InvalidUtf8 {
        /// Byte offset of the identity.
        offset: usize,
    },
    /// A stored id is outside its id space (or is the reserved air id).
    #[error("stored id {id} is outside the id space")]
    IdOutOfRange {
        /// Offending id.
        id: u32,
    },
    /// The same id or identity appears twice.
    #[error("stored id {id} is duplicated")]
    DuplicateId {
        /// Offending id.
        id: u32,
    },
    /// An identity does not fit the `u16` length prefix.
    #[error("identity of {len} bytes exceeds the {max}-byte limit")]
    IdentityTooLong {
        /// Identity length in bytes.
        len: usize,
        /// Longest storable identity.
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// Id table
// ---------------------------------------------------------------------------

/// One concurrent identity ⇄ id table.
struct IdTable {
    by_name: DashMap<Arc<str>, u32>,
    by_id: DashMap<u32, Arc<str>>,
    next: AtomicU32,
    first: u32,
    limit: u32,
    exhausted_logged: AtomicBool,
    kind: &'static str,
}

impl IdTable {
    fn new(kind: &'static str, first: u32, limit: u32) -> Self {
        Self {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU32::new(first),
            first,
            limit,
            exhausted_logged: AtomicBool::new(false),
            kind,
        }
    }

    fn id_of(&self, identity: &str) -> u32 {
        if let Some(id) = self.by_name.get(identity) {
            return *id;
        }

        // The entry lock serializes racing first lookups of the same identity.
        match self.by_name.entry(Arc::from(identity)) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let limit = self.limit;
                let allocated = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < limit).then_some(n + 1)
                    });
                match allocated {
                    Ok(id) => {
                        self.by_id.insert(id, e.key().clone());
                        e.insert(id);
                        id
                    }
                    Err(_) => {
                        if !self.exhausted_logged.swap(true, Ordering::Relaxed) {
                            tracing::error!(
                                kind = self.kind,
                                limit,
                                identity,
                                "id space exhausted, mapping new identities to 0"
                            );
                        }
                        0
                    }
                }
            }
        }
    }

    fn name_of(&self, id: u32) -> Option<String> {
        self.by_id.get(&id).map(|n| n.to_string())
    }

    fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Entries sorted by id.
    fn sorted(&self) -> Vec<(u32, Arc<str>)> {
        let mut entries: Vec<_> = self
            .by_id
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    fn restore(&self, id: u32, identity: &str) -> Result<(), MapperError> {
        if id < self.first || id >= self.limit {
            return Err(MapperError::IdOutOfRange { id });
        }
        let name: Arc<str> = Arc::from(identity);
        if self.by_id.contains_key(&id) || self.by_name.contains_key(&name) {
            return Err(MapperError::DuplicateId { id });
        }
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(id, name);
        self.next.fetch_max(id + 1, Ordering::AcqRel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Thread-safe state and biome id allocator.
pub struct Mapper {
    states: IdTable,
    biomes: IdTable,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    pub fn new() -> Self {
        Self {
            states: IdTable::new("state", AIR + 1, STATE_LIMIT),
            biomes: IdTable::new("biome", 0, BIOME_LIMIT),
        }
    }

    /// Id of a block-state identity, allocating one on first sight.
    ///
    /// Air identities return [`AIR`]. Once all 2^20 ids are used, unseen
    /// identities return 0 and an error is logged once.
    pub fn state_id(&self, identity: &str) -> u32 {
        if AIR_IDENTITIES.contains(&identity) {
            return AIR;
        }
        self.states.id_of(identity)
    }

    /// Id of a biome identity, allocating one on first sight.
    ///
    /// Once all 2^9 ids are used, unseen identities return 0.
    pub fn biome_id(&self, identity: &str) -> u16 {
        self.biomes.id_of(identity) as u16
    }

    /// Identity of an allocated state id.
    pub fn state(&self, id: u32) -> Option<String> {
        if id == AIR {
            return Some("minecraft:air".to_string());
        }
        self.states.name_of(id)
    }

    /// Identity of an allocated biome id.
    pub fn biome(&self, id: u16) -> Option<String> {
        self.biomes.name_of(u32::from(id))
    }

    /// Allocated state ids, excluding air.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn biome_count(&self) -> usize {
        self.biomes.len()
    }

    // -- persistence --

    /// Load a mapper from `path`. A missing file yields an empty mapper.
    pub fn load(path: &Path) -> Result<Self, MapperError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no mapper file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mapper = Self::from_bytes(&data)?;
        tracing::info!(
            path = %path.display(),
            states = mapper.state_count(),
            biomes = mapper.biome_count(),
            "loaded mapper"
        );
        Ok(mapper)
    }

    /// Write the identity table to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), MapperError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved mapper");
        Ok(())
    }

    /// Serialize both tables.
    ///
    /// Layout: magic `LVMP`, version `u8`, then for states and biomes in turn
    /// a `u32` entry count followed by `(id, u16 len, utf8)` entries. State
    /// ids are `u32`, biome ids `u16`; all integers little-endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MapperError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.push(FORMAT_VERSION);

        let states = self.states.sorted();
        buf.extend_from_slice(&(states.len() as u32).to_le_bytes());
        for (id, name) in &states {
            buf.extend_from_slice(&id.to_le_bytes());
            put_str(&mut buf, name)?;
        }

        let biomes = self.biomes.sorted();
        buf.extend_from_slice(&(biomes.len() as u32).to_le_bytes());
        for (id, name) in &biomes {
            buf.extend_from_slice(&(*id as u16).to_le_bytes());
            put_str(&mut buf, name)?;
        }
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MapperError> {
        if data.len() < MAGIC.len() || data[..4] != MAGIC {
            return Err(MapperError::InvalidMagic);
        }
        let mut r = Reader { data, pos: 4 };
        let version = r.u8()?;
        if version != FORMAT_VERSION {
            return Err(MapperError::UnsupportedVersion(version));
        }

        let mapper = Self::new();
        for _ in 0..r.u32()? {
            let id = r.u32()?;
            let name = r.str()?;
            mapper.states.restore(id, name)?;
        }
        for _ in 0..r.u32()? {
            let id = u32::from(r.u16()?);
            let name = r.str()?;
            mapper.biomes.restore(id, name)?;
        }
        Ok(mapper)
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), MapperError> {
    let len = u16::try_from(s.len()).map_err(|_| MapperError::IdentityTooLong {
        len: s.len(),
        max: u16::MAX as usize,
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MapperError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(MapperError::Truncated {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MapperError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MapperError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MapperError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Result<&'a str, MapperError> {
        let len = self.u16()? as usize;
        let offset = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| MapperError::InvalidUtf8 { offset })
    }
}

//! World ingest: persisted sections, the LOD mip chain above them, and the
//! bookkeeping that coalesces change notifications.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Sender;
use dashmap::{DashMap, DashSet};
use voxlod_storage::StorageBackend;
use voxlod_voxel::{SectionKey, VoxelizedSection};

use crate::error::EngineError;

/// Sections in storage, keyed by their packed [`SectionKey`].
pub struct WorldStore {
    storage: Arc<dyn StorageBackend>,
    top_lod: u8,
    /// Serializes mip-chain rebuilds so sibling ingests do not lose updates.
    rebuild: Mutex<()>,
}

impl WorldStore {
    pub fn new(storage: Arc<dyn StorageBackend>, top_lod: u8) -> Self {
        Self {
            storage,
            top_lod,
            rebuild: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn top_lod(&self) -> u8 {
        self.top_lod
    }

    pub fn load(&self, key: SectionKey) -> Result<Option<VoxelizedSection>, EngineError> {
        match self.storage.get(key.raw())? {
            Some(bytes) => Ok(Some(VoxelizedSection::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Section to mesh for `key`. Missing or unreadable sections mesh as air.
    pub fn load_for_meshing(&self, key: SectionKey) -> VoxelizedSection {
        match self.load(key) {
            Ok(Some(section)) => section,
            Ok(None) => VoxelizedSection::empty(key),
            Err(err) => {
                tracing::warn!(%key, %err, "section unreadable, meshing as air");
                VoxelizedSection::empty(key)
            }
        }
    }

    pub fn store(&self, section: &VoxelizedSection) -> Result<(), EngineError> {
        self.storage.put(section.key().raw(), &section.serialize())?;
        Ok(())
    }

    /// Store an LOD-0 section and rebuild its ancestors up to `top_lod`.
    pub fn ingest(&self, section: &VoxelizedSection) -> Result<(), EngineError> {
        self.store(section)?;
        self.rebuild_ancestors(section.key())
    }

    /// Recompute every stored ancestor of `key` from its eight children.
    pub fn rebuild_ancestors(&self, key: SectionKey) -> Result<(), EngineError> {
        let _guard = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = key;
        while current.lod() < self.top_lod {
            let Some(parent) = current.parent() else {
                break;
            };
            let Some(child_keys) = parent.children() else {
                break;
            };
            let mut loaded: [Option<VoxelizedSection>; 8] = Default::default();
            for (slot, child) in loaded.iter_mut().zip(child_keys) {
                *slot = self.load(child).unwrap_or_else(|err| {
                    tracing::warn!(key = %child, %err, "child section unreadable, treated as air");
                    None
                });
            }
            let refs: [Option<&VoxelizedSection>; 8] = std::array::from_fn(|i| loaded[i].as_ref());
            let downsampled = VoxelizedSection::downsample(parent, &refs);
            self.store(&downsampled)?;
            current = parent;
        }
        Ok(())
    }
}

/// Clonable, thread-safe entry point for section updates.
#[derive(Clone)]
pub struct SectionIngestor {
    world: Arc<WorldStore>,
    dirty: DirtySender,
}

impl SectionIngestor {
    pub(crate) fn new(world: Arc<WorldStore>, dirty: DirtySender) -> Self {
        Self { world, dirty }
    }

    /// Persist an LOD-0 section, rebuild its mip chain, and schedule the
    /// covering nodes for remeshing. Runs the storage work on the calling
    /// thread.
    pub fn ingest_section(&self, section: VoxelizedSection) -> Result<(), EngineError> {
        if section.key().lod() != 0 {
            tracing::warn!(key = %section.key(), "ingest expects LOD-0 sections, ignored");
            return Ok(());
        }
        self.world.ingest(&section)?;
        self.dirty.notify(section.key(), false);
        Ok(())
    }
}

/// A change notification for an LOD-0 section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirtyEvent {
    pub key: SectionKey,
    /// The stored mip chain must be rebuilt before remeshing.
    pub rebuild: bool,
}

/// Fire-and-forget change notifications, safe from any thread.
#[derive(Clone)]
pub struct DirtySender {
    tx: Sender<DirtyEvent>,
}

impl DirtySender {
    pub(crate) fn new(tx: Sender<DirtyEvent>) -> Self {
        Self { tx }
    }

    /// The stored data of LOD-0 section `key` changed.
    pub fn on_section_dirty(&self, key: SectionKey) {
        self.notify(key, true);
    }

    pub(crate) fn notify(&self, key: SectionKey, rebuild: bool) {
        // The receiver lives as long as the engine; a send after shutdown
        // has nobody left to inform.
        let _ = self.tx.send(DirtyEvent { key, rebuild });
    }
}

/// Dirty and in-flight section sets.
///
/// Dirty keys coalesce repeated notifications within a frame. In-flight
/// keys have a mesh being built; a key that changes again meanwhile is
/// remembered and rebuilt once the current result lands.
#[derive(Default)]
pub struct SectionTracker {
    dirty: DashSet<SectionKey>,
    in_flight: DashMap<SectionKey, bool>,
}

impl SectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` was not already dirty.
    pub fn mark_dirty(&self, key: SectionKey) -> bool {
        self.dirty.insert(key)
    }

    pub fn is_dirty(&self, key: SectionKey) -> bool {
        self.dirty.contains(&key)
    }

    pub fn take_dirty(&self) -> Vec<SectionKey> {
        let keys: Vec<SectionKey> = self.dirty.iter().map(|k| *k).collect();
        for key in &keys {
            self.dirty.remove(key);
        }
        keys
    }

    /// Claim `key` for meshing. Returns `false` if a build is already
    /// running; the key is then flagged to rebuild after it.
    pub fn begin_generation(&self, key: SectionKey, force: bool) -> bool {
        match self.in_flight.get_mut(&key) {
            Some(mut again) => {
                *again |= force;
                false
            }
            None => {
                self.in_flight.insert(key, false);
                true
            }
        }
    }

    /// Release `key`. Returns `true` if it changed while in flight.
    pub fn finish_generation(&self, key: SectionKey) -> bool {
        self.in_flight.remove(&key).is_some_and(|(_, again)| again)
    }

    pub fn is_in_flight(&self, key: SectionKey) -> bool {
        self.in_flight.contains_key(&key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget every in-flight claim, e.g. after the worker pool stopped.
    pub fn clear_in_flight(&self) {
        self.in_flight.clear();
    }
}

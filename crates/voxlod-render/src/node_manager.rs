//! CPU-authoritative LOD node table and its GPU mirror.
//!
//! Slots index [`GpuNode`] records. Top-level nodes take single slots;
//! children are always allocated as a group of 8 consecutive slots so the
//! traversal can reach them from `child_ptr`. Released slots go back to a
//! free list and are reused before the high-water mark grows.

use dashmap::DashMap;
use rustc_hash::FxHashSet;
use thiserror::Error;
use voxlod_mesh::QuadBounds;
use voxlod_voxel::SectionKey;

use crate::geometry_arena::ArenaAllocation;
use crate::node::{GpuNode, NO_GEOMETRY, NO_NODE, flags};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node capacity exhausted: requested {requested} slots, {available} available")]
    CapacityExhausted { requested: u32, available: u32 },
    #[error("slot {0} does not hold a live node")]
    UnknownSlot(u32),
}

/// Shape of the tree: capacity and which sections get top-level nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub max_nodes: u32,
    pub top_lod: u8,
    /// Vertical range of top-level nodes, in `top_lod` section units.
    pub min_y: i32,
    pub max_y: i32,
}

impl NodeLayout {
    fn column_height(&self) -> u32 {
        (self.max_y - self.min_y + 1).max(0) as u32
    }
}

pub struct NodeManager {
    layout: NodeLayout,
    table: DashMap<SectionKey, u32>,
    nodes: Vec<GpuNode>,
    geometry: Vec<Option<ArenaAllocation>>,
    last_rendered: Vec<u32>,
    free_singles: Vec<u32>,
    free_groups: Vec<u32>,
    columns: FxHashSet<(i32, i32)>,
    /// Roots of subtrees unlinked by `remove_top_level`, awaiting release.
    removed_roots: Vec<u32>,
    dirty: FxHashSet<u32>,
    tracker_resets: FxHashSet<u32>,
    frame: u32,
}

impl NodeManager {
    pub fn new(layout: NodeLayout) -> Self {
        Self {
            layout,
            table: DashMap::new(),
            nodes: Vec::new(),
            geometry: Vec::new(),
            last_rendered: Vec::new(),
            free_singles: Vec::new(),
            free_groups: Vec::new(),
            columns: FxHashSet::default(),
            removed_roots: Vec::new(),
            dirty: FxHashSet::default(),
            tracker_resets: FxHashSet::default(),
            frame: 0,
        }
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Frame number stamped on nodes created from now on.
    pub fn begin_frame(&mut self, frame: u32) {
        self.frame = frame;
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Slots in use or previously used: the traversal dispatch size.
    pub fn slot_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Nodes present in the table.
    pub fn live_count(&self) -> usize {
        self.table.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, x: i32, z: i32) -> bool {
        self.columns.contains(&(x, z))
    }

    pub fn columns(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.columns.iter().copied()
    }

    pub fn nodes(&self) -> &[GpuNode] {
        &self.nodes
    }

    pub fn node(&self, slot: u32) -> Option<&GpuNode> {
        self.nodes.get(slot as usize)
    }

    pub fn slot_of(&self, key: SectionKey) -> Option<u32> {
        self.table.get(&key).map(|slot| *slot)
    }

    pub fn contains(&self, key: SectionKey) -> bool {
        self.table.contains_key(&key)
    }

    pub fn last_rendered(&self, slot: u32) -> Option<u32> {
        self.last_rendered.get(slot as usize).copied()
    }

    fn available_slots(&self) -> u32 {
        self.layout.max_nodes.saturating_sub(self.slot_count()) + self.free_singles.len() as u32
    }

    fn live_node(&self, slot: u32) -> Result<&GpuNode, NodeError> {
        match self.nodes.get(slot as usize) {
            Some(node) if node.has(flags::VALID) => Ok(node),
            _ => Err(NodeError::UnknownSlot(slot)),
        }
    }

    fn touch(&mut self, slot: u32) {
        self.dirty.insert(slot);
    }

    /// Append `count` fresh slots past the high-water mark.
    fn grow(&mut self, count: u32) -> Option<u32> {
        let first = self.slot_count();
        if first.checked_add(count)? > self.layout.max_nodes {
            return None;
        }
        self.nodes.resize(self.nodes.len() + count as usize, GpuNode::VACANT);
        self.geometry.resize_with(self.geometry.len() + count as usize, || None);
        self.last_rendered.resize(self.last_rendered.len() + count as usize, 0);
        Some(first)
    }

    fn install(&mut self, slot: u32, node: GpuNode) {
        let key = node.key();
        self.nodes[slot as usize] = node;
        self.last_rendered[slot as usize] = self.frame;
        self.table.insert(key, slot);
        self.touch(slot);
        self.tracker_resets.insert(slot);
    }

    /// Create the top-level nodes of column `(x, z)` (in `top_lod` units).
    /// Returns the keys that need meshing; empty if the column is loaded.
    /// On capacity exhaustion nothing is inserted.
    pub fn add_top_level(&mut self, x: i32, z: i32) -> Result<Vec<SectionKey>, NodeError> {
        if self.columns.contains(&(x, z)) {
            return Ok(Vec::new());
        }
        let requested = self.layout.column_height();
        let available = self.available_slots();
        if requested > available {
            return Err(NodeError::CapacityExhausted {
                requested,
                available,
            });
        }

        let mut keys = Vec::with_capacity(requested as usize);
        for y in self.layout.min_y..=self.layout.max_y {
            let key = SectionKey::new(self.layout.top_lod, x, y, z);
            let slot = match self.free_singles.pop() {
                Some(slot) => slot,
                None => self.grow(1).ok_or(NodeError::CapacityExhausted {
                    requested,
                    available,
                })?,
            };
            self.install(slot, GpuNode::new(key, NO_NODE, flags::TOP_LEVEL));
            keys.push(key);
        }
        self.columns.insert((x, z));
        Ok(keys)
    }

    /// Unlink column `(x, z)` from the table and flag its whole subtree
    /// `STALE` for the cleaner. Geometry stays allocated until then.
    /// Returns the number of nodes unlinked.
    pub fn remove_top_level(&mut self, x: i32, z: i32) -> usize {
        if !self.columns.remove(&(x, z)) {
            return 0;
        }
        let mut removed = 0;
        for y in self.layout.min_y..=self.layout.max_y {
            let key = SectionKey::new(self.layout.top_lod, x, y, z);
            let Some((_, root)) = self.table.remove(&key) else {
                continue;
            };
            let mut stack = vec![root];
            while let Some(slot) = stack.pop() {
                let node = &mut self.nodes[slot as usize];
                if slot != root {
                    self.table.remove(&node.key());
                }
                node.flags = (node.flags & !flags::VALID) | flags::STALE;
                if node.has_children() {
                    stack.extend(node.child_ptr..node.child_ptr + 8);
                }
                self.dirty.insert(slot);
                removed += 1;
            }
            self.removed_roots.push(root);
        }
        removed
    }

    /// Flag every loaded node covering LOD-0 section `key` as `STALE` and
    /// return their keys, finest first.
    pub fn world_event(&mut self, key: SectionKey) -> Vec<SectionKey> {
        let mut stale = Vec::new();
        for lod in 0..=self.layout.top_lod {
            let Some(ancestor) = key.ancestor_at(lod) else {
                continue;
            };
            if let Some(slot) = self.slot_of(ancestor) {
                self.nodes[slot as usize].flags |= flags::STALE;
                self.touch(slot);
                stale.push(ancestor);
            }
        }
        stale
    }

    /// Make sure the node at `slot` has its 8 children. Returns the child
    /// keys that still need a mesh; empty for LOD-0 nodes.
    pub fn request_children(&mut self, slot: u32) -> Result<Vec<SectionKey>, NodeError> {
        let node = *self.live_node(slot)?;
        let Some(child_keys) = node.key().children() else {
            return Ok(Vec::new());
        };

        if node.has_children() {
            let pending = (node.child_ptr..node.child_ptr + 8)
                .filter(|&child| !self.nodes[child as usize].has(flags::MESHED))
                .map(|child| self.nodes[child as usize].key())
                .collect();
            return Ok(pending);
        }

        let first = match self.free_groups.pop() {
            Some(first) => first,
            None => self.grow(8).ok_or(NodeError::CapacityExhausted {
                requested: 8,
                available: self.layout.max_nodes.saturating_sub(self.slot_count()),
            })?,
        };
        for (child, key) in (first..first + 8).zip(child_keys) {
            self.install(child, GpuNode::new(key, slot, 0));
        }
        self.nodes[slot as usize].child_ptr = first;
        self.touch(slot);
        Ok(child_keys.to_vec())
    }

    /// Install a mesh result for `key`. `None` means the section meshed to
    /// nothing. Returns the allocation the caller must free: the replaced
    /// one, or `allocation` itself when `key` is no longer in the table.
    pub fn set_geometry(
        &mut self,
        key: SectionKey,
        allocation: Option<ArenaAllocation>,
        bounds: Option<QuadBounds>,
    ) -> Option<ArenaAllocation> {
        let Some(slot) = self.slot_of(key) else {
            return allocation;
        };
        let index = slot as usize;
        let node = &mut self.nodes[index];
        match &allocation {
            Some(alloc) => {
                node.geometry_offset = alloc.offset_quads();
                node.quad_count = alloc.quad_count();
                node.flags = (node.flags | flags::HAS_GEOMETRY) & !flags::EMPTY;
            }
            None => {
                node.geometry_offset = NO_GEOMETRY;
                node.quad_count = 0;
                node.flags = (node.flags | flags::EMPTY) & !flags::HAS_GEOMETRY;
            }
        }
        node.bounds = bounds.unwrap_or(QuadBounds::FULL).pack();
        node.flags = (node.flags | flags::MESHED) & !flags::STALE;
        let parent = node.parent_ptr;
        let previous = std::mem::replace(&mut self.geometry[index], allocation);
        self.touch(slot);

        if parent != NO_NODE {
            self.refresh_children_ready(parent);
        }
        previous
    }

    fn refresh_children_ready(&mut self, parent: u32) {
        let node = self.nodes[parent as usize];
        if !node.has_children() {
            return;
        }
        let ready = (node.child_ptr..node.child_ptr + 8)
            .all(|child| self.nodes[child as usize].has(flags::MESHED));
        let flags_before = node.flags;
        let node = &mut self.nodes[parent as usize];
        if ready {
            node.flags |= flags::CHILDREN_READY;
        } else {
            node.flags &= !flags::CHILDREN_READY;
        }
        if node.flags != flags_before {
            self.touch(parent);
        }
    }

    pub fn mark_rendered(&mut self, slot: u32, frame: u32) {
        if let Some(stamp) = self.last_rendered.get_mut(slot as usize) {
            *stamp = (*stamp).max(frame);
        }
    }

    /// Merge a render-tracker readback. Stamps only move forward.
    pub fn apply_render_feedback(&mut self, stamps: &[u32]) {
        for (stamp, &seen) in self.last_rendered.iter_mut().zip(stamps) {
            *stamp = (*stamp).max(seen);
        }
    }

    /// Drop the geometry of the node at `slot`, returning it for the caller
    /// to free. The node stays in the table and will be remeshed on demand.
    pub fn evict(&mut self, slot: u32) -> Option<ArenaAllocation> {
        let index = slot as usize;
        let node = self.nodes.get_mut(index)?;
        node.flags &= !(flags::HAS_GEOMETRY | flags::MESHED | flags::EMPTY);
        node.geometry_offset = NO_GEOMETRY;
        node.quad_count = 0;
        let parent = node.parent_ptr;
        let taken = self.geometry[index].take();
        self.touch(slot);
        if parent != NO_NODE {
            self.refresh_children_ready(parent);
        }
        taken
    }

    /// Release the child group of `slot` if every child is a leaf. Returns
    /// the children's geometry for the caller to free.
    pub fn release_children(&mut self, slot: u32) -> Option<Vec<ArenaAllocation>> {
        let node = *self.nodes.get(slot as usize)?;
        if !node.has_children() {
            return None;
        }
        let first = node.child_ptr;
        if (first..first + 8).any(|child| self.nodes[child as usize].has_children()) {
            return None;
        }
        let mut freed = Vec::new();
        for child in first..first + 8 {
            let child_node = self.nodes[child as usize];
            if child_node.has(flags::VALID) {
                self.table.remove(&child_node.key());
            }
            freed.extend(self.geometry[child as usize].take());
            self.nodes[child as usize] = GpuNode::VACANT;
            self.touch(child);
        }
        self.free_groups.push(first);
        let parent = &mut self.nodes[slot as usize];
        parent.child_ptr = NO_NODE;
        parent.flags &= !flags::CHILDREN_READY;
        self.touch(slot);
        Some(freed)
    }

    /// Release every subtree unlinked by [`Self::remove_top_level`]: slots go
    /// back to the free lists and their geometry is returned.
    pub fn release_removed(&mut self) -> (usize, Vec<ArenaAllocation>) {
        let roots = std::mem::take(&mut self.removed_roots);
        let mut released = 0;
        let mut freed = Vec::new();
        for root in roots {
            // Post-order: a group is freed only after its own children.
            let mut stack = vec![(root, false)];
            while let Some((slot, expanded)) = stack.pop() {
                let node = self.nodes[slot as usize];
                if !expanded && node.has_children() {
                    stack.push((slot, true));
                    stack.extend((node.child_ptr..node.child_ptr + 8).map(|c| (c, false)));
                    continue;
                }
                if node.has_children() {
                    self.free_groups.push(node.child_ptr);
                }
                freed.extend(self.geometry[slot as usize].take());
                self.nodes[slot as usize] = GpuNode::VACANT;
                self.touch(slot);
                released += 1;
            }
            self.free_singles.push(root);
        }
        (released, freed)
    }

    pub fn removed_pending(&self) -> usize {
        self.removed_roots.len()
    }

    /// Forget all geometry, e.g. when the arena is replaced. Every node
    /// becomes unmeshed; the returned allocations belong to the old arena.
    pub fn invalidate_geometry(&mut self) -> Vec<ArenaAllocation> {
        let mut taken = Vec::new();
        for (slot, node) in self.nodes.iter_mut().enumerate() {
            node.flags &= !(flags::HAS_GEOMETRY | flags::MESHED | flags::EMPTY | flags::CHILDREN_READY);
            node.geometry_offset = NO_GEOMETRY;
            node.quad_count = 0;
            taken.extend(self.geometry[slot].take());
        }
        self.mark_all_dirty();
        taken
    }

    /// Force a full upload on the next sync.
    pub fn mark_all_dirty(&mut self) {
        let count = self.slot_count();
        self.dirty.extend(0..count);
        self.tracker_resets.extend(0..count);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    fn take_sorted(set: &mut FxHashSet<u32>) -> Vec<u32> {
        let mut slots: Vec<u32> = set.drain().collect();
        slots.sort_unstable();
        slots
    }
}

/// Split sorted slots into `[start, end)` runs of consecutive slots.
pub(crate) fn contiguous_runs(sorted: &[u32]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &slot in sorted {
        match runs.last_mut() {
            Some((_, end)) if *end == slot => *end += 1,
            _ => runs.push((slot, slot + 1)),
        }
    }
    runs
}

/// GPU copies of the node table, render tracker and visibility array, sized
/// for `capacity` slots.
pub struct NodeGpuBuffers {
    nodes: wgpu::Buffer,
    visibility: wgpu::Buffer,
    tracker: wgpu::Buffer,
    capacity: u32,
}

impl NodeGpuBuffers {
    pub fn new(device: &wgpu::Device, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let storage = |label: &str, size: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let slots = u64::from(capacity);
        Self {
            nodes: storage("lod_nodes", slots * size_of::<GpuNode>() as u64),
            visibility: storage("lod_visibility", slots * 4),
            tracker: storage("lod_render_tracker", slots * 4),
            capacity,
        }
    }

    pub fn nodes(&self) -> &wgpu::Buffer {
        &self.nodes
    }

    pub fn visibility(&self) -> &wgpu::Buffer {
        &self.visibility
    }

    pub fn tracker(&self) -> &wgpu::Buffer {
        &self.tracker
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Upload dirty node records and reset the tracker/visibility entries
    /// of newly created slots. Returns the number of node records written.
    pub fn sync(&self, queue: &wgpu::Queue, manager: &mut NodeManager) -> usize {
        let dirty = NodeManager::take_sorted(&mut manager.dirty);
        for (start, end) in contiguous_runs(&dirty) {
            let end = end.min(self.capacity);
            if start >= end {
                continue;
            }
            let records = &manager.nodes[start as usize..end as usize];
            queue.write_buffer(
                &self.nodes,
                u64::from(start) * size_of::<GpuNode>() as u64,
                bytemuck::cast_slice(records),
            );
        }

        let resets = NodeManager::take_sorted(&mut manager.tracker_resets);
        for (start, end) in contiguous_runs(&resets) {
            let end = end.min(self.capacity);
            if start >= end {
                continue;
            }
            let stamps = &manager.last_rendered[start as usize..end as usize];
            let offset = u64::from(start) * 4;
            queue.write_buffer(&self.tracker, offset, bytemuck::cast_slice(stamps));
            let zeros = vec![0u32; (end - start) as usize];
            queue.write_buffer(&self.visibility, offset, bytemuck::cast_slice(&zeros));
        }
        dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry_arena::BlockAllocator;
    use crate::test_support::{read_back, test_device};

    fn layout() -> NodeLayout {
        NodeLayout {
            max_nodes: 64,
            top_lod: 2,
            min_y: -1,
            max_y: 1,
        }
    }

    fn arena() -> BlockAllocator {
        BlockAllocator::new(64 * 16 * 8, 16)
    }

    #[test]
    fn test_add_top_level_is_idempotent() {
        let mut nodes = NodeManager::new(layout());
        let keys = nodes.add_top_level(3, -4).unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.lod() == 2 && k.x() == 3 && k.z() == -4));
        assert!(nodes.add_top_level(3, -4).unwrap().is_empty());
        assert_eq!(nodes.live_count(), 3);
        assert_eq!(nodes.column_count(), 1);

        let slot = nodes.slot_of(keys[0]).unwrap();
        assert!(nodes.node(slot).unwrap().has(flags::VALID | flags::TOP_LEVEL));
    }

    #[test]
    fn test_capacity_exhaustion_inserts_nothing() {
        let mut nodes = NodeManager::new(NodeLayout {
            max_nodes: 4,
            ..layout()
        });
        nodes.add_top_level(0, 0).unwrap();
        let err = nodes.add_top_level(1, 0).unwrap_err();
        assert_eq!(
            err,
            NodeError::CapacityExhausted {
                requested: 3,
                available: 1
            }
        );
        assert_eq!(nodes.live_count(), 3);
        assert!(!nodes.has_column(1, 0));
    }

    #[test]
    fn test_request_children_allocates_group_once() {
        let mut nodes = NodeManager::new(layout());
        let root_key = nodes.add_top_level(0, 0).unwrap()[1];
        let root = nodes.slot_of(root_key).unwrap();

        let children = nodes.request_children(root).unwrap();
        assert_eq!(children.len(), 8);
        assert!(children.iter().all(|c| c.parent() == Some(root_key)));
        let first = nodes.node(root).unwrap().child_ptr;
        for (i, key) in children.iter().enumerate() {
            assert_eq!(nodes.slot_of(*key), Some(first + i as u32));
        }

        // Second call returns the unmeshed children, allocates nothing.
        let slots = nodes.slot_count();
        assert_eq!(nodes.request_children(root).unwrap(), children);
        assert_eq!(nodes.slot_count(), slots);

        assert_eq!(nodes.request_children(999), Err(NodeError::UnknownSlot(999)));
    }

    #[test]
    fn test_lod0_has_no_children() {
        let mut nodes = NodeManager::new(NodeLayout {
            top_lod: 0,
            min_y: 0,
            max_y: 0,
            ..layout()
        });
        let key = nodes.add_top_level(5, 5).unwrap()[0];
        let slot = nodes.slot_of(key).unwrap();
        assert!(nodes.request_children(slot).unwrap().is_empty());
    }

    #[test]
    fn test_set_geometry_hands_back_previous() {
        let arena = arena();
        let mut nodes = NodeManager::new(layout());
        let key = nodes.add_top_level(0, 0).unwrap()[0];

        let first = arena.allocate(10).unwrap();
        let first_offset = first.offset_bytes();
        assert!(nodes.set_geometry(key, Some(first), None).is_none());
        let slot = nodes.slot_of(key).unwrap();
        let node = *nodes.node(slot).unwrap();
        assert!(node.has(flags::HAS_GEOMETRY | flags::MESHED));
        assert_eq!(node.quad_count, 10);

        let second = arena.allocate(20).unwrap();
        let previous = nodes.set_geometry(key, Some(second), None).unwrap();
        assert_eq!(previous.offset_bytes(), first_offset);
        arena.free(previous);

        let third = nodes.set_geometry(key, None, None).unwrap();
        arena.free(third);
        let node = nodes.node(slot).unwrap();
        assert!(node.has(flags::EMPTY | flags::MESHED));
        assert!(!node.has(flags::HAS_GEOMETRY));
        assert_eq!(arena.free_blocks(), arena.total_blocks());
    }

    #[test]
    fn test_set_geometry_unknown_key_returns_allocation() {
        let arena = arena();
        let mut nodes = NodeManager::new(layout());
        let alloc = arena.allocate(5).unwrap();
        let back = nodes.set_geometry(SectionKey::new(0, 1, 2, 3), Some(alloc), None);
        arena.free(back.unwrap());
        assert_eq!(arena.free_blocks(), arena.total_blocks());
    }

    #[test]
    fn test_children_ready_after_all_siblings_meshed() {
        let mut nodes = NodeManager::new(layout());
        let root_key = nodes.add_top_level(0, 0).unwrap()[0];
        let root = nodes.slot_of(root_key).unwrap();
        let children = nodes.request_children(root).unwrap();

        for key in &children[..7] {
            nodes.set_geometry(*key, None, None);
        }
        assert!(!nodes.node(root).unwrap().has(flags::CHILDREN_READY));
        nodes.set_geometry(children[7], None, None);
        assert!(nodes.node(root).unwrap().has(flags::CHILDREN_READY));

        let child_slot = nodes.slot_of(children[3]).unwrap();
        assert!(nodes.evict(child_slot).is_none());
        assert!(!nodes.node(root).unwrap().has(flags::CHILDREN_READY));
        assert_eq!(nodes.request_children(root).unwrap(), vec![children[3]]);
    }

    #[test]
    fn test_world_event_marks_ancestors() {
        let mut nodes = NodeManager::new(layout());
        let root_key = nodes.add_top_level(0, 0).unwrap()[1];
        assert_eq!(root_key, SectionKey::new(2, 0, 0, 0));
        let root = nodes.slot_of(root_key).unwrap();
        let lod1 = nodes.request_children(root).unwrap();
        let lod1_slot = nodes.slot_of(lod1[0]).unwrap();
        nodes.request_children(lod1_slot).unwrap();

        let section = SectionKey::new(0, 1, 0, 1);
        let stale = nodes.world_event(section);
        assert_eq!(
            stale,
            vec![section, SectionKey::new(1, 0, 0, 0), SectionKey::new(2, 0, 0, 0)]
        );
        for key in stale {
            let slot = nodes.slot_of(key).unwrap();
            assert!(nodes.node(slot).unwrap().has(flags::STALE));
        }
        assert!(nodes.world_event(SectionKey::new(0, 100, 0, 100)).is_empty());
    }

    #[test]
    fn test_remove_then_release_frees_everything() {
        let arena = arena();
        let mut nodes = NodeManager::new(layout());
        let keys = nodes.add_top_level(0, 0).unwrap();
        let root = nodes.slot_of(keys[0]).unwrap();
        let children = nodes.request_children(root).unwrap();
        for key in children.iter().chain(&keys) {
            let alloc = arena.allocate(4).unwrap();
            assert!(nodes.set_geometry(*key, Some(alloc), None).is_none());
        }

        assert_eq!(nodes.remove_top_level(0, 0), 3 + 8);
        assert_eq!(nodes.live_count(), 0);
        assert!(!nodes.node(root).unwrap().has(flags::VALID));
        assert!(nodes.node(root).unwrap().has(flags::STALE));
        // Geometry is still held until release.
        assert!(arena.free_blocks() < arena.total_blocks());

        let (released, freed) = nodes.release_removed();
        assert_eq!(released, 11);
        for alloc in freed {
            arena.free(alloc);
        }
        assert_eq!(arena.free_blocks(), arena.total_blocks());

        // Slots are reused instead of growing.
        let high_water = nodes.slot_count();
        let again = nodes.add_top_level(0, 0).unwrap();
        let slot = nodes.slot_of(again[0]).unwrap();
        nodes.request_children(slot).unwrap();
        assert_eq!(nodes.slot_count(), high_water);
    }

    #[test]
    fn test_release_children_requires_leaves() {
        let mut nodes = NodeManager::new(layout());
        let root_key = nodes.add_top_level(0, 0).unwrap()[0];
        let root = nodes.slot_of(root_key).unwrap();
        let lod1 = nodes.request_children(root).unwrap();
        let lod1_slot = nodes.slot_of(lod1[2]).unwrap();
        nodes.request_children(lod1_slot).unwrap();

        assert!(nodes.release_children(root).is_none());
        assert_eq!(nodes.release_children(lod1_slot).unwrap().len(), 0);
        assert!(!nodes.node(lod1_slot).unwrap().has_children());
        assert!(nodes.release_children(root).is_some());
        assert_eq!(nodes.live_count(), 3);
    }

    #[test]
    fn test_render_feedback_only_moves_forward() {
        let mut nodes = NodeManager::new(layout());
        nodes.begin_frame(10);
        nodes.add_top_level(0, 0).unwrap();
        assert_eq!(nodes.last_rendered(0), Some(10));
        nodes.apply_render_feedback(&[15, 5, 0]);
        assert_eq!(nodes.last_rendered(0), Some(15));
        assert_eq!(nodes.last_rendered(1), Some(10));
        nodes.mark_rendered(2, 12);
        assert_eq!(nodes.last_rendered(2), Some(12));
    }

    #[test]
    fn test_contiguous_runs() {
        assert!(contiguous_runs(&[]).is_empty());
        assert_eq!(contiguous_runs(&[1, 2, 3, 7, 9, 10]), vec![(1, 4), (7, 8), (9, 11)]);
    }

    #[test]
    fn test_sync_uploads_dirty_nodes() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let mut nodes = NodeManager::new(layout());
        nodes.begin_frame(42);
        let keys = nodes.add_top_level(2, 2).unwrap();
        let buffers = NodeGpuBuffers::new(&device, 64);
        assert_eq!(buffers.sync(&queue, &mut nodes), 3);
        assert_eq!(nodes.dirty_count(), 0);

        let bytes = read_back(&device, &queue, buffers.nodes(), 0, 3 * 32);
        let records: &[GpuNode] = bytemuck::cast_slice(&bytes);
        assert_eq!(records[1].key(), keys[1]);

        let stamps = read_back(&device, &queue, buffers.tracker(), 0, 12);
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&stamps), &[42, 42, 42]);
    }
}

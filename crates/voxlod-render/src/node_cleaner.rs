//! Periodic eviction of geometry and nodes the traversal stopped drawing.

use crate::geometry_arena::{ArenaAllocation, GeometryArena};
use crate::node::flags;
use crate::node_manager::NodeManager;

/// What one cleanup pass released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub frame: u32,
    pub evicted_geometry: usize,
    pub released_groups: usize,
    pub released_removed: usize,
    pub freed_bytes: u64,
}

pub struct NodeCleaner {
    interval: u32,
    retention: u32,
    counter: u32,
}

impl NodeCleaner {
    pub fn new(interval: u32, retention: u32) -> Self {
        Self {
            interval: interval.max(1),
            retention,
            counter: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn retention(&self) -> u32 {
        self.retention
    }

    pub fn set_interval(&mut self, frames: u32) {
        self.interval = frames.max(1);
    }

    pub fn set_retention(&mut self, frames: u32) {
        self.retention = frames;
    }

    /// Whether the next [`Self::tick`] runs a pass.
    pub fn is_due(&self) -> bool {
        self.counter.saturating_add(1) >= self.interval
    }

    /// Count one frame; scan every `interval` calls.
    pub fn tick(
        &mut self,
        frame: u32,
        nodes: &mut NodeManager,
        arena: &GeometryArena,
    ) -> Option<CleanupReport> {
        self.counter += 1;
        if self.counter < self.interval {
            return None;
        }
        Some(self.force_cleanup(frame, nodes, arena))
    }

    /// Scan now and restart the interval.
    pub fn force_cleanup(
        &mut self,
        frame: u32,
        nodes: &mut NodeManager,
        arena: &GeometryArena,
    ) -> CleanupReport {
        self.counter = 0;
        let retention = self.retention;
        let expired = |nodes: &NodeManager, slot: u32| {
            let stamp = nodes.last_rendered(slot).unwrap_or(frame);
            frame.saturating_sub(stamp) > retention
        };
        let mut report = CleanupReport {
            frame,
            ..Default::default()
        };

        let (released, freed) = nodes.release_removed();
        report.released_removed = released;
        for alloc in freed {
            give_back(arena, alloc, &mut report.freed_bytes);
        }

        // Geometry goes a whole sibling group at a time and only from
        // leaves: evicting one child clears CHILDREN_READY on the parent,
        // which would pull its still-visible siblings back to the coarser
        // level.
        let group_expired = |nodes: &NodeManager, parent: u32| {
            nodes.node(parent).is_some_and(|p| {
                p.has_children() && (p.child_ptr..p.child_ptr + 8).all(|c| expired(nodes, c))
            })
        };
        for slot in 0..nodes.slot_count() {
            let Some(node) = nodes.node(slot) else {
                continue;
            };
            if !node.has(flags::VALID | flags::HAS_GEOMETRY)
                || node.has(flags::TOP_LEVEL)
                || node.has_children()
                || !group_expired(nodes, node.parent_ptr)
            {
                continue;
            }
            if let Some(alloc) = nodes.evict(slot) {
                give_back(arena, alloc, &mut report.freed_bytes);
                report.evicted_geometry += 1;
            }
        }

        // Leaf groups whose members are all expired and geometry-less.
        for slot in 0..nodes.slot_count() {
            let Some(node) = nodes.node(slot).copied() else {
                continue;
            };
            if !node.has(flags::VALID) || !node.has_children() {
                continue;
            }
            let releasable = (node.child_ptr..node.child_ptr + 8).all(|child| {
                nodes
                    .node(child)
                    .is_some_and(|c| !c.has_children() && !c.has(flags::HAS_GEOMETRY))
                    && expired(nodes, child)
            });
            if !releasable {
                continue;
            }
            if let Some(freed) = nodes.release_children(slot) {
                for alloc in freed {
                    give_back(arena, alloc, &mut report.freed_bytes);
                }
                report.released_groups += 1;
            }
        }

        tracing::debug!(
            frame,
            evicted = report.evicted_geometry,
            groups = report.released_groups,
            removed = report.released_removed,
            freed_bytes = report.freed_bytes,
            "node cleanup"
        );
        report
    }
}

/// Whether the `last_rendered` stamps are recent enough to clean on.
///
/// Stamps from the GPU traversal arrive through an asynchronous tracker
/// readback. A due pass first asks for a copy ([`Self::ready`] returns
/// `false` and raises the request) and runs once that copy has been
/// applied. Stamps written on the CPU are applied immediately.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StampFreshness {
    wanted: bool,
    in_flight: bool,
    fresh: bool,
}

impl StampFreshness {
    /// `true` when a pass may run now; otherwise requests a tracker copy.
    pub fn ready(&mut self) -> bool {
        if !self.fresh {
            self.wanted = true;
        }
        self.fresh
    }

    /// Called when recording the traversal. Returns `true` if the tracker
    /// copy should be recorded with it.
    pub fn take_copy_request(&mut self) -> bool {
        if self.wanted && !self.in_flight {
            self.wanted = false;
            self.in_flight = true;
            return true;
        }
        false
    }

    /// A new GPU traversal was recorded; earlier stamps are out of date.
    pub fn gpu_frame_recorded(&mut self) {
        self.fresh = false;
    }

    /// Stamps for the latest frame were applied, from a readback or the CPU.
    pub fn stamps_applied(&mut self) {
        self.in_flight = false;
        self.fresh = true;
    }

    pub fn readback_lost(&mut self) {
        self.in_flight = false;
    }

    /// A pass ran on the current stamps.
    pub fn consumed(&mut self) {
        self.fresh = false;
    }

    pub fn is_copy_in_flight(&self) -> bool {
        self.in_flight
    }
}

fn give_back(arena: &GeometryArena, alloc: ArenaAllocation, freed_bytes: &mut u64) {
    *freed_bytes += alloc.size_bytes();
    arena.free(alloc);
}

#[cfg(test)]
mod tests {
    use voxlod_voxel::SectionKey;

    use super::*;
    use crate::node_manager::NodeLayout;

    fn setup() -> (NodeManager, GeometryArena, Vec<SectionKey>, u32) {
        let mut nodes = NodeManager::new(NodeLayout {
            max_nodes: 64,
            top_lod: 1,
            min_y: 0,
            max_y: 0,
        });
        let arena = GeometryArena::new(64 * 16 * 8, 16);
        nodes.begin_frame(100);
        let root_key = nodes.add_top_level(0, 0).unwrap()[0];
        let root = nodes.slot_of(root_key).unwrap();
        let children = nodes.request_children(root).unwrap();
        for key in children.iter().chain(std::iter::once(&root_key)) {
            let alloc = arena.allocate(8).unwrap();
            assert!(nodes.set_geometry(*key, Some(alloc), None).is_none());
        }
        (nodes, arena, children, root)
    }

    #[test]
    fn test_retention_boundary() {
        let (mut nodes, arena, children, _) = setup();
        let mut cleaner = NodeCleaner::new(1, 60);
        for key in &children {
            nodes.mark_rendered(nodes.slot_of(*key).unwrap(), 200);
        }
        let slot = nodes.slot_of(children[0]).unwrap();

        let report = cleaner.force_cleanup(259, &mut nodes, &arena);
        assert_eq!(report.evicted_geometry, 0);
        assert!(nodes.node(slot).unwrap().has(flags::HAS_GEOMETRY));

        let report = cleaner.force_cleanup(261, &mut nodes, &arena);
        assert!(!nodes.node(slot).unwrap().has(flags::HAS_GEOMETRY));
        assert_eq!(report.evicted_geometry, 8);
        assert_eq!(report.released_groups, 1);
        assert_eq!(report.freed_bytes, 8 * 16 * 8);
    }

    #[test]
    fn test_top_level_survives_age() {
        let (mut nodes, arena, _, root) = setup();
        let mut cleaner = NodeCleaner::new(1, 60);
        let report = cleaner.force_cleanup(10_000, &mut nodes, &arena);
        assert!(nodes.node(root).unwrap().has(flags::HAS_GEOMETRY));
        // Never-rendered children age from their creation frame.
        assert_eq!(report.evicted_geometry, 8);
        assert_eq!(report.released_groups, 1);
        assert!(!nodes.node(root).unwrap().has_children());
        assert_eq!(arena.allocator().used_bytes(), arena.allocator().block_bytes());
    }

    #[test]
    fn test_visible_sibling_keeps_group_resident() {
        let (mut nodes, arena, children, root) = setup();
        let mut cleaner = NodeCleaner::new(1, 60);
        nodes.mark_rendered(nodes.slot_of(children[3]).unwrap(), 200);

        let report = cleaner.force_cleanup(230, &mut nodes, &arena);
        assert_eq!(report.evicted_geometry, 0);
        assert_eq!(report.released_groups, 0);
        assert!(nodes.node(root).unwrap().has(flags::CHILDREN_READY));
    }

    #[test]
    fn test_static_camera_keeps_finest_level() {
        use glam::{DVec3, Mat4};

        use crate::selection::{FrameParams, select_nodes};

        let mut nodes = NodeManager::new(NodeLayout {
            max_nodes: 256,
            top_lod: 2,
            min_y: 0,
            max_y: 0,
        });
        let arena = GeometryArena::new(1 << 20, 16);
        nodes.begin_frame(100);
        let root_key = nodes.add_top_level(0, 0).unwrap()[0];
        let mut pending = vec![root_key];
        while let Some(key) = pending.pop() {
            assert!(nodes.set_geometry(key, arena.allocate(4), None).is_none());
            let slot = nodes.slot_of(key).unwrap();
            pending.extend(nodes.request_children(slot).unwrap());
        }
        assert_eq!(nodes.live_count(), 1 + 8 + 64);

        let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 10_000.0);
        let lods_drawn = |nodes: &NodeManager, frame: u32| {
            let params = FrameParams::new(
                DVec3::new(32.0, 32.0, 32.0),
                Mat4::IDENTITY,
                projection,
                (720, 720),
                64.0,
                frame,
            );
            let selection = select_nodes(nodes.nodes(), &params, None, 1024);
            let mut lods: Vec<u8> = selection
                .draws
                .iter()
                .map(|d| nodes.node(d.first_instance).unwrap().key().lod())
                .collect();
            lods.sort_unstable();
            (selection, lods)
        };

        let mut cleaner = NodeCleaner::new(60, 60);
        let (_, before) = lods_drawn(&nodes, 100);
        assert!(!before.is_empty());
        assert!(before.iter().all(|&lod| lod == 0));

        for frame in 100..=170 {
            nodes.begin_frame(frame);
            let (selection, _) = lods_drawn(&nodes, frame);
            for &slot in selection.selected.iter().chain(&selection.handed_over) {
                nodes.mark_rendered(slot, frame);
            }
        }
        cleaner.force_cleanup(170, &mut nodes, &arena);

        let (_, after) = lods_drawn(&nodes, 171);
        assert_eq!(after, before);
        assert!(nodes.node(nodes.slot_of(root_key).unwrap()).unwrap().has(flags::CHILDREN_READY));
    }

    #[test]
    fn test_tick_interval() {
        let (mut nodes, arena, _, _) = setup();
        let mut cleaner = NodeCleaner::new(3, 60);
        assert!(cleaner.tick(101, &mut nodes, &arena).is_none());
        assert!(cleaner.tick(102, &mut nodes, &arena).is_none());
        assert!(cleaner.tick(103, &mut nodes, &arena).is_some());
        assert!(cleaner.tick(104, &mut nodes, &arena).is_none());

        cleaner.set_interval(0);
        assert_eq!(cleaner.interval(), 1);
        assert!(cleaner.tick(105, &mut nodes, &arena).is_some());
    }

    #[test]
    fn test_due_pass_waits_for_tracker_copy() {
        let mut cleaner = NodeCleaner::new(2, 60);
        let (mut nodes, arena, _, _) = setup();
        let mut stamps = StampFreshness::default();

        assert!(!cleaner.is_due());
        assert!(cleaner.tick(101, &mut nodes, &arena).is_none());
        assert!(cleaner.is_due());

        // Nothing fresh yet: the pass is held and a copy is requested once.
        stamps.gpu_frame_recorded();
        assert!(!stamps.ready());
        assert!(stamps.take_copy_request());
        assert!(!stamps.take_copy_request());
        assert!(stamps.is_copy_in_flight());

        // Later traversals do not satisfy the request on their own.
        stamps.gpu_frame_recorded();
        assert!(!stamps.ready());
        assert!(!stamps.take_copy_request());

        stamps.stamps_applied();
        assert!(stamps.ready());
        assert!(cleaner.tick(104, &mut nodes, &arena).is_some());
        stamps.consumed();
        assert!(!stamps.ready());
    }

    #[test]
    fn test_lost_readback_is_requested_again() {
        let mut stamps = StampFreshness::default();
        assert!(!stamps.ready());
        assert!(stamps.take_copy_request());
        stamps.readback_lost();
        assert!(!stamps.ready());
        assert!(stamps.take_copy_request());
    }

    #[test]
    fn test_removed_columns_are_released() {
        let (mut nodes, arena, _, _) = setup();
        let mut cleaner = NodeCleaner::new(60, 60);
        nodes.remove_top_level(0, 0);
        let report = cleaner.force_cleanup(101, &mut nodes, &arena);
        assert_eq!(report.released_removed, 9);
        assert_eq!(arena.allocator().used_bytes(), 0);
        assert_eq!(nodes.live_count(), 0);
    }
}

//! GPU-side records shared with `traversal.wgsl`.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};
use static_assertions::assert_eq_size;
use voxlod_mesh::QuadBounds;
use voxlod_voxel::{SECTION_SIZE, SectionKey};

use crate::frustum::Aabb;

/// Sentinel for "no node" in `child_ptr` / `parent_ptr`.
pub const NO_NODE: u32 = u32::MAX;
/// Sentinel for "no geometry" in `geometry_offset`.
pub const NO_GEOMETRY: u32 = u32::MAX;

/// Node flag bits. Mirrored as constants in `traversal.wgsl`.
pub mod flags {
    /// Slot holds a node that is present in the node table.
    pub const VALID: u32 = 1 << 0;
    /// Geometry is resident in the arena.
    pub const HAS_GEOMETRY: u32 = 1 << 1;
    /// All eight children have resolved geometry (possibly empty).
    pub const CHILDREN_READY: u32 = 1 << 2;
    /// Geometry is out of date and a rebuild is pending.
    pub const STALE: u32 = 1 << 3;
    /// Root of a loaded column; never released by age.
    pub const TOP_LEVEL: u32 = 1 << 4;
    /// Meshed with zero quads.
    pub const EMPTY: u32 = 1 << 5;
    /// A mesh result has been installed (with or without quads).
    pub const MESHED: u32 = 1 << 6;
}

/// One node of the LOD tree: 8 × u32, indexed by slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuNode {
    pub key_lo: u32,
    pub key_hi: u32,
    /// First of eight consecutive child slots, or [`NO_NODE`].
    pub child_ptr: u32,
    pub parent_ptr: u32,
    /// Offset into the arena in quads, or [`NO_GEOMETRY`].
    pub geometry_offset: u32,
    pub quad_count: u32,
    /// [`QuadBounds::pack`] of the node's geometry.
    pub bounds: u32,
    pub flags: u32,
}

assert_eq_size!(GpuNode, [u8; 32]);

impl GpuNode {
    /// An unused slot.
    pub const VACANT: Self = Self {
        key_lo: 0,
        key_hi: 0,
        child_ptr: NO_NODE,
        parent_ptr: NO_NODE,
        geometry_offset: NO_GEOMETRY,
        quad_count: 0,
        bounds: 0,
        flags: 0,
    };

    pub fn new(key: SectionKey, parent: u32, extra_flags: u32) -> Self {
        Self {
            key_lo: key.raw() as u32,
            key_hi: (key.raw() >> 32) as u32,
            parent_ptr: parent,
            bounds: QuadBounds::FULL.pack(),
            flags: flags::VALID | extra_flags,
            ..Self::VACANT
        }
    }

    pub fn key(&self) -> SectionKey {
        SectionKey::from_raw(u64::from(self.key_lo) | (u64::from(self.key_hi) << 32))
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    pub fn has_children(&self) -> bool {
        self.child_ptr != NO_NODE
    }

    /// Camera-relative box of the node's geometry.
    ///
    /// `camera_section` is the camera's LOD-0 section coordinate and
    /// `camera_offset` its position inside that section, in blocks.
    pub fn relative_aabb(&self, camera_section: IVec3, camera_offset: Vec3) -> Aabb {
        let key = self.key();
        let lod = u32::from(key.lod());
        let scale = (1i32 << lod) as f32;
        let origin_sections = IVec3::new(key.x(), key.y(), key.z()) * (1i32 << lod) - camera_section;
        let origin = origin_sections.as_vec3() * SECTION_SIZE as f32 - camera_offset;

        let bounds = QuadBounds::unpack(self.bounds);
        let min = Vec3::from(bounds.min.map(f32::from)) * scale;
        let max = Vec3::from(bounds.max.map(f32::from)) * scale;
        Aabb::new(origin + min, origin + max)
    }
}

/// Indirect draw record written by the traversal, laid out for
/// `multi_draw_indirect_count`. Each quad expands to 6 vertices;
/// `first_instance` carries the node slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

assert_eq_size!(DrawCommand, [u8; 16]);

impl DrawCommand {
    pub fn for_node(slot: u32, node: &GpuNode) -> Self {
        Self {
            vertex_count: node.quad_count * 6,
            instance_count: 1,
            first_vertex: node.geometry_offset * 6,
            first_instance: slot,
        }
    }
}

/// Traversal request word: slot in the low 31 bits, kind in bit 31.
pub mod request {
    /// The node wants its own mesh built.
    pub const MESH: u32 = 0;
    /// The node wants its children created and meshed.
    pub const CHILDREN: u32 = 1 << 31;
    pub const SLOT_MASK: u32 = !CHILDREN;

    pub fn encode(slot: u32, kind: u32) -> u32 {
        (slot & SLOT_MASK) | kind
    }

    /// `(slot, wants_children)`.
    pub fn decode(word: u32) -> (u32, bool) {
        (word & SLOT_MASK, word & CHILDREN != 0)
    }
}

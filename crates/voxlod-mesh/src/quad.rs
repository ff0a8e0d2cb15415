//! The packed 64-bit quad shared by the mesher, the geometry arena, and the
//! WGSL decoder in `quad.wgsl`.
//!
//! ## Bit layout
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..3 | face code ([`FaceDirection`]) |
//! | 3..7 | width − 1 |
//! | 7..11 | height − 1 |
//! | 11..15 | x |
//! | 15..19 | y |
//! | 19..23 | z |
//! | 23..43 | state id |
//! | 43..52 | biome id |
//! | 52..60 | light |
//! | 60..64 | reserved (zero) |
//!
//! `(x, y, z)` is the minimum voxel covered by the quad. Width runs along
//! the face's u axis and height along its v axis (see
//! [`FaceDirection::sweep_axes`]).

use bytemuck::{Pod, Zeroable};
use static_assertions::assert_eq_size;
use voxlod_voxel::{MAX_BIOME_ID, MAX_STATE_ID, SECTION_SIZE};

use crate::face_direction::FaceDirection;

/// Bytes per quad in GPU memory.
pub const QUAD_BYTES: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct Quad(u64);

assert_eq_size!(Quad, [u8; QUAD_BYTES]);

const fn field(raw: u64, shift: u32, bits: u32) -> u64 {
    (raw >> shift) & ((1 << bits) - 1)
}

impl Quad {
    /// Pack a quad. `width` and `height` must be in `1..=16`, coordinates in
    /// `0..16`; ids are masked to their field width.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        face: FaceDirection,
        x: u8,
        y: u8,
        z: u8,
        width: u8,
        height: u8,
        state: u32,
        biome: u16,
        light: u8,
    ) -> Self {
        debug_assert!((1..=16).contains(&width) && (1..=16).contains(&height));
        debug_assert!(x < 16 && y < 16 && z < 16);
        let raw = u64::from(face.code())
            | (u64::from(width.wrapping_sub(1) & 0xF) << 3)
            | (u64::from(height.wrapping_sub(1) & 0xF) << 7)
            | (u64::from(x & 0xF) << 11)
            | (u64::from(y & 0xF) << 15)
            | (u64::from(z & 0xF) << 19)
            | (u64::from(state & MAX_STATE_ID) << 23)
            | (u64::from(biome & MAX_BIOME_ID) << 43)
            | (u64::from(light) << 52);
        Self(raw)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Decoded face, or `None` for the unused codes 6 and 7.
    pub fn face(self) -> Option<FaceDirection> {
        FaceDirection::from_code(field(self.0, 0, 3) as u8)
    }

    pub const fn width(self) -> u8 {
        field(self.0, 3, 4) as u8 + 1
    }

    pub const fn height(self) -> u8 {
        field(self.0, 7, 4) as u8 + 1
    }

    pub const fn x(self) -> u8 {
        field(self.0, 11, 4) as u8
    }

    pub const fn y(self) -> u8 {
        field(self.0, 15, 4) as u8
    }

    pub const fn z(self) -> u8 {
        field(self.0, 19, 4) as u8
    }

    pub const fn state(self) -> u32 {
        field(self.0, 23, 20) as u32
    }

    pub const fn biome(self) -> u16 {
        field(self.0, 43, 9) as u16
    }

    pub const fn light(self) -> u8 {
        field(self.0, 52, 8) as u8
    }

    /// Voxel-space box covered by this quad: `(min, max_exclusive)`.
    pub fn voxel_extent(self) -> Option<([u8; 3], [u8; 3])> {
        let (_, u_axis, v_axis) = self.face()?.sweep_axes();
        let min = [self.x(), self.y(), self.z()];
        let mut max = [min[0] + 1, min[1] + 1, min[2] + 1];
        max[u_axis] = min[u_axis] + self.width();
        max[v_axis] = min[v_axis] + self.height();
        Some((min, max))
    }
}

impl std::fmt::Debug for Quad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quad")
            .field("face", &self.face())
            .field("pos", &(self.x(), self.y(), self.z()))
            .field("size", &(self.width(), self.height()))
            .field("state", &self.state())
            .finish()
    }
}

/// Tight voxel-space bounds of a quad set, in `0..=16` per axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuadBounds {
    pub min: [u8; 3],
    /// Exclusive.
    pub max: [u8; 3],
}

impl QuadBounds {
    /// Bounds covering the whole section.
    pub const FULL: Self = Self {
        min: [0; 3],
        max: [SECTION_SIZE as u8; 3],
    };

    /// `None` for an empty (or fully malformed) quad list.
    pub fn from_quads(quads: &[Quad]) -> Option<Self> {
        quads
            .iter()
            .filter_map(|q| q.voxel_extent())
            .fold(None, |acc: Option<Self>, (lo, hi)| {
                Some(match acc {
                    None => Self { min: lo, max: hi },
                    Some(b) => Self {
                        min: std::array::from_fn(|i| b.min[i].min(lo[i])),
                        max: std::array::from_fn(|i| b.max[i].max(hi[i])),
                    },
                })
            })
    }

    /// 24-bit packing used by the GPU node record: 4 bits per `min` component,
    /// then 4 bits per `max - 1` component.
    pub fn pack(self) -> u32 {
        let mut bits = 0u32;
        for i in 0..3 {
            bits |= u32::from(self.min[i] & 0xF) << (i * 4);
            bits |= u32::from(self.max[i].saturating_sub(1) & 0xF) << (12 + i * 4);
        }
        bits
    }

    pub fn unpack(bits: u32) -> Self {
        Self {
            min: std::array::from_fn(|i| ((bits >> (i * 4)) & 0xF) as u8),
            max: std::array::from_fn(|i| ((bits >> (12 + i * 4)) & 0xF) as u8 + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_roundtrip_at_limits() {
        let q = Quad::new(
            FaceDirection::PosX,
            15,
            0,
            7,
            16,
            1,
            MAX_STATE_ID,
            MAX_BIOME_ID,
            0xFF,
        );
        assert_eq!(q.face(), Some(FaceDirection::PosX));
        assert_eq!((q.x(), q.y(), q.z()), (15, 0, 7));
        assert_eq!((q.width(), q.height()), (16, 1));
        assert_eq!(q.state(), MAX_STATE_ID);
        assert_eq!(q.biome(), MAX_BIOME_ID);
        assert_eq!(q.light(), 0xFF);
        assert_eq!(q.raw() >> 60, 0, "reserved bits must stay clear");
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let q = Quad::new(FaceDirection::PosY, 1, 2, 3, 4, 5, 6, 7, 8);
        let expected = 1u64
            | (3 << 3)
            | (4 << 7)
            | (1 << 11)
            | (2 << 15)
            | (3 << 19)
            | (6 << 23)
            | (7 << 43)
            | (8 << 52);
        assert_eq!(q.raw(), expected);
    }

    #[test]
    fn test_invalid_face_code() {
        assert_eq!(Quad::from_raw(7).face(), None);
        assert_eq!(Quad::from_raw(7).voxel_extent(), None);
    }

    #[test]
    fn test_extent_follows_sweep_axes() {
        // +Z face: u = X, v = Y.
        let q = Quad::new(FaceDirection::PosZ, 2, 3, 9, 4, 6, 1, 0, 0);
        assert_eq!(q.voxel_extent(), Some(([2, 3, 9], [6, 9, 10])));
    }

    #[test]
    fn test_bounds_union_and_pack() {
        let quads = [
            Quad::new(FaceDirection::PosY, 0, 4, 0, 16, 16, 1, 0, 0),
            Quad::new(FaceDirection::NegX, 3, 1, 2, 1, 1, 1, 0, 0),
        ];
        let bounds = QuadBounds::from_quads(&quads).unwrap();
        assert_eq!(bounds.min, [0, 1, 0]);
        assert_eq!(bounds.max, [16, 5, 16]);
        assert_eq!(QuadBounds::unpack(bounds.pack()), bounds);
        assert_eq!(QuadBounds::unpack(QuadBounds::FULL.pack()), QuadBounds::FULL);
        assert!(QuadBounds::from_quads(&[]).is_none());
    }
}

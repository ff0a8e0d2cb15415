//! Packed 64-bit section coordinates.
//!
//! ## Bit layout
//!
//! | Bits | Field |
//! |------|-------|
//! | 0..22 | X (signed, 22 bits) |
//! | 22..30 | Y (signed, 8 bits) |
//! | 30..52 | Z (signed, 22 bits) |
//! | 52..60 | unused, zero |
//! | 60..64 | LOD level (0 = full resolution) |
//!
//! A key at LOD `n` covers `2^n` sections along each axis. Its coordinates
//! are the LOD-0 coordinates shifted right by `n`.

use std::fmt;

const XZ_BITS: u32 = 22;
const Y_BITS: u32 = 8;
const XZ_MASK: u64 = (1 << XZ_BITS) - 1;
const Y_MASK: u64 = (1 << Y_BITS) - 1;
const Y_SHIFT: u32 = XZ_BITS;
const Z_SHIFT: u32 = XZ_BITS + Y_BITS;
const LOD_SHIFT: u32 = 60;

/// Deepest LOD level representable in a key.
pub const MAX_LOD: u8 = 15;

/// Position of one 16x16x16 section (or an LOD cell of them) in the world.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SectionKey(u64);

impl SectionKey {
    /// Inclusive range of valid X/Z coordinates.
    pub const XZ_RANGE: (i32, i32) = (-(1 << 21), (1 << 21) - 1);
    /// Inclusive range of valid Y coordinates.
    pub const Y_RANGE: (i32, i32) = (-128, 127);

    /// Pack a key. Out-of-range coordinates wrap into their field width.
    pub const fn new(lod: u8, x: i32, y: i32, z: i32) -> Self {
        let raw = (x as u64 & XZ_MASK)
            | ((y as u64 & Y_MASK) << Y_SHIFT)
            | ((z as u64 & XZ_MASK) << Z_SHIFT)
            | (((lod & 0xF) as u64) << LOD_SHIFT);
        Self(raw)
    }

    /// Full-resolution section key.
    pub const fn section(x: i32, y: i32, z: i32) -> Self {
        Self::new(0, x, y, z)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn lod(self) -> u8 {
        (self.0 >> LOD_SHIFT) as u8
    }

    pub const fn x(self) -> i32 {
        sign_extend((self.0 & XZ_MASK) as u32, XZ_BITS)
    }

    pub const fn y(self) -> i32 {
        sign_extend(((self.0 >> Y_SHIFT) & Y_MASK) as u32, Y_BITS)
    }

    pub const fn z(self) -> i32 {
        sign_extend(((self.0 >> Z_SHIFT) & XZ_MASK) as u32, XZ_BITS)
    }

    /// The key one LOD level coarser that contains this one.
    pub const fn parent(self) -> Option<Self> {
        let lod = self.lod();
        if lod >= MAX_LOD {
            return None;
        }
        Some(Self::new(lod + 1, self.x() >> 1, self.y() >> 1, self.z() >> 1))
    }

    /// This key's ancestor at `lod`, or `None` if `lod` is finer than this key.
    pub const fn ancestor_at(self, lod: u8) -> Option<Self> {
        let own = self.lod();
        if lod < own || lod > MAX_LOD {
            return None;
        }
        let shift = (lod - own) as u32;
        Some(Self::new(
            lod,
            self.x() >> shift,
            self.y() >> shift,
            self.z() >> shift,
        ))
    }

    /// Slot of this key among its parent's eight children.
    ///
    /// Bit 0 is the X half, bit 1 the Z half, bit 2 the Y half.
    pub const fn child_index(self) -> usize {
        ((self.x() & 1) | ((self.z() & 1) << 1) | ((self.y() & 1) << 2)) as usize
    }

    /// The eight keys one level finer, ordered by [`Self::child_index`].
    pub fn children(self) -> Option<[Self; 8]> {
        let lod = self.lod();
        if lod == 0 {
            return None;
        }
        let (x, y, z) = (self.x() << 1, self.y() << 1, self.z() << 1);
        Some(std::array::from_fn(|i| {
            let i = i as i32;
            Self::new(lod - 1, x | (i & 1), y | ((i >> 2) & 1), z | ((i >> 1) & 1))
        }))
    }

    /// Edge length of the covered region in blocks.
    pub const fn block_extent(self) -> i64 {
        16i64 << self.lod()
    }

    /// World-space block coordinate of the region's minimum corner.
    pub const fn block_origin(self) -> [i64; 3] {
        let e = self.block_extent();
        [self.x() as i64 * e, self.y() as i64 * e, self.z() as i64 * e]
    }
}

const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

impl fmt::Debug for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionKey(L{} {}, {}, {})", self.lod(), self.x(), self.y(), self.z())
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}[{}, {}, {}]", self.lod(), self.x(), self.y(), self.z())
    }
}

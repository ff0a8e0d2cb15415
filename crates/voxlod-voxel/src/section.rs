//! Fixed 16x16x16 voxel sections: the unit the engine ingests and meshes.

use crate::section_key::SectionKey;

/// Edge length of a section in voxels.
pub const SECTION_SIZE: usize = 16;
/// Voxels per section.
pub const SECTION_VOLUME: usize = SECTION_SIZE * SECTION_SIZE * SECTION_SIZE;
/// State id reserved for empty space.
pub const AIR: u32 = 0;
/// Largest encodable state id (20 bits).
pub const MAX_STATE_ID: u32 = (1 << 20) - 1;
/// Largest encodable biome id (9 bits).
pub const MAX_BIOME_ID: u16 = (1 << 9) - 1;

/// Linear voxel index: `(y << 8) | (z << 4) | x`.
#[inline]
pub const fn voxel_index(x: usize, y: usize, z: usize) -> usize {
    (y << 8) | (z << 4) | x
}

/// A fully voxelized section.
///
/// Each voxel carries a state id, a biome id, and a light byte whose high
/// nibble is sky light and low nibble block light. Sections are immutable
/// once built and are shared between pipeline stages behind an `Arc`.
#[derive(Clone, PartialEq, Eq)]
pub struct VoxelizedSection {
    key: SectionKey,
    states: Box<[u32]>,
    biomes: Box<[u16]>,
    light: Box<[u8]>,
    block_count: u16,
}

impl VoxelizedSection {
    /// An all-air section.
    pub fn empty(key: SectionKey) -> Self {
        SectionBuilder::new(key).build()
    }

    pub fn builder(key: SectionKey) -> SectionBuilder {
        SectionBuilder::new(key)
    }

    pub fn key(&self) -> SectionKey {
        self.key
    }

    /// Number of non-air voxels.
    pub fn block_count(&self) -> u16 {
        self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    #[inline]
    pub fn state(&self, x: usize, y: usize, z: usize) -> u32 {
        self.states[voxel_index(x, y, z)]
    }

    #[inline]
    pub fn biome(&self, x: usize, y: usize, z: usize) -> u16 {
        self.biomes[voxel_index(x, y, z)]
    }

    #[inline]
    pub fn light(&self, x: usize, y: usize, z: usize) -> u8 {
        self.light[voxel_index(x, y, z)]
    }

    pub fn states(&self) -> &[u32] {
        &self.states
    }

    pub fn biomes(&self) -> &[u16] {
        &self.biomes
    }

    pub fn light_values(&self) -> &[u8] {
        &self.light
    }

    /// Build the section one LOD level above `children`.
    ///
    /// `children` is indexed by [`SectionKey::child_index`]; missing children
    /// count as air. Each output voxel summarizes a 2x2x2 cell: the most
    /// frequent non-air `(state, biome)` wins (first seen on ties), and both
    /// light nibbles are averaged over the whole cell.
    pub fn downsample(parent: SectionKey, children: &[Option<&VoxelizedSection>; 8]) -> Self {
        let mut out = SectionBuilder::new(parent);
        let half = SECTION_SIZE / 2;

        for py in 0..SECTION_SIZE {
            for pz in 0..SECTION_SIZE {
                for px in 0..SECTION_SIZE {
                    let child_slot = (px / half) | ((pz / half) << 1) | ((py / half) << 2);
                    let Some(child) = children[child_slot] else {
                        continue;
                    };
                    let (bx, by, bz) = ((px % half) * 2, (py % half) * 2, (pz % half) * 2);

                    let mut votes: [(u32, u16, u8); 8] = [(AIR, 0, 0); 8];
                    let mut distinct = 0;
                    let (mut sky, mut block) = (0u32, 0u32);

                    for i in 0..8 {
                        let idx = voxel_index(bx + (i & 1), by + ((i >> 2) & 1), bz + ((i >> 1) & 1));
                        let l = child.light[idx];
                        sky += u32::from(l >> 4);
                        block += u32::from(l & 0xF);

                        let state = child.states[idx];
                        if state == AIR {
                            continue;
                        }
                        let biome = child.biomes[idx];
                        match votes[..distinct]
                            .iter_mut()
                            .find(|v| v.0 == state && v.1 == biome)
                        {
                            Some(vote) => vote.2 += 1,
                            None => {
                                votes[distinct] = (state, biome, 1);
                                distinct += 1;
                            }
                        }
                    }

                    let light = (((sky / 8) as u8) << 4) | (block / 8) as u8;
                    let winner = votes[..distinct]
                        .iter()
                        .fold(None::<(u32, u16, u8)>, |best, v| match best {
                            Some(b) if b.2 >= v.2 => Some(b),
                            _ => Some(*v),
                        });
                    match winner {
                        Some((state, biome, _)) => out.set(px, py, pz, state, biome, light),
                        None => out.set_light(px, py, pz, light),
                    }
                }
            }
        }

        out.build()
    }
}

impl std::fmt::Debug for VoxelizedSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoxelizedSection")
            .field("key", &self.key)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

/// Mutable staging area for a [`VoxelizedSection`].
pub struct SectionBuilder {
    key: SectionKey,
    states: Box<[u32]>,
    biomes: Box<[u16]>,
    light: Box<[u8]>,
}

impl SectionBuilder {
    pub fn new(key: SectionKey) -> Self {
        Self {
            key,
            states: vec![AIR; SECTION_VOLUME].into_boxed_slice(),
            biomes: vec![0; SECTION_VOLUME].into_boxed_slice(),
            light: vec![0; SECTION_VOLUME].into_boxed_slice(),
        }
    }

    /// Set one voxel. Ids are masked to their encodable width.
    pub fn set(&mut self, x: usize, y: usize, z: usize, state: u32, biome: u16, light: u8) {
        self.set_index(voxel_index(x, y, z), state, biome, light);
    }

    pub fn set_index(&mut self, index: usize, state: u32, biome: u16, light: u8) {
        self.states[index] = state & MAX_STATE_ID;
        self.biomes[index] = biome & MAX_BIOME_ID;
        self.light[index] = light;
    }

    pub fn set_light(&mut self, x: usize, y: usize, z: usize, light: u8) {
        self.light[voxel_index(x, y, z)] = light;
    }

    /// Fill the whole section with one voxel value.
    pub fn fill(&mut self, state: u32, biome: u16, light: u8) {
        self.states.fill(state & MAX_STATE_ID);
        self.biomes.fill(biome & MAX_BIOME_ID);
        self.light.fill(light);
    }

    pub fn build(self) -> VoxelizedSection {
        let block_count = self.states.iter().filter(|&&s| s != AIR).count() as u16;
        VoxelizedSection {
            key: self.key,
            states: self.states,
            biomes: self.biomes,
            light: self.light,
            block_count,
        }
    }
}

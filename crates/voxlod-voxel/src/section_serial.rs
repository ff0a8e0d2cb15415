//! Binary encoding of [`VoxelizedSection`] for the section store.
//!
//! ## Binary Layout (`LVSC`, version 1)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic bytes `"LVSC"` |
//! | 4 | 1 | Format version (`u8`) |
//! | 5 | 8 | Section key (`u64` LE, raw packed layout) |
//! | 13 | 2 | Palette length N (`u16` LE) |
//! | 15 | N×7 | Palette entries: state `u32`, biome `u16`, light `u8` (LE) |
//! | 15+N×7 | 4 | Run count R (`u32` LE) |
//! | 19+N×7 | R×4 | Palette index runs (see [`crate::rle`]) |
//!
//! A section whose voxels are all `(air, 0, 0)` is written with N = 0 and
//! R = 0, so it costs only the 19-byte header.

use crate::rle::{self, RUN_BYTES, RleError};
use crate::section::{SECTION_VOLUME, SectionBuilder, VoxelizedSection};
use crate::section_key::SectionKey;

const MAGIC: [u8; 4] = *b"LVSC";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 15;
const ENTRY_LEN: usize = 7;

/// Errors that can occur while decoding a section.
#[derive(Debug, thiserror::Error)]
pub enum SectionSerError {
    /// The data does not start with `LVSC`.
    #[error("invalid magic bytes")]
    InvalidMagic,
    /// The format version is newer than this build understands.
    #[error("unsupported section format version: {0}")]
    UnsupportedVersion(u8),
    /// The data ends before a field it declares.
    #[error("section data truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required to continue.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// A run references a palette slot that does not exist.
    #[error("palette index {index} out of range (palette has {len} entries)")]
    PaletteIndexOutOfRange {
        /// Offending index.
        index: u16,
        /// Palette size.
        len: usize,
    },
    /// The run stream is malformed.
    #[error(transparent)]
    Rle(#[from] RleError),
}

type Voxel = (u32, u16, u8);

impl VoxelizedSection {
    /// Encode this section in the `LVSC` format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut palette: Vec<Voxel> = Vec::new();
        let mut indices = vec![0u16; SECTION_VOLUME];
        let all_default = self.states().iter().all(|&s| s == 0)
            && self.biomes().iter().all(|&b| b == 0)
            && self.light_values().iter().all(|&l| l == 0);

        if !all_default {
            // Linear palette search, short-circuited on repeats of the last voxel.
            let mut last: Option<(Voxel, u16)> = None;
            for (i, slot) in indices.iter_mut().enumerate() {
                let voxel = (self.states()[i], self.biomes()[i], self.light_values()[i]);
                let index = match last {
                    Some((v, idx)) if v == voxel => idx,
                    _ => {
                        let idx = match palette.iter().position(|&p| p == voxel) {
                            Some(pos) => pos as u16,
                            None => {
                                palette.push(voxel);
                                (palette.len() - 1) as u16
                            }
                        };
                        last = Some((voxel, idx));
                        idx
                    }
                };
                *slot = index;
            }
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + palette.len() * ENTRY_LEN + 4 + 64);
        buf.extend_from_slice(&MAGIC);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&self.key().raw().to_le_bytes());
        buf.extend_from_slice(&(palette.len() as u16).to_le_bytes());
        for &(state, biome, light) in &palette {
            buf.extend_from_slice(&state.to_le_bytes());
            buf.extend_from_slice(&biome.to_le_bytes());
            buf.push(light);
        }

        let run_count_at = buf.len();
        buf.extend_from_slice(&0u32.to_le_bytes());
        if !palette.is_empty() {
            let runs = rle::encode_into(&indices, &mut buf) as u32;
            buf[run_count_at..run_count_at + 4].copy_from_slice(&runs.to_le_bytes());
        }
        buf
    }

    /// Decode a section written by [`Self::serialize`].
    pub fn deserialize(data: &[u8]) -> Result<Self, SectionSerError> {
        if data.len() < MAGIC.len() || data[..4] != MAGIC {
            return Err(SectionSerError::InvalidMagic);
        }
        need(data, HEADER_LEN)?;
        let version = data[4];
        if version != FORMAT_VERSION {
            return Err(SectionSerError::UnsupportedVersion(version));
        }

        let key = SectionKey::from_raw(read_u64(data, 5));
        let palette_len = u16::from_le_bytes([data[13], data[14]]) as usize;

        let palette_end = HEADER_LEN + palette_len * ENTRY_LEN;
        need(data, palette_end + 4)?;
        let palette: Vec<Voxel> = data[HEADER_LEN..palette_end]
            .chunks_exact(ENTRY_LEN)
            .map(|e| {
                (
                    u32::from_le_bytes([e[0], e[1], e[2], e[3]]),
                    u16::from_le_bytes([e[4], e[5]]),
                    e[6],
                )
            })
            .collect();

        let run_count = read_u32(data, palette_end) as usize;
        let runs_start = palette_end + 4;
        let runs_end = runs_start + run_count * RUN_BYTES;
        need(data, runs_end)?;

        let mut builder = SectionBuilder::new(key);
        if palette.is_empty() {
            return Ok(builder.build());
        }

        let mut indices = vec![0u16; SECTION_VOLUME];
        rle::decode_into(&data[runs_start..runs_end], &mut indices)?;
        for (i, &index) in indices.iter().enumerate() {
            let &(state, biome, light) =
                palette
                    .get(index as usize)
                    .ok_or(SectionSerError::PaletteIndexOutOfRange {
                        index,
                        len: palette.len(),
                    })?;
            builder.set_index(i, state, biome, light);
        }
        Ok(builder.build())
    }
}

fn need(data: &[u8], expected: usize) -> Result<(), SectionSerError> {
    if data.len() < expected {
        return Err(SectionSerError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terrain(key: SectionKey) -> VoxelizedSection {
        let mut b = SectionBuilder::new(key);
        for x in 0..16 {
            for z in 0..16 {
                let height = 4 + (x + z) % 5;
                for y in 0..height {
                    let state = if y + 1 == height { 2 } else { 1 };
                    b.set(x, y, z, state, (x / 8) as u16, 0x0F);
                }
                b.set_light(x, 15, z, 0xF0);
            }
        }
        b.build()
    }

    #[test]
    fn test_empty_section_is_header_only() {
        let key = SectionKey::section(-4, 2, 9);
        let bytes = VoxelizedSection::empty(key).serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        let decoded = VoxelizedSection::deserialize(&bytes).unwrap();
        assert_eq!(decoded.key(), key);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_terrain_section_roundtrips() {
        let section = terrain(SectionKey::new(2, 10, -3, -77));
        let bytes = section.serialize();
        assert!(bytes.len() < SECTION_VOLUME * 7, "expected compression, got {}", bytes.len());
        let decoded = VoxelizedSection::deserialize(&bytes).unwrap();
        assert_eq!(decoded, section);
    }

    #[test]
    fn test_light_only_section_is_preserved() {
        let mut b = SectionBuilder::new(SectionKey::default());
        b.set_light(3, 3, 3, 0xF0);
        let section = b.build();
        let decoded = VoxelizedSection::deserialize(&section.serialize()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.light(3, 3, 3), 0xF0);
    }

    #[test]
    fn test_invalid_magic() {
        assert!(matches!(
            VoxelizedSection::deserialize(b"NOPE\x01"),
            Err(SectionSerError::InvalidMagic)
        ));
        assert!(matches!(
            VoxelizedSection::deserialize(b"LV"),
            Err(SectionSerError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = VoxelizedSection::empty(SectionKey::default()).serialize();
        bytes[4] = 99;
        assert!(matches!(
            VoxelizedSection::deserialize(&bytes),
            Err(SectionSerError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_runs() {
        let bytes = terrain(SectionKey::default()).serialize();
        let cut = &bytes[..bytes.len() - 2];
        assert!(matches!(
            VoxelizedSection::deserialize(cut),
            Err(SectionSerError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_palette_index() {
        let mut b = SectionBuilder::new(SectionKey::default());
        b.fill(1, 0, 0);
        let mut bytes = b.build().serialize();
        // Single palette entry, single run: point the run at slot 5.
        let run_index_at = bytes.len() - 2;
        bytes[run_index_at] = 5;
        assert!(matches!(
            VoxelizedSection::deserialize(&bytes),
            Err(SectionSerError::PaletteIndexOutOfRange { index: 5, len: 1 })
        ));
    }
}

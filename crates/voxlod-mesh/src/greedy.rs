//! Greedy meshing: merges coplanar, identical exposed faces of a section
//! into maximal rectangles.

use voxlod_voxel::{AIR, SECTION_SIZE, VoxelizedSection};

use crate::face_direction::FaceDirection;
use crate::quad::Quad;

const N: usize = SECTION_SIZE;

/// Mask value for "no exposed face here".
const EMPTY: u64 = 0;
/// Set on every occupied mask cell so that state 0 data still reads as occupied.
const OCCUPIED: u64 = 1 << 63;

fn axes_to_xyz(axes: (usize, usize, usize), layer: usize, u: usize, v: usize) -> [usize; 3] {
    let mut coords = [0usize; 3];
    coords[axes.0] = layer;
    coords[axes.1] = u;
    coords[axes.2] = v;
    coords
}

/// Merge key of the face of `(x, y, z)` looking along `face`, or [`EMPTY`].
///
/// A face is exposed when its voxel is solid and the neighbour is air or
/// outside the section. The light byte comes from the neighbour cell the face
/// looks into when it lies inside the section.
fn face_key(section: &VoxelizedSection, [x, y, z]: [usize; 3], face: FaceDirection) -> u64 {
    let state = section.state(x, y, z);
    if state == AIR {
        return EMPTY;
    }

    let [dx, dy, dz] = face.step();
    let (nx, ny, nz) = (x as i32 + dx, y as i32 + dy, z as i32 + dz);
    let inside = [nx, ny, nz].iter().all(|&c| (0..N as i32).contains(&c));
    let light = if inside {
        let (nx, ny, nz) = (nx as usize, ny as usize, nz as usize);
        if section.state(nx, ny, nz) != AIR {
            return EMPTY;
        }
        section.light(nx, ny, nz)
    } else {
        section.light(x, y, z)
    };

    OCCUPIED
        | u64::from(state)
        | (u64::from(section.biome(x, y, z)) << 20)
        | (u64::from(light) << 29)
}

/// Produce the exposed-face quads of `section`.
///
/// Output order is deterministic for a given section but callers must not
/// depend on it. An empty section yields no quads.
pub fn greedy_mesh(section: &VoxelizedSection) -> Vec<Quad> {
    let mut quads = Vec::new();
    if section.is_empty() {
        return quads;
    }

    let mut mask = [EMPTY; N * N];

    for face in FaceDirection::ALL {
        let axes = face.sweep_axes();

        for layer in 0..N {
            let mut any = false;
            for v in 0..N {
                for u in 0..N {
                    let key = face_key(section, axes_to_xyz(axes, layer, u, v), face);
                    mask[v * N + u] = key;
                    any |= key != EMPTY;
                }
            }
            if !any {
                continue;
            }

            for v in 0..N {
                let mut u = 0;
                while u < N {
                    let key = mask[v * N + u];
                    if key == EMPTY {
                        u += 1;
                        continue;
                    }

                    let mut w = 1;
                    while u + w < N && mask[v * N + u + w] == key {
                        w += 1;
                    }

                    let mut h = 1;
                    'grow: while v + h < N {
                        let row = (v + h) * N;
                        if mask[row + u..row + u + w].iter().any(|&k| k != key) {
                            break 'grow;
                        }
                        h += 1;
                    }

                    for dv in 0..h {
                        let row = (v + dv) * N;
                        mask[row + u..row + u + w].fill(EMPTY);
                    }

                    let [x, y, z] = axes_to_xyz(axes, layer, u, v);
                    quads.push(Quad::new(
                        face,
                        x as u8,
                        y as u8,
                        z as u8,
                        w as u8,
                        h as u8,
                        (key & 0xF_FFFF) as u32,
                        ((key >> 20) & 0x1FF) as u16,
                        ((key >> 29) & 0xFF) as u8,
                    ));
                    u += w;
                }
            }
        }
    }

    quads
}

#[cfg(test)]
mod tests {
    use voxlod_voxel::{SectionBuilder, SectionKey};

    use super::*;

    const STONE: u32 = 1;
    const DIRT: u32 = 2;

    fn count(quads: &[Quad], face: FaceDirection) -> usize {
        quads.iter().filter(|q| q.face() == Some(face)).count()
    }

    fn covered_area(quads: &[Quad]) -> usize {
        quads
            .iter()
            .map(|q| q.width() as usize * q.height() as usize)
            .sum()
    }

    #[test]
    fn test_empty_section_has_no_quads() {
        let section = VoxelizedSection::empty(SectionKey::default());
        assert!(greedy_mesh(&section).is_empty());
    }

    #[test]
    fn test_full_section_gives_six_full_quads() {
        let mut b = SectionBuilder::new(SectionKey::default());
        b.fill(STONE, 3, 0x7);
        let quads = greedy_mesh(&b.build());

        assert_eq!(quads.len(), 6);
        for face in FaceDirection::ALL {
            assert_eq!(count(&quads, face), 1, "{face:?}");
        }
        for q in &quads {
            assert_eq!((q.width(), q.height()), (16, 16));
            assert_eq!(q.state(), STONE);
            assert_eq!(q.biome(), 3);
        }
        let pos_x = quads
            .iter()
            .find(|q| q.face() == Some(FaceDirection::PosX))
            .unwrap();
        assert_eq!(pos_x.x(), 15);
    }

    #[test]
    fn test_single_voxel() {
        let mut b = SectionBuilder::new(SectionKey::default());
        b.set(5, 6, 7, STONE, 0, 0);
        let quads = greedy_mesh(&b.build());
        assert_eq!(quads.len(), 6);
        for q in &quads {
            assert_eq!((q.x(), q.y(), q.z()), (5, 6, 7));
            assert_eq!((q.width(), q.height()), (1, 1));
        }
    }

    #[test]
    fn test_flat_floor_merges_to_one_top_quad() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for z in 0..N {
            for x in 0..N {
                b.set(x, 0, z, STONE, 0, 0);
            }
        }
        let quads = greedy_mesh(&b.build());
        assert_eq!(count(&quads, FaceDirection::PosY), 1);
        assert_eq!(count(&quads, FaceDirection::NegY), 1);
        assert_eq!(count(&quads, FaceDirection::PosX), 1);
    }

    #[test]
    fn test_checkerboard_does_not_merge() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for z in 0..N {
            for x in 0..N {
                let state = if (x + z) % 2 == 0 { STONE } else { DIRT };
                b.set(x, 0, z, state, 0, 0);
            }
        }
        let quads = greedy_mesh(&b.build());
        assert_eq!(count(&quads, FaceDirection::PosY), N * N);
    }

    #[test]
    fn test_light_splits_quads() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for z in 0..N {
            for x in 0..N {
                b.set(x, 0, z, STONE, 0, 0);
                // Air above the left half is lit, the right half is dark.
                b.set_light(x, 1, z, if x < 8 { 0xF0 } else { 0 });
            }
        }
        let quads = greedy_mesh(&b.build());
        let tops: Vec<_> = quads
            .iter()
            .filter(|q| q.face() == Some(FaceDirection::PosY))
            .collect();
        assert_eq!(tops.len(), 2);
        assert!(tops.iter().any(|q| q.light() == 0xF0 && q.width() == 8));
    }

    #[test]
    fn test_interior_faces_are_culled() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for y in 4..8 {
            for z in 4..8 {
                for x in 4..8 {
                    b.set(x, y, z, STONE, 0, 0);
                }
            }
        }
        let quads = greedy_mesh(&b.build());
        assert_eq!(quads.len(), 6);
        assert_eq!(covered_area(&quads), 6 * 16);
    }

    #[test]
    fn test_quad_fields_in_range() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for i in 0..SECTION_SIZE * SECTION_SIZE * SECTION_SIZE {
            if (i * 7919) % 5 < 2 {
                b.set_index(i, 1 + (i % 3) as u32, (i % 2) as u16, 0);
            }
        }
        for q in greedy_mesh(&b.build()) {
            assert!(q.face().is_some());
            assert!((1..=16).contains(&q.width()));
            assert!((1..=16).contains(&q.height()));
            let (_, max) = q.voxel_extent().unwrap();
            assert!(max.iter().all(|&m| m <= 16));
        }
    }

    #[test]
    fn test_mesh_is_deterministic() {
        let mut b = SectionBuilder::new(SectionKey::default());
        for i in (0..4096).step_by(3) {
            b.set_index(i, STONE, 0, 0);
        }
        let section = b.build();
        assert_eq!(greedy_mesh(&section), greedy_mesh(&section));
    }
}

//! Voxel-side data model: section keys, voxelized sections, their binary
//! codec, and the state/biome id mapper.

pub mod mapper;
pub mod rle;
pub mod section;
pub mod section_key;
pub mod section_serial;

pub use mapper::{Mapper, MapperError, MAPPER_FILE_NAME};
pub use section::{
    AIR, MAX_BIOME_ID, MAX_STATE_ID, SECTION_SIZE, SECTION_VOLUME, SectionBuilder,
    VoxelizedSection, voxel_index,
};
pub use section_key::{MAX_LOD, SectionKey};
pub use section_serial::SectionSerError;

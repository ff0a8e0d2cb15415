//! Quad meshing for voxelized sections: the canonical packed quad format,
//! the greedy mesher, and the background generation service.

pub mod face_direction;
pub mod generation;
pub mod greedy;
pub mod quad;

pub use face_direction::FaceDirection;
pub use generation::{GeneratedMesh, RenderGenerationService, WORKER_POLL_INTERVAL};
pub use greedy::greedy_mesh;
pub use quad::{QUAD_BYTES, Quad, QuadBounds};

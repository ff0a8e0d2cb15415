//! GPU side of the LOD engine: geometry arena, node table, HiZ pyramid and
//! the compute traversal that turns the node tree into indirect draws.

pub mod capabilities;
pub mod frustum;
pub mod geometry_arena;
pub mod hiz;
pub mod node;
pub mod node_cleaner;
pub mod node_manager;
mod pipeline;
pub mod readback;
pub mod selection;
pub mod traversal;

#[cfg(test)]
pub(crate) mod test_support;

pub use capabilities::{GpuCapabilities, required_features};
pub use frustum::{Aabb, Frustum};
pub use geometry_arena::{ArenaAllocation, BlockAllocator, GeometryArena};
pub use hiz::HiZPyramid;
pub use node::{DrawCommand, GpuNode, NO_GEOMETRY, NO_NODE, flags, request};
pub use node_cleaner::{CleanupReport, NodeCleaner, StampFreshness};
pub use node_manager::{NodeError, NodeGpuBuffers, NodeLayout, NodeManager};
pub use readback::{AsyncReadback, ReadbackError};
pub use selection::{CpuHiZ, FrameParams, Selection, select_nodes, split_camera_position};
pub use traversal::{
    DrawList, OcclusionTraverser, SceneUniform, TraversalError, TraversalFeedback, TraverserState,
};

/// WGSL that decodes arena quads, with `vs_main`/`fs_main` for a flat debug
/// pass. Bindings: 0 camera uniform, 1 node records, 2 arena quads.
pub const QUAD_SHADER: &str = include_str!("shaders/quad.wgsl");

//! Far-terrain LOD engine: ingests voxelized sections, keeps an octree of
//! nodes around the camera and feeds the GPU traversal every frame.
//!
//! ```no_run
//! use voxlod_config::Config;
//! use voxlod_engine::LodEngine;
//!
//! let mut engine = LodEngine::open(Config::default()).unwrap();
//! // attach(device, queue, adapter), then call frame() once per frame.
//! engine.shutdown().unwrap();
//! ```

pub mod distance;
pub mod engine;
pub mod error;
pub mod world;

pub use distance::{ColumnChanges, RenderDistanceTracker};
pub use engine::{DepthInput, EngineStats, FrameInput, FrameOutput, LodEngine, REQUESTS_PER_FRAME};
pub use error::EngineError;
pub use world::{DirtySender, SectionIngestor, SectionTracker, WorldStore};

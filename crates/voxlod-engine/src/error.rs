use voxlod_render::TraversalError;
use voxlod_storage::StorageError;
use voxlod_voxel::{MapperError, SectionSerError};

/// Errors surfaced by the engine's fallible entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error("stored section is unreadable: {0}")]
    Section(#[from] SectionSerError),

    #[error(transparent)]
    Traversal(#[from] TraversalError),

    #[error("failed to start mesh workers: {0}")]
    Workers(#[from] std::io::Error),

    /// The adapter lacks something the GPU path needs.
    #[error("adapter is missing: {missing}")]
    UnsupportedAdapter { missing: String },

    #[error("engine is disabled by configuration")]
    Disabled,
}

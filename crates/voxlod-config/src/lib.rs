//! Configuration for the voxlod terrain engine.
//!
//! Settings persist to disk as `config.ron`. CLI flags parsed with clap
//! override file values, and every section tolerates missing or unknown
//! fields so older files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ArenaConfig, CleanerConfig, Config, DebugConfig, EngineConfig, LodConfig, NodeConfig,
    MAX_LOD, RENDER_DISTANCE_RANGE, StorageConfig, SUBDIVISION_SIZE_RANGE, default_config_dir,
};
pub use error::ConfigError;

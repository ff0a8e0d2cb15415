//! Engine settings with defaults, validation, and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Range accepted for [`LodConfig::section_render_distance`].
pub const RENDER_DISTANCE_RANGE: (u32, u32) = (4, 1500);
/// Range accepted for [`LodConfig::subdivision_size`].
pub const SUBDIVISION_SIZE_RANGE: (f32, f32) = (16.0, 256.0);
/// Deepest LOD level a section key can encode (4 bits).
pub const MAX_LOD: u8 = 15;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Lifecycle and threading.
    pub engine: EngineConfig,
    /// Hierarchy shape and selection thresholds.
    pub lod: LodConfig,
    /// GPU geometry arena sizing.
    pub arena: ArenaConfig,
    /// Node table sizing.
    pub nodes: NodeConfig,
    /// Eviction cadence.
    pub cleaner: CleanerConfig,
    /// On-disk persistence.
    pub storage: StorageConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Lifecycle and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch. A disabled engine accepts calls but renders nothing.
    pub enabled: bool,
    /// Meshing worker count.
    pub worker_threads: usize,
    /// Directory holding `sections.lvdb` and `mapper.bin`. Empty means
    /// "use the default data directory".
    pub data_dir: PathBuf,
}

/// LOD hierarchy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LodConfig {
    /// Load radius in top-level columns around the camera.
    pub section_render_distance: u32,
    /// Projected size in pixels above which a node prefers its children.
    pub subdivision_size: f32,
    /// LOD level of the top-level nodes.
    pub top_lod: u8,
    /// Lowest section Y of a top-level column (in top-LOD units).
    pub min_section_y: i32,
    /// Highest section Y of a top-level column (in top-LOD units).
    pub max_section_y: i32,
    /// Columns added or removed per frame at most.
    pub max_column_changes_per_frame: u32,
    /// Select nodes on the CPU when the GPU traversal is unavailable.
    pub cpu_fallback: bool,
}

/// Geometry arena settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArenaConfig {
    /// Total arena size in bytes.
    pub capacity_bytes: u64,
    /// Quads per allocation block.
    pub block_quads: u32,
}

/// Node table settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Maximum live node slots.
    pub max_nodes: u32,
}

/// Node cleaner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanerConfig {
    /// Frames between cleanup scans.
    pub interval_frames: u32,
    /// Frames a node may go unrendered before eviction.
    pub retention_frames: u32,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist sections and the id mapper to `engine.data_dir`.
    pub persistence: bool,
    /// Rewrite the section log on open when it holds more dead bytes than live.
    pub compact_on_open: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter override (e.g., "debug", "info,voxlod_render=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_threads: (num_cpus::get() * 2 / 3).max(1),
            data_dir: PathBuf::new(),
        }
    }
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            section_render_distance: 16,
            subdivision_size: 64.0,
            top_lod: 4,
            min_section_y: -1,
            max_section_y: 1,
            max_column_changes_per_frame: 32,
            cpu_fallback: false,
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
            block_quads: 1024,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { max_nodes: 1 << 21 }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval_frames: 60,
            retention_frames: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistence: true,
            compact_on_open: true,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Per-user config directory for voxlod (`<config_dir>/voxlod`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("voxlod"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Validation ---

impl Config {
    /// Clamp every setting into the range the engine supports.
    ///
    /// Out-of-range values are logged and replaced rather than rejected, so a
    /// hand-edited file never prevents startup.
    pub fn validated(mut self) -> Self {
        let (lo, hi) = RENDER_DISTANCE_RANGE;
        let rd = self.lod.section_render_distance.clamp(lo, hi);
        if rd != self.lod.section_render_distance {
            log::warn!(
                "section_render_distance {} out of range, using {rd}",
                self.lod.section_render_distance
            );
            self.lod.section_render_distance = rd;
        }

        let (lo, hi) = SUBDIVISION_SIZE_RANGE;
        let size = if self.lod.subdivision_size.is_finite() {
            self.lod.subdivision_size.clamp(lo, hi)
        } else {
            LodConfig::default().subdivision_size
        };
        if size != self.lod.subdivision_size {
            log::warn!(
                "subdivision_size {} out of range, using {size}",
                self.lod.subdivision_size
            );
            self.lod.subdivision_size = size;
        }

        self.lod.top_lod = self.lod.top_lod.min(MAX_LOD);
        if self.lod.max_section_y < self.lod.min_section_y {
            std::mem::swap(&mut self.lod.min_section_y, &mut self.lod.max_section_y);
        }
        self.lod.max_column_changes_per_frame = self.lod.max_column_changes_per_frame.max(1);

        self.engine.worker_threads = self.engine.worker_threads.max(1);
        self.arena.block_quads = self.arena.block_quads.max(1);
        self.nodes.max_nodes = self.nodes.max_nodes.max(8);
        self.cleaner.interval_frames = self.cleaner.interval_frames.max(1);
        self
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config.validated())
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read `config.ron`. Returns `Some` only when the contents differ.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = std::fs::read_to_string(config_dir.join(CONFIG_FILE))
            .map_err(ConfigError::ReadError)?;
        let fresh = ron::from_str::<Config>(&contents)
            .map_err(ConfigError::ParseError)?
            .validated();

        if &fresh == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(fresh))
    }

    /// Data directory for persisted world state, falling back to the
    /// platform data dir when `engine.data_dir` is empty.
    pub fn data_dir(&self) -> PathBuf {
        if !self.engine.data_dir.as_os_str().is_empty() {
            return self.engine.data_dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("voxlod")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = Config::default();
        assert_eq!(config.lod.section_render_distance, 16);
        assert_eq!(config.lod.subdivision_size, 64.0);
        assert_eq!(config.arena.block_quads, 1024);
        assert_eq!(config.arena.capacity_bytes, 512 * 1024 * 1024);
        assert_eq!(config.nodes.max_nodes, 1 << 21);
        assert_eq!(config.cleaner.interval_frames, 60);
        assert!(config.engine.worker_threads >= 1);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(lod: (top_lod: 3))").unwrap();
        assert_eq!(config.lod.top_lod, 3);
        assert_eq!(config.lod.section_render_distance, 16);
        assert_eq!(config.cleaner, CleanerConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_validated_clamps_ranges() {
        let mut config = Config::default();
        config.lod.section_render_distance = 2;
        config.lod.subdivision_size = 1000.0;
        config.lod.top_lod = 40;
        config.cleaner.interval_frames = 0;
        config.lod.min_section_y = 5;
        config.lod.max_section_y = -5;

        let config = config.validated();
        assert_eq!(config.lod.section_render_distance, 4);
        assert_eq!(config.lod.subdivision_size, 256.0);
        assert_eq!(config.lod.top_lod, MAX_LOD);
        assert_eq!(config.cleaner.interval_frames, 1);
        assert_eq!((config.lod.min_section_y, config.lod.max_section_y), (-5, 5));
    }

    #[test]
    fn test_validated_replaces_nan() {
        let mut config = Config::default();
        config.lod.subdivision_size = f32::NAN;
        assert_eq!(config.validated().lod.subdivision_size, 64.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.lod.section_render_distance = 64;
        config.engine.data_dir = PathBuf::from("/tmp/world");

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.cleaner.retention_frames = 120;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.cleaner.retention_frames, 120);
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let mut config = Config::default();
        config.engine.data_dir = PathBuf::from("/srv/voxlod");
        assert_eq!(config.data_dir(), PathBuf::from("/srv/voxlod"));
    }
}

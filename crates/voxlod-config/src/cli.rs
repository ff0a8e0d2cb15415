//! Command-line overrides for engine settings.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, ConfigError, default_config_dir};

/// voxlod command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "voxlod", about = "Far-terrain LOD engine")]
pub struct CliArgs {
    /// Load radius in LOD-0 sections (`lod.section_render_distance`).
    #[arg(long)]
    pub render_distance: Option<u32>,

    /// Projected pixel size above which nodes subdivide.
    #[arg(long)]
    pub subdivision_size: Option<f32>,

    /// Meshing worker count.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Disable the engine entirely.
    #[arg(long)]
    pub disable: bool,

    /// Keep world state in memory only.
    #[arg(long)]
    pub no_persistence: bool,

    /// World data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Directory holding `config.ron`: `--config` when given, otherwise the
    /// per-user default.
    pub fn config_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.config {
            Some(dir) => Ok(dir.clone()),
            None => default_config_dir(),
        }
    }
}

impl Config {
    /// Load (or create) the config in [`CliArgs::config_dir`] and apply the
    /// remaining flags on top of it.
    pub fn load_with_cli(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::load_or_create(&args.config_dir()?)?;
        config.apply_cli_overrides(args);
        Ok(config)
    }

    /// Apply CLI overrides to a loaded config, then re-validate.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rd) = args.render_distance {
            self.lod.section_render_distance = rd;
        }
        if let Some(size) = args.subdivision_size {
            self.lod.subdivision_size = size;
        }
        if let Some(workers) = args.workers {
            self.engine.worker_threads = workers;
        }
        if args.disable {
            self.engine.enabled = false;
        }
        if args.no_persistence {
            self.storage.persistence = false;
        }
        if let Some(ref dir) = args.data_dir {
            self.engine.data_dir = dir.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        *self = std::mem::take(self).validated();
    }
}

//! Errors raised while reading or writing `config.ron`.

/// Failure modes of config persistence.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The platform exposes no per-user config directory.
    #[error("no config directory available on this platform")]
    NoConfigDir,

    /// Reading `config.ron` failed.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// Writing `config.ron` (or creating its directory) failed.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file is not valid RON for [`crate::Config`].
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// The config could not be turned into RON text.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),
}

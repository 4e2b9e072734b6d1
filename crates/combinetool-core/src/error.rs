//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::JobMode;

/// Result type alias for configuration lookups.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A required argument, file or setting is missing or invalid.
///
/// These are raised while rendering, before anything touches the
/// filesystem, and are fatal to the flush that hit them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown job mode: {0}")]
    UnknownJobMode(String),

    #[error("the workspace argument must be specified explicitly with -d or --datacard")]
    MissingWorkspace,

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("prefix file not found: {}", .0.display())]
    PrefixFileNotFound(PathBuf),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("{0} must be at least 1")]
    ZeroValue(&'static str),

    #[error("method {method} is not supported in {mode} mode")]
    UnsupportedMethod { mode: JobMode, method: String },

    #[error("no datacards were given")]
    NoDatacards,

    #[error("impact fits in connect mode need a stage (--doInitialFit or --doFits)")]
    MissingImpactStage,

    #[error("per-parameter impact fits need at least one parameter name")]
    NoImpactParameters,

    #[error("{first} and {second} would both be staged as {name}")]
    StagedNameClash {
        name: String,
        first: String,
        second: String,
    },

    #[error("cannot derive a mass from datacard path {0}")]
    UnresolvedMass(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

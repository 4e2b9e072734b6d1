//! Orchestrator error types.

use std::path::{Path, PathBuf};

use combinetool_core::ConfigError;
use thiserror::Error;

/// Errors that can occur while flushing the job queue.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("no sandbox matching {pattern} found in {}", dir.display())]
    SandboxNotFound { dir: PathBuf, pattern: String },

    #[error("failed to render the CRAB configuration: {0}")]
    CrabConfig(#[from] toml::ser::Error),

    #[error("interactive worker failed: {0}")]
    Worker(String),
}

impl JobError {
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> JobError {
        let path = path.as_ref().to_path_buf();
        move |source| JobError::Io { path, source }
    }
}

/// An external submission call reported failure.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("`{command}` exited with code {code}")]
    Rejected {
        command: String,
        code: i32,
        /// Diagnostic lines reported by the submission client.
        details: Vec<String>,
    },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type JobResult<T> = Result<T, JobError>;

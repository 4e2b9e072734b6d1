//! Submission configuration, loadable from a `combinetool.toml`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::method::{ImpactStage, Method};

/// Where queued jobs are sent when the queue is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobMode {
    /// Run every job locally in a bounded worker pool.
    #[default]
    #[serde(rename = "interactive")]
    Interactive,
    /// Write one script per batch, do not submit.
    #[serde(rename = "script")]
    Script,
    /// LSF (`bsub`), one submission per batch script.
    #[serde(rename = "lxbatch")]
    Lxbatch,
    /// Sun Grid Engine (`qsub`), one submission per batch script.
    #[serde(rename = "SGE")]
    Sge,
    /// Slurm job array over a single script.
    #[serde(rename = "slurm")]
    Slurm,
    /// HTCondor cluster over a single script.
    #[serde(rename = "condor")]
    Condor,
    /// CRAB3 grid task.
    #[serde(rename = "crab3")]
    Crab3,
    /// CMS Connect flavoured HTCondor with sandbox staging.
    #[serde(rename = "connect")]
    Connect,
}

impl JobMode {
    pub const ALL: [JobMode; 8] = [
        JobMode::Interactive,
        JobMode::Script,
        JobMode::Lxbatch,
        JobMode::Sge,
        JobMode::Slurm,
        JobMode::Condor,
        JobMode::Crab3,
        JobMode::Connect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Interactive => "interactive",
            JobMode::Script => "script",
            JobMode::Lxbatch => "lxbatch",
            JobMode::Sge => "SGE",
            JobMode::Slurm => "slurm",
            JobMode::Condor => "condor",
            JobMode::Crab3 => "crab3",
            JobMode::Connect => "connect",
        }
    }

    /// Whether a user-supplied prefix file replaces the standard prefix.
    pub fn honours_prefix_file(&self) -> bool {
        matches!(
            self,
            JobMode::Script | JobMode::Lxbatch | JobMode::Sge | JobMode::Slurm
        )
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownJobMode(s.to_string()))
    }
}

/// What the interactive pool does after a job exits nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Keep running every queued job.
    #[default]
    BestEffort,
    /// Skip jobs that have not started yet.
    FailFast,
}

/// Settings for the CMS Connect backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// File the datacards reference, shipped next to them.
    pub input_file: String,
    /// Sandbox archive name.
    pub sandbox: String,
    /// Stash user owning the published sandbox.
    pub sandbox_path: String,
    /// Directory holding the sandbox archive and `cmssw_setup_connect.sh`.
    /// Defaults to `<stash_root>/<sandbox_path>/public`.
    pub sandbox_area: Option<PathBuf>,
    /// Root of the per-user stash areas.
    pub stash_root: PathBuf,
    /// Build and publish a fresh sandbox before submitting.
    pub make_sandbox: bool,
    /// Request memory in MB when `memory` is unset.
    pub default_memory_mb: u32,
    pub impact_stage: Option<ImpactStage>,
    /// Nuisance parameters fitted in the per-parameter impact stage.
    pub impact_params: Vec<String>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            input_file: String::new(),
            sandbox: "sandbox-CMSSW_10_6_5-6403d6f.tar.bz2".to_string(),
            sandbox_path: "zflowers".to_string(),
            sandbox_area: None,
            stash_root: PathBuf::from("/stash/user"),
            make_sandbox: false,
            default_memory_mb: 2000,
            impact_stage: None,
            impact_params: Vec::new(),
        }
    }
}

impl ConnectConfig {
    pub fn sandbox_area(&self) -> PathBuf {
        self.sandbox_area.clone().unwrap_or_else(|| {
            self.stash_root.join(&self.sandbox_path).join("public")
        })
    }
}

/// Settings for the CRAB3 backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrabOptions {
    /// CRAB working area.
    pub area: Option<PathBuf>,
    /// TOML overlay applied to the generated CRAB configuration.
    pub custom_crab: Option<PathBuf>,
    /// Shell snippet used instead of the default job postfix.
    pub custom_crab_post: Option<PathBuf>,
    /// Extra files shipped with the task.
    pub extra_files: Vec<String>,
}

/// Everything a flush needs to know about where and how to run jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub job_mode: JobMode,
    /// Directory for per-batch and Slurm scripts, relative to `work_dir`.
    pub job_dir: Option<PathBuf>,
    /// Directory every relative path and submission command resolves against.
    pub work_dir: PathBuf,
    /// Prefix file path (`*.txt`) or the name of a bundled job prefix.
    pub prefix_file: Option<String>,
    pub task_name: String,
    /// Worker count for interactive mode.
    pub parallel: usize,
    /// Jobs per batch.
    pub merge: usize,
    pub dry_run: bool,
    /// Extra options for the submission command or submit file.
    pub sub_opts: String,
    /// Memory request in MB.
    pub memory: Option<u32>,
    /// Prepended to every combine invocation.
    pub pre_cmd: String,
    pub failure_policy: FailurePolicy,
    /// The combine method the jobs run.
    pub method: Option<Method>,
    /// Label passed to combine with `-n`.
    pub name: Option<String>,
    /// Datacards the jobs were built from.
    pub datacards: Vec<String>,
    /// Arguments passed through to combine.
    pub passthru: Vec<String>,
    pub connect: ConnectConfig,
    pub crab: CrabOptions,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            job_mode: JobMode::Interactive,
            job_dir: None,
            work_dir: PathBuf::from("."),
            prefix_file: None,
            task_name: "combine_task".to_string(),
            parallel: 1,
            merge: 1,
            dry_run: false,
            sub_opts: String::new(),
            memory: None,
            pre_cmd: String::new(),
            failure_policy: FailurePolicy::BestEffort,
            method: None,
            name: None,
            datacards: Vec::new(),
            passthru: Vec::new(),
            connect: ConnectConfig::default(),
            crab: CrabOptions::default(),
        }
    }
}

impl SubmissionConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SubmissionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject settings no backend can work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.merge == 0 {
            return Err(ConfigError::ZeroValue("merge"));
        }
        if self.parallel == 0 {
            return Err(ConfigError::ZeroValue("parallel"));
        }
        Ok(())
    }

    /// Label used in combine output names, `Test` when `-n` was not given.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("Test")
    }
}

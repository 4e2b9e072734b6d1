//! Script template engine.
//!
//! A job script is a prefix (environment bootstrap) followed by the batch's
//! command lines and an optional postfix. Array-style backends wrap each
//! batch in an `if [ <index> -eq k ]; then … fi` guard so one script can
//! serve every job of the cluster.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use combinetool_core::{ConfigError, ConfigResult, Job, PrefixEnv};

use crate::queue::Batch;

/// Default bootstrap: CMSSW runtime environment, then back to the
/// submission directory.
pub const STANDARD_PREFIX: &str = "#!/bin/sh
ulimit -s unlimited
set -e
cd %(CMSSW_BASE)s/src
export SCRAM_ARCH=%(SCRAM_ARCH)s
source /cvmfs/cms.cern.ch/cmsset_default.sh
eval `scramv1 runtime -sh`
cd %(PWD)s
";

/// Where named job prefixes live inside the CMSSW area.
const PREFIX_DIR: &str = "src/CombineHarvester/CombineTools/input/job_prefixes";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%\((\w+)\)s").expect("token pattern is valid"));

/// Replace `%(NAME)s` tokens with values from `vars` and collapse `%%` to a
/// literal `%`. Unknown tokens are left untouched. Substituted values are
/// not scanned again.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let Some(key) = caps.get(1) else {
                return "%".to_string();
            };
            vars.iter()
                .find(|(name, _)| *name == key.as_str())
                .map(|(_, value)| (*value).to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// The bootstrap block every rendered script starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPrefix(String);

impl ScriptPrefix {
    /// Prefix text used as-is.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// [`STANDARD_PREFIX`] filled in from `env`.
    pub fn standard(env: &PrefixEnv) -> ConfigResult<Self> {
        Self::from_template(STANDARD_PREFIX, env)
    }

    /// Load a prefix template from `path` and fill it in from `env`.
    pub fn from_file(path: &Path, env: &PrefixEnv) -> ConfigResult<Self> {
        if !path.is_file() {
            return Err(ConfigError::PrefixFileNotFound(path.to_path_buf()));
        }
        let template = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_template(&template, env)
    }

    /// The prefix for a flush: the user's prefix file when one is set,
    /// the standard prefix otherwise.
    ///
    /// A value ending in `.txt` is a path; anything else names
    /// `job_prefix_<name>.txt` in the CMSSW area.
    pub fn resolve(prefix_file: Option<&str>, env: &PrefixEnv) -> ConfigResult<Self> {
        match prefix_file.filter(|p| !p.is_empty()) {
            None => Self::standard(env),
            Some(file) if file.ends_with(".txt") => Self::from_file(Path::new(file), env),
            Some(name) => {
                let path = Path::new(env.cmssw_base()?)
                    .join(PREFIX_DIR)
                    .join(format!("job_prefix_{name}.txt"));
                Self::from_file(&path, env)
            }
        }
    }

    fn from_template(template: &str, env: &PrefixEnv) -> ConfigResult<Self> {
        let vars = [
            ("CMSSW_BASE", env.cmssw_base()?),
            ("SCRAM_ARCH", env.scram_arch()?),
            ("PWD", env.pwd()?),
        ];
        Ok(Self(substitute(template, &vars)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The shell variable and first value an indexed script branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGuard {
    pub variable: &'static str,
    pub first: usize,
}

impl IndexGuard {
    /// Slurm array task ids, starting at 1.
    pub const SLURM_ARRAY: IndexGuard = IndexGuard {
        variable: "${SLURM_ARRAY_TASK_ID}",
        first: 1,
    };
    /// Condor `$(ProcId)` passed as the first argument, starting at 0.
    pub const CONDOR_PROCESS: IndexGuard = IndexGuard {
        variable: "$1",
        first: 0,
    };
    /// CRAB job number passed as the first argument, starting at 1.
    pub const CRAB_JOB: IndexGuard = IndexGuard {
        variable: "$1",
        first: 1,
    };
}

/// Renders command lines under a prefix.
#[derive(Debug, Clone, Copy)]
pub struct ScriptTemplate<'a> {
    prefix: &'a ScriptPrefix,
    pre_cmd: &'a str,
}

impl<'a> ScriptTemplate<'a> {
    pub fn new(prefix: &'a ScriptPrefix, pre_cmd: &'a str) -> Self {
        Self { prefix, pre_cmd }
    }

    /// Prefix followed by one line per job.
    ///
    /// Tool jobs (and `pushd` lines) get the pre-command hook and are
    /// `eval`'d; with `log` set
    /// their output is tee'd into it (the first job truncates, the rest
    /// append). Other jobs are written verbatim.
    pub fn render(&self, jobs: &[Job], log: Option<&str>) -> String {
        let mut out = self.prefix.as_str().to_string();
        for (i, job) in jobs.iter().enumerate() {
            if job.is_tool_line() {
                let _ = write!(out, "{}eval {}", self.pre_cmd, job.line());
                if let Some(log) = log {
                    let tee = if i == 0 { "tee" } else { "tee -a" };
                    let _ = write!(out, " 2>&1 | {tee} {log}");
                }
            } else {
                out.push_str(job.line());
            }
            out.push('\n');
        }
        out
    }

    /// Prefix followed by one guarded block per batch.
    pub fn render_indexed(&self, batches: &[Batch<'_>], guard: IndexGuard) -> String {
        let body = guarded_blocks(batches, guard, |job| Ok::<_, Infallible>(self.line(job)))
            .unwrap_or_else(|never| match never {});
        format!("{}{}", self.prefix.as_str(), body)
    }

    /// A job line with the pre-command hook applied to tool jobs.
    pub fn line(&self, job: &Job) -> String {
        if job.is_tool_line() {
            format!("{}{}", self.pre_cmd, job.line())
        } else {
            job.line().to_string()
        }
    }
}

/// Mutually exclusive `if [ <var> -eq k ]; then … fi` blocks, one per batch,
/// with `k` counting up from the guard's first index.
pub fn guarded_blocks<F, E>(batches: &[Batch<'_>], guard: IndexGuard, mut line: F) -> Result<String, E>
where
    F: FnMut(&Job) -> Result<String, E>,
{
    let mut out = String::new();
    for batch in batches {
        let _ = writeln!(
            out,
            "\nif [ {} -eq {} ]; then",
            guard.variable,
            guard.first + batch.index
        );
        for job in batch.jobs {
            let _ = writeln!(out, "  {}", line(job)?);
        }
        out.push_str("fi\n");
    }
    Ok(out)
}

/// `<dir>/<stem>.log` for a script.
pub fn log_path(script: &Path) -> PathBuf {
    script.with_extension("log")
}

/// `<dir>/<stem><suffix>`, for scheduler log names with placeholders such as
/// `_%J.log`.
pub fn scheduler_log_path(script: &Path, suffix: &str) -> PathBuf {
    let stem = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    script.with_file_name(format!("{stem}{suffix}"))
}

/// `chmod +x`: keep the current mode bits, add execute for owner, group and
/// other.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

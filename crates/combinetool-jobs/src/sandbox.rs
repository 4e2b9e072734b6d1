//! Builds a CMSSW sandbox archive and publishes it in the user's stash area
//! for CMS Connect jobs.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use combinetool_core::{ConnectConfig, Job, PrefixEnv};

use crate::error::{JobError, JobResult, SubmissionError};
use crate::exec::ExecGate;

const SANDBOX_REPO: &str = "https://github.com/CMSConnect/cmssw-sandbox";
const SANDBOX_TOOL_DIR: &str = "cmssw-sandbox";

/// Where a freshly built sandbox was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSandbox {
    /// Archive file name.
    pub name: String,
    /// Stash user that owns it.
    pub owner: String,
    /// Directory jobs fetch it from.
    pub area: PathBuf,
}

pub struct SandboxMaker<'a> {
    gate: &'a ExecGate,
}

impl<'a> SandboxMaker<'a> {
    pub fn new(gate: &'a ExecGate) -> Self {
        Self { gate }
    }

    /// Create a sandbox from `CMSSW_BASE` and move it into
    /// `<stash_root>/<user>/public`.
    ///
    /// In dry-run mode the commands are only printed and the configured
    /// sandbox name is returned.
    pub fn make(&self, connect: &ConnectConfig, env: &PrefixEnv) -> JobResult<PublishedSandbox> {
        let base = env.cmssw_base()?;
        let version = env.cmssw_version()?;
        let owner = env.user()?.to_string();
        let stash = connect.stash_root.join(&owner);
        let public = stash.join("public");
        info!(cmssw = %version, base = %base, stash = %stash.display(), "making sandbox");

        if !stash.join(SANDBOX_TOOL_DIR).is_dir() {
            self.run(format!(
                "git clone {SANDBOX_REPO} {}",
                stash.join(SANDBOX_TOOL_DIR).display()
            ))?;
        }
        self.run(format!(
            "cd {} && {SANDBOX_TOOL_DIR}/cmssw-sandbox create -a {base}",
            stash.display()
        ))?;
        if !public.is_dir() {
            self.run(format!("mkdir {}", public.display()))?;
            self.run(format!("chmod 775 {}", public.display()))?;
        }

        let name = if self.gate.is_dry_run() {
            connect.sandbox.clone()
        } else {
            find_sandbox(&stash, version)?
        };
        info!(sandbox = %name, "publishing sandbox");
        self.run(format!("mv {} {}/", stash.join(&name).display(), public.display()))?;
        self.run(format!("chmod 644 {}", public.join(&name).display()))?;

        Ok(PublishedSandbox {
            name,
            owner,
            area: public,
        })
    }

    /// Run one step. A nonzero exit stops the build so a stale archive
    /// left in the stash is never published.
    fn run(&self, command: String) -> JobResult<()> {
        let job = Job::shell(command);
        let outcome = self
            .gate
            .execute(&job)
            .map_err(|source| SubmissionError::Spawn {
                command: job.line().to_string(),
                source,
            })?;
        match outcome.exit_code() {
            Some(code) if code != 0 => {
                warn!(command = %job, exit_code = code, "sandbox step failed");
                Err(SubmissionError::Rejected {
                    command: job.line().to_string(),
                    code,
                    details: Vec::new(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}

/// The first `sandbox*<version>*` entry in `dir`, by name.
fn find_sandbox(dir: &Path, version: &str) -> JobResult<String> {
    let entries = std::fs::read_dir(dir).map_err(JobError::io(dir))?;
    let mut found: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("sandbox") && name.contains(version))
        .collect();
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| JobError::SandboxNotFound {
            dir: dir.to_path_buf(),
            pattern: format!("sandbox*{version}*"),
        })
}

//! Execution gate: the single place where commands run and files land.
//!
//! Every effect a flush has (running a job, calling a submission CLI,
//! writing a script, creating a directory) goes through [`ExecGate`]. In
//! dry-run mode the gate prints what it would have done and touches
//! nothing.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use combinetool_core::Job;

use crate::error::{JobError, JobResult};
use crate::template::make_executable;

/// Output of a command whose streams were captured.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs shell command lines. The seam tests use to observe submissions.
pub trait CommandRunner: Send + Sync {
    /// Run `command` with inherited stdio and return its exit code.
    fn run(&self, command: &str, cwd: &Path) -> io::Result<i32>;

    /// Run `command` with captured stdout/stderr.
    fn capture(&self, command: &str, cwd: &Path) -> io::Result<CapturedOutput>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path) -> io::Result<i32> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn capture(&self, command: &str, cwd: &Path) -> io::Result<CapturedOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .output()?;
        Ok(CapturedOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// What happened to one gated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ExecOutcome {
    Executed { command: String, exit_code: i32 },
    Previewed { command: String },
}

impl ExecOutcome {
    pub fn command(&self) -> &str {
        match self {
            ExecOutcome::Executed { command, .. } | ExecOutcome::Previewed { command } => command,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecOutcome::Executed { exit_code, .. } => Some(*exit_code),
            ExecOutcome::Previewed { .. } => None,
        }
    }
}

/// A file a backend wants written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedFile {
    /// Path relative to the work directory (or absolute).
    pub path: PathBuf,
    pub contents: String,
    /// Whether the execute bits are added after writing.
    pub executable: bool,
}

impl RenderedFile {
    pub fn script(path: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents,
            executable: true,
        }
    }

    pub fn plain(path: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents,
            executable: false,
        }
    }
}

/// Dry-run aware gate in front of every effect.
pub struct ExecGate {
    dry_run: bool,
    pre_cmd: String,
    work_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ExecGate {
    pub fn new(
        dry_run: bool,
        pre_cmd: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            dry_run,
            pre_cmd: pre_cmd.into(),
            work_dir: work_dir.into(),
            runner,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Resolve `path` against the work directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    /// The exact line that runs for `job`: tool invocations get the
    /// pre-command hook, everything else is left alone.
    pub fn command_line(&self, job: &Job) -> String {
        if job.is_tool() {
            format!("{}{}", self.pre_cmd, job.line())
        } else {
            job.line().to_string()
        }
    }

    /// Run `job`, or print it in dry-run mode.
    pub fn execute(&self, job: &Job) -> io::Result<ExecOutcome> {
        let command = self.command_line(job);
        if self.dry_run {
            println!("[DRY-RUN]: {command}");
            return Ok(ExecOutcome::Previewed { command });
        }
        println!(">> {command}");
        let exit_code = self.runner.run(&command, &self.work_dir)?;
        debug!(%command, exit_code, "command finished");
        Ok(ExecOutcome::Executed { command, exit_code })
    }

    /// Run `job` capturing its output. `None` in dry-run mode.
    pub fn capture(&self, job: &Job) -> io::Result<Option<CapturedOutput>> {
        let command = self.command_line(job);
        if self.dry_run {
            println!("[DRY-RUN]: {command}");
            return Ok(None);
        }
        println!(">> {command}");
        self.runner.capture(&command, &self.work_dir).map(Some)
    }

    /// Write a rendered file, creating parent directories and adding execute
    /// bits for scripts.
    pub fn write(&self, file: &RenderedFile) -> JobResult<()> {
        let path = self.resolve(&file.path);
        if self.dry_run {
            println!("[DRY-RUN]: write {}", path.display());
            debug!(path = %path.display(), contents = %file.contents, "rendered file");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(JobError::io(parent))?;
                info!(dir = %parent.display(), "created directory");
            }
        }
        std::fs::write(&path, &file.contents).map_err(JobError::io(&path))?;
        if file.executable {
            make_executable(&path).map_err(JobError::io(&path))?;
            println!("Created job script: {}", file.path.display());
        }
        Ok(())
    }
}

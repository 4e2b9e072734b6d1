//! Scheduler backends.
//!
//! Each backend turns the partitioned queue into a [`DispatchPlan`]: the
//! commands to run before anything is written, the files to write, and how
//! the work is handed to the scheduler. Planning is pure; the orchestrator
//! applies the plan through the execution gate, so configuration errors
//! surface before the filesystem is touched.

use std::collections::BTreeSet;

use combinetool_core::{Job, JobMode, PrefixEnv, SubmissionConfig};

use crate::error::JobResult;
use crate::exec::RenderedFile;
use crate::queue::Batch;
use crate::template::ScriptPrefix;

pub mod batch;
pub mod condor;
pub mod connect;
pub mod crab;
pub mod interactive;
pub mod slurm;

pub use batch::{BatchScripts, QueueSystem};
pub use condor::Condor;
pub use connect::Connect;
pub use crab::{Crab3, CrabConfig};
pub use interactive::Interactive;
pub use slurm::Slurm;

/// Inputs shared by every backend for one flush.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub config: &'a SubmissionConfig,
    pub env: &'a PrefixEnv,
    /// Resolved prefix for backends that use the standard bootstrap.
    pub prefix: Option<&'a ScriptPrefix>,
}

impl DispatchContext<'_> {
    /// The resolved prefix, or the standard one if none was resolved.
    pub fn prefix(&self) -> JobResult<ScriptPrefix> {
        match self.prefix {
            Some(prefix) => Ok(prefix.clone()),
            None => Ok(ScriptPrefix::standard(self.env)?),
        }
    }
}

/// How the rendered work reaches the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Nothing to submit; the scripts are the product.
    None,
    /// Run the jobs here in the interactive worker pool.
    Local(Vec<Job>),
    /// Submission command lines, run in order.
    Commands(Vec<Job>),
    /// Hand a configuration to the CRAB client.
    Crab(Box<CrabConfig>),
}

/// Everything a backend wants done for one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    /// Commands that must run before the files are written.
    pub setup: Vec<Job>,
    pub files: Vec<RenderedFile>,
    pub submission: Submission,
    /// Files that travel with the task (grid backends).
    pub staged: BTreeSet<String>,
}

impl DispatchPlan {
    pub fn new(files: Vec<RenderedFile>, submission: Submission) -> Self {
        Self {
            setup: Vec::new(),
            files,
            submission,
            staged: BTreeSet::new(),
        }
    }
}

/// Render the batches of one flush and describe their submission.
pub trait Backend {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan>;
}

/// The closed set of backends, one per job mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerBackend {
    Interactive(Interactive),
    Script(BatchScripts),
    Lxbatch(BatchScripts),
    Sge(BatchScripts),
    Slurm(Slurm),
    Condor(Condor),
    Connect(Connect),
    Crab3(Crab3),
}

impl SchedulerBackend {
    pub fn for_mode(mode: JobMode) -> Self {
        match mode {
            JobMode::Interactive => SchedulerBackend::Interactive(Interactive),
            JobMode::Script => SchedulerBackend::Script(BatchScripts::new(None)),
            JobMode::Lxbatch => SchedulerBackend::Lxbatch(BatchScripts::new(Some(QueueSystem::Lsf))),
            JobMode::Sge => SchedulerBackend::Sge(BatchScripts::new(Some(QueueSystem::Sge))),
            JobMode::Slurm => SchedulerBackend::Slurm(Slurm),
            JobMode::Condor => SchedulerBackend::Condor(Condor),
            JobMode::Connect => SchedulerBackend::Connect(Connect),
            JobMode::Crab3 => SchedulerBackend::Crab3(Crab3),
        }
    }
}

impl Backend for SchedulerBackend {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        match self {
            SchedulerBackend::Interactive(b) => b.render(ctx, batches),
            SchedulerBackend::Script(b) | SchedulerBackend::Lxbatch(b) | SchedulerBackend::Sge(b) => {
                b.render(ctx, batches)
            }
            SchedulerBackend::Slurm(b) => b.render(ctx, batches),
            SchedulerBackend::Condor(b) => b.render(ctx, batches),
            SchedulerBackend::Connect(b) => b.render(ctx, batches),
            SchedulerBackend::Crab3(b) => b.render(ctx, batches),
        }
    }
}

/// Decode backslash escapes in user-supplied submit-file options.
pub(crate) fn unescape_options(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// `cmd [opts] args…` without doubled spaces when `opts` is empty.
pub(crate) fn command_with_opts(head: &str, opts: &str, tail: &str) -> String {
    if opts.trim().is_empty() {
        format!("{head} {tail}")
    } else {
        format!("{head} {} {tail}", opts.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_mode_covers_every_mode() {
        for mode in JobMode::ALL {
            let backend = SchedulerBackend::for_mode(mode);
            let expected = match backend {
                SchedulerBackend::Interactive(_) => JobMode::Interactive,
                SchedulerBackend::Script(_) => JobMode::Script,
                SchedulerBackend::Lxbatch(_) => JobMode::Lxbatch,
                SchedulerBackend::Sge(_) => JobMode::Sge,
                SchedulerBackend::Slurm(_) => JobMode::Slurm,
                SchedulerBackend::Condor(_) => JobMode::Condor,
                SchedulerBackend::Connect(_) => JobMode::Connect,
                SchedulerBackend::Crab3(_) => JobMode::Crab3,
            };
            assert_eq!(expected, mode);
        }
    }

    #[test]
    fn unescape_handles_common_escapes() {
        assert_eq!(
            unescape_options(r#"+JobFlavour = \"workday\"\nrequest_cpus = 2"#),
            "+JobFlavour = \"workday\"\nrequest_cpus = 2"
        );
        assert_eq!(unescape_options(r"a\qb\"), "a\\qb\\");
    }

    #[test]
    fn command_with_empty_opts() {
        assert_eq!(command_with_opts("bsub -o a.log", "", "/x/job.sh"), "bsub -o a.log /x/job.sh");
        assert_eq!(
            command_with_opts("bsub -o a.log", " -q 1nh ", "/x/job.sh"),
            "bsub -o a.log -q 1nh /x/job.sh"
        );
    }
}

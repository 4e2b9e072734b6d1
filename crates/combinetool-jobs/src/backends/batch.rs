//! One script per batch: plain scripts, LSF and SGE.

use std::path::{Path, PathBuf};

use combinetool_core::Job;

use super::{Backend, DispatchContext, DispatchPlan, Submission, command_with_opts};
use crate::error::{JobError, JobResult};
use crate::exec::RenderedFile;
use crate::queue::Batch;
use crate::template::{ScriptTemplate, log_path, scheduler_log_path};

/// Queueing system that receives each batch script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSystem {
    /// LSF, `bsub`.
    Lsf,
    /// Sun Grid Engine, `qsub`.
    Sge,
}

impl QueueSystem {
    pub fn submit_command(&self) -> &'static str {
        match self {
            QueueSystem::Lsf => "bsub",
            QueueSystem::Sge => "qsub",
        }
    }
}

/// Writes `job_<task>_<i>.sh` per batch and, with a queue system, submits
/// each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScripts {
    queue: Option<QueueSystem>,
}

impl BatchScripts {
    pub fn new(queue: Option<QueueSystem>) -> Self {
        Self { queue }
    }
}

/// Path of a script inside the configured job directory.
pub(crate) fn job_dir_path(job_dir: Option<&Path>, file_name: String) -> PathBuf {
    match job_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

/// Absolute form of `path` under `work_dir`, without touching the disk.
pub(crate) fn absolute(work_dir: &Path, path: &Path) -> JobResult<PathBuf> {
    let joined = work_dir.join(path);
    std::path::absolute(&joined).map_err(JobError::io(&joined))
}

impl Backend for BatchScripts {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let config = ctx.config;
        let prefix = ctx.prefix()?;
        let template = ScriptTemplate::new(&prefix, &config.pre_cmd);
        // Only plain scripts log; schedulers capture output themselves.
        let log = self.queue.is_none();

        let mut files = Vec::with_capacity(batches.len());
        let mut submissions = Vec::new();
        for batch in batches {
            let path = job_dir_path(
                config.job_dir.as_deref(),
                format!("job_{}_{}.sh", config.task_name, batch.index),
            );
            let log_name = log.then(|| log_path(&path).display().to_string());
            files.push(RenderedFile::script(
                &path,
                template.render(batch.jobs, log_name.as_deref()),
            ));

            if let Some(queue) = self.queue {
                let full_script = absolute(&config.work_dir, &path)?;
                let logname = scheduler_log_path(&full_script, "_%J.log");
                submissions.push(Job::shell(command_with_opts(
                    &format!("{} -o {}", queue.submit_command(), logname.display()),
                    &config.sub_opts,
                    &full_script.display().to_string(),
                )));
            }
        }

        let submission = if self.queue.is_some() {
            Submission::Commands(submissions)
        } else {
            Submission::None
        };
        Ok(DispatchPlan::new(files, submission))
    }
}

//! Interactive mode: run jobs here, in a bounded worker pool.
//!
//! The pool holds `parallel` permits; each job takes one and runs to
//! completion on a blocking thread. Outcomes come back in queue order even
//! though jobs may finish in any order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use combinetool_core::{FailurePolicy, Job};

use super::{Backend, DispatchContext, DispatchPlan, Submission};
use crate::error::{JobError, JobResult};
use crate::exec::{ExecGate, ExecOutcome};
use crate::queue::Batch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interactive;

impl Backend for Interactive {
    fn render(&self, _ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let jobs = batches.iter().flat_map(|b| b.jobs.iter().cloned()).collect();
        Ok(DispatchPlan::new(Vec::new(), Submission::Local(jobs)))
    }
}

/// Result of one interactively run job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum JobOutcome {
    /// The job ran; a nonzero exit code is reported, not raised.
    Finished { command: String, exit_code: i32 },
    /// Dry run: the command was only printed.
    Previewed { command: String },
    /// The process could not be started.
    Failed { command: String, error: String },
    /// Not started because an earlier job failed under fail-fast.
    Skipped { command: String },
}

impl JobOutcome {
    pub fn is_failure(&self) -> bool {
        match self {
            JobOutcome::Finished { exit_code, .. } => *exit_code != 0,
            JobOutcome::Failed { .. } => true,
            JobOutcome::Previewed { .. } | JobOutcome::Skipped { .. } => false,
        }
    }
}

/// Run `jobs` with at most `parallel` running at once.
pub async fn run_pool(
    gate: Arc<ExecGate>,
    jobs: Vec<Job>,
    parallel: usize,
    policy: FailurePolicy,
) -> JobResult<Vec<JobOutcome>> {
    let permits = Arc::new(Semaphore::new(parallel.max(1)));
    let halted = Arc::new(AtomicBool::new(false));
    let total = jobs.len();
    let mut handles = Vec::with_capacity(total);

    info!(jobs = total, parallel, "running jobs interactively");

    for job in jobs {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| JobError::Worker(e.to_string()))?;
        let gate = gate.clone();
        let halted = halted.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let command = gate.command_line(&job);
            if halted.load(Ordering::Acquire) {
                debug!(%command, "skipping job after earlier failure");
                return JobOutcome::Skipped { command };
            }
            let outcome = match gate.execute(&job) {
                Ok(ExecOutcome::Executed { command, exit_code }) => {
                    JobOutcome::Finished { command, exit_code }
                }
                Ok(ExecOutcome::Previewed { command }) => JobOutcome::Previewed { command },
                Err(e) => JobOutcome::Failed {
                    command,
                    error: e.to_string(),
                },
            };
            if outcome.is_failure() && policy == FailurePolicy::FailFast {
                halted.store(true, Ordering::Release);
            }
            outcome
        }));
    }

    let mut outcomes = Vec::with_capacity(total);
    for handle in handles {
        outcomes.push(handle.await.map_err(|e| JobError::Worker(e.to_string()))?);
    }

    let failed = outcomes.iter().filter(|o| o.is_failure()).count();
    if failed > 0 {
        warn!(failed, total, "some interactive jobs failed");
    }
    Ok(outcomes)
}

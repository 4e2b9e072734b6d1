//! Job orchestrator: owns the queue and flushes it through a backend.
//!
//! A flush always empties the queue, then:
//! 1. checks the configuration and renders a plan for the selected backend
//!    (no effects yet, so configuration errors leave the filesystem alone)
//! 2. runs the plan's setup commands and writes its files through the gate
//! 3. submits, or runs the jobs here in interactive mode
//!
//! Everything that happened is returned as a [`FlushReport`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use combinetool_core::{Job, JobMode, PrefixEnv, SubmissionConfig};

use crate::backends::crab::{CrabCli, CrabClient, CrabConfig, crab_file_names};
use crate::backends::interactive::{JobOutcome, run_pool};
use crate::backends::{Backend, DispatchContext, DispatchPlan, SchedulerBackend, Submission};
use crate::error::{JobError, JobResult, SubmissionError};
use crate::exec::{CommandRunner, ExecGate, ExecOutcome, RenderedFile, ShellRunner};
use crate::queue::{JobQueue, partition};
use crate::sandbox::SandboxMaker;
use crate::template::ScriptPrefix;

/// What one flush did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub mode: JobMode,
    pub dry_run: bool,
    /// Jobs taken from the queue.
    pub jobs: usize,
    pub setup: Vec<ExecOutcome>,
    /// Files written, or previewed in dry-run mode.
    pub files: Vec<RenderedFile>,
    pub submissions: Vec<ExecOutcome>,
    /// Interactive job results, in queue order.
    pub outcomes: Vec<JobOutcome>,
    pub staged_files: Vec<String>,
    /// Sandbox archive built for this flush.
    pub sandbox: Option<String>,
    /// Soft failures that did not abort the flush.
    pub warnings: Vec<String>,
}

impl FlushReport {
    fn new(mode: JobMode, dry_run: bool) -> Self {
        Self {
            mode,
            dry_run,
            ..Self::default()
        }
    }

    /// Whether any job or submission command failed. Soft failures only
    /// show up in `warnings`.
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(JobOutcome::is_failure)
            || self
                .submissions
                .iter()
                .any(|s| s.exit_code().is_some_and(|code| code != 0))
    }
}

/// Collects jobs and hands them to the configured backend.
pub struct JobOrchestrator {
    config: SubmissionConfig,
    env: PrefixEnv,
    queue: JobQueue,
    gate: Arc<ExecGate>,
    crab: Arc<dyn CrabClient>,
}

impl JobOrchestrator {
    /// An orchestrator that runs commands through `sh`.
    pub fn new(config: SubmissionConfig, env: PrefixEnv) -> Self {
        Self::with_runner(config, env, Arc::new(ShellRunner))
    }

    pub fn with_runner(
        config: SubmissionConfig,
        env: PrefixEnv,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let gate = Arc::new(ExecGate::new(
            config.dry_run,
            config.pre_cmd.clone(),
            config.work_dir.clone(),
            runner,
        ));
        Self {
            config,
            env,
            queue: JobQueue::new(),
            gate,
            crab: Arc::new(CrabCli),
        }
    }

    /// Replace the client CRAB tasks are submitted with.
    pub fn with_crab_client(mut self, client: Arc<dyn CrabClient>) -> Self {
        self.crab = client;
        self
    }

    pub fn config(&self) -> &SubmissionConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn enqueue(&mut self, job: Job) {
        self.queue.push(job);
    }

    pub fn enqueue_all(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.queue.extend(jobs);
    }

    /// Dispatch every queued job. The queue is empty afterwards, whether
    /// or not the flush succeeds.
    pub async fn flush(&mut self) -> JobResult<FlushReport> {
        let jobs = self.queue.drain();
        let mode = self.config.job_mode;
        let mut report = FlushReport::new(mode, self.gate.is_dry_run());
        report.jobs = jobs.len();
        if jobs.is_empty() {
            debug!(%mode, "job queue is empty, nothing to flush");
            return Ok(report);
        }
        self.config.validate()?;

        let batches = partition(&jobs, self.config.merge);
        info!(%mode, jobs = jobs.len(), batches = batches.len(), "flushing job queue");

        let prefix = if mode.honours_prefix_file() {
            Some(ScriptPrefix::resolve(
                self.config.prefix_file.as_deref(),
                &self.env,
            )?)
        } else {
            None
        };
        let backend = SchedulerBackend::for_mode(mode);
        let ctx = DispatchContext {
            config: &self.config,
            env: &self.env,
            prefix: prefix.as_ref(),
        };
        let mut plan = backend.render(&ctx, &batches)?;

        if mode == JobMode::Connect && self.config.connect.make_sandbox {
            let published = SandboxMaker::new(&self.gate).make(&self.config.connect, &self.env)?;
            let mut config = self.config.clone();
            config.connect.sandbox = published.name.clone();
            config.connect.sandbox_path = published.owner;
            config.connect.sandbox_area = Some(published.area);
            let ctx = DispatchContext {
                config: &config,
                ..ctx
            };
            plan = backend.render(&ctx, &batches)?;
            report.sandbox = Some(published.name);
        }

        self.apply(plan, &mut report).await?;
        Ok(report)
    }

    async fn apply(&self, plan: DispatchPlan, report: &mut FlushReport) -> JobResult<()> {
        let DispatchPlan {
            setup,
            files,
            submission,
            staged,
        } = plan;

        for job in &setup {
            let outcome = self.gate.execute(job).map_err(self.spawn_error(job))?;
            if let Some(code) = outcome.exit_code().filter(|code| *code != 0) {
                return Err(SubmissionError::Rejected {
                    command: outcome.command().to_string(),
                    code,
                    details: Vec::new(),
                }
                .into());
            }
            report.setup.push(outcome);
        }

        for file in &files {
            self.gate.write(file)?;
        }
        report.files = files;
        report.staged_files = staged.into_iter().collect();

        match submission {
            Submission::None => {}
            Submission::Commands(commands) => {
                for job in &commands {
                    let outcome = self.gate.execute(job).map_err(self.spawn_error(job))?;
                    if let Some(code) = outcome.exit_code().filter(|code| *code != 0) {
                        warn!(command = %outcome.command(), exit_code = code, "submission failed");
                    }
                    report.submissions.push(outcome);
                }
            }
            Submission::Local(jobs) => {
                report.outcomes = run_pool(
                    self.gate.clone(),
                    jobs,
                    self.config.parallel,
                    self.config.failure_policy,
                )
                .await?;
            }
            Submission::Crab(crab) => self.submit_crab(&crab, report)?,
        }
        Ok(())
    }

    /// Submit a CRAB task. Rejections are logged and recorded in the report
    /// so one failed task does not stop the caller's next one.
    fn submit_crab(&self, crab: &CrabConfig, report: &mut FlushReport) -> JobResult<()> {
        let (_, cfg_name) = crab_file_names(&self.config.task_name);
        let cfg_file = PathBuf::from(cfg_name);
        if self.gate.is_dry_run() {
            println!("{}", crab.to_python()?);
            return Ok(());
        }
        info!(request = %crab.general.request_name, units = crab.data.total_units, "submitting crab task");

        match self.crab.submit(&self.gate, &cfg_file, crab) {
            Ok(()) => {}
            Err(err) => {
                warn!(error = %err, request = %crab.general.request_name, "crab submission failed");
                report.warnings.push(err.to_string());
                if let SubmissionError::Rejected { details, .. } = &err {
                    for line in details {
                        warn!(detail = %line, "crab");
                        report.warnings.push(line.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_error(&self, job: &Job) -> impl FnOnce(std::io::Error) -> JobError {
        let command = self.gate.command_line(job);
        move |source| SubmissionError::Spawn { command, source }.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CapturedOutput;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, command: &str, _cwd: &Path) -> std::io::Result<i32> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(if command.contains("fail") { 1 } else { 0 })
        }

        fn capture(&self, command: &str, cwd: &Path) -> std::io::Result<CapturedOutput> {
            self.run(command, cwd).map(|exit_code| CapturedOutput {
                exit_code,
                ..CapturedOutput::default()
            })
        }
    }

    #[tokio::test]
    async fn empty_queue_does_nothing() {
        let recorder = Arc::new(Recorder::default());
        let config = SubmissionConfig {
            job_mode: JobMode::Condor,
            ..SubmissionConfig::default()
        };
        let mut orchestrator =
            JobOrchestrator::with_runner(config, PrefixEnv::default(), recorder.clone());

        let report = orchestrator.flush().await.unwrap();
        assert_eq!(report.jobs, 0);
        assert!(report.files.is_empty());
        assert!(recorder.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_still_clears_queue() {
        let config = SubmissionConfig {
            merge: 0,
            ..SubmissionConfig::default()
        };
        let mut orchestrator = JobOrchestrator::with_runner(
            config,
            PrefixEnv::default(),
            Arc::new(Recorder::default()),
        );
        orchestrator.enqueue(Job::combine(["-M", "X"]));

        let result = orchestrator.flush().await;
        assert!(matches!(result, Err(JobError::Config(_))));
        assert!(orchestrator.queue().is_empty());
    }

    #[tokio::test]
    async fn interactive_runs_jobs_in_pool() {
        let recorder = Arc::new(Recorder::default());
        let config = SubmissionConfig {
            parallel: 2,
            ..SubmissionConfig::default()
        };
        let mut orchestrator =
            JobOrchestrator::with_runner(config, PrefixEnv::default(), recorder.clone());
        orchestrator.enqueue_all([Job::combine(["-n", "a"]), Job::combine(["-n", "fail"])]);

        let report = orchestrator.flush().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].is_failure());
        assert!(report.outcomes[1].is_failure());
        assert!(report.has_failures());
        assert_eq!(recorder.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_setup_command_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = SubmissionConfig {
            job_mode: JobMode::Connect,
            work_dir: dir.path().to_path_buf(),
            method: Some(combinetool_core::Method::AsymptoticLimits),
            datacards: vec!["fail/120/card.txt".to_string(), "b/130/card.txt".to_string()],
            ..SubmissionConfig::default()
        };
        let env = PrefixEnv {
            cmssw_version: Some("CMSSW_10_6_5".to_string()),
            scram_arch: Some("slc7_amd64_gcc700".to_string()),
            ..PrefixEnv::default()
        };
        let mut orchestrator = JobOrchestrator::with_runner(config, env, recorder.clone());
        orchestrator.enqueue(Job::combine(["-M", "AsymptoticLimits", "-d", "b/130/card.txt"]));

        let result = orchestrator.flush().await;
        assert!(matches!(
            result,
            Err(JobError::Submission(SubmissionError::Rejected { code: 1, .. }))
        ));
        assert!(!dir.path().join("condor_combine_task.sh").exists());
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use tracing::info;

use combinetool_core::{
    FailurePolicy, ImpactStage, Job, JobMode, Method, PrefixEnv, SubmissionConfig,
};
use combinetool_jobs::{FlushReport, JobOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Options shared by every job mode.
#[derive(Debug, Default, Args)]
pub struct JobArgs {
    /// Task execution mode: interactive, script, lxbatch, SGE, slurm,
    /// condor, crab3 or connect
    #[arg(long)]
    pub job_mode: Option<JobMode>,
    /// Directory for job scripts and logs
    #[arg(long)]
    pub job_dir: Option<PathBuf>,
    /// Directory commands run in and relative paths resolve against
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    /// Job prefix file (*.txt) or the name of a bundled prefix
    #[arg(long)]
    pub prefix_file: Option<String>,
    /// Input file the datacards reference (connect)
    #[arg(long)]
    pub input_file: Option<String>,
    /// Sandbox archive name (connect)
    #[arg(long)]
    pub sandbox: Option<String>,
    /// Stash user owning the sandbox (connect)
    #[arg(long)]
    pub sandbox_path: Option<String>,
    /// Build and publish a sandbox before submitting (connect)
    #[arg(long)]
    pub make_sandbox: bool,
    /// Task name, used for job script and log file names
    #[arg(long)]
    pub task_name: Option<String>,
    /// Jobs to run at once [interactive]
    #[arg(long)]
    pub parallel: Option<usize>,
    /// Jobs per script
    #[arg(long)]
    pub merge: Option<usize>,
    /// Print commands and scripts without running or writing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Options for batch or CRAB submission
    #[arg(long, allow_hyphen_values = true)]
    pub sub_opts: Option<String>,
    /// Memory request [MB]
    #[arg(long)]
    pub memory: Option<u32>,
    /// CRAB working area
    #[arg(long)]
    pub crab_area: Option<PathBuf>,
    /// TOML file whose tables override the generated CRAB configuration
    #[arg(long)]
    pub custom_crab: Option<PathBuf>,
    /// Extra files shipped with a CRAB task
    #[arg(long, num_args = 1..)]
    pub crab_extra_files: Vec<String>,
    /// Prepended to every combine call
    #[arg(long, allow_hyphen_values = true)]
    pub pre_cmd: Option<String>,
    /// File with command lines that replace the default CRAB job postfix
    #[arg(long)]
    pub custom_crab_post: Option<PathBuf>,
    /// Skip remaining interactive jobs after the first failure
    #[arg(long)]
    pub fail_fast: bool,
    /// Impacts: run the initial fit (connect)
    #[arg(long = "doInitialFit", conflicts_with = "do_fits")]
    pub do_initial_fit: bool,
    /// Impacts: run the per-parameter fits (connect)
    #[arg(long = "doFits")]
    pub do_fits: bool,
    /// Impacts: parameters fitted by --doFits, comma separated
    #[arg(long = "named", value_delimiter = ',')]
    pub impact_params: Vec<String>,
}

impl JobArgs {
    /// Override `config` with every flag that was given.
    pub fn apply(self, config: &mut SubmissionConfig) {
        if let Some(mode) = self.job_mode {
            config.job_mode = mode;
        }
        if let Some(dir) = self.job_dir {
            config.job_dir = Some(dir);
        }
        if let Some(dir) = self.work_dir {
            config.work_dir = dir;
        }
        if let Some(prefix) = self.prefix_file {
            config.prefix_file = Some(prefix);
        }
        if let Some(task) = self.task_name {
            config.task_name = task;
        }
        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(merge) = self.merge {
            config.merge = merge;
        }
        if let Some(opts) = self.sub_opts {
            config.sub_opts = opts;
        }
        if let Some(pre_cmd) = self.pre_cmd {
            config.pre_cmd = pre_cmd;
        }
        config.dry_run |= self.dry_run;
        config.memory = self.memory.or(config.memory);
        if self.fail_fast {
            config.failure_policy = FailurePolicy::FailFast;
        }

        let connect = &mut config.connect;
        if let Some(input) = self.input_file {
            connect.input_file = input;
        }
        if let Some(sandbox) = self.sandbox {
            connect.sandbox = sandbox;
        }
        if let Some(path) = self.sandbox_path {
            connect.sandbox_path = path;
        }
        connect.make_sandbox |= self.make_sandbox;
        if self.do_initial_fit {
            connect.impact_stage = Some(ImpactStage::InitialFit);
        } else if self.do_fits {
            connect.impact_stage = Some(ImpactStage::Fits);
        }
        if !self.impact_params.is_empty() {
            connect.impact_params = self.impact_params;
        }

        let crab = &mut config.crab;
        crab.area = self.crab_area.or(crab.area.take());
        crab.custom_crab = self.custom_crab.or(crab.custom_crab.take());
        crab.custom_crab_post = self.custom_crab_post.or(crab.custom_crab_post.take());
        if !self.crab_extra_files.is_empty() {
            crab.extra_files = self.crab_extra_files;
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Combine method, e.g. AsymptoticLimits, FitDiagnostics, Impacts or T2W
    #[arg(short = 'M', long)]
    pub method: Option<String>,
    /// Datacards or workspaces; one job is queued per file
    #[arg(short = 'd', long = "datacard", num_args = 1..)]
    pub datacards: Vec<String>,
    /// Name label passed to combine
    #[arg(short = 'n', long)]
    pub name: Option<String>,
    /// Queue the command lines of this file instead of building jobs
    #[arg(long, conflicts_with = "method")]
    pub from_file: Option<PathBuf>,
    /// TOML file with default submission settings
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(flatten)]
    pub job: JobArgs,
    /// Arguments passed through to combine
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub passthru: Vec<String>,
}

impl RunArgs {
    /// The submission settings: the config file (if any) overridden by the
    /// command line.
    pub fn submission_config(&mut self) -> anyhow::Result<SubmissionConfig> {
        let mut config = match &self.config {
            Some(path) => SubmissionConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SubmissionConfig::default(),
        };
        std::mem::take(&mut self.job).apply(&mut config);
        if let Some(method) = &self.method {
            config.method = Some(Method::from(method.as_str()));
        }
        if !self.datacards.is_empty() {
            config.datacards = self.datacards.clone();
        }
        if self.name.is_some() {
            config.name = self.name.clone();
        }
        config.passthru.extend(self.passthru.iter().cloned());
        Ok(config)
    }
}

/// Jobs for `config`: one per datacard, or one with the passthrough
/// arguments alone when no datacard was given.
pub fn build_jobs(config: &SubmissionConfig) -> anyhow::Result<Vec<Job>> {
    let Some(method) = &config.method else {
        bail!("no method given, use -M/--method or --from-file");
    };
    let mut extra = config.passthru.clone();
    if let Some(name) = &config.name {
        extra.extend(["-n".to_string(), name.clone()]);
    }

    if *method == Method::T2W {
        if config.datacards.is_empty() {
            bail!("T2W needs at least one datacard (-d)");
        }
        return Ok(config
            .datacards
            .iter()
            .map(|card| {
                let mut line = format!("text2workspace.py {card}");
                for arg in &extra {
                    line.push(' ');
                    line.push_str(arg);
                }
                Job::from_line(line)
            })
            .collect());
    }

    let head = ["-M".to_string(), method.to_string()];
    if config.datacards.is_empty() {
        return Ok(vec![Job::combine(head.iter().chain(&extra))]);
    }
    Ok(config
        .datacards
        .iter()
        .map(|card| {
            let card_args = ["-d".to_string(), card.clone()];
            Job::combine(head.iter().chain(&card_args).chain(&extra))
        })
        .collect())
}

/// Command lines from a file, one job per non-empty line; `#` starts a
/// comment line.
pub fn jobs_from_file(path: &Path) -> anyhow::Result<Vec<Job>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading jobs from {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Job::from_line)
        .collect())
}

pub async fn run(mut args: RunArgs) -> anyhow::Result<()> {
    let config = args.submission_config()?;
    let jobs = match &args.from_file {
        Some(path) => jobs_from_file(path)?,
        None => build_jobs(&config)?,
    };
    info!(jobs = jobs.len(), mode = %config.job_mode, "queued jobs");

    let mut orchestrator = JobOrchestrator::new(config, PrefixEnv::from_env());
    orchestrator.enqueue_all(jobs);
    let report = orchestrator.flush().await?;

    print_report(&report, args.format)?;
    if report.has_failures() {
        bail!("some jobs or submissions failed");
    }
    Ok(())
}

fn print_report(report: &FlushReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            let failed = report.outcomes.iter().filter(|o| o.is_failure()).count();
            println!(
                "{} job(s) in {} mode: {} file(s), {} submission(s), {} failed",
                report.jobs,
                report.mode,
                report.files.len(),
                report.submissions.len(),
                failed
            );
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
        }
    }
    Ok(())
}

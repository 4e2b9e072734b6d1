//! Whole-flush tests for every backend.
//!
//! Commands go to a recording runner, so nothing is submitted; files are
//! written into a temporary work directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use combinetool_core::{
    ConfigError, ConnectConfig, ImpactStage, Job, JobMode, Method, PrefixEnv, SubmissionConfig,
};
use combinetool_jobs::{
    CapturedOutput, CommandRunner, CrabClient, CrabConfig, ExecGate, ExecOutcome, JobError,
    JobOrchestrator, JobOutcome, SubmissionError,
};

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<(String, PathBuf)>>,
    /// Commands containing this text exit with 1.
    fail_on: Option<&'static str>,
}

impl Recorder {
    fn failing_on(needle: &'static str) -> Self {
        Self {
            fail_on: Some(needle),
            ..Self::default()
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

impl CommandRunner for Recorder {
    fn run(&self, command: &str, cwd: &Path) -> std::io::Result<i32> {
        self.commands
            .lock()
            .unwrap()
            .push((command.to_string(), cwd.to_path_buf()));
        match self.fail_on {
            Some(needle) if command.contains(needle) => Ok(1),
            _ => Ok(0),
        }
    }

    fn capture(&self, command: &str, cwd: &Path) -> std::io::Result<CapturedOutput> {
        self.run(command, cwd).map(|exit_code| CapturedOutput {
            exit_code,
            ..CapturedOutput::default()
        })
    }
}

/// Rejects every task with a fixed set of diagnostic lines.
#[derive(Default)]
struct RejectingCrab {
    submitted: Mutex<Vec<PathBuf>>,
}

impl CrabClient for RejectingCrab {
    fn submit(
        &self,
        _gate: &ExecGate,
        config_file: &Path,
        _config: &CrabConfig,
    ) -> Result<(), SubmissionError> {
        self.submitted.lock().unwrap().push(config_file.to_path_buf());
        Err(SubmissionError::Rejected {
            command: format!("crab submit -c {}", config_file.display()),
            code: 1,
            details: vec!["HTTP/1.1 403 Forbidden".to_string()],
        })
    }
}

fn env(pwd: &Path) -> PrefixEnv {
    PrefixEnv {
        cmssw_base: Some("/cms/CMSSW_10_6_5".to_string()),
        cmssw_version: Some("CMSSW_10_6_5".to_string()),
        scram_arch: Some("slc7_amd64_gcc700".to_string()),
        pwd: Some(pwd.display().to_string()),
        user: Some("me".to_string()),
    }
}

fn config(mode: JobMode, work_dir: &Path) -> SubmissionConfig {
    SubmissionConfig {
        job_mode: mode,
        work_dir: work_dir.to_path_buf(),
        task_name: "scan".to_string(),
        ..SubmissionConfig::default()
    }
}

fn jobs(n: usize) -> Vec<Job> {
    (0..n)
        .map(|i| Job::combine(["-M", "MultiDimFit", "-d", "ws.root", "-n", format!(".p{i}").as_str()]))
        .collect()
}

#[tokio::test]
async fn script_mode_writes_merged_executable_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Script, dir.path());
    cfg.merge = 2;
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all(jobs(5));

    let report = orchestrator.flush().await.unwrap();
    assert!(orchestrator.queue().is_empty());
    assert_eq!(report.files.len(), 3);
    assert!(recorder.commands().is_empty());

    let last = std::fs::read_to_string(dir.path().join("job_scan_2.sh")).unwrap();
    assert!(last.starts_with("#!/bin/sh\nulimit -s unlimited\nset -e\n"));
    assert!(last.ends_with(
        "eval combine -M MultiDimFit -d ws.root -n .p4 2>&1 | tee job_scan_2.log\n"
    ));
    let first = std::fs::read_to_string(dir.path().join("job_scan_0.sh")).unwrap();
    assert!(first.contains("-n .p1 2>&1 | tee -a job_scan_0.log\n"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for i in 0..3 {
            let path = dir.path().join(format!("job_scan_{i}.sh"));
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}

#[tokio::test]
async fn lxbatch_submits_each_script_from_work_dir() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Lxbatch, dir.path());
    cfg.job_dir = Some(PathBuf::from("jobs"));
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all(jobs(2));

    let report = orchestrator.flush().await.unwrap();
    assert!(dir.path().join("jobs/job_scan_1.sh").is_file());
    let commands = recorder.commands();
    assert_eq!(commands.len(), 2);
    let script = std::path::absolute(dir.path().join("jobs/job_scan_0.sh")).unwrap();
    let log = std::path::absolute(dir.path().join("jobs/job_scan_0_%J.log")).unwrap();
    assert_eq!(
        commands[0],
        format!("bsub -o {} {}", log.display(), script.display())
    );
    assert_eq!(report.submissions.len(), 2);
    assert!(
        recorder
            .commands
            .lock()
            .unwrap()
            .iter()
            .all(|(_, cwd)| cwd == dir.path())
    );
}

#[tokio::test]
async fn condor_writes_one_script_and_submit_file() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut orchestrator = JobOrchestrator::with_runner(
        config(JobMode::Condor, dir.path()),
        env(dir.path()),
        recorder.clone(),
    );
    orchestrator.enqueue_all(jobs(4));

    orchestrator.flush().await.unwrap();
    let script = std::fs::read_to_string(dir.path().join("condor_scan.sh")).unwrap();
    assert_eq!(script.matches("if [ $1 -eq").count(), 4);
    assert!(script.contains("if [ $1 -eq 3 ]; then\n  combine -M MultiDimFit -d ws.root -n .p3\nfi\n"));
    let submit = std::fs::read_to_string(dir.path().join("condor_scan.sub")).unwrap();
    assert!(submit.starts_with("executable = condor_scan.sh\n"));
    assert!(submit.ends_with("queue 4\n\n"));
    assert_eq!(recorder.commands(), vec!["condor_submit condor_scan.sub"]);
}

#[tokio::test]
async fn slurm_submits_an_array() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Slurm, dir.path());
    cfg.merge = 3;
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all(jobs(7));

    orchestrator.flush().await.unwrap();
    let script = std::fs::read_to_string(dir.path().join("slurm_scan.sh")).unwrap();
    assert!(script.contains("if [ ${SLURM_ARRAY_TASK_ID} -eq 3 ]; then\n"));
    assert!(!script.contains("-eq 4 ]"));
    assert!(recorder.commands()[0].starts_with("sbatch --array=1-3 -o "));
}

#[tokio::test]
async fn dry_run_has_no_effects() {
    let dir = tempfile::tempdir().unwrap();
    for mode in JobMode::ALL {
        let recorder = Arc::new(Recorder::default());
        let mut cfg = config(mode, dir.path());
        cfg.dry_run = true;
        cfg.job_dir = Some(PathBuf::from("jobs"));
        cfg.method = Some(Method::FitDiagnostics);
        cfg.datacards = vec!["ws.root".to_string()];
        let mut orchestrator =
            JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
        orchestrator.enqueue_all(jobs(3));

        let report = orchestrator.flush().await.unwrap();
        assert!(report.dry_run);
        assert!(recorder.commands().is_empty(), "{mode} ran a command");
        if mode == JobMode::Interactive {
            assert!(report
                .outcomes
                .iter()
                .all(|o| matches!(o, JobOutcome::Previewed { .. })));
        } else {
            assert!(!report.files.is_empty(), "{mode} rendered nothing");
        }
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn empty_queue_is_a_no_op_for_every_mode() {
    let dir = tempfile::tempdir().unwrap();
    for mode in JobMode::ALL {
        let recorder = Arc::new(Recorder::default());
        let mut orchestrator = JobOrchestrator::with_runner(
            config(mode, dir.path()),
            PrefixEnv::default(),
            recorder.clone(),
        );
        let report = orchestrator.flush().await.unwrap();
        assert_eq!(report.jobs, 0);
        assert!(recorder.commands().is_empty());
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_prefix_file_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Script, dir.path());
    cfg.prefix_file = Some(dir.path().join("absent.txt").display().to_string());
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all(jobs(2));

    let result = orchestrator.flush().await;
    assert!(matches!(
        result,
        Err(JobError::Config(ConfigError::PrefixFileNotFound(_)))
    ));
    assert!(orchestrator.queue().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn connect_t2w_returns_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::T2W);
    cfg.passthru = vec!["-o".to_string(), "myWorkspace.root".to_string()];
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue(Job::from_line("text2workspace.py datacard.txt -o myWorkspace.root"));

    let report = orchestrator.flush().await.unwrap();
    let script = std::fs::read_to_string(dir.path().join("condor_scan.sh")).unwrap();
    assert!(script.contains("cd cmssw-tmp/CMSSW_10_6_5/src//tmp1//\n"));
    assert!(script.ends_with("\nmv myWorkspace.root ../../../../\n"));
    let submit = std::fs::read_to_string(dir.path().join("condor_scan.sub")).unwrap();
    assert!(submit.contains("transfer_output_files = myWorkspace.root\n"));
    assert!(report.staged_files.contains(&"datacard.txt".to_string()));
    assert_eq!(recorder.commands(), vec!["condor_submit condor_scan.sub"]);
}

#[tokio::test]
async fn connect_initial_fit_resolves_mass_from_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::Impacts);
    cfg.datacards = vec!["ws.root".to_string()];
    cfg.passthru = vec!["-m".to_string(), "MASS".to_string()];
    cfg.connect = ConnectConfig {
        input_file: "../../../../shapes.root".to_string(),
        impact_stage: Some(ImpactStage::InitialFit),
        ..ConnectConfig::default()
    };
    let mut orchestrator = JobOrchestrator::with_runner(
        cfg,
        env(Path::new("/home/me/limits/125/impacts")),
        recorder.clone(),
    );
    orchestrator.enqueue(Job::combine([
        "-M",
        "MultiDimFit",
        "-d",
        "ws.root",
        "-m",
        "125",
        "--doInitialFit",
    ]));

    let report = orchestrator.flush().await.unwrap();
    let script = std::fs::read_to_string(dir.path().join("condor_scan.sh")).unwrap();
    assert!(script.contains("mkdir -p cmssw-tmp/CMSSW_10_6_5/src//tmp3//\n"));
    assert!(script.contains("cp --parents ws.root cmssw-tmp/CMSSW_10_6_5/src//tmp3//\n"));
    assert!(script.contains(
        "if [ $1 -eq 0 ]; then\n  combine -M MultiDimFit -d ws.root -m 125 --doInitialFit\nfi\n"
    ));
    assert!(script.ends_with(
        "\nmv *initialFit*.root ../../../\n\nrm ../../../sandbox* ../../../cmssw_setup*\n"
    ));

    let submit = std::fs::read_to_string(dir.path().join("condor_scan.sub")).unwrap();
    assert!(submit.contains(
        "transfer_output_files = /tmp3/higgsCombine_initialFit_Test.MultiDimFit.mH125.root\n"
    ));
    assert!(submit.contains(",ws.root,../../../../shapes.root\n"));
    assert!(report.staged_files.contains(&"../../../../shapes.root".to_string()));
    assert_eq!(recorder.commands(), vec!["condor_submit condor_scan.sub"]);
}

#[tokio::test]
async fn connect_limits_take_mass_from_datacard_directory() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::AsymptoticLimits);
    cfg.datacards = vec!["cards/125/card.txt".to_string()];
    cfg.passthru = vec!["-m".to_string(), "MASS".to_string()];
    cfg.connect.input_file = "shapes.root".to_string();
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue(Job::combine([
        "-M",
        "AsymptoticLimits",
        "-d",
        "cards/125/card.txt",
        "-m",
        "125",
    ]));

    let report = orchestrator.flush().await.unwrap();
    assert!(report.setup.is_empty());
    let script = std::fs::read_to_string(dir.path().join("condor_scan.sh")).unwrap();
    assert!(script.contains("cp --parents cards/125/card.txt cmssw-tmp/CMSSW_10_6_5/src//\n"));
    assert!(script.contains("cp ../../../shapes.root .\n"));
    assert!(!script.contains("tar -xf"));
    assert!(script.ends_with("\nmv *AsymptoticLimits*.root ../../../\n"));
    let submit = std::fs::read_to_string(dir.path().join("condor_scan.sub")).unwrap();
    assert!(submit.contains("transfer_output_files = higgsCombineTest.AsymptoticLimits.mH125.root\n"));
}

#[tokio::test]
async fn failing_setup_step_aborts_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::failing_on("tar -czf"));
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::AsymptoticLimits);
    cfg.datacards = vec!["cards/120/card.txt".to_string(), "cards/130/card.txt".to_string()];
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all([
        Job::combine(["-M", "AsymptoticLimits", "-d", "cards/120/card.txt"]),
        Job::combine(["-M", "AsymptoticLimits", "-d", "cards/130/card.txt"]),
    ]);

    let result = orchestrator.flush().await;
    assert!(matches!(
        result,
        Err(JobError::Submission(SubmissionError::Rejected { code: 1, .. }))
    ));
    assert!(orchestrator.queue().is_empty());
    assert_eq!(
        recorder.commands(),
        vec!["tar -czf datacards.tar.gz cards/120/card.txt cards/130/card.txt"]
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_sandbox_build_stops_the_submission() {
    let dir = tempfile::tempdir().unwrap();
    let stash_root = tempfile::tempdir().unwrap();
    let stash = stash_root.path().join("me");
    std::fs::create_dir_all(stash.join("cmssw-sandbox")).unwrap();
    let stale = stash.join("sandbox-CMSSW_10_6_5-old.tar.bz2");
    std::fs::write(&stale, b"").unwrap();

    let recorder = Arc::new(Recorder::failing_on("cmssw-sandbox create"));
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::FitDiagnostics);
    cfg.datacards = vec!["ws.root".to_string()];
    cfg.connect.make_sandbox = true;
    cfg.connect.stash_root = stash_root.path().to_path_buf();
    let mut orchestrator = JobOrchestrator::with_runner(cfg, env(dir.path()), recorder.clone());
    orchestrator.enqueue_all(jobs(1));

    let result = orchestrator.flush().await;
    assert!(matches!(
        result,
        Err(JobError::Submission(SubmissionError::Rejected { code: 1, .. }))
    ));
    assert!(stale.is_file());
    assert!(!stash.join("public").exists());
    let commands = recorder.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("cmssw-sandbox create"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn dry_run_report_previews_the_exact_commands() {
    let dir = tempfile::tempdir().unwrap();

    let mut cfg = config(JobMode::Condor, dir.path());
    cfg.dry_run = true;
    let mut orchestrator =
        JobOrchestrator::with_runner(cfg, env(dir.path()), Arc::new(Recorder::default()));
    orchestrator.enqueue_all(jobs(2));
    let report = orchestrator.flush().await.unwrap();
    assert_eq!(
        report.submissions,
        vec![ExecOutcome::Previewed {
            command: "condor_submit condor_scan.sub".to_string()
        }]
    );
    assert_eq!(report.files[0].path, PathBuf::from("condor_scan.sh"));
    assert!(report.files[0].contents.contains(
        "if [ $1 -eq 1 ]; then\n  combine -M MultiDimFit -d ws.root -n .p1\nfi\n"
    ));
    assert!(report.files[1].contents.ends_with("queue 2\n\n"));

    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.dry_run = true;
    cfg.method = Some(Method::AsymptoticLimits);
    cfg.datacards = vec!["cards/120/card.txt".to_string(), "cards/130/card.txt".to_string()];
    let mut orchestrator =
        JobOrchestrator::with_runner(cfg, env(dir.path()), Arc::new(Recorder::default()));
    orchestrator.enqueue_all([
        Job::combine(["-M", "AsymptoticLimits", "-d", "cards/120/card.txt"]),
        Job::combine(["-M", "AsymptoticLimits", "-d", "cards/130/card.txt"]),
    ]);
    let report = orchestrator.flush().await.unwrap();
    assert_eq!(
        report.setup,
        vec![ExecOutcome::Previewed {
            command: "tar -czf datacards.tar.gz cards/120/card.txt cards/130/card.txt".to_string()
        }]
    );

    let mut cfg = config(JobMode::Interactive, dir.path());
    cfg.dry_run = true;
    cfg.pre_cmd = "time ".to_string();
    let mut orchestrator =
        JobOrchestrator::with_runner(cfg, env(dir.path()), Arc::new(Recorder::default()));
    orchestrator.enqueue_all([Job::combine(["-M", "Significance"]), Job::shell("echo done")]);
    let report = orchestrator.flush().await.unwrap();
    assert_eq!(
        report.outcomes,
        vec![
            JobOutcome::Previewed {
                command: "time combine -M Significance".to_string()
            },
            JobOutcome::Previewed {
                command: "echo done".to_string()
            },
        ]
    );

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn connect_rejects_unsupported_method() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(JobMode::Connect, dir.path());
    cfg.method = Some(Method::from("MultiDimFit"));
    let mut orchestrator =
        JobOrchestrator::with_runner(cfg, env(dir.path()), Arc::new(Recorder::default()));
    orchestrator.enqueue_all(jobs(1));

    let result = orchestrator.flush().await;
    assert!(matches!(
        result,
        Err(JobError::Config(ConfigError::UnsupportedMethod { .. }))
    ));
}

#[tokio::test]
async fn crab_rejection_is_soft() {
    let dir = tempfile::tempdir().unwrap();
    let crab = Arc::new(RejectingCrab::default());
    let mut orchestrator = JobOrchestrator::with_runner(
        config(JobMode::Crab3, dir.path()),
        env(dir.path()),
        Arc::new(Recorder::default()),
    )
    .with_crab_client(crab.clone());
    orchestrator.enqueue_all(jobs(2));

    let report = orchestrator.flush().await.unwrap();
    assert!(dir.path().join("crab_scan.sh").is_file());
    let python = std::fs::read_to_string(dir.path().join("crab_scan_cfg.py")).unwrap();
    assert!(python.contains("config.Data.totalUnits = 2\n"));
    assert_eq!(
        *crab.submitted.lock().unwrap(),
        vec![PathBuf::from("crab_scan_cfg.py")]
    );
    assert!(report.warnings.iter().any(|w| w.contains("403 Forbidden")));
    assert_eq!(report.staged_files, vec!["ws.root".to_string()]);

    // The orchestrator stays usable for the next task.
    orchestrator.enqueue_all(jobs(1));
    assert!(orchestrator.flush().await.is_ok());
}

#[tokio::test]
async fn report_serializes_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(JobMode::Interactive, dir.path());
    cfg.dry_run = true;
    let mut orchestrator =
        JobOrchestrator::with_runner(cfg, env(dir.path()), Arc::new(Recorder::default()));
    orchestrator.enqueue(Job::combine(["-M", "Significance"]));

    let report = orchestrator.flush().await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["mode"], "interactive");
    assert_eq!(json["outcomes"][0]["status"], "previewed");
    assert_eq!(json["outcomes"][0]["command"], "combine -M Significance");
}

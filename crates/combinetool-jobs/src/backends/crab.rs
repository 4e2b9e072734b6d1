//! CRAB3 grid submission.
//!
//! The job script runs under a trap that turns any failing command into a
//! `FrameworkJobReport.xml` carrying the exit code, then exits cleanly so
//! the grid framework records the error instead of losing the job. Result
//! files are archived into `combine_output.tar` at the end.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use combinetool_core::args::workspace_arg;
use combinetool_core::job::TOOL;
use combinetool_core::{ConfigError, ConfigResult, CrabOptions, Job, PrefixEnv};

use super::{Backend, DispatchContext, DispatchPlan, Submission};
use crate::error::{JobResult, SubmissionError};
use crate::exec::{ExecGate, RenderedFile};
use crate::queue::Batch;
use crate::template::{IndexGuard, guarded_blocks};

pub const CRAB_PREFIX: &str = r#"
set -x
set -e
ulimit -s unlimited
ulimit -c 0

function error_exit
{
  if [ $1 -ne 0 ]; then
    echo "Error with exit code ${1}"
    if [ -e FrameworkJobReport.xml ]
    then
      cat << EOF > FrameworkJobReport.xml.tmp
      <FrameworkJobReport>
      <FrameworkError ExitStatus="${1}" Type="" >
      Error with exit code ${1}
      </FrameworkError>
EOF
      tail -n+2 FrameworkJobReport.xml >> FrameworkJobReport.xml.tmp
      mv FrameworkJobReport.xml.tmp FrameworkJobReport.xml
    else
      cat << EOF > FrameworkJobReport.xml
      <FrameworkJobReport>
      <FrameworkError ExitStatus="${1}" Type="" >
      Error with exit code ${1}
      </FrameworkError>
      </FrameworkJobReport>
EOF
    fi
    exit 0
  fi
}

trap 'error_exit $?' ERR
"#;

pub const CRAB_POSTFIX: &str = "
tar -cf combine_output.tar higgsCombine*.root
rm higgsCombine*.root
";

/// Helper shipped with every task that fetches a remote workspace.
pub const REMOTE_FETCH: &str = "./copyRemoteWorkspace.sh";

const REMOTE_SCHEME: &str = "root://";
const SCRIPTS_DIR: &str = "src/CombineHarvester/CombineTools/scripts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSection {
    pub request_name: String,
    pub work_area: String,
    pub transfer_outputs: bool,
    pub transfer_logs: bool,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeSection {
    pub plugin_name: String,
    pub pset_name: String,
    pub script_exe: String,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    #[serde(rename = "maxMemoryMB", skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u32>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSection {
    pub output_primary_dataset: String,
    pub splitting: String,
    pub units_per_job: u32,
    pub total_units: usize,
    pub publication: bool,
    pub output_dataset_tag: String,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSection {
    pub storage_site: String,
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// A CRAB task configuration.
///
/// Sections and field names follow the CRAB client's own configuration so
/// an overlay file can address any of them, known or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrabConfig {
    #[serde(rename = "General")]
    pub general: GeneralSection,
    #[serde(rename = "JobType")]
    pub job_type: JobTypeSection,
    #[serde(rename = "Data")]
    pub data: DataSection,
    #[serde(rename = "Site")]
    pub site: SiteSection,
}

impl CrabConfig {
    /// The default task: a private MC job that runs the generated script,
    /// ships the combine binary and returns `combine_output.tar`.
    pub fn new(env: &PrefixEnv) -> ConfigResult<Self> {
        let base = Path::new(env.cmssw_base()?);
        let scripts = base.join(SCRIPTS_DIR);
        let binary = base.join("bin").join(env.scram_arch()?).join(TOOL);
        Ok(Self {
            general: GeneralSection {
                request_name: String::new(),
                work_area: "crab_area".to_string(),
                transfer_outputs: true,
                transfer_logs: true,
                extra: toml::Table::new(),
            },
            job_type: JobTypeSection {
                plugin_name: "PrivateMC".to_string(),
                pset_name: scripts.join("do_nothing_cfg.py").display().to_string(),
                script_exe: String::new(),
                input_files: vec![
                    scripts.join("FrameworkJobReport.xml").display().to_string(),
                    scripts.join("copyRemoteWorkspace.sh").display().to_string(),
                    binary.display().to_string(),
                ],
                output_files: vec!["combine_output.tar".to_string()],
                max_memory_mb: None,
                extra: toml::Table::new(),
            },
            data: DataSection {
                output_primary_dataset: "Combine".to_string(),
                splitting: "EventBased".to_string(),
                units_per_job: 1,
                total_units: 1,
                publication: false,
                output_dataset_tag: String::new(),
                extra: toml::Table::new(),
            },
            site: SiteSection {
                storage_site: "T2_CH_CERN".to_string(),
                extra: toml::Table::new(),
            },
        })
    }

    /// Merge a TOML overlay into this configuration. Tables merge key by
    /// key; any other value replaces what was there.
    pub fn apply_overlay(&self, overlay: &str, origin: &Path) -> JobResult<Self> {
        let parse_error = |source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        };
        let overlay: toml::Table = toml::from_str(overlay).map_err(parse_error)?;
        let mut base = toml::Table::try_from(self)?;
        merge_tables(&mut base, overlay);
        Ok(toml::Value::Table(base).try_into().map_err(parse_error)?)
    }

    /// Apply the overlay file at `path`.
    pub fn apply_overlay_file(&self, path: &Path) -> JobResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_overlay(&text, path)
    }

    /// The configuration as a CRAB python config file.
    pub fn to_python(&self) -> JobResult<String> {
        let table = toml::Table::try_from(self)?;
        let mut out = String::from(
            "from CRABClient.UserUtilities import config\n\nconfig = config()\n",
        );
        for section in ["General", "JobType", "Data", "Site"] {
            let Some(toml::Value::Table(fields)) = table.get(section) else {
                continue;
            };
            out.push('\n');
            for (key, value) in fields {
                let _ = writeln!(out, "config.{section}.{key} = {}", python_literal(value));
            }
        }
        Ok(out)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (Some(slot), value) => *slot = value,
            (None, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn python_literal(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(true) => "True".to_string(),
        toml::Value::Boolean(false) => "False".to_string(),
        toml::Value::Datetime(d) => format!("'{d}'"),
        toml::Value::Array(items) => format!(
            "[{}]",
            items.iter().map(python_literal).collect::<Vec<_>>().join(", ")
        ),
        toml::Value::Table(fields) => format!(
            "{{{}}}",
            fields
                .iter()
                .map(|(k, v)| format!("'{k}': {}", python_literal(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Hands a rendered task to CRAB.
pub trait CrabClient: Send + Sync {
    fn submit(
        &self,
        gate: &ExecGate,
        config_file: &Path,
        config: &CrabConfig,
    ) -> Result<(), SubmissionError>;
}

/// Submits through the `crab` command line client.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrabCli;

impl CrabClient for CrabCli {
    fn submit(
        &self,
        gate: &ExecGate,
        config_file: &Path,
        _config: &CrabConfig,
    ) -> Result<(), SubmissionError> {
        let command = format!("crab submit -c {}", config_file.display());
        let output = gate
            .capture(&Job::shell(command.as_str()))
            .map_err(|source| SubmissionError::Spawn {
                command: command.clone(),
                source,
            })?;
        match output {
            Some(out) if out.exit_code != 0 => Err(SubmissionError::Rejected {
                command,
                code: out.exit_code,
                details: out
                    .stderr
                    .lines()
                    .chain(out.stdout.lines())
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            _ => Ok(()),
        }
    }
}

/// Script and python config names for a task.
pub(crate) fn crab_file_names(task: &str) -> (String, String) {
    (format!("crab_{task}.sh"), format!("crab_{task}_cfg.py"))
}

/// Files a CRAB task ships, and which source path each name on the grid
/// node came from.
#[derive(Debug, Default)]
struct GridInputs {
    staged: BTreeSet<String>,
    names: BTreeMap<String, String>,
}

impl GridInputs {
    fn seeded(extra_files: &[String]) -> Self {
        let mut inputs = Self::default();
        inputs.staged.extend(extra_files.iter().cloned());
        inputs
    }

    /// Claim `name` on the grid node for `source`. Two different sources
    /// cannot share a name: jobs only see the file name.
    fn claim(&mut self, name: &str, source: &str) -> ConfigResult<()> {
        match self.names.get(name) {
            Some(first) if first != source => Err(ConfigError::StagedNameClash {
                name: name.to_string(),
                first: first.clone(),
                second: source.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.names.insert(name.to_string(), source.to_string());
                Ok(())
            }
        }
    }
}

/// Rewrite one job for the grid node.
///
/// Combine runs from the task sandbox as `./combine` and sees its workspace
/// by file name only. Remote workspaces are fetched first; local ones are
/// staged.
fn grid_line(job: &Job, pre_cmd: &str, inputs: &mut GridInputs) -> ConfigResult<String> {
    if !job.is_tool() {
        return Ok(job.line().to_string());
    }
    let line = match job.line().strip_prefix(TOOL) {
        Some(rest) => format!("{pre_cmd}./{TOOL}{rest}"),
        None => format!("{pre_cmd}{}", job.line()),
    };
    let workspace = workspace_arg(&job.tokens())?.to_string();
    let base = Path::new(&workspace)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| workspace.clone());
    inputs.claim(&base, &workspace)?;
    let line = line.replace(&workspace, &base);
    if workspace.starts_with(REMOTE_SCHEME) {
        Ok(format!("{REMOTE_FETCH} {workspace} ./{base}; {line}"))
    } else {
        inputs.staged.insert(workspace);
        Ok(line)
    }
}

fn read_post(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Fill in the per-task fields of `config`.
fn configure(
    mut config: CrabConfig,
    task: &str,
    script: &str,
    staged: &BTreeSet<String>,
    jobs: usize,
    memory: Option<u32>,
    options: &CrabOptions,
) -> JobResult<CrabConfig> {
    config.general.request_name = task.to_string();
    config.job_type.script_exe = script.to_string();
    config.job_type.input_files.extend(staged.iter().cloned());
    config.data.total_units = jobs;
    config.data.output_dataset_tag = task.to_string();
    if let Some(memory) = memory {
        config.job_type.max_memory_mb = Some(memory);
    }
    if let Some(area) = &options.area {
        config.general.work_area = area.display().to_string();
    }
    match &options.custom_crab {
        Some(overlay) => config.apply_overlay_file(overlay),
        None => Ok(config),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crab3;

impl Backend for Crab3 {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let config = ctx.config;
        let options = &config.crab;
        let (script_name, cfg_name) = crab_file_names(&config.task_name);
        info!(request = %config.task_name, script = %script_name, "crab3 task");

        let mut inputs = GridInputs::seeded(&options.extra_files);
        let mut script = CRAB_PREFIX.to_string();
        script.push_str(&guarded_blocks(batches, IndexGuard::CRAB_JOB, |job| {
            grid_line(job, &config.pre_cmd, &mut inputs)
        })?);
        let staged = inputs.staged;
        match &options.custom_crab_post {
            Some(path) => script.push_str(&read_post(path)?),
            None => script.push_str(CRAB_POSTFIX),
        }

        let crab = configure(
            CrabConfig::new(ctx.env)?,
            &config.task_name,
            &script_name,
            &staged,
            batches.len(),
            config.memory,
            options,
        )?;
        let python = crab.to_python()?;

        let mut plan = DispatchPlan::new(
            vec![
                RenderedFile::script(&script_name, script),
                RenderedFile::plain(PathBuf::from(&cfg_name), python),
            ],
            Submission::Crab(Box::new(crab)),
        );
        plan.staged = staged;
        Ok(plan)
    }
}

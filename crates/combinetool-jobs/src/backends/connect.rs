//! CMS Connect: HTCondor with a shipped CMSSW sandbox.
//!
//! The job unpacks the sandbox, copies the datacards into a nested working
//! directory inside it, runs its guarded block and moves the method's
//! result files back to where HTCondor collects them. What comes back is
//! declared up front in `transfer_output_files`, so the output names below
//! must match what combine writes or the results are silently lost.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::info;

use combinetool_core::args::{flag_value, workspace_arg};
use combinetool_core::{ConfigError, ConfigResult, ImpactStage, Job, JobMode, Method};

use super::{Backend, DispatchContext, DispatchPlan, Submission, unescape_options};
use super::condor::condor_file_names;
use crate::error::JobResult;
use crate::exec::RenderedFile;
use crate::queue::Batch;
use crate::template::{IndexGuard, ScriptPrefix, ScriptTemplate, guarded_blocks, substitute};

pub const CONNECT_PREFIX: &str = "#!/bin/bash
ulimit -s unlimited
set -e
export SCRAM_ARCH=%(SCRAM_ARCH)s
source /cvmfs/cms.cern.ch/cmsset_default.sh
source cmssw_setup_connect.sh
cmssw_setup %(SANDBOX)s
mkdir -p cmssw-tmp/%(CMSSW_VERSION)s/src/%(PATH)s/
cp --parents %(FILE)s cmssw-tmp/%(CMSSW_VERSION)s/src/%(PATH)s/
cd cmssw-tmp/%(CMSSW_VERSION)s/src/%(PATH)s/
eval `scramv1 runtime -sh`

";

pub const CONNECT_SUBMIT_TEMPLATE: &str = "executable = %(EXE)s
universe = vanilla
use_x509userproxy = true
getenv = True\x20
arguments = $(ProcId)
output                = %(TASK)s.$(ClusterId).$(ProcId).out
error                 = %(TASK)s.$(ClusterId).$(ProcId).err
log                   = %(TASK)s.$(ClusterId).log

# Send the job to Held state on failure.
on_exit_hold = (ExitBySignal == True) || (ExitCode != 0)

# Periodically retry the jobs every 10 minutes, up to a maximum of 5 retries.
periodic_release =  (NumJobStarts < 3) && ((CurrentTime - EnteredCurrentStatus) > 600)

preserve_relative_paths = True

transfer_input_files = %(INPUTS)s
transfer_output_files = %(OUTPUTS)s

request_memory = %(MEMORY)s MB
%(EXTRA)s
queue %(NUMBER)s

";

/// Sandbox bootstrap shipped next to the archive.
pub const SETUP_SCRIPT: &str = "cmssw_setup_connect.sh";

/// Archive several limit datacards are bundled into.
pub const DATACARD_BUNDLE: &str = "datacards.tar.gz";

/// Mass combine assumes when `-m` is not given.
const DEFAULT_MASS: &str = "120";

/// Placeholder that stands for a mass taken from the datacard path.
const MASS_PLACEHOLDER: &str = "MASS";

const PURGE_SANDBOX: &str = "rm ../../../sandbox* ../../../cmssw_setup*";

/// Where the datacard comes from and where it lands inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    /// Datacard (or bundle) shipped with the job.
    pub datacard: String,
    /// Extra directory levels below `src/`, e.g. `/tmp3/`.
    pub nested_dir: String,
    /// Command that builds the bundle before submission.
    pub bundle: Option<Job>,
}

impl Staging {
    pub fn is_bundled(&self) -> bool {
        self.bundle.is_some()
    }
}

/// Inputs of the output-name mapping.
#[derive(Debug, Clone, Copy)]
pub struct OutputNaming<'a> {
    pub method: &'a Method,
    /// Label given to combine with `-n`.
    pub label: &'a str,
    pub masses: &'a [String],
    /// Arguments passed through to the tool.
    pub passthru: &'a [String],
    pub impact_stage: Option<ImpactStage>,
    pub impact_params: &'a [String],
}

/// The result file(s) a connect job hands back, comma separated.
pub fn output_file_name(naming: &OutputNaming<'_>) -> ConfigResult<String> {
    let label = naming.label;
    let first_mass = || {
        naming
            .masses
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_MASS)
    };
    match naming.method {
        Method::T2W => flag_value(naming.passthru, &["-o"])
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingArgument("-o".to_string())),
        Method::FitDiagnostics => Ok(format!("fitDiagnostics{label}.root")),
        Method::Impacts => match naming.impact_stage {
            Some(ImpactStage::InitialFit) => Ok(format!(
                "higgsCombine_initialFit_{label}.MultiDimFit.mH{}.root",
                first_mass()
            )),
            Some(ImpactStage::Fits) => {
                if naming.impact_params.is_empty() {
                    return Err(ConfigError::NoImpactParameters);
                }
                let mass = first_mass();
                Ok(naming
                    .impact_params
                    .iter()
                    .map(|param| {
                        format!("higgsCombine_paramFit_{label}_{param}.MultiDimFit.mH{mass}.root")
                    })
                    .collect::<Vec<_>>()
                    .join(","))
            }
            None => Err(ConfigError::MissingImpactStage),
        },
        Method::AsymptoticLimits => {
            let default = [DEFAULT_MASS.to_string()];
            let masses = if naming.masses.is_empty() {
                &default[..]
            } else {
                naming.masses
            };
            Ok(masses
                .iter()
                .map(|mass| format!("higgsCombine{label}.AsymptoticLimits.mH{mass}.root"))
                .collect::<Vec<_>>()
                .join(","))
        }
        Method::Other(name) => Err(ConfigError::UnsupportedMethod {
            mode: JobMode::Connect,
            method: name.clone(),
        }),
    }
}

/// Masses named by `-m`/`--mass`.
///
/// The `MASS` placeholder is resolved from the datacard paths for limits
/// (the directory holding each card) and from the working directory's
/// parent for every other method.
pub fn resolve_masses(
    method: &Method,
    passthru: &[String],
    datacards: &[String],
    staged_datacard: &str,
    pwd: Option<&str>,
) -> ConfigResult<Vec<String>> {
    let Some(mass) = flag_value(passthru, &["-m", "--mass"]) else {
        return Ok(Vec::new());
    };
    if !mass.contains(MASS_PLACEHOLDER) {
        return Ok(vec![mass.to_string()]);
    }
    match method {
        Method::AsymptoticLimits if datacards.len() > 1 => {
            datacards.iter().map(|d| parent_dir_name(d)).collect()
        }
        Method::AsymptoticLimits => Ok(vec![parent_dir_name(staged_datacard)?]),
        _ => {
            let pwd = pwd.ok_or(ConfigError::MissingEnv("PWD"))?;
            Ok(vec![parent_dir_name(pwd)?])
        }
    }
}

fn parent_dir_name(path: &str) -> ConfigResult<String> {
    Path::new(path)
        .parent()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ConfigError::UnresolvedMass(path.to_string()))
}

/// `/tmp<i>/` levels for input files that climb more than three
/// directories.
fn nested_dir(input_file: &str) -> String {
    let ups = input_file.matches("../").count();
    (3..ups.max(3)).map(|i| format!("/tmp{i}/")).collect()
}

fn last_workspace(batches: &[Batch<'_>]) -> ConfigResult<String> {
    let job = batches
        .last()
        .and_then(|b| b.jobs.last())
        .ok_or(ConfigError::MissingWorkspace)?;
    Ok(workspace_arg(&job.tokens())?.to_string())
}

/// Work out which datacard travels with the job.
pub fn staging(
    method: &Method,
    datacards: &[String],
    input_file: &str,
    batches: &[Batch<'_>],
) -> ConfigResult<Staging> {
    let mut bundle = None;
    let datacard = match method {
        Method::AsymptoticLimits if datacards.len() > 1 => {
            bundle = Some(Job::shell(format!(
                "tar -czf {DATACARD_BUNDLE} {}",
                datacards.join(" ")
            )));
            DATACARD_BUNDLE.to_string()
        }
        Method::AsymptoticLimits => last_workspace(batches)?,
        Method::T2W => "datacard.txt".to_string(),
        Method::Impacts | Method::FitDiagnostics => match datacards.first() {
            Some(card) => card.clone(),
            None => last_workspace(batches).map_err(|_| ConfigError::NoDatacards)?,
        },
        Method::Other(name) => {
            return Err(ConfigError::UnsupportedMethod {
                mode: JobMode::Connect,
                method: name.clone(),
            });
        }
    };

    let nested_dir = match method {
        Method::T2W => "/tmp1/".to_string(),
        _ => nested_dir(input_file),
    };

    Ok(Staging {
        datacard,
        nested_dir,
        bundle,
    })
}

/// Lines appended to the job that move results back out of the sandbox.
fn return_lines(method: &Method, stage: Option<ImpactStage>, output: &str) -> Vec<String> {
    match method {
        Method::AsymptoticLimits => vec!["mv *AsymptoticLimits*.root ../../../".to_string()],
        Method::Impacts => match stage {
            Some(ImpactStage::Fits) => vec![
                "mv *param*.root ../../../".to_string(),
                PURGE_SANDBOX.to_string(),
            ],
            Some(ImpactStage::InitialFit) => vec![
                "mv *initialFit*.root ../../../".to_string(),
                PURGE_SANDBOX.to_string(),
            ],
            None => Vec::new(),
        },
        Method::FitDiagnostics => vec!["mv *fitDiagnostics*.root ../../../".to_string()],
        Method::T2W => vec![format!("mv {output} ../../../../")],
        Method::Other(_) => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connect;

impl Backend for Connect {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let config = ctx.config;
        let connect = &config.connect;
        let method = config
            .method
            .as_ref()
            .ok_or_else(|| ConfigError::MissingArgument("-M/--method".to_string()))?;

        let staging = staging(method, &config.datacards, &connect.input_file, batches)?;
        let masses = resolve_masses(
            method,
            &config.passthru,
            &config.datacards,
            &staging.datacard,
            ctx.env.pwd.as_deref(),
        )?;
        let output = output_file_name(&OutputNaming {
            method,
            label: config.label(),
            masses: &masses,
            passthru: &config.passthru,
            impact_stage: connect.impact_stage,
            impact_params: &connect.impact_params,
        })?;

        // T2W outputs come back from the top of the sandbox.
        let output_dir = if *method == Method::T2W {
            ""
        } else {
            staging.nested_dir.as_str()
        };
        let outputs = output
            .split(',')
            .map(|file| format!("{output_dir}{file}"))
            .collect::<Vec<_>>()
            .join(",");

        let prefix = ScriptPrefix::from_text(substitute(
            CONNECT_PREFIX,
            &[
                ("SCRAM_ARCH", ctx.env.scram_arch()?),
                ("CMSSW_VERSION", ctx.env.cmssw_version()?),
                ("SANDBOX", &connect.sandbox),
                ("PATH", &staging.nested_dir),
                ("FILE", &staging.datacard),
            ],
        ));
        let template = ScriptTemplate::new(&prefix, &config.pre_cmd);

        let mut script = prefix.as_str().to_string();
        if *method == Method::AsymptoticLimits {
            if staging.is_bundled() {
                script.push_str(&format!("tar -xf {DATACARD_BUNDLE}\n"));
            }
            if !connect.input_file.is_empty() {
                script.push_str(&format!("cp ../../../{} .\n", connect.input_file));
            }
        }
        script.push_str(&guarded_blocks(batches, IndexGuard::CONDOR_PROCESS, |job| {
            Ok::<_, ConfigError>(template.line(job))
        })?);
        for line in return_lines(method, connect.impact_stage, &output) {
            script.push('\n');
            script.push_str(&line);
            script.push('\n');
        }

        let area = connect.sandbox_area();
        let mut inputs = vec![
            area.join(&connect.sandbox).display().to_string(),
            area.join(SETUP_SCRIPT).display().to_string(),
            staging.datacard.clone(),
        ];
        if !connect.input_file.is_empty() {
            inputs.push(connect.input_file.clone());
        }

        let (script_name, sub_name) = condor_file_names(&config.task_name);
        let memory = config.memory.unwrap_or(connect.default_memory_mb).to_string();
        let number = batches.len().to_string();
        let submit = substitute(
            CONNECT_SUBMIT_TEMPLATE,
            &[
                ("EXE", &script_name),
                ("TASK", &config.task_name),
                ("INPUTS", &inputs.join(",")),
                ("OUTPUTS", &outputs),
                ("MEMORY", &memory),
                ("EXTRA", &unescape_options(&config.sub_opts)),
                ("NUMBER", &number),
            ],
        );

        info!(
            script = %script_name,
            method = %method,
            outputs = %outputs,
            "connect job script"
        );

        let mut plan = DispatchPlan::new(
            vec![
                RenderedFile::script(&script_name, script),
                RenderedFile::plain(&sub_name, submit),
            ],
            Submission::Commands(vec![Job::shell(format!("condor_submit {sub_name}"))]),
        );
        plan.setup.extend(staging.bundle);
        plan.staged = inputs.into_iter().collect::<BTreeSet<_>>();
        Ok(plan)
    }
}

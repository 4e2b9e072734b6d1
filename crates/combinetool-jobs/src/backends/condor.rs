//! HTCondor: one indexed script plus a submit description.
//!
//! Failed jobs are held rather than completed and released again every
//! ten minutes, for at most three starts.

use combinetool_core::Job;
use tracing::info;

use super::{Backend, DispatchContext, DispatchPlan, Submission, unescape_options};
use crate::error::JobResult;
use crate::exec::RenderedFile;
use crate::queue::Batch;
use crate::template::{IndexGuard, ScriptTemplate, substitute};

pub const CONDOR_SUBMIT_TEMPLATE: &str = "executable = %(EXE)s
arguments = $(ProcId)
output                = %(TASK)s.$(ClusterId).$(ProcId).out
error                 = %(TASK)s.$(ClusterId).$(ProcId).err
log                   = %(TASK)s.$(ClusterId).log

# Send the job to Held state on failure.
on_exit_hold = (ExitBySignal == True) || (ExitCode != 0)

# Periodically retry the jobs every 10 minutes, up to a maximum of 5 retries.
periodic_release =  (NumJobStarts < 3) && ((CurrentTime - EnteredCurrentStatus) > 600)

%(EXTRA)s
queue %(NUMBER)s

";

/// Script and submit file names for a task.
pub(crate) fn condor_file_names(task: &str) -> (String, String) {
    (format!("condor_{task}.sh"), format!("condor_{task}.sub"))
}

/// Fill in [`CONDOR_SUBMIT_TEMPLATE`].
pub fn submit_description(executable: &str, task: &str, extra: &str, jobs: usize) -> String {
    let number = jobs.to_string();
    substitute(
        CONDOR_SUBMIT_TEMPLATE,
        &[
            ("EXE", executable),
            ("TASK", task),
            ("EXTRA", extra),
            ("NUMBER", &number),
        ],
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Condor;

impl Backend for Condor {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let config = ctx.config;
        let prefix = ctx.prefix()?;
        let template = ScriptTemplate::new(&prefix, &config.pre_cmd);
        let (script_name, sub_name) = condor_file_names(&config.task_name);

        info!(script = %script_name, jobs = batches.len(), "condor job script");
        let script = RenderedFile::script(
            &script_name,
            template.render_indexed(batches, IndexGuard::CONDOR_PROCESS),
        );
        let submit = RenderedFile::plain(
            &sub_name,
            submit_description(
                &script_name,
                &config.task_name,
                &unescape_options(&config.sub_opts),
                batches.len(),
            ),
        );

        Ok(DispatchPlan::new(
            vec![script, submit],
            Submission::Commands(vec![Job::shell(format!("condor_submit {sub_name}"))]),
        ))
    }
}

//! Slurm: one script for the whole queue, submitted as a job array.

use combinetool_core::Job;

use super::batch::{absolute, job_dir_path};
use super::{Backend, DispatchContext, DispatchPlan, Submission, command_with_opts};
use crate::error::JobResult;
use crate::exec::RenderedFile;
use crate::queue::Batch;
use crate::template::{IndexGuard, ScriptTemplate, scheduler_log_path};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slurm;

impl Backend for Slurm {
    fn render(&self, ctx: &DispatchContext<'_>, batches: &[Batch<'_>]) -> JobResult<DispatchPlan> {
        let config = ctx.config;
        let prefix = ctx.prefix()?;
        let template = ScriptTemplate::new(&prefix, &config.pre_cmd);

        let path = job_dir_path(
            config.job_dir.as_deref(),
            format!("slurm_{}.sh", config.task_name),
        );
        let script = RenderedFile::script(
            &path,
            template.render_indexed(batches, IndexGuard::SLURM_ARRAY),
        );

        let full_script = absolute(&config.work_dir, &path)?;
        let logname = scheduler_log_path(&full_script, "_%A_%a.log");
        let submit = Job::shell(command_with_opts(
            &format!("sbatch --array=1-{} -o {}", batches.len(), logname.display()),
            &config.sub_opts,
            &full_script.display().to_string(),
        ));

        Ok(DispatchPlan::new(vec![script], Submission::Commands(vec![submit])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::partition;
    use crate::template::ScriptPrefix;
    use combinetool_core::{JobMode, PrefixEnv, SubmissionConfig};
    use std::path::PathBuf;

    #[test]
    fn array_spans_every_batch() {
        let config = SubmissionConfig {
            job_mode: JobMode::Slurm,
            task_name: "grid".to_string(),
            work_dir: PathBuf::from("/work"),
            job_dir: Some(PathBuf::from("slurm")),
            sub_opts: "--time=60".to_string(),
            ..SubmissionConfig::default()
        };
        let prefix = ScriptPrefix::from_text("#!/bin/sh\n");
        let env = PrefixEnv::default();
        let ctx = DispatchContext { config: &config, env: &env, prefix: Some(&prefix) };
        let queue: Vec<Job> = (0..5).map(|i| Job::combine([format!("-n {i}")])).collect();

        let plan = Slurm.render(&ctx, &partition(&queue, 2)).unwrap();
        assert_eq!(plan.files.len(), 1);
        assert_eq!(plan.files[0].path, PathBuf::from("slurm/slurm_grid.sh"));
        let text = &plan.files[0].contents;
        assert!(text.contains("if [ ${SLURM_ARRAY_TASK_ID} -eq 1 ]; then\n  combine -n 0\n  combine -n 1\nfi\n"));
        assert!(text.contains("if [ ${SLURM_ARRAY_TASK_ID} -eq 3 ]; then\n  combine -n 4\nfi\n"));
        assert!(!text.contains("-eq 4 ]"));

        assert_eq!(
            plan.submission,
            Submission::Commands(vec![Job::shell(
                "sbatch --array=1-3 -o /work/slurm/slurm_grid_%A_%a.log --time=60 /work/slurm/slurm_grid.sh"
            )])
        );
    }
}

//! combinetool-jobs: queueing, script rendering and submission of combine
//! jobs.
//!
//! Jobs are queued on a [`JobOrchestrator`] and flushed through one of the
//! scheduler backends. A flush:
//!
//! - Partitions the queue into batches of `merge` jobs
//! - Renders job scripts (prefix, guarded blocks, postfix) for the backend
//! - Writes them with execute permission and submits them
//! - Or, in interactive mode, runs the jobs here in a bounded pool
//!
//! # Architecture
//!
//! ```text
//! JobOrchestrator
//!   ├── JobQueue (pending jobs, drained on flush)
//!   ├── SchedulerBackend (render → DispatchPlan)
//!   │     interactive │ script │ lxbatch │ SGE │ slurm │ condor │ connect │ crab3
//!   └── ExecGate (dry-run aware: commands, file writes)
//!         ├── CommandRunner (sh -c)
//!         └── CrabClient (crab submit)
//! ```

pub mod backends;
pub mod error;
pub mod exec;
pub mod orchestrator;
pub mod queue;
pub mod sandbox;
pub mod template;

pub use backends::crab::{CrabCli, CrabClient, CrabConfig};
pub use backends::interactive::JobOutcome;
pub use backends::{Backend, DispatchContext, DispatchPlan, SchedulerBackend, Submission};
pub use error::{JobError, JobResult, SubmissionError};
pub use exec::{CapturedOutput, CommandRunner, ExecGate, ExecOutcome, RenderedFile, ShellRunner};
pub use orchestrator::{FlushReport, JobOrchestrator};
pub use queue::{Batch, JobQueue, partition};
pub use sandbox::{PublishedSandbox, SandboxMaker};
pub use template::{ScriptPrefix, ScriptTemplate, make_executable};

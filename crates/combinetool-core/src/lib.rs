pub mod args;
pub mod config;
pub mod env;
pub mod error;
pub mod job;
pub mod method;

pub use config::{ConnectConfig, CrabOptions, FailurePolicy, JobMode, SubmissionConfig};
pub use env::PrefixEnv;
pub use error::{ConfigError, ConfigResult};
pub use job::{Job, JobKind};
pub use method::{ImpactStage, Method};

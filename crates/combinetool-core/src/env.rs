//! Snapshot of the CMSSW environment that generated scripts depend on.

use crate::error::{ConfigError, ConfigResult};

/// Environment values substituted into script prefixes.
///
/// Captured once with [`PrefixEnv::from_env`]; a value that is missing only
/// becomes an error when a backend actually needs it.
#[derive(Debug, Clone, Default)]
pub struct PrefixEnv {
    pub cmssw_base: Option<String>,
    pub cmssw_version: Option<String>,
    pub scram_arch: Option<String>,
    /// Working directory the jobs change into.
    pub pwd: Option<String>,
    pub user: Option<String>,
}

impl PrefixEnv {
    pub fn from_env() -> Self {
        let pwd = std::env::var("PWD").ok().or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string())
        });
        Self {
            cmssw_base: std::env::var("CMSSW_BASE").ok(),
            cmssw_version: std::env::var("CMSSW_VERSION").ok(),
            scram_arch: std::env::var("SCRAM_ARCH").ok(),
            pwd,
            user: std::env::var("USER").ok(),
        }
    }

    pub fn cmssw_base(&self) -> ConfigResult<&str> {
        required(&self.cmssw_base, "CMSSW_BASE")
    }

    pub fn cmssw_version(&self) -> ConfigResult<&str> {
        required(&self.cmssw_version, "CMSSW_VERSION")
    }

    pub fn scram_arch(&self) -> ConfigResult<&str> {
        required(&self.scram_arch, "SCRAM_ARCH")
    }

    pub fn pwd(&self) -> ConfigResult<&str> {
        required(&self.pwd, "PWD")
    }

    pub fn user(&self) -> ConfigResult<&str> {
        required(&self.user, "USER")
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> ConfigResult<&'a str> {
    value.as_deref().ok_or(ConfigError::MissingEnv(name))
}

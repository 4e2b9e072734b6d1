//! A single queued command line.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the statistical tool executable.
pub const TOOL: &str = "combine";

/// Lines that enter another directory before running the tool.
const PUSHD: &str = "pushd";

/// How a job line is treated when it is rendered or executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// A combine tool-chain invocation: gets the pre-command hook, is
    /// `eval`'d in scripts and can be logged.
    Tool,
    /// `pushd <dir>; combine …`: rendered like a tool line in scripts, but
    /// run as-is and never rewritten for the grid.
    Pushd,
    /// Anything else; passed through verbatim.
    Shell,
}

/// One fully formed command line. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    line: String,
    kind: JobKind,
}

impl Job {
    /// `combine <args…>`.
    pub fn combine<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut line = TOOL.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg.as_ref());
        }
        Self {
            line,
            kind: JobKind::Tool,
        }
    }

    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            kind: JobKind::Shell,
        }
    }

    /// Classify a raw line once by its leading word.
    pub fn from_line(line: impl Into<String>) -> Self {
        let line = line.into();
        let kind = if line.starts_with(TOOL) {
            JobKind::Tool
        } else if line.starts_with(PUSHD) {
            JobKind::Pushd
        } else {
            JobKind::Shell
        };
        Self { line, kind }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_tool(&self) -> bool {
        self.kind == JobKind::Tool
    }

    /// Whether script rendering hooks and logs this line.
    pub fn is_tool_line(&self) -> bool {
        matches!(self.kind, JobKind::Tool | JobKind::Pushd)
    }

    /// Whitespace-separated tokens of the line.
    pub fn tokens(&self) -> Vec<&str> {
        self.line.split_whitespace().collect()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

//! Execution request types passed across the sandbox boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Language of a node program, determining how the entrypoint is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProgramLanguage {
    /// POSIX shell script.
    Shell,
    /// Python script, invoked through `python3`.
    Python,
    /// JavaScript, invoked through `node`.
    Node,
    /// Pre-built executable, invoked directly.
    Binary,
}

/// A program source file staged into the sandbox before the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the sandbox working directory.
    pub path: String,
    /// File contents.
    pub contents: String,
}

impl SourceFile {
    /// Creates a new source file.
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// What to execute: the resolved program version of a workflow node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    /// Entrypoint: a file path for staged programs, or an inline command
    /// for [`ProgramLanguage::Shell`] with no files.
    pub entrypoint: String,
    /// Program language.
    pub language: ProgramLanguage,
    /// Source files to stage into the working directory.
    #[serde(default)]
    pub files: Vec<SourceFile>,
}

impl ExecutableSpec {
    /// Creates a spec for an inline shell command.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            entrypoint: command.into(),
            language: ProgramLanguage::Shell,
            files: Vec::new(),
        }
    }

    /// Creates a spec for a staged program with an entrypoint file.
    pub fn program(
        language: ProgramLanguage,
        entrypoint: impl Into<String>,
        files: Vec<SourceFile>,
    ) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            language,
            files,
        }
    }
}

/// Resource ceiling for one sandboxed run.
///
/// Enforcement depends on the backend: container backends enforce all
/// three, the process backend treats them as advisory and only reports
/// breaches it can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU ceiling as a percentage of one core.
    pub cpu_percent: u32,
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// Scratch-disk ceiling in megabytes.
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 100,
            memory_mb: 512,
            disk_mb: 1024,
        }
    }
}

/// A fully-specified sandbox run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// What to execute.
    pub spec: ExecutableSpec,
    /// Environment variables visible to the program.
    pub env: BTreeMap<String, String>,
    /// Working directory. When `None` the backend stages a throwaway
    /// directory and discards it after the run.
    pub working_dir: Option<PathBuf>,
    /// Resource ceiling.
    pub limits: ResourceLimits,
    /// Wall-clock timeout; the backend force-terminates the run when it
    /// elapses.
    pub timeout: Duration,
}

impl RunRequest {
    /// Default wall-clock timeout for a run.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Creates a request with default environment, limits, and timeout.
    pub fn new(spec: ExecutableSpec) -> Self {
        Self {
            spec,
            env: BTreeMap::new(),
            working_dir: None,
            limits: ResourceLimits::default(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the resource ceiling.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trip() {
        let json = serde_json::to_string(&ProgramLanguage::Python).unwrap();
        assert_eq!(json, "\"python\"");
        assert_eq!(ProgramLanguage::Python.to_string(), "python");
    }

    #[test]
    fn test_request_builder() {
        let request = RunRequest::new(ExecutableSpec::shell("true"))
            .with_env("KEY", "value")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(request.env.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(request.timeout, Duration::from_secs(5));
        assert!(request.working_dir.is_none());
    }
}

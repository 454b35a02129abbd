#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod process;
mod runner;
mod spec;

pub use error::{SandboxError, SandboxResult};
pub use process::ProcessSandbox;
pub use runner::{ResourceUsage, RunOutcome, SandboxRunner};
pub use spec::{ExecutableSpec, ProgramLanguage, ResourceLimits, RunRequest, SourceFile};

/// Tracing target for sandbox operations.
pub const TRACING_TARGET: &str = "tessera_sandbox";

//! Process-backed sandbox.
//!
//! Runs node programs as local subprocesses. This backend provides no
//! isolation beyond a throwaway working directory and is intended for
//! development and tests; production deployments inject a container or
//! remote backend behind the same [`SandboxRunner`] trait.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::error::{SandboxError, SandboxResult};
use crate::runner::{ResourceUsage, RunOutcome, SandboxRunner};
use crate::spec::{ProgramLanguage, RunRequest};

/// Process-backed [`SandboxRunner`].
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    /// Override for the shell binary, mainly for tests.
    shell: Option<String>,
}

impl ProcessSandbox {
    /// Creates a new process sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the shell used for [`ProgramLanguage::Shell`] programs.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("sh")
    }

    /// Builds the command line for a staged request.
    fn command(&self, request: &RunRequest, workdir: &Path) -> Command {
        let spec = &request.spec;
        let mut cmd = match spec.language {
            ProgramLanguage::Shell => {
                let mut cmd = Command::new(self.shell());
                if spec.files.is_empty() {
                    // Inline command rather than a staged script.
                    cmd.arg("-c").arg(&spec.entrypoint);
                } else {
                    cmd.arg(&spec.entrypoint);
                }
                cmd
            }
            ProgramLanguage::Python => {
                let mut cmd = Command::new("python3");
                cmd.arg(&spec.entrypoint);
                cmd
            }
            ProgramLanguage::Node => {
                let mut cmd = Command::new("node");
                cmd.arg(&spec.entrypoint);
                cmd
            }
            ProgramLanguage::Binary => Command::new(workdir.join(&spec.entrypoint)),
        };
        cmd.current_dir(workdir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> SandboxResult<RunOutcome> {
        // Stage the working directory: either caller-provided (durable) or
        // a tempdir discarded after the run.
        let staging;
        let workdir: PathBuf = match &request.working_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(SandboxError::Staging)?;
                dir.clone()
            }
            None => {
                staging = tempfile::tempdir().map_err(SandboxError::Staging)?;
                staging.path().to_path_buf()
            }
        };

        let mut staged: HashSet<String> = HashSet::new();
        for file in &request.spec.files {
            let path = workdir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(SandboxError::Staging)?;
            }
            tokio::fs::write(&path, &file.contents)
                .await
                .map_err(SandboxError::Staging)?;
            staged.insert(file.path.clone());
        }

        let mut cmd = self.command(&request, &workdir);

        tracing::debug!(
            target: TRACING_TARGET,
            language = %request.spec.language,
            entrypoint = %request.spec.entrypoint,
            timeout_secs = request.timeout.as_secs(),
            "Launching sandboxed process"
        );

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        // kill_on_drop terminates the child when the output future is
        // dropped by timeout or cancellation.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(target: TRACING_TARGET, "Sandboxed process cancelled");
                return Err(SandboxError::Cancelled);
            }
            waited = tokio::time::timeout(request.timeout, child.wait_with_output()) => {
                match waited {
                    Err(_) => {
                        tracing::debug!(
                            target: TRACING_TARGET,
                            timeout_secs = request.timeout.as_secs(),
                            "Sandboxed process killed on timeout"
                        );
                        return Ok(RunOutcome {
                            exit_code: None,
                            stdout: String::new(),
                            stderr: String::new(),
                            output_files: Vec::new(),
                            duration: request.timeout,
                            resource_usage: ResourceUsage::default(),
                            timed_out: true,
                            resource_exceeded: false,
                        });
                    }
                    Ok(result) => result?,
                }
            }
        };

        let duration = start.elapsed();
        let output_files = collect_output_files(&workdir, &staged).await;

        // A SIGKILL with no exit code is how the kernel reports an
        // out-of-memory kill for this backend.
        let resource_exceeded = killed_by_sigkill(&output.status);

        Ok(RunOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            output_files,
            duration,
            // The process backend does not meter cpu/memory/disk.
            resource_usage: ResourceUsage::default(),
            timed_out: false,
            resource_exceeded,
        })
    }
}

#[cfg(unix)]
fn killed_by_sigkill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    const SIGKILL: i32 = 9;
    status.signal() == Some(SIGKILL)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &std::process::ExitStatus) -> bool {
    false
}

/// Lists files present in the working directory that were not staged in,
/// i.e. outputs the program produced.
async fn collect_output_files(workdir: &Path, staged: &HashSet<String>) -> Vec<String> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(workdir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !staged.contains(&name) {
            files.push(name);
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::spec::ExecutableSpec;

    #[tokio::test]
    async fn test_inline_command() {
        let sandbox = ProcessSandbox::new();
        let request = RunRequest::new(ExecutableSpec::shell("echo hello"));
        let outcome = sandbox
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exit_code_preserved() {
        let sandbox = ProcessSandbox::new();
        let request = RunRequest::new(ExecutableSpec::shell("exit 42"));
        let outcome = sandbox
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(42));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_env_passed_through() {
        let sandbox = ProcessSandbox::new();
        let request =
            RunRequest::new(ExecutableSpec::shell("printf '%s' \"$GREETING\""))
                .with_env("GREETING", "hi");
        let outcome = sandbox
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "hi");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let sandbox = ProcessSandbox::new();
        let request = RunRequest::new(ExecutableSpec::shell("sleep 30"))
            .with_timeout(Duration::from_millis(100));
        let outcome = sandbox
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let sandbox = ProcessSandbox::new();
        let request = RunRequest::new(ExecutableSpec::shell("sleep 30"));
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let result = sandbox.run(request, cancel).await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[tokio::test]
    async fn test_staged_script_and_output_files() {
        let sandbox = ProcessSandbox::new();
        let spec = ExecutableSpec::program(
            ProgramLanguage::Shell,
            "main.sh",
            vec![crate::spec::SourceFile::new(
                "main.sh",
                "printf ok > result.txt\n",
            )],
        );
        let outcome = sandbox
            .run(RunRequest::new(spec), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.output_files, vec!["result.txt".to_string()]);
    }
}

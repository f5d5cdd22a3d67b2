//! Shell executor built on `tokio::process`.

use async_trait::async_trait;
use branchship_core::Error;
use branchship_core::executor::{CommandExecutor, CommandOutput};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default ceiling for each captured output stream.
pub const DEFAULT_MAX_OUTPUT: usize = 10 * 1024 * 1024;

/// Runs commands through `sh -c` and captures bounded stdout/stderr.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    max_output: usize,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    /// Create an executor with a custom per-stream output ceiling.
    pub fn with_max_output(max_output: usize) -> Self {
        Self { max_output }
    }
}

/// Captured stream contents and whether the ceiling was exceeded.
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

/// Read up to `limit` bytes, then keep draining so the child never blocks on
/// a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut reader).take(limit as u64 + 1).read_to_end(&mut bytes).await?;

    let overflowed = bytes.len() > limit;
    if overflowed {
        bytes.truncate(limit);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }

    Ok(Captured { bytes, overflowed })
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str, cwd: &Path) -> CommandOutput {
        info!(command = %command, cwd = %cwd.display(), "Running command");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to spawn command");
                return CommandOutput::failed(format!("failed to spawn `{}`: {}", command, e));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return CommandOutput::failed(format!("`{}` has no output pipes", command));
        };

        let (stdout, stderr) = tokio::join!(
            read_bounded(stdout, self.max_output),
            read_bounded(stderr, self.max_output)
        );
        let status = child.wait().await;

        let (stdout, stderr, status) = match (stdout, stderr, status) {
            (Ok(out), Ok(err), Ok(status)) => (out, err, status),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!(command = %command, error = %e, "Failed to collect command output");
                return CommandOutput::failed(format!("failed to run `{}`: {}", command, e));
            }
        };

        let stdout_text = String::from_utf8_lossy(&stdout.bytes).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr.bytes).into_owned();

        if stdout.overflowed || stderr.overflowed {
            let error = Error::OutputTooLarge {
                limit: self.max_output,
            };
            warn!(command = %command, error = %error, "Command output discarded");
            return CommandOutput {
                success: false,
                exit_code: status.code(),
                stdout: stdout_text,
                stderr: stderr_text,
                error: format!("`{}`: {}", command, error),
            };
        }

        if !status.success() {
            let detail = stderr_text.trim();
            let error = match status.code() {
                Some(code) if detail.is_empty() => {
                    format!("`{}` exited with code {}", command, code)
                }
                Some(code) => format!("`{}` exited with code {}: {}", command, code, detail),
                None => format!("`{}` was terminated by a signal", command),
            };
            warn!(command = %command, exit_code = ?status.code(), "Command failed");
            return CommandOutput {
                success: false,
                exit_code: status.code(),
                stdout: stdout_text,
                stderr: stderr_text,
                error,
            };
        }

        let diagnostics = stderr_text.trim();
        if !diagnostics.is_empty() {
            if diagnostics.contains("warning") {
                debug!(command = %command, stderr = %diagnostics, "Command reported warnings");
            } else {
                warn!(command = %command, stderr = %diagnostics, "Command wrote to stderr");
            }
        }

        CommandOutput {
            success: true,
            exit_code: status.code(),
            stdout: stdout_text,
            stderr: stderr_text,
            error: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShellExecutor::new().run("echo hello", dir.path()).await;

        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.error.is_empty());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let output = ShellExecutor::new().run("cat marker.txt", dir.path()).await;
        assert!(output.success);
        assert_eq!(output.stdout, "here");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShellExecutor::new()
            .run("echo broken >&2; exit 3", dir.path())
            .await;

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert!(output.error.contains("code 3"));
        assert!(output.error.contains("broken"));
    }

    #[tokio::test]
    async fn test_stderr_warnings_do_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShellExecutor::new()
            .run("echo 'npm warning deprecated' >&2; echo done", dir.path())
            .await;

        assert!(output.success);
        assert!(output.stderr.contains("warning"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_failure() {
        let output = ShellExecutor::new()
            .run("echo hi", Path::new("/definitely/not/here"))
            .await;
        assert!(!output.success);
        assert!(output.error.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_output_over_ceiling_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = ShellExecutor::with_max_output(1024)
            .run("head -c 4096 /dev/zero", dir.path())
            .await;

        assert!(!output.success);
        assert_eq!(output.stdout.len(), 1024);
        assert!(output.error.contains("exceeded 1024 bytes"));
    }
}

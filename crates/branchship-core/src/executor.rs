//! Command executor trait.
//!
//! Every version-control call, dependency install and build command goes
//! through a `CommandExecutor`, so the build engine never spawns processes
//! directly and tests can script command results.

use async_trait::async_trait;
use std::path::Path;

/// Captured result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Human-readable failure description; empty on success.
    pub error: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: error.into(),
        }
    }
}

/// Runs shell commands against a working directory.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` through the shell with `cwd` as the working directory.
    ///
    /// Never retries. Spawn failures and non-zero exits come back as
    /// `success == false` rather than as an error.
    async fn run(&self, command: &str, cwd: &Path) -> CommandOutput;
}

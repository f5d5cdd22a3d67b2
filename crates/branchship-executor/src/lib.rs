//! Command execution backend for Branchship.
//!
//! Provides the shell executor the build pipeline runs every external
//! command through.

pub mod shell;

pub use branchship_core::executor::{CommandExecutor, CommandOutput};
pub use shell::{DEFAULT_MAX_OUTPUT, ShellExecutor};

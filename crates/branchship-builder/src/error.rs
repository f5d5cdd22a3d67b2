//! Fatal pipeline failures.

use branchship_core::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// The first fatal failure of a pipeline run. Each message is meant to be
/// shown to the person who requested the build.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("working copy not found: {}", .0.display())]
    MissingWorkingCopy(PathBuf),

    #[error("fetch failed after {attempts} attempts: {message}")]
    Fetch { attempts: u32, message: String },

    #[error("checkout of '{branch}' failed: {message}")]
    Checkout { branch: String, message: String },

    #[error("pull failed after {attempts} attempts: {message}")]
    Pull { attempts: u32, message: String },

    #[error("dependency install failed: {0}")]
    Install(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("build output directory not found: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("packaging failed: {0}")]
    Archive(String),

    #[error("cancelled before {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    /// Stage the failure belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::MissingWorkingCopy(_) => Stage::Check,
            PipelineError::Fetch { .. }
            | PipelineError::Checkout { .. }
            | PipelineError::Pull { .. } => Stage::Fetch,
            PipelineError::Install(_) => Stage::Install,
            PipelineError::Build(_) => Stage::Build,
            PipelineError::MissingOutput(_) | PipelineError::Archive(_) => Stage::Compress,
            PipelineError::Cancelled { stage } => *stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Archive(e.to_string())
    }
}

impl From<zip::result::ZipError> for PipelineError {
    fn from(e: zip::result::ZipError) -> Self {
        PipelineError::Archive(e.to_string())
    }
}

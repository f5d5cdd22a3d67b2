//! Error types for Branchship.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("command output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

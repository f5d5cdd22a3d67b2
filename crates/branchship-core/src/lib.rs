//! Core domain types and traits for Branchship.
//!
//! This crate contains:
//! - Task identifiers and branch names
//! - Build tasks and their lifecycle states
//! - Progress events and sinks
//! - The command executor and notifier traits the build engine calls into
//! - The `Outcome` type for best-effort operations

pub mod branch;
pub mod error;
pub mod executor;
pub mod id;
pub mod notify;
pub mod outcome;
pub mod progress;
pub mod task;

pub use branch::BranchName;
pub use error::{Error, Result};
pub use id::TaskId;
pub use outcome::Outcome;
pub use progress::{ProgressEvent, ProgressSink, Stage};
pub use task::{BuildTask, TaskState};

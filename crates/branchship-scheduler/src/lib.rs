//! Build scheduling for Branchship.
//!
//! At most one build runs per process because every build shares the same
//! working copy. Further requests wait in a FIFO queue and are dispatched
//! after a short settle delay once the running build reaches a terminal state.

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{Admission, CancelReport, QueueSnapshot, RunningTask};
pub use scheduler::{BatchAdmission, BatchEntry, Scheduler};
pub use worker::{BuildWorker, TaskProgress, TaskRunner};

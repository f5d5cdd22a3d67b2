//! The single-flight build scheduler.

use branchship_builder::{BranchResolver, BranchValidation};
use branchship_config::BuildConfig;
use branchship_core::{BranchName, BuildTask, Error, Outcome, Result, TaskState};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::queue::{Admission, CancelReport, QueueSnapshot, QueueState, RunningTask};
use crate::worker::TaskRunner;

/// Per-branch result of a batch admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    Started,
    Queued { position: usize },
    Duplicate,
    /// The branch does not exist in the working copy.
    Unknown,
    /// Malformed name or not on the allow-list.
    Rejected { reason: String },
}

/// Outcome of [`Scheduler::admit_many`], in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchAdmission {
    pub entries: Vec<(String, BatchEntry)>,
    /// Set when branch validation fell back to accepting every name.
    pub warning: Option<String>,
}

impl BatchAdmission {
    /// Number of branches that were started or queued.
    pub fn admitted(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, BatchEntry::Started | BatchEntry::Queued { .. }))
            .count()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    runner: Arc<dyn TaskRunner>,
    config: Arc<BuildConfig>,
    /// `true` while a task runs, settles, or waits.
    busy: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits build requests and runs them one at a time in FIFO order.
///
/// Cloning is cheap; every clone drives the same queue. Admission and
/// cancellation never block on a running build. Must be used from within a
/// Tokio runtime: starting a task spawns the worker loop.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn TaskRunner>, config: Arc<BuildConfig>) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new()),
                runner,
                config,
                busy,
            }),
        }
    }

    /// Start `task` if idle, otherwise queue it.
    ///
    /// Fails with [`Error::Rejected`] when the requester or branch is not
    /// allowed. Duplicates are not an error; they return
    /// [`Admission::Duplicate`].
    pub fn admit(&self, task: BuildTask) -> Result<Admission> {
        let config = &self.shared.config;
        if !config.is_requester_allowed(&task.requester) {
            return Err(Error::Rejected(format!(
                "requester {} is not allowed to start builds",
                task.requester
            )));
        }
        if !config.is_branch_allowed(task.branch.as_str()) {
            return Err(Error::Rejected(format!(
                "branch {} is not in the allowed list",
                task.branch
            )));
        }

        let branch = task.branch.clone();
        let (admission, running) = {
            let mut state = self.shared.lock();
            let result = state.admit(task);
            if result.1.is_some() {
                self.shared.busy.send_replace(true);
            }
            result
        };

        match &admission {
            Admission::Started { task_id } => info!(task_id = %task_id, branch = %branch, "Build started"),
            Admission::Queued { task_id, position } => {
                info!(task_id = %task_id, branch = %branch, position, "Build queued")
            }
            Admission::Duplicate => info!(branch = %branch, "Duplicate build request ignored"),
        }

        if let Some(running) = running {
            tokio::spawn(drive(self.shared.clone(), running));
        }
        Ok(admission)
    }

    /// Validate `names` against the working copy and admit the known ones in
    /// order.
    ///
    /// Fails only when the requester is not allowed. Per-branch problems are
    /// reported in the returned entries.
    pub async fn admit_many(
        &self,
        resolver: &BranchResolver,
        names: &[String],
        requester: &str,
        destination: &str,
    ) -> Result<BatchAdmission> {
        if !self.shared.config.is_requester_allowed(requester) {
            return Err(Error::Rejected(format!(
                "requester {} is not allowed to start builds",
                requester
            )));
        }

        let mut entries: Vec<(String, Option<BatchEntry>)> = Vec::with_capacity(names.len());
        let mut candidates: Vec<BranchName> = Vec::new();

        for raw in names {
            match BranchName::parse(raw) {
                Err(e) => entries.push((
                    raw.clone(),
                    Some(BatchEntry::Rejected {
                        reason: e.to_string(),
                    }),
                )),
                Ok(branch) if !self.shared.config.is_branch_allowed(branch.as_str()) => {
                    entries.push((
                        branch.to_string(),
                        Some(BatchEntry::Rejected {
                            reason: "not in the allowed list".to_string(),
                        }),
                    ))
                }
                Ok(branch) => {
                    entries.push((branch.to_string(), None));
                    candidates.push(branch);
                }
            }
        }

        let validation = if candidates.is_empty() {
            Outcome::Ok(BranchValidation::default())
        } else {
            let names: Vec<String> = candidates.iter().map(ToString::to_string).collect();
            resolver.validate_many(&names).await
        };
        let warning = validation.warning().map(str::to_string);
        let validation = validation.into_value();

        let mut candidates = candidates.into_iter();
        for (name, entry) in entries.iter_mut().filter(|(_, e)| e.is_none()) {
            let Some(branch) = candidates.next() else {
                break;
            };
            if validation.invalid.contains(name) {
                *entry = Some(BatchEntry::Unknown);
                continue;
            }
            *entry = Some(match self.admit(BuildTask::new(branch, requester, destination)) {
                Ok(Admission::Started { .. }) => BatchEntry::Started,
                Ok(Admission::Queued { position, .. }) => BatchEntry::Queued { position },
                Ok(Admission::Duplicate) => BatchEntry::Duplicate,
                Err(e) => BatchEntry::Rejected {
                    reason: e.to_string(),
                },
            });
        }

        Ok(BatchAdmission {
            entries: entries
                .into_iter()
                .map(|(name, entry)| (name, entry.unwrap_or(BatchEntry::Unknown)))
                .collect(),
            warning,
        })
    }

    /// Cancel the running build of `branch`, if any, and drop every queued
    /// request for it.
    ///
    /// The running build stops at its next checkpoint; this call does not
    /// wait for it.
    pub fn cancel(&self, branch: &str) -> CancelReport {
        let report = self.shared.lock().cancel(branch);
        if report.is_empty() {
            info!(branch = %branch, "Nothing to cancel");
        } else {
            info!(
                branch = %branch,
                cancelled_running = report.cancelled_running,
                removed_from_queue = report.removed_from_queue,
                "Cancellation requested"
            );
        }
        report
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn is_busy(&self) -> bool {
        *self.shared.busy.borrow()
    }

    /// Wait until nothing is running, settling, or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.busy.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}

/// Worker loop: run the task, release the worker, settle, dispatch the next.
async fn drive(shared: Arc<Shared>, mut running: RunningTask) {
    loop {
        let task_id = running.task.id;
        let branch = running.task.branch.clone();

        let state = AssertUnwindSafe(shared.runner.run(&running.task, running.cancel.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(task_id = %task_id, branch = %branch, "Build task panicked");
                TaskState::Failed {
                    message: "build task panicked".to_string(),
                }
            });

        match &state {
            TaskState::Completed => info!(task_id = %task_id, branch = %branch, "Build completed"),
            TaskState::Cancelled => warn!(task_id = %task_id, branch = %branch, "Build cancelled"),
            TaskState::Failed { message } => {
                error!(task_id = %task_id, branch = %branch, error = %message, "Build failed")
            }
            other => warn!(task_id = %task_id, state = ?other, "Runner returned a non-terminal state"),
        }

        shared.lock().finish(task_id);
        tokio::time::sleep(shared.config.timings.settle_delay).await;

        let next = {
            let mut state = shared.lock();
            let next = state.dispatch_next();
            if next.is_none() {
                shared.busy.send_replace(false);
            }
            next
        };

        match next {
            Some(next) => {
                info!(task_id = %next.task.id, branch = %next.task.branch, "Dequeued build");
                running = next;
            }
            None => {
                info!("Build queue drained");
                break;
            }
        }
    }
}

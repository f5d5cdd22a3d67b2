//! Scheduler state: the running task, the settle window and the FIFO queue.
//!
//! Pure bookkeeping with no I/O. The scheduler owns one `QueueState` behind a
//! mutex and every mutation goes through the methods below.

use branchship_core::{BranchName, BuildTask, TaskId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Result of admitting one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The worker was idle and the task is now running.
    Started { task_id: TaskId },
    /// The task waits at `position` (1-based) in the queue.
    Queued { task_id: TaskId, position: usize },
    /// A task for the same branch is already running or queued.
    Duplicate,
}

/// What a cancel request affected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub cancelled_running: bool,
    pub removed_from_queue: usize,
}

impl CancelReport {
    pub fn is_empty(&self) -> bool {
        !self.cancelled_running && self.removed_from_queue == 0
    }
}

/// The task currently holding the worker, with its cancellation token.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task: BuildTask,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl RunningTask {
    fn start(task: BuildTask) -> Self {
        Self {
            task,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running: Option<RunningSummary>,
    /// True between a task finishing and the next dispatch.
    pub settling: bool,
    pub waiting: Vec<WaitingSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningSummary {
    pub task_id: TaskId,
    pub branch: BranchName,
    pub requester: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitingSummary {
    pub task_id: TaskId,
    pub branch: BranchName,
    pub requester: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.running.is_none() && !self.settling && self.waiting.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct QueueState {
    current: Option<RunningTask>,
    settling: bool,
    waiting: VecDeque<BuildTask>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the worker is taken, either by a running task or by the
    /// settle window that follows one.
    pub fn is_busy(&self) -> bool {
        self.current.is_some() || self.settling
    }

    pub fn current(&self) -> Option<&RunningTask> {
        self.current.as_ref()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    fn holds_branch(&self, branch: &BranchName) -> bool {
        self.current.as_ref().is_some_and(|c| &c.task.branch == branch)
            || self.waiting.iter().any(|t| &t.branch == branch)
    }

    /// Start `task` if the worker is free, otherwise append it to the queue.
    ///
    /// Returns the running task alongside `Started` so the caller can
    /// dispatch it.
    pub fn admit(&mut self, task: BuildTask) -> (Admission, Option<RunningTask>) {
        if self.holds_branch(&task.branch) {
            return (Admission::Duplicate, None);
        }

        let task_id = task.id;
        if self.is_busy() {
            self.waiting.push_back(task);
            let position = self.waiting.len();
            return (Admission::Queued { task_id, position }, None);
        }

        let running = RunningTask::start(task);
        self.current = Some(running.clone());
        (Admission::Started { task_id }, Some(running))
    }

    /// Flag the running task for cancellation when it matches `branch` and
    /// drop every queued task for it. Both happen under the same borrow, so a
    /// cancel is atomic with respect to admissions and dispatch.
    pub fn cancel(&mut self, branch: &str) -> CancelReport {
        let mut report = CancelReport::default();

        if let Some(current) = self.current.as_ref().filter(|c| c.task.branch == branch) {
            current.cancel.cancel();
            report.cancelled_running = true;
        }

        let before = self.waiting.len();
        self.waiting.retain(|t| t.branch != branch);
        report.removed_from_queue = before - self.waiting.len();

        report
    }

    /// Release the worker after `task_id` reached a terminal state and open
    /// the settle window.
    pub fn finish(&mut self, task_id: TaskId) {
        if self.current.as_ref().is_some_and(|c| c.task.id == task_id) {
            self.current = None;
            self.settling = true;
        }
    }

    /// Close the settle window and start the next queued task, if any.
    pub fn dispatch_next(&mut self) -> Option<RunningTask> {
        self.settling = false;
        let next = RunningTask::start(self.waiting.pop_front()?);
        self.current = Some(next.clone());
        Some(next)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running: self.current.as_ref().map(|c| RunningSummary {
                task_id: c.task.id,
                branch: c.task.branch.clone(),
                requester: c.task.requester.clone(),
                started_at: c.started_at,
                cancel_requested: c.cancel.is_cancelled(),
            }),
            settling: self.settling,
            waiting: self
                .waiting
                .iter()
                .map(|t| WaitingSummary {
                    task_id: t.id,
                    branch: t.branch.clone(),
                    requester: t.requester.clone(),
                    enqueued_at: t.enqueued_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(branch: &str) -> BuildTask {
        BuildTask::new(BranchName::parse(branch).unwrap(), "1001", "chat-1")
    }

    fn branches(state: &QueueState) -> Vec<String> {
        state
            .snapshot()
            .waiting
            .iter()
            .map(|w| w.branch.to_string())
            .collect()
    }

    #[test]
    fn test_cold_start_runs_immediately() {
        let mut state = QueueState::new();
        let (admission, running) = state.admit(task("main"));

        assert!(matches!(admission, Admission::Started { .. }));
        assert_eq!(running.unwrap().task.branch, "main");
        assert!(state.is_busy());
        assert_eq!(state.current().unwrap().task.branch, "main");
        assert_eq!(state.waiting_len(), 0);
    }

    #[test]
    fn test_busy_worker_queues_in_order() {
        let mut state = QueueState::new();
        state.admit(task("main"));

        let (second, _) = state.admit(task("dev"));
        let (third, _) = state.admit(task("release"));

        assert!(matches!(second, Admission::Queued { position: 1, .. }));
        assert!(matches!(third, Admission::Queued { position: 2, .. }));
        assert_eq!(branches(&state), vec!["dev", "release"]);
    }

    #[test]
    fn test_duplicate_of_running_or_queued_is_refused() {
        let mut state = QueueState::new();
        state.admit(task("main"));
        state.admit(task("dev"));

        assert_eq!(state.admit(task("main")).0, Admission::Duplicate);
        assert_eq!(state.admit(task("dev")).0, Admission::Duplicate);
        assert_eq!(state.waiting_len(), 1);
    }

    #[test]
    fn test_settle_window_keeps_worker_busy() {
        let mut state = QueueState::new();
        let (_, running) = state.admit(task("main"));
        state.finish(running.unwrap().task.id);

        assert!(state.current().is_none());
        assert!(state.is_busy());
        assert!(matches!(
            state.admit(task("dev")).0,
            Admission::Queued { position: 1, .. }
        ));

        let next = state.dispatch_next().unwrap();
        assert_eq!(next.task.branch, "dev");
        assert_eq!(state.current().unwrap().task.id, next.task.id);
    }

    #[test]
    fn test_dispatch_on_empty_queue_goes_idle() {
        let mut state = QueueState::new();
        let (_, running) = state.admit(task("main"));
        state.finish(running.unwrap().task.id);

        assert!(state.dispatch_next().is_none());
        assert!(!state.is_busy());
        assert!(state.snapshot().is_idle());
    }

    #[test]
    fn test_finish_ignores_stale_task_id() {
        let mut state = QueueState::new();
        state.admit(task("main"));
        state.finish(TaskId::new());

        assert_eq!(state.current().unwrap().task.branch, "main");
        assert!(!state.snapshot().settling);
    }

    #[test]
    fn test_cancel_running_flags_token() {
        let mut state = QueueState::new();
        let (_, running) = state.admit(task("main"));
        let running = running.unwrap();

        let report = state.cancel("main");

        assert!(report.cancelled_running);
        assert_eq!(report.removed_from_queue, 0);
        assert!(running.cancel.is_cancelled());
        assert!(state.snapshot().running.unwrap().cancel_requested);
    }

    #[test]
    fn test_cancel_queued_removes_entry() {
        let mut state = QueueState::new();
        state.admit(task("main"));
        state.admit(task("dev"));
        state.admit(task("release"));

        let report = state.cancel("dev");

        assert!(!report.cancelled_running);
        assert_eq!(report.removed_from_queue, 1);
        assert_eq!(branches(&state), vec!["release"]);
        assert!(!state.current().unwrap().cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_branch_is_empty() {
        let mut state = QueueState::new();
        state.admit(task("main"));
        assert!(state.cancel("nope").is_empty());
    }

    #[test]
    fn test_new_task_gets_fresh_token() {
        let mut state = QueueState::new();
        let (_, running) = state.admit(task("main"));
        state.cancel("main");
        state.finish(running.unwrap().task.id);
        state.dispatch_next();

        let (_, running) = state.admit(task("main"));
        assert!(!running.unwrap().cancel.is_cancelled());
    }
}

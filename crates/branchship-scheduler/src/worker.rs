//! Task execution: run the pipeline, report, deliver, clean up.

use async_trait::async_trait;
use branchship_builder::{
    ArchivePart, BuildPipeline, BuildReport, remove_parts, split_archive,
};
use branchship_config::SplitConfig;
use branchship_core::notify::Notifier;
use branchship_core::progress::MonotonicSink;
use branchship_core::{BranchName, BuildTask, ProgressEvent, ProgressSink, TaskId, TaskState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Executes one admitted task to a terminal state.
///
/// Implementations must not panic; every failure is folded into the
/// returned state.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &BuildTask, cancel: CancellationToken) -> TaskState;
}

/// A progress event tagged with the task it belongs to.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub branch: BranchName,
    pub destination: String,
    pub event: ProgressEvent,
}

/// Forwards pipeline progress for one task. Goes quiet once the task is
/// cancelled.
struct TaskSink {
    task_id: TaskId,
    branch: BranchName,
    destination: String,
    cancel: CancellationToken,
    tx: Option<mpsc::UnboundedSender<TaskProgress>>,
}

impl ProgressSink for TaskSink {
    fn emit(&self, event: ProgressEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!(
            task_id = %self.task_id,
            stage = %event.stage,
            percent = event.percent,
            message = %event.message,
            "Build progress"
        );
        if let Some(tx) = &self.tx {
            let progress = TaskProgress {
                task_id: self.task_id,
                branch: self.branch.clone(),
                destination: self.destination.clone(),
                event,
            };
            if tx.send(progress).is_err() {
                debug!("Progress receiver dropped");
            }
        }
    }
}

/// Runs the build pipeline for a task and delivers the archive through a
/// [`Notifier`].
///
/// The archive is removed after every run, whether delivery succeeded,
/// failed, or was cancelled.
pub struct BuildWorker {
    pipeline: Arc<BuildPipeline>,
    notifier: Arc<dyn Notifier>,
    split: Option<SplitConfig>,
    progress: Option<mpsc::UnboundedSender<TaskProgress>>,
}

impl BuildWorker {
    pub fn new(pipeline: Arc<BuildPipeline>, notifier: Arc<dyn Notifier>) -> Self {
        let split = pipeline.config().split;
        Self {
            pipeline,
            notifier,
            split,
            progress: None,
        }
    }

    /// Forward progress events to `tx`.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<TaskProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    async fn notify(&self, destination: &str, text: &str) {
        if let Err(e) = self.notifier.send_message(destination, text).await {
            warn!(destination = %destination, error = %e, "Failed to send message");
        }
    }

    /// Split if needed, report, and upload. Returns the terminal state.
    ///
    /// Nothing reaches the destination once `cancel` has fired.
    async fn deliver(
        &self,
        task: &BuildTask,
        report: &BuildReport,
        artifacts: &mut Artifacts,
        cancel: &CancellationToken,
    ) -> TaskState {
        if cancel.is_cancelled() {
            info!(task_id = %task.id, branch = %task.branch, "Cancelled after build, discarding archive");
            return TaskState::Cancelled;
        }

        let parts = self.parts_for(report).await;
        artifacts.track(&parts);

        if cancel.is_cancelled() {
            info!(task_id = %task.id, branch = %task.branch, "Cancelled before upload, discarding archive");
            return TaskState::Cancelled;
        }

        debug!(task_id = %task.id, state = ?TaskState::Uploading, "Task state changed");
        self.notify(&task.destination, &summary_message(report)).await;

        for part in &parts {
            let caption = caption_for(report, part);
            if let Err(e) = self
                .notifier
                .send_file(&task.destination, &part.path, &caption)
                .await
            {
                warn!(
                    task_id = %task.id,
                    file = %part.name,
                    error = %e,
                    "Upload failed"
                );
                self.notify(
                    &task.destination,
                    &format!("Upload of {} failed: {}", part.name, e),
                )
                .await;
                break;
            }
            info!(task_id = %task.id, file = %part.name, "Uploaded archive");
        }

        TaskState::Completed
    }

    /// The files to upload: the archive itself, or its parts when it is over
    /// the split threshold. Falls back to the whole archive if splitting fails.
    async fn parts_for(&self, report: &BuildReport) -> Vec<ArchivePart> {
        let archive = &report.archive;
        let whole = vec![ArchivePart {
            path: archive.path.clone(),
            name: archive.file_name.clone(),
            part: 1,
            total: 1,
        }];

        let Some(split) = self.split else {
            return whole;
        };
        if archive.size_bytes <= split.threshold_mb * BYTES_PER_MB {
            return whole;
        }

        match split_archive(&archive.path, split.chunk_mb * BYTES_PER_MB).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(archive = %archive.file_name, error = %e, "Split failed, sending whole archive");
                whole
            }
        }
    }
}

#[async_trait]
impl TaskRunner for BuildWorker {
    async fn run(&self, task: &BuildTask, cancel: CancellationToken) -> TaskState {
        let sink: Arc<dyn ProgressSink> = Arc::new(MonotonicSink::new(TaskSink {
            task_id: task.id,
            branch: task.branch.clone(),
            destination: task.destination.clone(),
            cancel: cancel.clone(),
            tx: self.progress.clone(),
        }));

        let report = match self.pipeline.run(&task.branch, sink, &cancel).await {
            Ok(report) => report,
            Err(e) if e.is_cancelled() => {
                info!(task_id = %task.id, branch = %task.branch, stage = %e.stage(), "Build cancelled");
                return TaskState::Cancelled;
            }
            Err(e) => {
                let message = e.to_string();
                self.notify(
                    &task.destination,
                    &format!("Build of {} failed at {}: {}", task.branch, e.stage(), message),
                )
                .await;
                return TaskState::Failed { message };
            }
        };

        let mut artifacts = Artifacts::new(&report);
        let state = self.deliver(task, &report, &mut artifacts, &cancel).await;
        artifacts.remove().await;
        state
    }
}

fn summary_message(report: &BuildReport) -> String {
    let mut text = format!(
        "Build of {} complete\nSize: {:.2} MB\nBuild time: {}s\nTotal time: {}s\nCommit: {}",
        report.branch,
        report.archive.size_mb,
        report.build_duration.as_secs(),
        report.total_duration.as_secs(),
        report.commit_info,
    );
    for warning in &report.warnings {
        text.push_str("\nWarning: ");
        text.push_str(warning);
    }
    text
}

fn caption_for(report: &BuildReport, part: &ArchivePart) -> String {
    if part.total > 1 {
        format!("{} (part {}/{})", report.branch, part.part, part.total)
    } else {
        format!("{} ({:.2} MB)", report.branch, report.archive.size_mb)
    }
}

/// Files a run left on disk: the archive and any split parts.
///
/// Removed by [`Artifacts::remove`] on the normal path; whatever is still
/// tracked when the value is dropped (a panic while delivering) is removed
/// synchronously.
struct Artifacts {
    files: Vec<ArchivePart>,
}

impl Artifacts {
    fn new(report: &BuildReport) -> Self {
        Self {
            files: vec![ArchivePart {
                path: report.archive.path.clone(),
                name: report.archive.file_name.clone(),
                part: 1,
                total: 1,
            }],
        }
    }

    fn track(&mut self, parts: &[ArchivePart]) {
        for part in parts {
            if !self.files.iter().any(|f| f.path == part.path) {
                self.files.push(part.clone());
            }
        }
    }

    async fn remove(mut self) {
        remove_parts(&self.files).await;
        debug!(files = self.files.len(), "Removed build artifacts");
        self.files.clear();
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        for file in &self.files {
            match std::fs::remove_file(&file.path) {
                Ok(()) => debug!(path = %file.path.display(), "Removed abandoned artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.path.display(), error = %e, "Failed to remove artifact"),
            }
        }
    }
}

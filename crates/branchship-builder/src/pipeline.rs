//! The build pipeline: check, checkout and sync, install, build, package.
//!
//! Stages run strictly in order and the first fatal failure ends the run.
//! Cancellation is cooperative: the token is checked between stages, never
//! while an external command is running.

use branchship_config::BuildConfig;
use branchship_core::executor::CommandExecutor;
use branchship_core::{BranchName, Outcome, ProgressEvent, ProgressSink, Stage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::{ArchivePackager, PACKAGE_PERCENT_END, PACKAGE_PERCENT_START, PackagedArchive};
use crate::PipelineError;

const CHECK_PERCENT: u8 = 5;
const FETCH_PERCENT: u8 = 10;
const INSTALL_PERCENT: u8 = 30;
const BUILD_PERCENT_START: u8 = 40;
const BUILD_PERCENT_END: u8 = 70;

const COMMIT_DESCRIPTOR_COMMAND: &str = "git log -1 --pretty=format:\"%h - %s (%an, %ar)\"";

/// Summary of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub branch: BranchName,
    /// One-line description of the built commit.
    pub commit_info: String,
    pub build_duration: Duration,
    pub total_duration: Duration,
    pub archive: PackagedArchive,
    /// Degraded-but-continued steps, in the order they happened.
    pub warnings: Vec<String>,
}

/// Runs the build stages for one branch against the shared working copy.
pub struct BuildPipeline {
    executor: Arc<dyn CommandExecutor>,
    config: Arc<BuildConfig>,
    packager: ArchivePackager,
}

impl BuildPipeline {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: Arc<BuildConfig>) -> Self {
        let packager = ArchivePackager::new(config.compression_level);
        Self {
            executor,
            config,
            packager,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run every stage for `branch`.
    ///
    /// The archive in the returned report belongs to the caller, who must
    /// delete it once it has been delivered.
    pub async fn run(
        &self,
        branch: &BranchName,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, PipelineError> {
        info!(branch = %branch, "Starting build pipeline");
        let started = Instant::now();

        let result = self.run_stages(branch, sink, cancel, started).await;
        match &result {
            Ok(report) => info!(
                branch = %branch,
                total_secs = report.total_duration.as_secs_f64(),
                archive = %report.archive.file_name,
                "Build pipeline succeeded"
            ),
            Err(e) if e.is_cancelled() => warn!(branch = %branch, error = %e, "Build pipeline cancelled"),
            Err(e) => error!(branch = %branch, stage = %e.stage(), error = %e, "Build pipeline failed"),
        }
        result
    }

    async fn run_stages(
        &self,
        branch: &BranchName,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<BuildReport, PipelineError> {
        let mut warnings = Vec::new();

        checkpoint(cancel, Stage::Check)?;
        sink.emit(ProgressEvent::new(Stage::Check, CHECK_PERCENT, "checking working copy"));
        self.check_exists().await?;

        checkpoint(cancel, Stage::Fetch)?;
        sink.emit(ProgressEvent::new(
            Stage::Fetch,
            FETCH_PERCENT,
            format!("switching to {} and syncing", branch),
        ));
        let commit = self.checkout_and_sync(branch, sink.as_ref()).await?;
        if let Some(warning) = commit.warning() {
            warnings.push(warning.to_string());
        }
        let commit_info = commit.into_value();

        checkpoint(cancel, Stage::Install)?;
        sink.emit(ProgressEvent::new(
            Stage::Install,
            INSTALL_PERCENT,
            "checking dependencies",
        ));
        if let Outcome::Degraded { warning, .. } = self.install_dependencies().await? {
            warnings.push(warning);
        }

        checkpoint(cancel, Stage::Build)?;
        sink.emit(ProgressEvent::new(
            Stage::Build,
            BUILD_PERCENT_START,
            "building project",
        ));
        let build_duration = self.run_build(sink.as_ref()).await?;

        checkpoint(cancel, Stage::Compress)?;
        sink.emit(ProgressEvent::new(
            Stage::Package,
            PACKAGE_PERCENT_START,
            "packaging build output",
        ));
        let archive = self
            .packager
            .package(
                &self.config.output_path(),
                &self.config.archive_dir,
                branch.as_str(),
                sink.clone(),
            )
            .await?;
        sink.emit(ProgressEvent::new(
            Stage::Package,
            PACKAGE_PERCENT_END,
            format!("packaged {} ({:.2} MB)", archive.file_name, archive.size_mb),
        ));

        Ok(BuildReport {
            branch: branch.clone(),
            commit_info,
            build_duration,
            total_duration: started.elapsed(),
            archive,
            warnings,
        })
    }

    async fn check_exists(&self) -> Result<(), PipelineError> {
        let root = &self.config.project_path;
        if tokio::fs::try_exists(root).await.unwrap_or(false) {
            info!(path = %root.display(), "Working copy present");
            Ok(())
        } else {
            Err(PipelineError::MissingWorkingCopy(root.clone()))
        }
    }

    /// Fetch, check out `branch`, pull, and describe the resulting commit.
    ///
    /// The returned outcome is degraded when the commit descriptor could not
    /// be read.
    async fn checkout_and_sync(
        &self,
        branch: &BranchName,
        sink: &dyn ProgressSink,
    ) -> Result<Outcome<String>, PipelineError> {
        let attempts = self.config.timings.sync_attempts.max(1);

        if self.config.auto_fetch_pull {
            self.run_with_retry("git fetch --all", "fetch", sink)
                .await
                .map_err(|message| PipelineError::Fetch { attempts, message })?;
            info!("Fetch complete");
        } else {
            info!("Skipping fetch, auto-fetch-pull is off");
        }

        let checkout = self
            .executor
            .run(&format!("git checkout {}", branch), &self.config.project_path)
            .await;
        if !checkout.success {
            return Err(PipelineError::Checkout {
                branch: branch.to_string(),
                message: checkout.error,
            });
        }
        info!(branch = %branch, "Checked out branch");

        if self.config.auto_fetch_pull {
            self.run_with_retry("git pull", "pull", sink)
                .await
                .map_err(|message| PipelineError::Pull { attempts, message })?;
            info!("Pull complete");
        } else {
            info!("Skipping pull, building local branch state");
        }

        let log = self
            .executor
            .run(COMMIT_DESCRIPTOR_COMMAND, &self.config.project_path)
            .await;
        if log.success {
            Ok(Outcome::Ok(log.stdout.trim().to_string()))
        } else {
            warn!(error = %log.error, "Could not read commit descriptor");
            Ok(Outcome::degraded(
                "unavailable".to_string(),
                format!("commit descriptor unavailable: {}", log.error),
            ))
        }
    }

    /// Run `command` up to `sync_attempts` times with a fixed pause between
    /// attempts. Returns the last error message when every attempt failed.
    async fn run_with_retry(
        &self,
        command: &str,
        what: &str,
        sink: &dyn ProgressSink,
    ) -> Result<(), String> {
        let timings = &self.config.timings;
        let attempts = timings.sync_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let output = self.executor.run(command, &self.config.project_path).await;
            if output.success {
                return Ok(());
            }
            last_error = output.error;

            warn!(
                command = %command,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "Sync command failed"
            );

            if attempt < attempts {
                sink.emit(ProgressEvent::new(
                    Stage::Fetch,
                    FETCH_PERCENT,
                    format!(
                        "{} failed, retrying in {}s ({}/{})",
                        what,
                        timings.sync_backoff.as_secs(),
                        attempt,
                        attempts
                    ),
                ));
                tokio::time::sleep(timings.sync_backoff).await;
            }
        }

        Err(last_error)
    }

    /// Install dependencies when missing, or on every build when configured.
    ///
    /// A failed reinstall over an existing dependency tree degrades instead
    /// of failing.
    async fn install_dependencies(&self) -> Result<Outcome<()>, PipelineError> {
        let present = tokio::fs::try_exists(self.config.dependency_path())
            .await
            .unwrap_or(false);

        if !present {
            info!(dir = %self.config.dependency_dir, "Dependencies missing, installing");
            let output = self
                .executor
                .run(&self.config.install_command, &self.config.project_path)
                .await;
            if !output.success {
                return Err(PipelineError::Install(output.error));
            }
            info!("Dependencies installed");
            return Ok(Outcome::Ok(()));
        }

        if !self.config.always_reinstall {
            info!("Dependencies present, skipping install");
            return Ok(Outcome::Ok(()));
        }

        let output = self
            .executor
            .run(&self.config.install_command, &self.config.project_path)
            .await;
        if output.success {
            info!("Dependencies refreshed");
            Ok(Outcome::Ok(()))
        } else {
            warn!(error = %output.error, "Reinstall failed, continuing with existing dependencies");
            Ok(Outcome::degraded(
                (),
                format!("dependency reinstall failed: {}", output.error),
            ))
        }
    }

    /// Run the build command, reporting estimated progress on a timer.
    async fn run_build(&self, sink: &dyn ProgressSink) -> Result<Duration, PipelineError> {
        let timings = &self.config.timings;
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(
            started + timings.progress_interval,
            timings.progress_interval,
        );

        let build = self
            .executor
            .run(&self.config.build_command, &self.config.project_path);
        tokio::pin!(build);

        let output = loop {
            tokio::select! {
                output = &mut build => break output,
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    sink.emit(ProgressEvent::estimated(
                        Stage::Build,
                        estimate_build_percent(elapsed, timings.expected_build),
                        format!("building... {}s", elapsed.as_secs()),
                    ));
                }
            }
        };

        let duration = started.elapsed();
        if !output.success {
            return Err(PipelineError::Build(output.error));
        }

        info!(secs = duration.as_secs_f64(), "Build complete");
        Ok(duration)
    }
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled { stage })
    } else {
        Ok(())
    }
}

/// Extrapolate build progress from elapsed time against the expected build
/// duration, within the build stage's percent range.
pub fn estimate_build_percent(elapsed: Duration, expected: Duration) -> u8 {
    let span = u128::from(BUILD_PERCENT_END - BUILD_PERCENT_START);
    let expected = expected.as_millis().max(1);
    let done = (elapsed.as_millis() * span / expected).min(span) as u8;
    BUILD_PERCENT_START + done
}

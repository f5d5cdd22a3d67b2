//! CLI command implementations.

pub mod build;
pub mod serve;

use anyhow::{Context, Result};
use branchship_builder::{BranchResolver, BuildPipeline};
use branchship_config::{BuildConfig, load_config};
use branchship_core::BranchName;
use branchship_core::executor::CommandExecutor;
use branchship_executor::ShellExecutor;
use branchship_scheduler::{BatchAdmission, BatchEntry, BuildWorker, Scheduler, TaskProgress};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::notifier::LocalNotifier;

/// Everything a command needs to admit and run builds.
pub struct Engine {
    pub config: Arc<BuildConfig>,
    pub scheduler: Scheduler,
    pub resolver: BranchResolver,
}

impl Engine {
    pub fn load(config_path: &Path, deliver_to: Option<PathBuf>) -> Result<Self> {
        let config = Arc::new(read_config(config_path)?);
        let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new());

        let pipeline = Arc::new(BuildPipeline::new(executor.clone(), config.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = BuildWorker::new(pipeline, Arc::new(LocalNotifier::new(deliver_to)))
            .with_progress(tx);
        tokio::spawn(print_progress(rx));

        Ok(Self {
            scheduler: Scheduler::new(Arc::new(worker), config.clone()),
            resolver: resolver_for(&config, executor),
            config,
        })
    }
}

/// Branch resolver for the configured working copy. Remote refresh follows
/// `auto-fetch-pull`.
fn resolver_for(config: &BuildConfig, executor: Arc<dyn CommandExecutor>) -> BranchResolver {
    let resolver = BranchResolver::new(executor, config.project_path.clone());
    if config.auto_fetch_pull {
        resolver
    } else {
        resolver.without_refresh()
    }
}

fn read_config(path: &Path) -> Result<BuildConfig> {
    load_config(path).with_context(|| format!("Failed to load config file: {}", path.display()))
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<TaskProgress>) {
    while let Some(progress) = rx.recv().await {
        let event = &progress.event;
        let marker = if event.estimated { "~" } else { "" };
        println!(
            "[{}] {}{:>3}% {}: {}",
            progress.branch, marker, event.percent, event.stage, event.message
        );
    }
}

pub fn print_batch(batch: &BatchAdmission) {
    if let Some(warning) = &batch.warning {
        println!("warning: {}", warning);
    }
    for (branch, entry) in &batch.entries {
        match entry {
            BatchEntry::Started => println!("{}: started", branch),
            BatchEntry::Queued { position } => println!("{}: queued at position {}", branch, position),
            BatchEntry::Duplicate => println!("{}: already running or queued", branch),
            BatchEntry::Unknown => println!("{}: branch not found", branch),
            BatchEntry::Rejected { reason } => println!("{}: rejected ({})", branch, reason),
        }
    }
}

pub fn validate(path: &Path, json: bool) -> Result<()> {
    let config = read_config(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("Configuration is valid");
    println!("  project:      {}", config.project_path.display());
    println!("  build:        {}", config.build_command);
    println!("  output:       {}", config.output_path().display());
    println!("  archives:     {}", config.archive_dir.display());
    println!("  auto sync:    {}", config.auto_fetch_pull);
    println!("  compression:  {}", config.compression_level);
    if !config.allowed_branches.is_empty() {
        println!("  branches:     {}", config.allowed_branches.join(", "));
    }
    if let Some(split) = config.split {
        println!(
            "  split:        over {} MB into {} MB parts",
            split.threshold_mb, split.chunk_mb
        );
    }
    Ok(())
}

pub async fn branches(config_path: &Path, name: Option<&str>) -> Result<()> {
    let config = read_config(config_path)?;
    let resolver = resolver_for(&config, Arc::new(ShellExecutor::new()));
    match name {
        Some(name) => check_branch(&resolver, name).await,
        None => print_branches(&resolver).await,
    }
}

pub async fn check_branch(resolver: &BranchResolver, name: &str) -> Result<()> {
    let branch = BranchName::parse(name)?;
    if resolver.branch_exists(&branch).await {
        println!("{}: exists", branch);
    } else {
        println!("{}: branch not found", branch);
    }
    Ok(())
}

pub async fn print_branches(resolver: &BranchResolver) -> Result<()> {
    let listed = resolver.list_branches().await?;
    if let Some(warning) = listed.warning() {
        println!("warning: {}", warning);
    }
    for branch in listed.value() {
        println!("{}", branch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use branchship_core::executor::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGit {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingGit {
        async fn run(&self, command: &str, _cwd: &Path) -> CommandOutput {
            self.calls.lock().unwrap().push(command.to_string());
            if command.starts_with("git fetch") {
                return CommandOutput::failed("fatal: unable to access remote");
            }
            CommandOutput::ok("* main\n  dev\n")
        }
    }

    async fn listed_with(auto_fetch_pull: bool) -> (Vec<String>, bool) {
        let mut config = BuildConfig::new("/srv/web");
        config.auto_fetch_pull = auto_fetch_pull;
        let git = Arc::new(RecordingGit::default());

        let resolver = resolver_for(&config, git.clone());
        let listed = resolver.list_branches().await.unwrap();
        let fetched = git
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("git fetch"));
        assert_eq!(listed.value(), &vec!["main".to_string(), "dev".to_string()]);
        (git.calls.lock().unwrap().clone(), fetched)
    }

    #[tokio::test]
    async fn test_resolver_skips_fetch_when_sync_disabled() {
        let (calls, fetched) = listed_with(false).await;
        assert!(!fetched);
        assert_eq!(calls, vec!["git branch -a"]);
    }

    #[tokio::test]
    async fn test_resolver_refreshes_when_sync_enabled() {
        let (_, fetched) = listed_with(true).await;
        assert!(fetched);
    }

    #[tokio::test]
    async fn test_check_branch_rejects_malformed_name() {
        let resolver = BranchResolver::new(Arc::new(RecordingGit::default()), "/srv/web");
        assert!(check_branch(&resolver, "x; touch owned").await.is_err());
        assert!(check_branch(&resolver, "--orphan").await.is_err());
        assert!(check_branch(&resolver, "dev").await.is_ok());
    }
}

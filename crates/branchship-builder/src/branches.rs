//! Branch listing and validation against the working copy's remotes.

use branchship_core::executor::CommandExecutor;
use branchship_core::{BranchName, Error, Outcome, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Result of validating a batch of branch names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchValidation {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

/// Lists branches of the working copy, caching the list between calls.
///
/// The cache is dropped at the start of every validation batch and reused
/// for lookups within it.
pub struct BranchResolver {
    executor: Arc<dyn CommandExecutor>,
    repo: PathBuf,
    refresh_remote: bool,
    cache: Mutex<Option<Vec<String>>>,
}

impl BranchResolver {
    pub fn new(executor: Arc<dyn CommandExecutor>, repo: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            repo: repo.into(),
            refresh_remote: true,
            cache: Mutex::new(None),
        }
    }

    /// Skip the remote refresh and only list what the working copy knows.
    pub fn without_refresh(mut self) -> Self {
        self.refresh_remote = false;
        self
    }

    /// Refresh remotes, then list local and remote-tracking branches.
    ///
    /// A failed refresh degrades to the locally known list; only a failure to
    /// list branches at all is an error.
    pub async fn list_branches(&self) -> Result<Outcome<Vec<String>>> {
        let mut warning = None;

        if self.refresh_remote {
            let fetch = self.executor.run("git fetch --all --prune", &self.repo).await;
            if fetch.success {
                info!("Refreshed remote branches");
            } else {
                warn!(error = %fetch.error, "Remote refresh failed, using local branch list");
                warning = Some(format!("remote refresh failed: {}", fetch.error));
            }
        }

        let listing = self.executor.run("git branch -a", &self.repo).await;
        if !listing.success {
            return Err(Error::CommandFailed(format!(
                "listing branches failed: {}",
                listing.error
            )));
        }

        let branches = parse_branch_list(&listing.stdout);
        *self.cache.lock().await = Some(branches.clone());

        Ok(match warning {
            Some(warning) => Outcome::degraded(branches, warning),
            None => Outcome::Ok(branches),
        })
    }

    /// Partition `names` into branches that exist and branches that do not.
    ///
    /// When the branch list cannot be obtained, every name is returned as
    /// provisionally valid and the outcome is degraded; the checkout stage
    /// then acts as the final check.
    pub async fn validate_many(&self, names: &[String]) -> Outcome<BranchValidation> {
        self.invalidate().await;

        let listed = match self.list_branches().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Cannot list branches, deferring validation to checkout");
                return Outcome::degraded(
                    BranchValidation {
                        valid: names.to_vec(),
                        invalid: Vec::new(),
                    },
                    format!("branch list unavailable, validation deferred: {}", e),
                );
            }
        };

        listed.map(|known| {
            let (valid, invalid): (Vec<String>, Vec<String>) =
                names.iter().cloned().partition(|n| known.contains(n));
            BranchValidation { valid, invalid }
        })
    }

    /// Whether `name` exists, using the cached list when present.
    ///
    /// Falls back to probing the single ref when the list cannot be built.
    pub async fn branch_exists(&self, name: &BranchName) -> bool {
        if let Some(cached) = self.cache.lock().await.as_ref() {
            return cached.iter().any(|b| name == b.as_str());
        }

        match self.list_branches().await {
            Ok(listed) => listed.value().iter().any(|b| name == b.as_str()),
            Err(e) => {
                warn!(branch = %name, error = %e, "Branch list unavailable, probing ref");
                let probe = format!(
                    "git show-ref --verify --quiet refs/heads/{name} || git show-ref --verify --quiet refs/remotes/origin/{name}"
                );
                self.executor.run(&probe, &self.repo).await.success
            }
        }
    }

    /// Drop the cached branch list.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

/// Turn `git branch -a` output into a deduplicated list of branch names,
/// preserving first-seen order.
pub fn parse_branch_list(output: &str) -> Vec<String> {
    let mut branches: Vec<String> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        let line = line.strip_prefix('*').map(str::trim_start).unwrap_or(line);
        let name = match line.strip_prefix("remotes/") {
            Some(rest) => rest.split_once('/').map(|(_, b)| b).unwrap_or(rest),
            None => line,
        };

        if name.is_empty() || name.contains("HEAD") {
            continue;
        }
        if !branches.iter().any(|b| b == name) {
            branches.push(name.to_string());
        }
    }

    branches
}

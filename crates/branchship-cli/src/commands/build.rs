//! One-shot build command.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};

use super::{Engine, print_batch};

/// Admit `branches` in order and wait until every build has finished.
pub async fn run(
    config_path: &Path,
    branches: &[String],
    deliver_to: Option<PathBuf>,
    requester: &str,
) -> Result<()> {
    let engine = Engine::load(config_path, deliver_to)?;

    let batch = engine
        .scheduler
        .admit_many(&engine.resolver, branches, requester, "cli")
        .await?;
    print_batch(&batch);

    if batch.admitted() == 0 {
        bail!("No builds were admitted");
    }

    engine.scheduler.wait_idle().await;
    Ok(())
}

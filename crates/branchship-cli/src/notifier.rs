//! Local stand-in for a chat transport: prints messages and copies
//! artifacts into a directory.

use async_trait::async_trait;
use branchship_core::Result;
use branchship_core::notify::Notifier;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct LocalNotifier {
    deliver_to: Option<PathBuf>,
}

impl LocalNotifier {
    pub fn new(deliver_to: Option<PathBuf>) -> Self {
        Self { deliver_to }
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn send_message(&self, destination: &str, text: &str) -> Result<()> {
        for line in text.lines() {
            println!("[{}] {}", destination, line);
        }
        Ok(())
    }

    async fn send_file(&self, destination: &str, path: &Path, caption: &str) -> Result<()> {
        let Some(dir) = &self.deliver_to else {
            info!(file = %path.display(), caption = %caption, "Artifact ready, no delivery directory set");
            return Ok(());
        };

        let name = path.file_name().unwrap_or(path.as_os_str());
        let target = dir.join(name);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::copy(path, &target).await?;

        println!("[{}] {} -> {}", destination, caption, target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_file_copies_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.zip");
        std::fs::write(&source, b"PK").unwrap();
        let out = dir.path().join("out");

        let notifier = LocalNotifier::new(Some(out.clone()));
        notifier.send_file("cli", &source, "main").await.unwrap();

        assert_eq!(std::fs::read(out.join("main.zip")).unwrap(), b"PK");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_send_file_without_directory_is_noop() {
        let notifier = LocalNotifier::new(None);
        notifier
            .send_file("cli", Path::new("/nowhere/main.zip"), "main")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = LocalNotifier::new(Some(dir.path().to_path_buf()));
        let result = notifier
            .send_file("cli", &dir.path().join("gone.zip"), "gone")
            .await;
        assert!(result.is_err());
    }
}

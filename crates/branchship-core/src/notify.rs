//! Notification channel trait.
//!
//! Implemented by the transport that admitted a build (a chat client, the
//! CLI, ...). Failures are reported to the caller, which logs them; they never
//! fail a build.

use async_trait::async_trait;
use std::path::Path;

use crate::Result;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a text message to `destination`.
    async fn send_message(&self, destination: &str, text: &str) -> Result<()>;

    /// Deliver the file at `path` to `destination`.
    async fn send_file(&self, destination: &str, path: &Path, caption: &str) -> Result<()>;
}

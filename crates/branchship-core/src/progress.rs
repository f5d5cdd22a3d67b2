//! Progress events emitted while a build runs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Pipeline stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Check,
    Fetch,
    Install,
    Build,
    Compress,
    Package,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Check => "check",
            Stage::Fetch => "fetch",
            Stage::Install => "install",
            Stage::Build => "build",
            Stage::Compress => "compress",
            Stage::Package => "package",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Overall completion, 0-100.
    pub percent: u8,
    pub message: String,
    /// Set when `percent` is extrapolated from elapsed time rather than measured.
    pub estimated: bool,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
            estimated: false,
        }
    }

    pub fn estimated(stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            estimated: true,
            ..Self::new(stage, percent, message)
        }
    }
}

/// Receiver of progress events.
///
/// Sinks may be called any number of times, from any thread, and must not
/// block for long: the archive packager reports from a blocking thread.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        if self.send(event).is_err() {
            debug!("Progress receiver dropped");
        }
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for Arc<S> {
    fn emit(&self, event: ProgressEvent) {
        (**self).emit(event)
    }
}

/// Wraps a sink so the percent it sees never goes backwards within one task.
pub struct MonotonicSink<S> {
    inner: S,
    high_water: AtomicU8,
}

impl<S: ProgressSink> MonotonicSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            high_water: AtomicU8::new(0),
        }
    }
}

impl<S: ProgressSink> ProgressSink for MonotonicSink<S> {
    fn emit(&self, mut event: ProgressEvent) {
        let previous = self.high_water.fetch_max(event.percent, Ordering::SeqCst);
        event.percent = event.percent.max(previous);
        self.inner.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_percent_is_clamped_to_100() {
        assert_eq!(ProgressEvent::new(Stage::Build, 150, "x").percent, 100);
    }

    #[test]
    fn test_monotonic_sink_never_regresses() {
        let recorder = Arc::new(Recorder::default());
        let sink = MonotonicSink::new(recorder.clone());

        sink.emit(ProgressEvent::new(Stage::Build, 40, "a"));
        sink.emit(ProgressEvent::new(Stage::Build, 35, "b"));
        sink.emit(ProgressEvent::new(Stage::Compress, 72, "c"));

        let seen: Vec<u8> = recorder.0.lock().unwrap().iter().map(|e| e.percent).collect();
        assert_eq!(seen, vec![40, 40, 72]);
    }

    #[tokio::test]
    async fn test_channel_sink_tolerates_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.emit(ProgressEvent::new(Stage::Check, 5, "checking"));
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&Stage::Compress).unwrap();
        assert_eq!(json, "\"compress\"");
    }
}

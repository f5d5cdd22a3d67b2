//! Zip packaging of build output.
//!
//! Entries are written in sorted path order with a fixed timestamp, so the
//! same input tree always produces the same archive bytes.

use branchship_core::{ProgressEvent, ProgressSink, Stage};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::PipelineError;

/// Overall percent at which packaging starts.
pub const PACKAGE_PERCENT_START: u8 = 70;
/// Overall percent at which packaging ends.
pub const PACKAGE_PERCENT_END: u8 = 80;
/// Minimum percent advance between two compress events.
const PROGRESS_STEP: u8 = 2;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Characters that are not allowed in file names on common filesystems.
const ILLEGAL_FILE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// A finished archive on disk. The caller owns the file and deletes it once
/// delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub file_name: String,
    /// Compressed size.
    pub size_bytes: u64,
    /// Compressed size in MiB, rounded to two decimals.
    pub size_mb: f64,
    /// Total size of the regular files that went into the archive.
    pub source_bytes: u64,
}

/// Replace characters that are illegal in file names with `-`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_FILE_CHARS.contains(&c) { '-' } else { c })
        .collect()
}

fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

/// Packages a directory tree into a zip archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchivePackager {
    compression_level: u8,
}

impl Default for ArchivePackager {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArchivePackager {
    /// `compression_level` is clamped to 1..=9.
    pub fn new(compression_level: u8) -> Self {
        Self {
            compression_level: compression_level.clamp(1, 9),
        }
    }

    pub fn compression_level(&self) -> u8 {
        self.compression_level
    }

    /// Write `source` into `output_dir/<sanitized base_name>.zip`.
    ///
    /// Entries are stored under a top-level folder named after `source`.
    /// Compression runs on the blocking pool; progress is mapped onto 70-80%.
    pub async fn package(
        &self,
        source: &Path,
        output_dir: &Path,
        base_name: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PackagedArchive, PipelineError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(PipelineError::MissingOutput(source.to_path_buf()));
        }

        let packager = *self;
        let source = source.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let base_name = base_name.to_string();

        let partial = output_dir.join(format!("{}.zip", sanitize_file_name(&base_name)));

        let result = tokio::task::spawn_blocking(move || {
            packager.package_blocking(&source, &output_dir, &base_name, sink.as_ref())
        })
        .await
        .map_err(|e| PipelineError::Archive(format!("packaging task failed: {}", e)))
        .and_then(|r| r);

        if result.is_err() {
            // A failed stream leaves a truncated archive behind.
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }

    fn package_blocking(
        &self,
        source: &Path,
        output_dir: &Path,
        base_name: &str,
        sink: &dyn ProgressSink,
    ) -> Result<PackagedArchive, PipelineError> {
        let entries = collect_entries(source)?;
        let source_bytes: u64 = entries.iter().map(|e| e.size).sum();

        fs::create_dir_all(output_dir)?;
        let file_name = format!("{}.zip", sanitize_file_name(base_name));
        let path = output_dir.join(&file_name);

        info!(
            source = %source.display(),
            archive = %path.display(),
            level = self.compression_level,
            total_mb = round_mb(source_bytes),
            "Packaging build output"
        );

        let root = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(i64::from(self.compression_level)))
            .last_modified_time(zip::DateTime::default());

        let mut zip = ZipWriter::new(BufWriter::new(File::create(&path)?));
        zip.add_directory(format!("{}/", root), options)?;

        let mut progress = Throttle::new(source_bytes);
        let mut buf = vec![0u8; 64 * 1024];

        for entry in &entries {
            let name = format!("{}/{}", root, entry.relative);
            if entry.is_dir {
                zip.add_directory(format!("{}/", name), options)?;
                continue;
            }

            let file_options = options.large_file(entry.size >= u64::from(u32::MAX));
            zip.start_file(name, file_options)?;

            let mut file = File::open(&entry.path)?;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buf[..n])?;
                if let Some(event) = progress.advance(n as u64) {
                    sink.emit(event);
                }
            }
        }

        let mut writer = zip.finish()?;
        writer.flush()?;
        drop(writer);

        if let Some(event) = progress.finish() {
            sink.emit(event);
        }

        let size_bytes = fs::metadata(&path)?.len();
        let archive = PackagedArchive {
            path,
            file_name,
            size_bytes,
            size_mb: round_mb(size_bytes),
            source_bytes,
        };

        info!(archive = %archive.file_name, size_mb = archive.size_mb, "Packaging complete");
        Ok(archive)
    }
}

/// One file or directory below the packaged root.
struct Entry {
    path: PathBuf,
    /// Path relative to the root, `/`-separated.
    relative: String,
    is_dir: bool,
    size: u64,
}

/// Walk `root` depth-first in sorted order. Symlinked directories are not
/// followed; symlinked files are packaged by content.
fn collect_entries(root: &Path) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    walk(root, "", &mut entries)?;
    Ok(entries)
}

fn walk(dir: &Path, prefix: &str, entries: &mut Vec<Entry>) -> std::io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let path = child.path();
        let name = child.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = child.file_type()?;
        if file_type.is_dir() {
            entries.push(Entry {
                path: path.clone(),
                relative: relative.clone(),
                is_dir: true,
                size: 0,
            });
            walk(&path, &relative, entries)?;
        } else {
            let metadata = match fs::metadata(&path) {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => {
                    debug!(path = %path.display(), "Skipping non-regular entry");
                    continue;
                }
            };
            entries.push(Entry {
                path,
                relative,
                is_dir: false,
                size: metadata.len(),
            });
        }
    }

    Ok(())
}

/// Maps processed bytes onto the packaging percent range and suppresses
/// events that would not advance it by at least `PROGRESS_STEP`.
struct Throttle {
    total: u64,
    processed: u64,
    last_percent: u8,
    reached_end: bool,
}

impl Throttle {
    fn new(total: u64) -> Self {
        Self {
            total,
            processed: 0,
            last_percent: PACKAGE_PERCENT_START,
            reached_end: false,
        }
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return PACKAGE_PERCENT_END;
        }
        let span = u64::from(PACKAGE_PERCENT_END - PACKAGE_PERCENT_START);
        let done = (self.processed.min(self.total) * span / self.total) as u8;
        PACKAGE_PERCENT_START + done
    }

    fn advance(&mut self, bytes: u64) -> Option<ProgressEvent> {
        self.processed += bytes;
        let percent = self.percent();
        let due = percent >= self.last_percent + PROGRESS_STEP
            || (percent >= PACKAGE_PERCENT_END && !self.reached_end);
        if !due {
            return None;
        }
        self.last_percent = percent;
        self.reached_end = percent >= PACKAGE_PERCENT_END;
        Some(self.event(percent))
    }

    fn finish(&mut self) -> Option<ProgressEvent> {
        if self.reached_end {
            return None;
        }
        self.reached_end = true;
        self.processed = self.total;
        Some(self.event(PACKAGE_PERCENT_END))
    }

    fn event(&self, percent: u8) -> ProgressEvent {
        ProgressEvent::new(
            Stage::Compress,
            percent,
            format!(
                "packaging... {:.1}MB/{:.1}MB",
                self.processed as f64 / BYTES_PER_MB,
                self.total as f64 / BYTES_PER_MB
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchship_core::progress::NoopSink;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn make_tree(root: &Path) -> u64 {
        let dist = root.join("dist");
        fs::create_dir_all(dist.join("assets/js")).unwrap();
        let index = "<html>".repeat(2000);
        let app = "console.log('hello');\n".repeat(5000);
        fs::write(dist.join("index.html"), &index).unwrap();
        fs::write(dist.join("assets/js/app.js"), &app).unwrap();
        fs::write(dist.join("assets/empty.txt"), "").unwrap();
        (index.len() + app.len()) as u64
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("feature/login"), "feature-login");
        assert_eq!(sanitize_file_name(r#"a\b:c*d?e"f<g>h|i"#), "a-b-c-d-e-f-g-h-i");
        assert_eq!(sanitize_file_name("release_1.2"), "release_1.2");
    }

    #[test]
    fn test_sanitize_known_collision_class() {
        // Names differing only in illegal characters map to the same file.
        assert_eq!(sanitize_file_name("a/b"), sanitize_file_name("a:b"));
        assert_ne!(sanitize_file_name("a/b"), sanitize_file_name("a/c"));
    }

    #[tokio::test]
    async fn test_package_directory() {
        let dir = tempfile::tempdir().unwrap();
        let total = make_tree(dir.path());
        let out = dir.path().join("builds");

        let recorder = Arc::new(Recorder::default());
        let archive = ArchivePackager::new(6)
            .package(&dir.path().join("dist"), &out, "feature/login", recorder.clone())
            .await
            .unwrap();

        assert_eq!(archive.file_name, "feature-login.zip");
        assert_eq!(archive.path, out.join("feature-login.zip"));
        assert_eq!(archive.source_bytes, total);
        assert!(archive.size_bytes < total);
        assert!(archive.size_mb <= round_mb(total));

        let bytes = fs::read(&archive.path).unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "dist/",
                "dist/assets/",
                "dist/assets/empty.txt",
                "dist/assets/js/",
                "dist/assets/js/app.js",
                "dist/index.html",
            ]
        );

        let mut app = String::new();
        zip.by_name("dist/assets/js/app.js")
            .unwrap()
            .read_to_string(&mut app)
            .unwrap();
        assert!(app.starts_with("console.log"));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let recorder = Arc::new(Recorder::default());
        ArchivePackager::new(9)
            .package(
                &dir.path().join("dist"),
                &dir.path().join("out"),
                "main",
                recorder.clone(),
            )
            .await
            .unwrap();

        let events = recorder.0.lock().unwrap();
        assert!(!events.is_empty());
        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| (70..=80).contains(p)));
        assert_eq!(percents.last(), Some(&80));
        assert_eq!(percents.iter().filter(|p| **p == 80).count(), 1);
        assert!(events.iter().all(|e| e.stage == Stage::Compress));
    }

    #[tokio::test]
    async fn test_output_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let packager = ArchivePackager::new(6);
        let source = dir.path().join("dist");

        let first = packager
            .package(&source, &dir.path().join("a"), "main", Arc::new(NoopSink))
            .await
            .unwrap();
        let second = packager
            .package(&source, &dir.path().join("b"), "main", Arc::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(fs::read(first.path).unwrap(), fs::read(second.path).unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = ArchivePackager::default()
            .package(
                &dir.path().join("dist"),
                &dir.path().join("out"),
                "main",
                Arc::new(NoopSink),
            )
            .await;

        assert!(matches!(result, Err(PipelineError::MissingOutput(_))));
    }

    #[tokio::test]
    async fn test_empty_directory_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("dist")).unwrap();

        let recorder = Arc::new(Recorder::default());
        let archive = ArchivePackager::default()
            .package(
                &dir.path().join("dist"),
                &dir.path().join("out"),
                "main",
                recorder.clone(),
            )
            .await
            .unwrap();

        assert_eq!(archive.source_bytes, 0);
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent, 80);
    }

    #[test]
    fn test_clamps_compression_level() {
        assert_eq!(ArchivePackager::new(0).compression_level(), 1);
        assert_eq!(ArchivePackager::new(42).compression_level(), 9);
    }
}

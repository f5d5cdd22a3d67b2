//! Splitting large archives into parts for channels with upload limits.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One piece of a split archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub path: PathBuf,
    pub name: String,
    /// 1-based part number.
    pub part: usize,
    pub total: usize,
}

/// Split the file at `path` into `<stem>.partN.zip` files of at most
/// `chunk_bytes` each, next to the original.
///
/// A file that fits in one chunk is returned as a single part pointing at the
/// original file; nothing is copied.
pub async fn split_archive(path: &Path, chunk_bytes: u64) -> std::io::Result<Vec<ArchivePart>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || split_blocking(&path, chunk_bytes))
        .await
        .map_err(std::io::Error::other)?
}

fn split_blocking(path: &Path, chunk_bytes: u64) -> std::io::Result<Vec<ArchivePart>> {
    if chunk_bytes == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "chunk size must be greater than zero",
        ));
    }

    let size = std::fs::metadata(path)?.len();
    let total = size.div_ceil(chunk_bytes).max(1) as usize;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if total == 1 {
        return Ok(vec![ArchivePart {
            path: path.to_path_buf(),
            name,
            part: 1,
            total: 1,
        }]);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path.parent().unwrap_or(Path::new("."));

    info!(
        archive = %name,
        size_mb = size as f64 / (1024.0 * 1024.0),
        parts = total,
        "Splitting archive"
    );

    let mut reader = BufReader::new(File::open(path)?);
    let mut parts: Vec<ArchivePart> = Vec::with_capacity(total);

    for part in 1..=total {
        let part_name = format!("{}.part{}.zip", stem, part);
        let part_path = dir.join(&part_name);
        if let Err(e) = write_part(&mut reader, &part_path, chunk_bytes) {
            warn!(part = %part_name, error = %e, "Split failed, removing written parts");
            for written in parts.iter().map(|p| &p.path).chain([&part_path]) {
                let _ = std::fs::remove_file(written);
            }
            return Err(e);
        }

        parts.push(ArchivePart {
            path: part_path,
            name: part_name,
            part,
            total,
        });
    }

    Ok(parts)
}

fn write_part(reader: &mut impl Read, part_path: &Path, chunk_bytes: u64) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(part_path)?);
    let copied = std::io::copy(&mut reader.take(chunk_bytes), &mut writer)?;
    if copied == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "archive shrank while it was being split",
        ));
    }
    writer.flush()
}

/// Delete every part file, logging failures. Safe to call on parts that
/// were already removed.
pub async fn remove_parts(parts: &[ArchivePart]) {
    for part in parts {
        match tokio::fs::remove_file(&part.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(part = %part.name, error = %e, "Failed to remove archive part"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_into_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.zip");
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let parts = split_archive(&path, 1000).await.unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].name, "main.part1.zip");
        assert_eq!(parts[2].name, "main.part3.zip");
        assert!(parts.iter().all(|p| p.total == 3));

        let sizes: Vec<u64> = parts
            .iter()
            .map(|p| std::fs::metadata(&p.path).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let mut joined = Vec::new();
        for part in &parts {
            joined.extend(std::fs::read(&part.path).unwrap());
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_small_file_is_single_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.zip");
        std::fs::write(&path, b"tiny").unwrap();

        let parts = split_archive(&path, 1000).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].path, path);
        assert_eq!(parts[0].name, "dev.zip");
    }

    #[tokio::test]
    async fn test_failed_split_leaves_no_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.zip");
        std::fs::write(&path, vec![7u8; 2500]).unwrap();
        // Occupy the second part's name with a directory so creating it fails.
        std::fs::create_dir(dir.path().join("main.part2.zip")).unwrap();

        let result = split_archive(&path, 1000).await;

        assert!(result.is_err());
        assert!(!dir.path().join("main.part1.zip").exists());
        assert!(!dir.path().join("main.part3.zip").exists());
        assert!(dir.path().join("main.part2.zip").is_dir());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_remove_parts_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.zip");
        std::fs::write(&path, vec![0u8; 300]).unwrap();

        let parts = split_archive(&path, 100).await.unwrap();
        remove_parts(&parts).await;
        remove_parts(&parts).await;

        assert!(parts.iter().all(|p| !p.path.exists()));
        assert!(path.exists());
    }
}

//! Utility functions for common operations
//!
//! Helpers shared by the checkpoint store, the progress log and the
//! orchestrator: size formatting, ratio math, target-file matching and
//! crash-safe JSON persistence.

use crate::constants::PROGRESS_BAR_TEMPLATE;
use crate::error::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Check if a file path has one of the target extensions (case-insensitive)
pub fn is_target_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Create a progress bar with consistent styling
pub fn create_progress_bar(len: u64, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_BAR_TEMPLATE) {
        pb.set_style(style);
    }
    pb
}

/// Format file size in human-readable format
///
/// # Returns
/// * Human-readable size string (e.g., "1.2 MB", "512 B")
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Calculate compression ratio as a percentage
///
/// Positive means reduction, negative means the file grew.
pub fn calculate_compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    ((original_size as f64 - compressed_size as f64) / original_size as f64) * 100.0
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// The bytes go to a temp file in the same directory which is fsynced and
/// then renamed over the target, so readers see either the previous file or
/// the new one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(&dir);
    Ok(())
}

/// Directory holding `path`, treating a bare file name as the current directory.
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Best-effort fsync of a directory so a completed rename survives power loss.
pub fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Make `path` absolute without requiring it to exist.
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let parent = parent_dir(path);
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[test]
    fn test_is_target_file() {
        let exts = vec!["pdf".to_string()];
        assert!(is_target_file(Path::new("report.pdf"), &exts));
        assert!(is_target_file(Path::new("REPORT.PDF"), &exts));
        assert!(is_target_file(Path::new("dir/Mixed.PdF"), &exts));

        assert!(!is_target_file(Path::new("notes.txt"), &exts));
        assert!(!is_target_file(Path::new("pdf"), &exts));
        assert!(!is_target_file(Path::new("archive.pdf.gz"), &exts));
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_file_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_calculate_compression_ratio() {
        assert_eq!(calculate_compression_ratio(1000, 800), 20.0);
        assert_eq!(calculate_compression_ratio(1000, 1200), -20.0);
        assert_eq!(calculate_compression_ratio(1000, 1000), 0.0);
        assert_eq!(calculate_compression_ratio(0, 500), 0.0);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");

        write_json_atomic(&path, &Sample { name: "a".into(), count: 1 }).unwrap();
        write_json_atomic(&path, &Sample { name: "b".into(), count: 2 }).unwrap();

        let loaded: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, Sample { name: "b".into(), count: 2 });

        // Only the target remains; the temp file was renamed, not left behind.
        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_json_atomic_creates_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/deeper/state.json");
        write_json_atomic(&path, &Sample { name: "x".into(), count: 0 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_absolutize_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");
        let abs = absolutize(&path);
        assert!(abs.is_absolute());
        assert_eq!(abs.file_name().unwrap(), "missing.json");
    }
}

use crate::error::{CompressionError, Result};
use crate::utils::is_target_file;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Target,
    PassThrough,
}

/// A file found under the input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
    pub kind: FileKind,
}

impl FileRecord {
    /// Stable identity used by the checkpoint: the relative path with `/` separators.
    pub fn identity(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn destination(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.relative)
    }
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub targets: Vec<FileRecord>,
    pub passthrough: Vec<FileRecord>,
}

/// Walk `input_root`, splitting regular files into targets and pass-through files.
///
/// Directories or files listed in `exclude` (the output tree, the checkpoint,
/// the log) are skipped. Both lists come back sorted by relative path.
pub fn discover(input_root: &Path, extensions: &[String], exclude: &[PathBuf]) -> Result<Discovery> {
    if !input_root.exists() {
        return Err(CompressionError::InputNotFound(input_root.to_path_buf()));
    }
    if !input_root.is_dir() {
        return Err(CompressionError::InputNotDirectory(input_root.to_path_buf()));
    }

    let root = input_root.canonicalize()?;
    let mut discovery = Discovery::default();

    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| x.as_path() == e.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // An unreadable subdirectory must not sink the whole run.
                warn!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let relative = match path.strip_prefix(&root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let kind = if is_target_file(&path, extensions) {
            FileKind::Target
        } else {
            FileKind::PassThrough
        };

        let record = FileRecord {
            path,
            relative,
            size,
            kind,
        };
        match kind {
            FileKind::Target => discovery.targets.push(record),
            FileKind::PassThrough => discovery.passthrough.push(record),
        }
    }

    discovery.targets.sort_by(|a, b| a.relative.cmp(&b.relative));
    discovery.passthrough.sort_by(|a, b| a.relative.cmp(&b.relative));

    debug!(
        targets = discovery.targets.len(),
        passthrough = discovery.passthrough.len(),
        "Discovery complete"
    );
    Ok(discovery)
}

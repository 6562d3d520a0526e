//! Durable batch progress.
//!
//! The checkpoint is a JSON snapshot replaced atomically on every flush. When
//! a batch finishes, the snapshot is promoted to a `.completed.json` marker and
//! the checkpoint itself is removed.

use crate::constants::CHECKPOINT_VERSION;
use crate::error::Result;
use crate::outcome::{Aggregate, ProcessingResult};
use crate::utils::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub first_start: Option<DateTime<Utc>>,
    pub current_start: Option<DateTime<Utc>>,
    pub resume_count: u32,
    pub last_resume: Option<DateTime<Utc>>,
    pub copy_phase_start: Option<DateTime<Utc>>,
}

impl SessionInfo {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            first_start: Some(now),
            current_start: Some(now),
            ..Self::default()
        }
    }

    /// Bump the resume counter and stamp the new session start.
    pub fn resumed(&mut self, now: DateTime<Utc>) {
        self.resume_count += 1;
        self.last_resume = Some(now);
        self.current_start = Some(now);
        if self.first_start.is_none() {
            self.first_start = Some(now);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointState {
    pub version: u32,
    pub processed_files: BTreeSet<String>,
    pub stats: Aggregate,
    pub session: SessionInfo,
    pub last_update: Option<DateTime<Utc>>,
    /// Canonical roots of the batch this state was recorded for.
    pub input_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            processed_files: BTreeSet::new(),
            stats: Aggregate::default(),
            session: SessionInfo::default(),
            last_update: None,
            input_root: None,
            output_root: None,
        }
    }
}

impl CheckpointState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            session: SessionInfo::started(now),
            ..Self::default()
        }
    }

    /// A fresh state bound to one input/output pair.
    pub fn for_roots(now: DateTime<Utc>, input_root: &Path, output_root: &Path) -> Self {
        Self {
            input_root: Some(input_root.to_path_buf()),
            output_root: Some(output_root.to_path_buf()),
            ..Self::new(now)
        }
    }

    /// Identities are relative paths, so a state is only reusable for the same roots.
    pub fn belongs_to(&self, input_root: &Path, output_root: &Path) -> bool {
        self.input_root.as_deref() == Some(input_root)
            && self.output_root.as_deref() == Some(output_root)
    }

    pub fn is_processed(&self, identity: &str) -> bool {
        self.processed_files.contains(identity)
    }

    /// Record `result` for `identity`. Returns false, and changes nothing,
    /// when the identity was already merged.
    pub fn merge(&mut self, identity: &str, result: &ProcessingResult) -> bool {
        if !self.processed_files.insert(identity.to_string()) {
            return false;
        }
        self.stats.record(result);
        true
    }
}

/// Written once a batch has run to the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: CheckpointState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    NotStarted,
    InProgress(CheckpointState),
    Completed(CompletionMarker),
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<dir>/<stem>.completed.json` next to the checkpoint.
    pub fn marker_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        self.path.with_file_name(format!("{}.completed.json", stem))
    }

    /// Previous in-progress state, if a readable one exists.
    pub fn load(&self) -> Option<CheckpointState> {
        read_json(&self.path)
    }

    pub fn load_completed(&self) -> Option<CompletionMarker> {
        read_json(&self.marker_path())
    }

    /// An in-progress checkpoint wins over a completion marker.
    pub fn status(&self) -> RunStatus {
        if let Some(state) = self.load() {
            RunStatus::InProgress(state)
        } else if let Some(marker) = self.load_completed() {
            RunStatus::Completed(marker)
        } else {
            RunStatus::NotStarted
        }
    }

    pub fn flush(&self, state: &CheckpointState) -> Result<()> {
        write_json_atomic(&self.path, state)?;
        debug!(
            path = %self.path.display(),
            processed = state.processed_files.len(),
            "Checkpoint flushed"
        );
        Ok(())
    }

    /// Promote `state` to the completion marker and delete the checkpoint.
    pub fn complete(&self, state: &CheckpointState, now: DateTime<Utc>) -> Result<()> {
        let marker = CompletionMarker {
            completed_at: now,
            state: state.clone(),
        };
        write_json_atomic(&self.marker_path(), &marker)?;
        remove_if_exists(&self.path)?;
        info!(marker = %self.marker_path().display(), "Batch marked complete");
        Ok(())
    }

    /// Forget every trace of earlier runs.
    pub fn discard(&self) -> Result<()> {
        remove_if_exists(&self.path)?;
        remove_if_exists(&self.marker_path())?;
        Ok(())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Unreadable state file, ignoring it");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Malformed state file, starting cold");
            None
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

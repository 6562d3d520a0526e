//! Human-readable run log.
//!
//! Three files hang off the configured log path `<log>.json`:
//!
//! * `<log>.events.jsonl`, an append-only stream of phase changes and per-file results;
//! * `<log>.json`, a rolling snapshot rewritten atomically on every flush;
//! * `<log>_summary.json`, the lifetime summary written when a batch completes.
//!
//! Nothing here influences resume decisions; that is the checkpoint's job.

use crate::checkpoint::{CheckpointState, SessionInfo};
use crate::constants::{HISTORY_LIMIT, RECENT_ERRORS_LIMIT, TOP_COMPRESSIONS_LIMIT};
use crate::error::Result;
use crate::outcome::{Aggregate, CompressionRange, FailureCategory, Outcome, ProcessingResult};
use crate::utils::{parent_dir, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub outcome: Outcome,
    pub original_size: u64,
    pub final_size: u64,
    pub compression_ratio: f64,
    pub message: String,
}

impl HistoryEntry {
    pub fn new(file: &str, result: &ProcessingResult, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            file: file.to_string(),
            outcome: result.outcome,
            original_size: result.original_size,
            final_size: result.final_size,
            compression_ratio: result.ratio(),
            message: result.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogInfo {
    pub created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub tool_version: String,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub engine: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    InProgress,
    Interrupted,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarySection {
    pub status: RunState,
    pub total_found: u64,
    pub processed: u64,
    pub remaining: u64,
    pub completion_percentage: f64,
    pub statistics: Aggregate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSnapshot {
    pub log_info: LogInfo,
    pub session_info: SessionInfo,
    pub summary: SummarySection,
    pub processed_files_history: Vec<HistoryEntry>,
    pub recent_errors: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Phase {
        timestamp: DateTime<Utc>,
        phase: &'a str,
    },
    File(&'a HistoryEntry),
    CopyFailed {
        timestamp: DateTime<Utc>,
        file: &'a str,
        error: &'a str,
    },
}

#[derive(Debug, Serialize)]
struct RangeLine {
    label: &'static str,
    count: u64,
    percentage: f64,
}

#[derive(Debug, Serialize)]
struct CategoryLine {
    category: FailureCategory,
    count: u64,
}

#[derive(Debug, Serialize)]
struct LifetimeSummary<'a> {
    completed_at: DateTime<Utc>,
    log_info: &'a LogInfo,
    session_info: &'a SessionInfo,
    statistics: &'a Aggregate,
    overall_compression_ratio: f64,
    compression_ranges: Vec<RangeLine>,
    error_breakdown: Vec<CategoryLine>,
    top_compressions: Vec<&'a HistoryEntry>,
}

pub struct ProgressLog {
    snapshot_path: PathBuf,
    events_path: PathBuf,
    summary_path: PathBuf,
    events: Option<BufWriter<File>>,
    info: LogInfo,
    history: VecDeque<HistoryEntry>,
    recent_errors: VecDeque<HistoryEntry>,
    /// Best successes of this session, highest ratio first, at most `TOP_COMPRESSIONS_LIMIT`.
    top_compressions: Vec<HistoryEntry>,
}

impl ProgressLog {
    /// Open the log at `path`. With `resume`, the history of the previous
    /// snapshot is carried over; otherwise the snapshot starts empty.
    pub fn open(path: &Path, mut info: LogInfo, resume: bool) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "progress".to_string());
        let dir = parent_dir(path);

        let mut log = Self {
            snapshot_path: path.to_path_buf(),
            events_path: dir.join(format!("{}.events.jsonl", stem)),
            summary_path: dir.join(format!("{}_summary.json", stem)),
            events: None,
            info: LogInfo::default(),
            history: VecDeque::new(),
            recent_errors: VecDeque::new(),
            top_compressions: Vec::new(),
        };

        if resume {
            if let Some(previous) = log.read_snapshot() {
                info.created = previous.log_info.created;
                log.history = previous.processed_files_history.into();
                log.recent_errors = previous.recent_errors.into();
                trim_front(&mut log.history, HISTORY_LIMIT);
                trim_front(&mut log.recent_errors, RECENT_ERRORS_LIMIT);
            }
        }
        info.created.get_or_insert_with(Utc::now);
        log.info = info;

        log.events = match open_append(&log.events_path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!(path = %log.events_path.display(), error = %err, "Event log disabled");
                None
            }
        };
        log
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn phase(&mut self, phase: &str) {
        self.emit(&Event::Phase {
            timestamp: Utc::now(),
            phase,
        });
    }

    pub fn record(&mut self, identity: &str, result: &ProcessingResult) {
        let entry = HistoryEntry::new(identity, result, Utc::now());
        self.emit(&Event::File(&entry));

        if result.is_success() {
            let at = self
                .top_compressions
                .partition_point(|e| e.compression_ratio >= entry.compression_ratio);
            if at < TOP_COMPRESSIONS_LIMIT {
                self.top_compressions.insert(at, entry.clone());
                self.top_compressions.truncate(TOP_COMPRESSIONS_LIMIT);
            }
        } else {
            self.recent_errors.push_back(entry.clone());
            trim_front(&mut self.recent_errors, RECENT_ERRORS_LIMIT);
        }
        self.history.push_back(entry);
        trim_front(&mut self.history, HISTORY_LIMIT);
    }

    pub fn copy_failed(&mut self, identity: &str, error: &str) {
        self.emit(&Event::CopyFailed {
            timestamp: Utc::now(),
            file: identity,
            error,
        });
    }

    /// Flush pending events and rewrite the snapshot.
    pub fn flush(&mut self, state: &CheckpointState, total_found: u64, status: RunState) -> Result<()> {
        if let Some(events) = self.events.as_mut() {
            events.flush()?;
        }

        self.info.last_updated = Some(Utc::now());
        let processed = state.stats.total_processed();
        let completion_percentage = if total_found == 0 {
            100.0
        } else {
            (processed as f64 / total_found as f64 * 100.0).min(100.0)
        };

        let snapshot = LogSnapshot {
            log_info: self.info.clone(),
            session_info: state.session.clone(),
            summary: SummarySection {
                status,
                total_found,
                processed,
                remaining: total_found.saturating_sub(processed),
                completion_percentage,
                statistics: state.stats,
            },
            processed_files_history: self.history.iter().cloned().collect(),
            recent_errors: self.recent_errors.iter().cloned().collect(),
        };
        write_json_atomic(&self.snapshot_path, &snapshot)
    }

    /// Write the lifetime summary with the best compressions of this session.
    pub fn write_summary(&self, state: &CheckpointState) -> Result<()> {
        let stats = &state.stats;
        let compressed = stats.total_compressed;

        let compression_ranges = CompressionRange::ALL
            .iter()
            .map(|range| {
                let count = stats.compression_ranges.get(*range);
                RangeLine {
                    label: range.label(),
                    count,
                    percentage: if compressed == 0 {
                        0.0
                    } else {
                        count as f64 / compressed as f64 * 100.0
                    },
                }
            })
            .collect();

        let error_breakdown = FailureCategory::ALL
            .iter()
            .map(|category| CategoryLine {
                category: *category,
                count: stats.error_breakdown.get(*category),
            })
            .collect();

        let summary = LifetimeSummary {
            completed_at: Utc::now(),
            log_info: &self.info,
            session_info: &state.session,
            statistics: stats,
            overall_compression_ratio: stats.overall_ratio(),
            compression_ranges,
            error_breakdown,
            top_compressions: self.top_compressions.iter().collect(),
        };
        write_json_atomic(&self.summary_path, &summary)
    }

    fn read_snapshot(&self) -> Option<LogSnapshot> {
        let raw = fs::read_to_string(&self.snapshot_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(path = %self.snapshot_path.display(), error = %err, "Ignoring unreadable log snapshot");
                None
            }
        }
    }

    fn emit(&mut self, event: &Event<'_>) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *events, event)
            .map_err(std::io::Error::from)
            .and_then(|_| events.write_all(b"\n"));
        if let Err(err) = written {
            warn!(error = %err, "Failed to append to event log");
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    fs::create_dir_all(parent_dir(path))?;
    OpenOptions::new().create(true).append(true).open(path)
}

fn trim_front<T>(queue: &mut VecDeque<T>, limit: usize) {
    while queue.len() > limit {
        queue.pop_front();
    }
}

use crate::checkpoint::{CheckpointState, CheckpointStore, RunStatus};
use crate::config::BatchConfig;
use crate::constants::{
    COMPRESSED_SIZE_PREFIX, COMPRESSION_RATIO_PREFIX, INFO_PREFIX, ORIGINAL_SIZE_PREFIX,
    SUCCESS_PREFIX, WARNING_PREFIX,
};
use crate::copy::{copy_verbatim, is_up_to_date};
use crate::discovery::{discover, FileRecord};
use crate::engine::{build_engine, compress_file, CompressionEngine};
use crate::error::{CompressionError, Result};
use crate::logger::is_quiet;
use crate::outcome::{Aggregate, CompressionRange, FailureCategory, ProcessingResult};
use crate::progress::{LogInfo, ProgressLog, RunState};
use crate::say;
use crate::utils::{absolutize, create_progress_bar, format_file_size};
use chrono::Utc;
use indicatif::ProgressBar;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discover,
    FilterResumed,
    CompressLoop,
    CopyPassthrough,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discover => "discover",
            Phase::FilterResumed => "filter_resumed",
            Phase::CompressLoop => "compress_loop",
            Phase::CopyPassthrough => "copy_passthrough",
            Phase::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared stop flag. Files already running finish; nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassthroughStats {
    pub copied: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub total_found: usize,
    pub skipped_resumed: usize,
    /// Target files merged during this session.
    pub processed: usize,
    pub session: Aggregate,
    /// Totals across every session of this batch.
    pub lifetime: Aggregate,
    pub passthrough: PassthroughStats,
    pub resume_count: u32,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub output_root: PathBuf,
}

struct Paths {
    input_root: PathBuf,
    output_root: PathBuf,
    checkpoint: PathBuf,
    log: PathBuf,
}

pub struct BatchCompressor {
    config: BatchConfig,
    engine: Box<dyn CompressionEngine>,
    cancel: CancelToken,
    hide_progress: bool,
}

impl BatchCompressor {
    pub fn new(config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let engine = build_engine(&config)?;
        Ok(Self::assemble(config, engine))
    }

    /// Use a caller-supplied engine instead of the configured one.
    pub fn with_engine(config: BatchConfig, engine: Box<dyn CompressionEngine>) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, engine))
    }

    fn assemble(config: BatchConfig, engine: Box<dyn CompressionEngine>) -> Self {
        Self {
            config,
            engine,
            cancel: CancelToken::new(),
            hide_progress: false,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn hide_progress(mut self, hidden: bool) -> Self {
        self.hide_progress = hidden;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn prepare_paths(&self) -> Result<Paths> {
        let input = &self.config.input_root;
        if !input.exists() {
            return Err(CompressionError::InputNotFound(input.clone()));
        }
        if !input.is_dir() {
            return Err(CompressionError::InputNotDirectory(input.clone()));
        }
        let output_root = self.config.output_root();
        fs::create_dir_all(&output_root)
            .map_err(|_| CompressionError::DirectoryCreationFailed(output_root.clone()))?;

        Ok(Paths {
            input_root: input.canonicalize()?,
            output_root: output_root.canonicalize()?,
            checkpoint: absolutize(&self.config.checkpoint_path),
            log: absolutize(&self.config.log_path),
        })
    }

    pub fn run(&self) -> Result<BatchReport> {
        let started = Instant::now();
        let paths = self.prepare_paths()?;
        let store = CheckpointStore::new(&paths.checkpoint);
        if self.config.fresh {
            store.discard()?;
        }

        let now = Utc::now();
        let previous = match store.status() {
            RunStatus::InProgress(state) => Some(state),
            RunStatus::Completed(marker) => Some(marker.state),
            RunStatus::NotStarted => None,
        };
        let (mut state, resumed) = match previous {
            Some(mut state) if state.belongs_to(&paths.input_root, &paths.output_root) => {
                state.session.resumed(now);
                (state, true)
            }
            Some(foreign) => {
                warn!(
                    checkpoint = %store.path().display(),
                    recorded_input = ?foreign.input_root,
                    recorded_output = ?foreign.output_root,
                    "Saved state belongs to another batch; starting cold"
                );
                (CheckpointState::for_roots(now, &paths.input_root, &paths.output_root), false)
            }
            None => (CheckpointState::for_roots(now, &paths.input_root, &paths.output_root), false),
        };
        if resumed {
            info!(
                processed = state.processed_files.len(),
                resume_count = state.session.resume_count,
                "Resuming batch"
            );
        }

        let mut log = ProgressLog::open(
            &paths.log,
            LogInfo {
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                input_root: paths.input_root.clone(),
                output_root: paths.output_root.clone(),
                engine: self.engine.name().to_string(),
                ..LogInfo::default()
            },
            resumed,
        );

        let mut report = BatchReport {
            total_found: 0,
            skipped_resumed: 0,
            processed: 0,
            session: Aggregate::default(),
            lifetime: Aggregate::default(),
            passthrough: PassthroughStats::default(),
            resume_count: state.session.resume_count,
            interrupted: false,
            elapsed: Duration::ZERO,
            output_root: paths.output_root.clone(),
        };

        self.enter(&mut log, Phase::Discover);
        let exclude = excluded_paths(&paths, &store, &log);
        let found = discover(&paths.input_root, &self.config.normalized_extensions(), &exclude)?;
        report.total_found = found.targets.len();
        info!(
            targets = found.targets.len(),
            passthrough = found.passthrough.len(),
            "Discovered files"
        );

        self.enter(&mut log, Phase::FilterResumed);
        let pending: Vec<&FileRecord> = found
            .targets
            .iter()
            .filter(|r| !state.is_processed(&r.identity()))
            .collect();
        report.skipped_resumed = report.total_found - pending.len();
        if report.skipped_resumed > 0 {
            info!(skipped = report.skipped_resumed, "Skipping files from earlier sessions");
        }

        self.enter(&mut log, Phase::CompressLoop);
        let interrupted = self.compress_loop(&pending, &paths, &store, &mut log, &mut state, &mut report)?;
        if interrupted {
            return self.stop(report, &store, &mut log, &state, started);
        }

        self.enter(&mut log, Phase::CopyPassthrough);
        if state.session.copy_phase_start.is_none() {
            state.session.copy_phase_start = Some(Utc::now());
        }
        let interrupted = self.copy_passthrough(&found.passthrough, &paths, &mut log, &mut report);
        if interrupted {
            return self.stop(report, &store, &mut log, &state, started);
        }

        self.enter(&mut log, Phase::Finalize);
        state.last_update = Some(Utc::now());
        if let Err(err) = log.flush(&state, report.total_found as u64, RunState::Completed) {
            warn!(error = %err, "Failed to write progress log");
        }
        if let Err(err) = log.write_summary(&state) {
            warn!(error = %err, "Failed to write summary");
        }
        store.complete(&state, Utc::now())?;

        report.lifetime = state.stats;
        report.elapsed = started.elapsed();
        info!(
            processed = report.processed,
            compressed = report.session.total_compressed,
            errors = report.session.total_errors,
            "Batch complete"
        );
        Ok(report)
    }

    fn enter(&self, log: &mut ProgressLog, phase: Phase) {
        debug!(%phase, "Entering phase");
        log.phase(phase.as_str());
    }

    fn compress_loop(
        &self,
        pending: &[&FileRecord],
        paths: &Paths,
        store: &CheckpointStore,
        log: &mut ProgressLog,
        state: &mut CheckpointState,
        report: &mut BatchReport,
    ) -> Result<bool> {
        if pending.is_empty() {
            return Ok(false);
        }

        let pool = self.build_pool()?;
        let bar = self.progress_bar(pending.len());

        let mut interrupted = false;
        for chunk in pending.chunks(self.config.flush_interval) {
            let results: Vec<Option<ProcessingResult>> = match &pool {
                Some(pool) => pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|record| self.process_one(record, &paths.output_root))
                        .collect()
                }),
                None => chunk
                    .iter()
                    .map(|record| self.process_one(record, &paths.output_root))
                    .collect(),
            };

            // Only this thread touches the checkpoint state.
            for (record, result) in chunk.iter().zip(results) {
                let Some(result) = result else {
                    interrupted = true;
                    continue;
                };
                let identity = record.identity();
                if state.merge(&identity, &result) {
                    report.session.record(&result);
                    report.processed += 1;
                    log.record(&identity, &result);
                }
                bar.inc(1);
            }

            state.last_update = Some(Utc::now());
            store.flush(state)?;
            if let Err(err) = log.flush(state, report.total_found as u64, RunState::InProgress) {
                warn!(error = %err, "Failed to write progress log");
            }

            if interrupted || self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
        }

        if interrupted {
            bar.abandon_with_message("Interrupted");
        } else {
            bar.finish_with_message("Compression complete");
        }
        Ok(interrupted)
    }

    fn build_pool(&self) -> Result<Option<ThreadPool>> {
        if self.config.jobs <= 1 {
            return Ok(None);
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .thread_name(|i| format!("pdf-squeeze-{}", i))
            .build()
            .map(Some)
            .map_err(|e| CompressionError::InvalidConfig(format!("failed to build thread pool: {}", e)))
    }

    /// `None` when cancellation was requested before this file started.
    fn process_one(&self, record: &FileRecord, output_root: &Path) -> Option<ProcessingResult> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let destination = record.destination(output_root);
        let result = compress_file(
            self.engine.as_ref(),
            &record.path,
            &destination,
            self.config.min_savings_percent,
        );
        match result.failure_category() {
            None => debug!(file = %record.identity(), ratio = result.ratio(), "Compressed"),
            Some(category) => debug!(file = %record.identity(), %category, reason = %result.message, "Fallback"),
        }
        Some(result)
    }

    fn copy_passthrough(
        &self,
        files: &[FileRecord],
        paths: &Paths,
        log: &mut ProgressLog,
        report: &mut BatchReport,
    ) -> bool {
        let bar = self.progress_bar(files.len());
        for record in files {
            if self.cancel.is_cancelled() {
                bar.abandon_with_message("Interrupted");
                return true;
            }
            let destination = record.destination(&paths.output_root);
            if is_up_to_date(&record.path, &destination) {
                report.passthrough.unchanged += 1;
            } else {
                match copy_verbatim(&record.path, &destination) {
                    Ok(_) => report.passthrough.copied += 1,
                    Err(err) => {
                        warn!(file = %record.identity(), error = %err, "Pass-through copy failed");
                        log.copy_failed(&record.identity(), &err.to_string());
                        report.passthrough.failed += 1;
                    }
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        false
    }

    fn stop(
        &self,
        mut report: BatchReport,
        store: &CheckpointStore,
        log: &mut ProgressLog,
        state: &CheckpointState,
        started: Instant,
    ) -> Result<BatchReport> {
        warn!("Interrupted; progress saved, re-run to resume");
        store.flush(state)?;
        if let Err(err) = log.flush(state, report.total_found as u64, RunState::Interrupted) {
            warn!(error = %err, "Failed to write progress log");
        }
        report.lifetime = state.stats;
        report.interrupted = true;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        create_progress_bar(len as u64, self.hide_progress || is_quiet())
    }
}

/// State files that may live inside the input tree must never be treated as input.
fn excluded_paths(paths: &Paths, store: &CheckpointStore, log: &ProgressLog) -> Vec<PathBuf> {
    vec![
        paths.output_root.clone(),
        store.path().to_path_buf(),
        store.marker_path(),
        log.snapshot_path().to_path_buf(),
        log.events_path().to_path_buf(),
        log.summary_path().to_path_buf(),
    ]
}

/// Console summary in the style of the rest of the CLI output.
pub fn print_report(report: &BatchReport) {
    let session = &report.session;
    let lifetime = &report.lifetime;

    if report.interrupted {
        say!("\n{}  Interrupted. Progress was saved; run again to resume.", WARNING_PREFIX);
    } else {
        say!("\n{} Batch compression complete", SUCCESS_PREFIX);
    }
    say!("\n📊 Batch Compression Summary:");
    say!("  📁 PDFs found: {}", report.total_found);
    if report.skipped_resumed > 0 {
        say!("  ⏭️  Already processed earlier: {}", report.skipped_resumed);
    }
    say!("  🔄 Processed this session: {}", report.processed);
    say!("  ✅ Compressed: {}", session.total_compressed);
    say!("  📋 Kept original: {}", session.total_errors);
    say!(
        "  📄 Other files copied: {} (unchanged: {}, failed: {})",
        report.passthrough.copied, report.passthrough.unchanged, report.passthrough.failed
    );
    say!("  ⏱️  Total time: {:?}", report.elapsed);
    if report.processed > 0 && report.elapsed.as_secs_f64() > 0.0 {
        say!(
            "  ⚡ Average speed: {:.2} files/second",
            report.processed as f64 / report.elapsed.as_secs_f64()
        );
    }

    say!("\n{} Lifetime totals (resumes: {}):", INFO_PREFIX, report.resume_count);
    say!("  {} {}", ORIGINAL_SIZE_PREFIX, format_file_size(lifetime.total_original_bytes));
    say!("  {} {}", COMPRESSED_SIZE_PREFIX, format_file_size(lifetime.total_final_bytes));
    say!("  {} {:.1}%", COMPRESSION_RATIO_PREFIX, lifetime.overall_ratio());
    say!("  💾 Space saved: {}", format_file_size(lifetime.space_saved_bytes));

    if lifetime.total_compressed > 0 {
        say!("\n  Compression ranges:");
        for range in CompressionRange::ALL {
            let count = lifetime.compression_ranges.get(range);
            if count > 0 {
                say!("    {:<20} {}", range.label(), count);
            }
        }
    }
    if lifetime.total_errors > 0 {
        say!("\n  Kept originals by reason:");
        for category in FailureCategory::ALL {
            let count = lifetime.error_breakdown.get(category);
            if count > 0 {
                say!("    {:<24} {}", category.as_str(), count);
            }
        }
    }
    say!("\n📁 Output: {}", report.output_root.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::CompressLoop.to_string(), "compress_loop");
        assert_eq!(Phase::CopyPassthrough.as_str(), "copy_passthrough");
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let config = BatchConfig {
            flush_interval: 0,
            ..BatchConfig::new("/tmp")
        };
        assert!(matches!(
            BatchCompressor::new(config),
            Err(CompressionError::InvalidConfig(_))
        ));
    }
}

//! Per-file compression with the verbatim-copy fallback.

pub mod ghostscript;
pub mod rewrite;

pub use ghostscript::GhostscriptEngine;
pub use rewrite::RewriteEngine;

use crate::config::{BatchConfig, EngineKind};
use crate::copy::{copy_verbatim, staging_file};
use crate::error::{CompressionError, Result};
use crate::outcome::{FailureCategory, ProcessingResult};
use crate::utils::calculate_compression_ratio;
use std::fs::{self, File};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, warn};

/// A strategy that turns one PDF into a (hopefully) smaller one.
///
/// `output` is always a fresh temp path beside the final destination; the
/// engine may write it in any way it likes. Returning an error is enough to
/// trigger the fallback copy.
pub trait CompressionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, input: &Path, output: &Path) -> Result<()>;
}

pub fn build_engine(config: &BatchConfig) -> Result<Box<dyn CompressionEngine>> {
    let engine: Box<dyn CompressionEngine> = match config.engine {
        EngineKind::Rewrite => Box::new(RewriteEngine::new(config.image_quality, config.rewrite.clone())),
        EngineKind::Ghostscript => Box::new(GhostscriptEngine::new(&config.ghostscript, config.image_quality)?),
    };
    debug!(engine = engine.name(), "Compression engine ready");
    Ok(engine)
}

/// Compress `input` into `destination`, never leaving a partial destination.
///
/// Exactly one of three things happens: a strictly smaller file lands at
/// `destination`; a byte-identical copy lands there; or, when permissions
/// forbid it, nothing is written at all. The source is only ever read.
pub fn compress_file(
    engine: &dyn CompressionEngine,
    input: &Path,
    destination: &Path,
    min_savings_percent: f64,
) -> ProcessingResult {
    let metadata = match File::open(input).and_then(|f| f.metadata()) {
        Ok(metadata) => metadata,
        Err(err) => return fall_back(input, destination, 0, CompressionError::Io(err)),
    };
    let original_size = metadata.len();

    let staged = match staging_file(destination) {
        Ok(staged) => staged,
        Err(err) => return fall_back(input, destination, original_size, CompressionError::Io(err)),
    };

    // A panic inside one file's engine call must not take the batch down.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.compress(input, staged.path())))
        .unwrap_or_else(|payload| Err(CompressionError::EnginePanicked(panic_message(payload.as_ref()))));
    if let Err(err) = outcome {
        drop(staged);
        return fall_back(input, destination, original_size, err);
    }

    let final_size = match fs::metadata(staged.path()) {
        Ok(m) if m.len() > 0 => m.len(),
        Ok(_) => {
            drop(staged);
            let err = CompressionError::Pdf(format!("{} produced an empty file", engine.name()));
            return fall_back(input, destination, original_size, err);
        }
        Err(err) => {
            drop(staged);
            return fall_back(input, destination, original_size, CompressionError::Io(err));
        }
    };

    if final_size >= original_size {
        drop(staged);
        return copy_with_reason(
            input,
            destination,
            original_size,
            FailureCategory::AlreadyOptimized,
            "Already optimized; original kept".to_string(),
        );
    }

    let ratio = calculate_compression_ratio(original_size, final_size);
    if ratio < min_savings_percent {
        drop(staged);
        return copy_with_reason(
            input,
            destination,
            original_size,
            FailureCategory::MinimalGain,
            format!("Gain of {:.1}% below threshold; original kept", ratio),
        );
    }

    // Match the source's mode instead of the temp file's private one.
    let persisted = fs::set_permissions(staged.path(), metadata.permissions())
        .and_then(|_| staged.persist(destination).map_err(|e| e.error).map(|_| ()));
    match persisted {
        Ok(()) => ProcessingResult::success(original_size, final_size),
        Err(err) => fall_back(input, destination, original_size, CompressionError::Io(err)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fall_back(input: &Path, destination: &Path, original_size: u64, err: CompressionError) -> ProcessingResult {
    let category = err.category();
    let message = err.to_string();
    if !category.copies_source() {
        warn!(file = %input.display(), error = %message, "No output written");
        return ProcessingResult::fallback(category, original_size, message, false);
    }
    copy_with_reason(input, destination, original_size, category, message)
}

fn copy_with_reason(
    input: &Path,
    destination: &Path,
    original_size: u64,
    category: FailureCategory,
    message: String,
) -> ProcessingResult {
    debug!(file = %input.display(), %category, reason = %message, "Falling back to verbatim copy");
    match copy_verbatim(input, destination) {
        Ok(_) => ProcessingResult::fallback(category, original_size, message, true),
        Err(err) => {
            let copy_category = if err.kind() == io::ErrorKind::PermissionDenied {
                FailureCategory::PermissionDenied
            } else {
                FailureCategory::OtherError
            };
            warn!(file = %input.display(), error = %err, "Fallback copy failed");
            ProcessingResult::fallback(
                copy_category,
                original_size,
                format!("{}; fallback copy failed: {}", message, err),
                false,
            )
        }
    }
}

pub const DEFAULT_QUALITY: u8 = 85;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

/// Processed files between two checkpoint flushes.
pub const DEFAULT_FLUSH_INTERVAL: usize = 10;

pub const DEFAULT_TARGET_EXTENSION: &str = "pdf";
pub const DEFAULT_OUTPUT_FOLDER: &str = "compressed";
pub const DEFAULT_CHECKPOINT_FILE: &str = "pdf_squeeze_checkpoint.json";
pub const DEFAULT_LOG_FILE: &str = "pdf_squeeze_log.json";
pub const CHECKPOINT_VERSION: u32 = 1;

pub const HISTORY_LIMIT: usize = 1000;
pub const RECENT_ERRORS_LIMIT: usize = 50;
pub const TOP_COMPRESSIONS_LIMIT: usize = 20;

// External engine (Ghostscript) defaults
pub const DEFAULT_DPI: u32 = 150;
pub const DEFAULT_COMPATIBILITY_LEVEL: &str = "1.4";
pub const DEFAULT_PDF_SETTINGS: &str = "/ebook";
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 600;
pub const GHOSTSCRIPT_CANDIDATES: &[&str] = &["gs", "gswin64c", "gswin32c"];
pub const ENGINE_STDERR_LIMIT: usize = 200;

// Lossless image stream encoding
pub const ZOPFLI_ITERATIONS: u8 = 15;
pub const LIBDEFLATER_MAX_LEVEL: u8 = 12;
pub const OXIPNG_PRESET: u8 = 6;

pub const PROGRESS_BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

// Common output message prefixes
pub const ORIGINAL_SIZE_PREFIX: &str = "📊 Original size:";
pub const COMPRESSED_SIZE_PREFIX: &str = "📈 Compressed size:";
pub const COMPRESSION_RATIO_PREFIX: &str = "🎯 Compression ratio:";
pub const SUCCESS_PREFIX: &str = "✅";
pub const WARNING_PREFIX: &str = "⚠️";
pub const INFO_PREFIX: &str = "📋";

use crate::constants::{
    DEFAULT_CHECKPOINT_FILE, DEFAULT_COMPATIBILITY_LEVEL, DEFAULT_DPI,
    DEFAULT_ENGINE_TIMEOUT_SECS, DEFAULT_FLUSH_INTERVAL, DEFAULT_LOG_FILE, DEFAULT_OUTPUT_FOLDER,
    DEFAULT_PDF_SETTINGS, DEFAULT_QUALITY, DEFAULT_TARGET_EXTENSION, MAX_QUALITY, MIN_QUALITY,
};
use crate::error::{CompressionError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// In-process object-graph rewrite.
    #[default]
    Rewrite,
    /// Delegate to an external Ghostscript process.
    Ghostscript,
}

impl std::str::FromStr for EngineKind {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rewrite" | "lopdf" | "native" => Ok(EngineKind::Rewrite),
            "ghostscript" | "gs" => Ok(EngineKind::Ghostscript),
            other => Err(CompressionError::InvalidConfig(format!(
                "unknown engine '{}', expected 'rewrite' or 'ghostscript'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostscriptConfig {
    /// Explicit binary; searched on PATH when unset.
    pub binary: Option<PathBuf>,
    pub dpi: u32,
    pub compatibility_level: String,
    pub pdf_settings: String,
    pub timeout_secs: u64,
}

impl Default for GhostscriptConfig {
    fn default() -> Self {
        Self {
            binary: None,
            dpi: DEFAULT_DPI,
            compatibility_level: DEFAULT_COMPATIBILITY_LEVEL.to_string(),
            pdf_settings: DEFAULT_PDF_SETTINGS.to_string(),
            timeout_secs: DEFAULT_ENGINE_TIMEOUT_SECS,
        }
    }
}

impl GhostscriptConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub remove_unreferenced: bool,
    pub recompress_images: bool,
    pub recompress_streams: bool,
    /// Zopfli instead of libdeflate for lossless image planes. Much slower.
    pub zopfli: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            remove_unreferenced: true,
            recompress_images: true,
            recompress_streams: true,
            zopfli: false,
        }
    }
}

/// Everything a batch run needs. Loadable from JSON; absent keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub input_root: PathBuf,
    /// Defaults to `<input_root>/compressed`.
    pub output_root: Option<PathBuf>,
    pub checkpoint_path: PathBuf,
    pub log_path: PathBuf,
    pub engine: EngineKind,
    pub image_quality: u8,
    /// Gains below this percentage are treated as `minimal_gain` fallbacks.
    pub min_savings_percent: f64,
    pub flush_interval: usize,
    pub jobs: usize,
    pub target_extensions: Vec<String>,
    /// Ignore any checkpoint or completion marker and start cold.
    #[serde(skip)]
    pub fresh: bool,
    pub ghostscript: GhostscriptConfig,
    pub rewrite: RewriteConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::new(),
            output_root: None,
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
            log_path: PathBuf::from(DEFAULT_LOG_FILE),
            engine: EngineKind::default(),
            image_quality: DEFAULT_QUALITY,
            min_savings_percent: 0.0,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            jobs: 1,
            target_extensions: vec![DEFAULT_TARGET_EXTENSION.to_string()],
            fresh: false,
            ghostscript: GhostscriptConfig::default(),
            rewrite: RewriteConfig::default(),
        }
    }
}

impl BatchConfig {
    pub fn new(input_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| CompressionError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn output_root(&self) -> PathBuf {
        self.output_root
            .clone()
            .unwrap_or_else(|| self.input_root.join(DEFAULT_OUTPUT_FOLDER))
    }

    /// Field checks that do not touch the filesystem.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&self.image_quality) {
            return Err(CompressionError::InvalidQuality(self.image_quality));
        }
        if self.flush_interval == 0 {
            return Err(CompressionError::InvalidConfig(
                "flush_interval must be at least 1".to_string(),
            ));
        }
        if self.jobs == 0 {
            return Err(CompressionError::InvalidConfig(
                "jobs must be at least 1".to_string(),
            ));
        }
        if self.target_extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(CompressionError::InvalidConfig(
                "target_extensions must list at least one extension".to_string(),
            ));
        }
        if !(0.0..100.0).contains(&self.min_savings_percent) {
            return Err(CompressionError::InvalidConfig(format!(
                "min_savings_percent must be in [0, 100), got {}",
                self.min_savings_percent
            )));
        }
        if self.engine == EngineKind::Ghostscript && self.ghostscript.timeout_secs == 0 {
            return Err(CompressionError::InvalidConfig(
                "ghostscript.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Extensions without a leading dot, as matched by discovery.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.target_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_string())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

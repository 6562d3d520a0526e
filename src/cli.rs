use crate::config::{BatchConfig, EngineKind};
use crate::error::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pdf-squeeze",
    about = "Crash-resumable batch PDF compression",
    long_about = "pdf-squeeze mirrors a directory tree into an output folder, compressing every PDF it finds \
                  and copying everything else verbatim. Progress is checkpointed so an interrupted run \
                  picks up where it stopped. A file that cannot be made smaller is copied unchanged.",
    version,
    after_help = "EXAMPLES:\n  \
    pdf-squeeze batch ./scans\n  \
    pdf-squeeze batch ./scans ./scans-small -q 70 -j 4\n  \
    pdf-squeeze batch ./scans --engine ghostscript --dpi 120\n  \
    pdf-squeeze compress report.pdf report-small.pdf\n  \
    pdf-squeeze status"
)]
pub struct Args {
    #[arg(long, global = true, help = "Only print warnings and errors")]
    pub quiet: bool,

    #[arg(
        short = 'v',
        long,
        global = true,
        conflicts_with = "quiet",
        help = "Print per-file details",
        long_help = "Enable debug logging for pdf-squeeze. RUST_LOG overrides both --quiet and --verbose."
    )]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(
        about = "Compress a directory tree of PDFs, resuming any interrupted run",
        long_about = "Walk the input directory, compress each PDF into the mirrored output tree and copy \
                      all other files. Re-running after an interruption skips files already handled."
    )]
    Batch(BatchArgs),

    #[command(
        about = "Compress a single PDF file",
        long_about = "Compress one PDF. If the result would not be smaller, the original is copied to the output path."
    )]
    Compress {
        #[arg(help = "Input PDF file path")]
        input: PathBuf,

        #[arg(help = "Output PDF file path")]
        output: PathBuf,

        #[command(flatten)]
        options: EngineArgs,
    },

    #[command(
        about = "Show the state of the checkpoint for a batch",
        long_about = "Report whether a batch has not started, is part way through, or has completed, \
                      with its running totals."
    )]
    Status {
        #[arg(
            long,
            help = "Checkpoint file path",
            long_help = "Checkpoint file to inspect. Defaults to pdf_squeeze_checkpoint.json in the current directory."
        )]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct BatchArgs {
    #[arg(help = "Input directory")]
    pub input: PathBuf,

    #[arg(
        help = "Output directory (default: <input>/compressed)",
        long_help = "Root of the mirrored output tree. Excluded from discovery when it lies inside the input."
    )]
    pub output: Option<PathBuf>,

    #[arg(
        short = 'c',
        long,
        help = "JSON configuration file",
        long_help = "Load settings from a JSON file. Command-line flags override values from the file."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'j',
        long,
        help = "Number of files compressed in parallel (default: 1)"
    )]
    pub jobs: Option<usize>,

    #[arg(
        long,
        help = "Files between checkpoint writes (default: 10)",
        long_help = "How many files are compressed between checkpoint writes. After a crash at most this \
                     many files are processed again."
    )]
    pub flush_interval: Option<usize>,

    #[arg(long, help = "Checkpoint file path")]
    pub checkpoint: Option<PathBuf>,

    #[arg(long, help = "Progress log file path")]
    pub log: Option<PathBuf>,

    #[arg(
        short = 'e',
        long = "extension",
        help = "File extension to compress (repeatable, default: pdf)"
    )]
    pub extensions: Vec<String>,

    #[arg(
        long,
        help = "Ignore any existing checkpoint and start over",
        long_help = "Discard the checkpoint and completion marker before starting, so every file is processed again."
    )]
    pub fresh: bool,

    #[arg(long, help = "Hide the progress bar")]
    pub no_progress: bool,

    #[command(flatten)]
    pub options: EngineArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct EngineArgs {
    #[arg(
        long,
        help = "Compression engine (rewrite, ghostscript)",
        long_help = "rewrite: in-process object graph rewrite with image recompression. \
                     ghostscript: delegate to an external gs binary."
    )]
    pub engine: Option<EngineKind>,

    #[arg(
        short = 'q',
        long,
        help = "Image quality (1-100, default: 85)",
        long_help = "Quality used when re-encoding JPEG images, and passed to Ghostscript as JPEGQ."
    )]
    pub quality: Option<u8>,

    #[arg(
        long,
        help = "Minimum percentage saved to keep a compressed file (default: 0)",
        long_help = "Results that save less than this percentage are discarded and the original is copied instead."
    )]
    pub min_savings: Option<f64>,

    #[arg(long, help = "Use Zopfli for lossless image planes (slow)")]
    pub zopfli: bool,

    #[arg(long, help = "Ghostscript binary (default: search PATH)")]
    pub gs_binary: Option<PathBuf>,

    #[arg(long, help = "Ghostscript image resolution in DPI (default: 150)")]
    pub dpi: Option<u32>,

    #[arg(long, help = "Ghostscript PDFSETTINGS preset (default: /ebook)")]
    pub pdf_settings: Option<String>,

    #[arg(long, help = "Seconds before a Ghostscript run is killed (default: 600)")]
    pub timeout: Option<u64>,
}

impl EngineArgs {
    /// Overlay flags that were given onto `config`.
    pub fn apply(&self, config: &mut BatchConfig) {
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(quality) = self.quality {
            config.image_quality = quality;
        }
        if let Some(min_savings) = self.min_savings {
            config.min_savings_percent = min_savings;
        }
        if self.zopfli {
            config.rewrite.zopfli = true;
        }
        if let Some(binary) = &self.gs_binary {
            config.ghostscript.binary = Some(binary.clone());
        }
        if let Some(dpi) = self.dpi {
            config.ghostscript.dpi = dpi;
        }
        if let Some(pdf_settings) = &self.pdf_settings {
            config.ghostscript.pdf_settings = pdf_settings.clone();
        }
        if let Some(timeout) = self.timeout {
            config.ghostscript.timeout_secs = timeout;
        }
    }
}

impl BatchArgs {
    pub fn to_config(&self) -> Result<BatchConfig> {
        let mut config = match &self.config {
            Some(path) => BatchConfig::from_file(path)?,
            None => BatchConfig::default(),
        };
        config.input_root = self.input.clone();
        if let Some(output) = &self.output {
            config.output_root = Some(output.clone());
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(flush_interval) = self.flush_interval {
            config.flush_interval = flush_interval;
        }
        if let Some(checkpoint) = &self.checkpoint {
            config.checkpoint_path = checkpoint.clone();
        }
        if let Some(log) = &self.log {
            config.log_path = log.clone();
        }
        if !self.extensions.is_empty() {
            config.target_extensions = self.extensions.clone();
        }
        config.fresh = self.fresh;
        self.options.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn batch(argv: &[&str]) -> BatchArgs {
        let mut full = vec!["pdf-squeeze", "batch"];
        full.extend_from_slice(argv);
        match Args::try_parse_from(full).unwrap().command {
            Commands::Batch(args) => args,
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn test_batch_defaults() {
        let config = batch(&["./scans"]).to_config().unwrap();
        assert_eq!(config.input_root, PathBuf::from("./scans"));
        assert_eq!(config.output_root(), PathBuf::from("./scans/compressed"));
        assert_eq!(config.engine, EngineKind::Rewrite);
        assert_eq!(config.jobs, 1);
        assert!(!config.fresh);
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("squeeze.json");
        fs::write(&path, r#"{"image_quality": 60, "jobs": 3, "flush_interval": 5}"#).unwrap();

        let config = batch(&[
            "in",
            "out",
            "--config",
            path.to_str().unwrap(),
            "-q",
            "75",
            "--engine",
            "gs",
            "--dpi",
            "96",
            "--fresh",
        ])
        .to_config()
        .unwrap();

        assert_eq!(config.image_quality, 75);
        assert_eq!(config.jobs, 3);
        assert_eq!(config.flush_interval, 5);
        assert_eq!(config.output_root, Some(PathBuf::from("out")));
        assert_eq!(config.engine, EngineKind::Ghostscript);
        assert_eq!(config.ghostscript.dpi, 96);
        assert!(config.fresh);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(batch(&["in", "-q", "0"]).to_config().is_err());
        assert!(batch(&["in", "--flush-interval", "0"]).to_config().is_err());
        assert!(Args::try_parse_from(["pdf-squeeze", "batch", "in", "--engine", "magic"]).is_err());
    }

    #[test]
    fn test_extensions_replace_default() {
        let config = batch(&["in", "-e", "pdf", "-e", ".ai"]).to_config().unwrap();
        assert_eq!(config.normalized_extensions(), vec!["pdf", "ai"]);
    }
}

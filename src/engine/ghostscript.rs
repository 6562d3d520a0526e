use crate::config::GhostscriptConfig;
use crate::constants::{ENGINE_STDERR_LIMIT, GHOSTSCRIPT_CANDIDATES};
use crate::engine::CompressionEngine;
use crate::error::{CompressionError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, instrument};

/// Delegates to an external Ghostscript `pdfwrite` process.
pub struct GhostscriptEngine {
    binary: PathBuf,
    settings: GhostscriptConfig,
    quality: u8,
    runtime: Runtime,
}

impl GhostscriptEngine {
    pub fn new(settings: &GhostscriptConfig, quality: u8) -> Result<Self> {
        let binary = match &settings.binary {
            Some(binary) => locate(binary),
            None => GHOSTSCRIPT_CANDIDATES
                .iter()
                .find_map(|name| locate(Path::new(name))),
        }
        .ok_or_else(|| {
            CompressionError::EngineUnavailable(match &settings.binary {
                Some(binary) => format!("Ghostscript binary {} not found", binary.display()),
                None => format!(
                    "Ghostscript not found on PATH (tried {})",
                    GHOSTSCRIPT_CANDIDATES.join(", ")
                ),
            })
        })?;

        // One worker drives child I/O and timers; callers block on it from any thread.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pdf-squeeze-gs")
            .enable_all()
            .build()?;

        debug!(binary = %binary.display(), "Using Ghostscript");
        Ok(Self {
            binary,
            settings: settings.clone(),
            quality,
            runtime,
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn arguments(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let dpi = self.settings.dpi;
        let mut args: Vec<OsString> = [
            "-dSAFER".to_string(),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
            "-sDEVICE=pdfwrite".to_string(),
            format!("-dCompatibilityLevel={}", self.settings.compatibility_level),
            format!("-dPDFSETTINGS={}", self.settings.pdf_settings),
            format!("-dColorImageResolution={}", dpi),
            format!("-dGrayImageResolution={}", dpi),
            format!("-dMonoImageResolution={}", dpi),
            "-dColorImageDownsampleType=/Bicubic".to_string(),
            "-dGrayImageDownsampleType=/Bicubic".to_string(),
            "-dDownsampleColorImages=true".to_string(),
            "-dDownsampleGrayImages=true".to_string(),
            "-dDownsampleMonoImages=true".to_string(),
            "-dColorImageDownsampleThreshold=1.0".to_string(),
            "-dGrayImageDownsampleThreshold=1.0".to_string(),
            "-dAutoFilterColorImages=false".to_string(),
            "-dAutoFilterGrayImages=false".to_string(),
            "-dColorImageFilter=/DCTEncode".to_string(),
            "-dGrayImageFilter=/DCTEncode".to_string(),
            format!("-dJPEGQ={}", self.quality),
            "-dDetectDuplicateImages=true".to_string(),
            "-dCompressFonts=true".to_string(),
            "-dSubsetFonts=true".to_string(),
            "-dEmbedAllFonts=true".to_string(),
            "-dFastWebView=true".to_string(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        let mut output_arg = OsString::from("-sOutputFile=");
        output_arg.push(output);
        args.push(output_arg);
        args.push(input.as_os_str().to_os_string());
        args
    }

    async fn run(&self, input: &Path, output: &Path) -> Result<()> {
        let child = Command::new(&self.binary)
            .args(self.arguments(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CompressionError::ExternalEngine(format!("failed to start {}: {}", self.binary.display(), e))
            })?;

        let timeout = self.settings.timeout();
        // On expiry the wait future, and with it the child, is dropped and killed.
        let output_status = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(CompressionError::EngineTimeout(timeout)),
        };

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            let excerpt: String = stderr.trim().chars().take(ENGINE_STDERR_LIMIT).collect();
            return Err(CompressionError::ExternalEngine(format!(
                "exited with {}: {}",
                output_status.status, excerpt
            )));
        }
        if !output.exists() {
            return Err(CompressionError::ExternalEngine(
                "no output file was produced".to_string(),
            ));
        }
        Ok(())
    }
}

impl CompressionEngine for GhostscriptEngine {
    fn name(&self) -> &'static str {
        "ghostscript"
    }

    #[instrument(skip_all, fields(file = %input.display()))]
    fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        self.runtime.block_on(self.run(input, output)).map_err(|err| match err {
            // Anything the child does wrong is the engine's failure, I/O included.
            CompressionError::Io(io) => CompressionError::ExternalEngine(io.to_string()),
            other => other,
        })
    }
}

/// Resolve `binary` to an existing file, searching PATH for bare names.
fn locate(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

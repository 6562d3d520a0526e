use crate::outcome::FailureCategory;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid quality value: {0}. Must be between 1 and 100")]
    InvalidQuality(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Input path not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Input path is not a directory: {0}")]
    InputNotDirectory(PathBuf),

    #[error("Failed to create output directory: {0}")]
    DirectoryCreationFailed(PathBuf),

    #[error("Walkdir error: {0}")]
    WalkdirError(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression engine unavailable: {0}")]
    EngineUnavailable(String),

    // -- Per-file failures, mapped onto a FailureCategory --
    #[error("PDF is password protected: {0}")]
    PasswordProtected(String),

    #[error("PDF is corrupted: {0}")]
    CorruptedPdf(String),

    #[error("PDF processing error: {0}")]
    Pdf(String),

    #[error("External engine failed: {0}")]
    ExternalEngine(String),

    #[error("External engine timed out after {0:?}")]
    EngineTimeout(Duration),

    #[error("Compression engine panicked: {0}")]
    EnginePanicked(String),
}

impl CompressionError {
    /// Failure bucket used by the outcome classifier for a per-file error.
    pub fn category(&self) -> FailureCategory {
        match self {
            CompressionError::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                FailureCategory::PermissionDenied
            }
            CompressionError::PasswordProtected(_) => FailureCategory::PasswordProtected,
            CompressionError::CorruptedPdf(_) => FailureCategory::CorruptedInput,
            CompressionError::ExternalEngine(_)
            | CompressionError::EngineTimeout(_)
            | CompressionError::EngineUnavailable(_) => FailureCategory::ExternalEngineFailure,
            _ => FailureCategory::OtherError,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompressionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_io_maps_to_permission_category() {
        let err = CompressionError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(err.category(), FailureCategory::PermissionDenied);
    }

    #[test]
    fn test_other_io_maps_to_other_errors() {
        let err = CompressionError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(err.category(), FailureCategory::OtherError);
    }

    #[test]
    fn test_engine_errors_share_one_category() {
        assert_eq!(
            CompressionError::EngineTimeout(Duration::from_secs(1)).category(),
            FailureCategory::ExternalEngineFailure
        );
        assert_eq!(
            CompressionError::ExternalEngine("exit 1".into()).category(),
            FailureCategory::ExternalEngineFailure
        );
    }

    #[test]
    fn test_pdf_specific_categories() {
        assert_eq!(
            CompressionError::PasswordProtected("x".into()).category(),
            FailureCategory::PasswordProtected
        );
        assert_eq!(
            CompressionError::CorruptedPdf("x".into()).category(),
            FailureCategory::CorruptedInput
        );
        assert_eq!(CompressionError::Pdf("x".into()).category(), FailureCategory::OtherError);
        assert_eq!(
            CompressionError::EnginePanicked("x".into()).category(),
            FailureCategory::OtherError
        );
    }
}

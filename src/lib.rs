pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod constants;
pub mod copy;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod logger;
pub mod outcome;
pub mod pdf;
pub mod progress;
pub mod utils;

pub use batch::{BatchCompressor, BatchReport, CancelToken, PassthroughStats, Phase};
pub use checkpoint::{CheckpointState, CheckpointStore, CompletionMarker, RunStatus, SessionInfo};
pub use config::{BatchConfig, EngineKind, GhostscriptConfig, RewriteConfig};
pub use discovery::{discover, Discovery, FileKind, FileRecord};
pub use engine::{build_engine, compress_file, CompressionEngine, GhostscriptEngine, RewriteEngine};
pub use error::{CompressionError, Result};
pub use outcome::{Aggregate, CompressionRange, FailureCategory, Outcome, ProcessingResult};
pub use progress::{LogInfo, ProgressLog, RunState};

//! Per-file results and the aggregate reducer that classifies them.
//!
//! [`Aggregate`] is a plain value: `record` folds one result in, `merge`
//! combines two partial aggregates. `merge` is associative and commutative
//! with `Aggregate::default()` as identity, which is what lets totals from
//! several resumed sessions add up to the totals of one uninterrupted run.

use crate::utils::calculate_compression_ratio;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a file ended up as a verbatim copy (or, for `PermissionDenied`, with no output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureCategory {
    #[serde(rename = "already_optimized")]
    AlreadyOptimized,
    #[serde(rename = "minimal_gain")]
    MinimalGain,
    #[serde(rename = "password_protected")]
    PasswordProtected,
    #[serde(rename = "corrupted")]
    CorruptedInput,
    #[serde(rename = "permission_denied")]
    PermissionDenied,
    #[serde(rename = "external_engine_failure")]
    ExternalEngineFailure,
    #[serde(rename = "other_errors")]
    OtherError,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 7] = [
        FailureCategory::AlreadyOptimized,
        FailureCategory::MinimalGain,
        FailureCategory::PasswordProtected,
        FailureCategory::CorruptedInput,
        FailureCategory::PermissionDenied,
        FailureCategory::ExternalEngineFailure,
        FailureCategory::OtherError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::AlreadyOptimized => "already_optimized",
            FailureCategory::MinimalGain => "minimal_gain",
            FailureCategory::PasswordProtected => "password_protected",
            FailureCategory::CorruptedInput => "corrupted",
            FailureCategory::PermissionDenied => "permission_denied",
            FailureCategory::ExternalEngineFailure => "external_engine_failure",
            FailureCategory::OtherError => "other_errors",
        }
    }

    /// Every category except `PermissionDenied` still produces a verbatim copy.
    pub fn copies_source(&self) -> bool {
        !matches!(self, FailureCategory::PermissionDenied)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size-reduction bucket for successful compressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionRange {
    Excellent,
    Good,
    Moderate,
    Low,
    Minimal,
}

impl CompressionRange {
    pub const ALL: [CompressionRange; 5] = [
        CompressionRange::Excellent,
        CompressionRange::Good,
        CompressionRange::Moderate,
        CompressionRange::Low,
        CompressionRange::Minimal,
    ];

    /// Buckets a reduction percentage: >=50 excellent, >=30 good, >=15 moderate,
    /// >=5 low, below that minimal.
    pub fn from_ratio(ratio_percent: f64) -> Self {
        if ratio_percent >= 50.0 {
            CompressionRange::Excellent
        } else if ratio_percent >= 30.0 {
            CompressionRange::Good
        } else if ratio_percent >= 15.0 {
            CompressionRange::Moderate
        } else if ratio_percent >= 5.0 {
            CompressionRange::Low
        } else {
            CompressionRange::Minimal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CompressionRange::Excellent => "Excellent (>=50%)",
            CompressionRange::Good => "Good (30-50%)",
            CompressionRange::Moderate => "Moderate (15-30%)",
            CompressionRange::Low => "Low (5-15%)",
            CompressionRange::Minimal => "Minimal (<5%)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "category", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fallback(FailureCategory),
}

/// Result of compressing exactly one target file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub outcome: Outcome,
    pub original_size: u64,
    pub final_size: u64,
    pub message: String,
    /// False only when nothing could be written to the destination.
    pub output_written: bool,
}

impl ProcessingResult {
    pub fn success(original_size: u64, final_size: u64) -> Self {
        debug_assert!(final_size < original_size);
        let ratio = calculate_compression_ratio(original_size, final_size);
        Self {
            outcome: Outcome::Success,
            original_size,
            final_size,
            message: format!("Compressed ({:.1}% reduction)", ratio),
            output_written: true,
        }
    }

    /// A verbatim copy keeps the original size; no output means a final size of zero.
    pub fn fallback(
        category: FailureCategory,
        original_size: u64,
        message: impl Into<String>,
        output_written: bool,
    ) -> Self {
        Self {
            outcome: Outcome::Fallback(category),
            original_size,
            final_size: if output_written { original_size } else { 0 },
            message: message.into(),
            output_written,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Fallback(category) => Some(category),
        }
    }

    /// Reduction in percent; zero for anything that is not a success.
    pub fn ratio(&self) -> f64 {
        if self.is_success() {
            calculate_compression_ratio(self.original_size, self.final_size)
        } else {
            0.0
        }
    }

    pub fn range(&self) -> Option<CompressionRange> {
        self.is_success().then(|| CompressionRange::from_ratio(self.ratio()))
    }

    pub fn bytes_saved(&self) -> u64 {
        if self.is_success() {
            self.original_size - self.final_size
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeHistogram {
    pub excellent: u64,
    pub good: u64,
    pub moderate: u64,
    pub low: u64,
    pub minimal: u64,
}

impl RangeHistogram {
    pub fn get(&self, range: CompressionRange) -> u64 {
        match range {
            CompressionRange::Excellent => self.excellent,
            CompressionRange::Good => self.good,
            CompressionRange::Moderate => self.moderate,
            CompressionRange::Low => self.low,
            CompressionRange::Minimal => self.minimal,
        }
    }

    fn slot(&mut self, range: CompressionRange) -> &mut u64 {
        match range {
            CompressionRange::Excellent => &mut self.excellent,
            CompressionRange::Good => &mut self.good,
            CompressionRange::Moderate => &mut self.moderate,
            CompressionRange::Low => &mut self.low,
            CompressionRange::Minimal => &mut self.minimal,
        }
    }

    pub fn total(&self) -> u64 {
        CompressionRange::ALL.iter().map(|r| self.get(*r)).sum()
    }

    fn merge(&mut self, other: &RangeHistogram) {
        for range in CompressionRange::ALL {
            *self.slot(range) += other.get(range);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureBreakdown {
    pub already_optimized: u64,
    pub minimal_gain: u64,
    pub password_protected: u64,
    pub corrupted: u64,
    pub permission_denied: u64,
    pub external_engine_failure: u64,
    pub other_errors: u64,
}

impl FailureBreakdown {
    pub fn get(&self, category: FailureCategory) -> u64 {
        match category {
            FailureCategory::AlreadyOptimized => self.already_optimized,
            FailureCategory::MinimalGain => self.minimal_gain,
            FailureCategory::PasswordProtected => self.password_protected,
            FailureCategory::CorruptedInput => self.corrupted,
            FailureCategory::PermissionDenied => self.permission_denied,
            FailureCategory::ExternalEngineFailure => self.external_engine_failure,
            FailureCategory::OtherError => self.other_errors,
        }
    }

    fn slot(&mut self, category: FailureCategory) -> &mut u64 {
        match category {
            FailureCategory::AlreadyOptimized => &mut self.already_optimized,
            FailureCategory::MinimalGain => &mut self.minimal_gain,
            FailureCategory::PasswordProtected => &mut self.password_protected,
            FailureCategory::CorruptedInput => &mut self.corrupted,
            FailureCategory::PermissionDenied => &mut self.permission_denied,
            FailureCategory::ExternalEngineFailure => &mut self.external_engine_failure,
            FailureCategory::OtherError => &mut self.other_errors,
        }
    }

    pub fn total(&self) -> u64 {
        FailureCategory::ALL.iter().map(|c| self.get(*c)).sum()
    }

    fn merge(&mut self, other: &FailureBreakdown) {
        for category in FailureCategory::ALL {
            *self.slot(category) += other.get(category);
        }
    }
}

/// Running statistics over a stream of [`ProcessingResult`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aggregate {
    pub total_compressed: u64,
    pub total_errors: u64,
    /// Fallback results that still produced a verbatim copy.
    pub total_copied: u64,
    pub total_original_bytes: u64,
    pub total_final_bytes: u64,
    pub space_saved_bytes: u64,
    pub compression_ranges: RangeHistogram,
    pub error_breakdown: FailureBreakdown,
}

impl Aggregate {
    pub fn record(&mut self, result: &ProcessingResult) {
        match result.outcome {
            Outcome::Success => {
                self.total_compressed += 1;
                self.total_original_bytes += result.original_size;
                self.total_final_bytes += result.final_size;
                self.space_saved_bytes += result.bytes_saved();
                *self
                    .compression_ranges
                    .slot(CompressionRange::from_ratio(result.ratio())) += 1;
            }
            Outcome::Fallback(category) => {
                self.total_errors += 1;
                *self.error_breakdown.slot(category) += 1;
                if result.output_written {
                    self.total_copied += 1;
                }
            }
        }
    }

    pub fn merge(mut self, other: &Aggregate) -> Aggregate {
        self.total_compressed += other.total_compressed;
        self.total_errors += other.total_errors;
        self.total_copied += other.total_copied;
        self.total_original_bytes += other.total_original_bytes;
        self.total_final_bytes += other.total_final_bytes;
        self.space_saved_bytes += other.space_saved_bytes;
        self.compression_ranges.merge(&other.compression_ranges);
        self.error_breakdown.merge(&other.error_breakdown);
        self
    }

    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ProcessingResult>) -> Self {
        results.into_iter().fold(Aggregate::default(), |mut acc, r| {
            acc.record(r);
            acc
        })
    }

    pub fn total_processed(&self) -> u64 {
        self.total_compressed + self.total_errors
    }

    /// Overall reduction over successfully compressed files only.
    pub fn overall_ratio(&self) -> f64 {
        calculate_compression_ratio(self.total_original_bytes, self.total_final_bytes)
    }
}

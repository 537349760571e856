//! Run configuration and startup validation.
//!
//! Invalid option combinations are fatal before any work starts; everything
//! past [`Config::validate`] can assume the numbers are sane.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

/// Default maximum Hamming distance for a frame match.
pub const DEFAULT_PHASH_THRESHOLD: u32 = 12;
/// Default minimum fraction of the longer video required to report overlap.
pub const DEFAULT_MIN_OVERLAP_RATIO: f64 = 0.10;
/// Default slack when clustering by probed duration.
pub const DEFAULT_DURATION_TOLERANCE_SEC: f64 = 2.0;
/// Default minimum diagonal streak length.
pub const DEFAULT_MIN_STREAK_LENGTH: usize = 5;
/// Default tolerated frame-index gap inside a streak.
pub const DEFAULT_GAP_TOLERANCE: u32 = 2;
/// Wall-clock limit for one probe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Wall-clock budget per scheduled frame during extraction.
pub const PER_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

// ── Mode ─────────────────────────────────────────────────────────────────────

/// Search effort preset.  Selects the frame-sampling schedule and decides
/// whether temporal overlap verification runs at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Sparse sampling; visual matches by frame-count only, no subset search.
    Fast,
    /// Medium sampling; full subset/overlap detection.
    Balanced,
    /// Dense sampling; full subset/overlap detection.
    Thorough,
}

impl Mode {
    /// Temporal overlap verification is skipped only in `fast` mode.
    #[inline]
    pub fn subset_detection(self) -> bool {
        !matches!(self, Mode::Fast)
    }
}

// ── KeepPolicy ───────────────────────────────────────────────────────────────

/// Which member of a duplicate group is retained.  Every policy terminates
/// in the lexicographic path tie-break, so selection is a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeepPolicy {
    /// Resolution, then bitrate, then duration, then size, then age.
    BestQuality,
    Oldest,
    Newest,
    Smallest,
    Largest,
}

// ── ArtifactMode ─────────────────────────────────────────────────────────────

/// Handling of partial-download residue (`.part`, `.tmp`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArtifactMode {
    /// Exclude from the pipeline; count separately (default).
    Skip,
    /// Treat like any other file.
    Include,
    /// Exclude, and list them in the report for external deletion.
    Cleanup,
}

// ── ConfigError ──────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No root directories given")]
    NoRoots,
    #[error("min_overlap_ratio {0} outside (0.0, 1.0]")]
    OverlapRatioOutOfRange(f64),
    #[error("phash_threshold {0} exceeds 64 bits")]
    ThresholdTooLarge(u32),
    #[error("phash_frames bounds inverted: min {min} > max {max}")]
    FrameBoundsInverted { min: usize, max: usize },
    #[error("phash_frames minimum must be at least 1")]
    FrameBoundsZero,
    #[error("duration_tolerance_sec {0} is negative")]
    NegativeDurationTolerance(f64),
    #[error("min_streak_length must be at least 2")]
    StreakTooShort,
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    BadGlob { pattern: String, reason: String },
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Everything a run needs, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub roots:         Vec<PathBuf>,
    pub exclude_dirs:  Vec<PathBuf>,
    pub max_depth:     Option<usize>,
    /// File-name glob patterns; empty means "every regular file".
    pub include_globs: Vec<String>,

    pub mode:                   Mode,
    pub min_overlap_ratio:      f64,
    pub phash_threshold:        u32,
    /// Optional override of the per-video min/max frame bounds.
    pub phash_frames:           Option<(usize, usize)>,
    pub duration_tolerance_sec: f64,
    pub same_codec:             bool,
    pub same_container:         bool,
    pub min_streak_length:      usize,
    pub gap_tolerance:          u32,

    pub keep_policy: KeepPolicy,

    /// 0 means "size to the logical CPU count".
    pub io_threads:  usize,
    pub cpu_threads: usize,

    pub cache_path:    PathBuf,
    pub artifact_mode: ArtifactMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roots:         Vec::new(),
            exclude_dirs:  Vec::new(),
            max_depth:     None,
            include_globs: Vec::new(),

            mode:                   Mode::Balanced,
            min_overlap_ratio:      DEFAULT_MIN_OVERLAP_RATIO,
            phash_threshold:        DEFAULT_PHASH_THRESHOLD,
            phash_frames:           None,
            duration_tolerance_sec: DEFAULT_DURATION_TOLERANCE_SEC,
            same_codec:             false,
            same_container:         false,
            min_streak_length:      DEFAULT_MIN_STREAK_LENGTH,
            gap_tolerance:          DEFAULT_GAP_TOLERANCE,

            keep_policy: KeepPolicy::BestQuality,

            io_threads:  0,
            cpu_threads: 0,

            cache_path:    PathBuf::from("viddup.cache"),
            artifact_mode: ArtifactMode::Skip,
        }
    }
}

impl Config {
    /// Reject invalid option combinations.  Called once before the pipeline
    /// touches the filesystem; failure here is fatal (exit code 1).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        if !(self.min_overlap_ratio > 0.0 && self.min_overlap_ratio <= 1.0) {
            return Err(ConfigError::OverlapRatioOutOfRange(self.min_overlap_ratio));
        }
        if self.phash_threshold > 64 {
            return Err(ConfigError::ThresholdTooLarge(self.phash_threshold));
        }
        if let Some((min, max)) = self.phash_frames {
            if min == 0 {
                return Err(ConfigError::FrameBoundsZero);
            }
            if min > max {
                return Err(ConfigError::FrameBoundsInverted { min, max });
            }
        }
        if self.duration_tolerance_sec < 0.0 {
            return Err(ConfigError::NegativeDurationTolerance(self.duration_tolerance_sec));
        }
        if self.min_streak_length < 2 {
            return Err(ConfigError::StreakTooShort);
        }
        for pattern in &self.include_globs {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::BadGlob {
                    pattern: pattern.clone(),
                    reason:  e.to_string(),
                });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn effective_io_threads(&self) -> usize {
        resolve_threads(self.io_threads)
    }

    #[inline]
    pub fn effective_cpu_threads(&self) -> usize {
        resolve_threads(self.cpu_threads)
    }
}

fn resolve_threads(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }
}

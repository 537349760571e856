//! # viddup — duplicate-video detection pipeline
//!
//! Behavioural guarantees (frozen for report schema v1):
//! - Size bucketing never eliminates a file; it only orders the hash work
//! - Partial-hash collision is necessary, never sufficient, for equality;
//!   only identical full-content digests form exact-duplicate groups
//! - Exact-matched files (and only those) leave the visual stages
//! - Segment-bucket lookup is the sole approximate step in matching; the
//!   final frame distance is always the true 64-bit Hamming
//! - Per-file errors never kill a run; only configuration, startup cache
//!   IO, and missing external tools are fatal
//! - The cache log is append-only; a torn tail truncates, a corrupt record
//!   drops alone, and the latest value per key and field wins
//! - Reports are a pure function of their inputs: stable ordering, no
//!   wall-clock reads, atomic tmp→fsync→rename replacement

pub mod config;
pub mod identity;
pub mod scan;
pub mod cache;
pub mod hasher;
pub mod probe;
pub mod media;
pub mod sampler;
pub mod phash;
pub mod phash_index;
pub mod sequence;
pub mod pipeline;
pub mod grouper;
pub mod report;
pub mod progress;

// Flat re-exports for the most common types.
pub use cache::{Cache, CacheError, CacheField, CacheRecord};
pub use config::{ArtifactMode, Config, ConfigError, KeepPolicy, Mode};
pub use grouper::{DuplicateGroup, GroupEvidence, GroupKind, MemberInfo};
pub use hasher::{Digest, FullHash, HashAlgo, Hasher, PartialHash};
pub use identity::{CacheKey, FileMeta};
pub use media::{FfmpegTools, MediaTools};
pub use phash::{hamming, FrameHash, VideoFingerprint};
pub use phash_index::PHashIndex;
pub use pipeline::{FailureKind, FileFailure, Pipeline, PipelineError, RunOutcome};
pub use probe::VideoMeta;
pub use progress::{ProgressEvent, ProgressSink};
pub use report::Report;
pub use sequence::OverlapMatch;

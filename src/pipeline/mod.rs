//! Stage orchestration: the progressive filtration pipeline.
//!
//! Files advance through hashing, probing, fingerprinting, and overlap
//! search as a sequence of filters, each stage consulting and feeding the
//! cache.  The filters only ever *narrow the work*, never the candidate
//! set:
//!
//! - Size bucketing is an ordering hint.  Files in multi-member size
//!   buckets are hashed first because exact duplicates resolve cheapest,
//!   but size-unique files stay in the running — re-encodes never share a
//!   size.
//! - Every file is partial-hashed; only partial-collision groups are
//!   full-hashed.  Identical full digests form exact-duplicate groups, and
//!   only those members leave the visual path.
//! - Remaining files are probed and clustered by (duration, resolution,
//!   optionally codec/container); only clusters of two or more are worth
//!   fingerprinting.
//! - Fingerprints feed one fresh per-run index; candidate pairs from the
//!   index go through temporal overlap verification (skipped in `fast`
//!   mode).
//!
//! # Per-file state machine
//! `scanned → partial-hashed → (full-hashed → exact-matched ▷ terminal)
//! | (probed → fingerprinted → visually/subset-matched ▷ terminal)
//! | (unmatched ▷ terminal) | (failed ▷ terminal)`
//!
//! # Concurrency
//! Two rayon pools: the IO pool owns file reads and external-process
//! invocations, the CPU pool owns DCT hashing and overlap search.  Frame
//! extraction hands decoded buffers to the CPU pool over a bounded channel
//! so a fast extractor cannot pile up decoded frames.  The cache has a
//! single writer thread; stages only enqueue.
//!
//! # Failure semantics
//! Per-file errors are recorded and the file drops out of its remaining
//! stages; the pipeline always finishes.  Only configuration errors,
//! cache/startup IO errors, and missing external tools are fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{info, trace, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::cache::{Cache, CacheError, CacheField};
use crate::config::{ArtifactMode, Config, ConfigError};
use crate::grouper::{build_groups, DuplicateGroup, GroupInput, MatchEdge, MatchKind};
use crate::hasher::{FullHash, Hasher, PartialHash};
use crate::identity::FileMeta;
use crate::media::{MediaTools, ToolCheckError};
use crate::phash::{extract_frames, hash_extracted, FrameHash, VideoFingerprint};
use crate::phash_index::PHashIndex;
use crate::probe::VideoMeta;
use crate::progress::{FileOutcome, ProgressEvent, ProgressSink, Stage};
use crate::report::Report;
use crate::sampler::sample_timestamps;
use crate::scan::{discover, ScanError};
use crate::sequence::{frame_match_stats, match_fingerprints, MatchParams};

// ── Errors ───────────────────────────────────────────────────────────────────

/// Fatal pipeline errors — everything that stops a run before or at startup.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Tools(#[from] ToolCheckError),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
}

impl PipelineError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_)     => 1,
            PipelineError::Cache(_)      => 2,
            PipelineError::Scan(_)       => 2,
            PipelineError::Tools(_)      => 3,
            PipelineError::ThreadPool(_) => 3,
        }
    }
}

/// Error-taxonomy bucket for one recorded per-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Io,
    ExternalProcess,
    Decode,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Io              => "io",
            FailureKind::ExternalProcess => "external_process",
            FailureKind::Decode          => "decode",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path:    PathBuf,
    pub kind:    FailureKind,
    pub message: String,
}

// ── Per-file state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Scanned,
    PartialHashed,
    FullHashed,
    ExactMatched,
    Probed,
    Fingerprinted,
    VisuallyMatched,
    SubsetMatched,
    Unmatched,
    Failed,
}

struct FileEntry {
    meta:        FileMeta,
    state:       FileState,
    partial:     Option<PartialHash>,
    full:        Option<FullHash>,
    video:       Option<VideoMeta>,
    fingerprint: Option<VideoFingerprint>,
}

impl FileEntry {
    fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            state:       FileState::Scanned,
            partial:     None,
            full:        None,
            video:       None,
            fingerprint: None,
        }
    }

    fn fail(&mut self, failures: &mut Vec<FileFailure>, kind: FailureKind, message: String) {
        self.state = FileState::Failed;
        failures.push(FileFailure { path: self.meta.path.clone(), kind, message });
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub discovered:       usize,
    pub artifacts:        usize,
    pub exact_groups:     usize,
    pub probed:           usize,
    pub clustered:        usize,
    pub fingerprinted:    usize,
    pub candidate_pairs:  usize,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub groups:        Vec<DuplicateGroup>,
    pub failures:      Vec<FileFailure>,
    pub artifacts:     Vec<PathBuf>,
    pub interrupted:   bool,
    /// Escalated stop: the run bailed before grouping; write no report.
    pub aborted:       bool,
    pub scan_time_sec: f64,
    pub stats:         RunStats,
}

impl RunOutcome {
    pub fn to_report(&self) -> Report {
        Report::new(
            self.groups.clone(),
            self.failures.clone(),
            self.artifacts.clone(),
            self.scan_time_sec,
            self.interrupted,
        )
    }
}

// ── Stage accounting ─────────────────────────────────────────────────────────

struct StageCounter {
    stage:     Stage,
    succeeded: AtomicUsize,
    skipped:   AtomicUsize,
    failed:    AtomicUsize,
}

impl StageCounter {
    fn start(progress: &ProgressSink, stage: Stage, total: usize) -> Self {
        progress.emit(ProgressEvent::StageStarted { stage, total });
        Self {
            stage,
            succeeded: AtomicUsize::new(0),
            skipped:   AtomicUsize::new(0),
            failed:    AtomicUsize::new(0),
        }
    }

    fn file(&self, progress: &ProgressSink, path: &std::path::Path, outcome: FileOutcome) {
        let counter = match outcome {
            FileOutcome::Succeeded => &self.succeeded,
            FileOutcome::Skipped   => &self.skipped,
            FileOutcome::Failed    => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        progress.emit(ProgressEvent::FileFinished {
            stage: self.stage,
            path:  path.to_path_buf(),
            outcome,
        });
    }

    fn finish(self, progress: &ProgressSink) {
        progress.emit(ProgressEvent::StageFinished {
            stage:     self.stage,
            succeeded: self.succeeded.into_inner(),
            skipped:   self.skipped.into_inner(),
            failed:    self.failed.into_inner(),
        });
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline<'a> {
    cfg:      &'a Config,
    tools:    &'a dyn MediaTools,
    progress: ProgressSink,
    stop:     Arc<AtomicBool>,
    abort:    Arc<AtomicBool>,
    cache:    Cache,
    hasher:   Hasher,
    io_pool:  rayon::ThreadPool,
    cpu_pool: rayon::ThreadPool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        cfg: &'a Config,
        tools: &'a dyn MediaTools,
        progress: ProgressSink,
    ) -> Result<Self, PipelineError> {
        Self::with_hasher(cfg, tools, progress, Hasher::default())
    }

    /// Constructor with an injectable hasher (tests shrink the partial-hash
    /// window geometry through this).
    pub fn with_hasher(
        cfg: &'a Config,
        tools: &'a dyn MediaTools,
        progress: ProgressSink,
        hasher: Hasher,
    ) -> Result<Self, PipelineError> {
        cfg.validate()?;
        tools.check_available()?;

        let io_threads = cfg.effective_io_threads();
        let cpu_threads = cfg.effective_cpu_threads();
        let cache = Cache::open_with_queue(&cfg.cache_path, 4 * io_threads)?;

        let io_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(io_threads)
            .thread_name(|i| format!("viddup-io-{i}"))
            .build()
            .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;
        let cpu_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cpu_threads)
            .thread_name(|i| format!("viddup-cpu-{i}"))
            .build()
            .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;

        Ok(Self {
            cfg,
            tools,
            progress,
            stop: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
            cache,
            hasher,
            io_pool,
            cpu_pool,
        })
    }

    /// Cooperative stop flag; polled at every dequeue and after each file.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Escalated stop: bail right after the cache flush, no report.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    #[inline]
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    // ── Run ──────────────────────────────────────────────────────────────────

    pub fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();
        let mut stats = RunStats::default();
        let mut failures: Vec<FileFailure> = Vec::new();
        let mut edges: Vec<MatchEdge> = Vec::new();

        // Discovery.
        let counter = StageCounter::start(&self.progress, Stage::Discover, 0);
        let scan = discover(self.cfg)?;
        stats.discovered = scan.files.len();
        stats.artifacts = scan.artifacts.len();
        for (path, message) in scan.walk_errors {
            failures.push(FileFailure { path, kind: FailureKind::Io, message });
        }
        let report_artifacts = match self.cfg.artifact_mode {
            ArtifactMode::Cleanup => scan.artifacts.clone(),
            _ => Vec::new(),
        };
        info!(target: "pipeline",
            "discovered {} files ({} artifacts set aside)", stats.discovered, stats.artifacts);
        let mut entries: Vec<FileEntry> = scan.files.into_iter().map(FileEntry::new).collect();
        counter.finish(&self.progress);

        // Size bucketing: ordering hint only.  Every scanned file appears in
        // the hashing order exactly once.
        let order = size_priority_order(&entries);
        debug_assert_eq!(order.len(), entries.len());

        self.partial_hash_stage(&mut entries, &order, &mut failures);

        if !self.stopped() {
            stats.exact_groups = self.full_hash_stage(&mut entries, &mut failures, &mut edges);
        }
        if !self.stopped() {
            stats.probed = self.probe_stage(&mut entries, &mut failures);
        }

        let clusters = if self.stopped() {
            Vec::new()
        } else {
            let eligible: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.state == FileState::Probed
                        && e.video.as_ref().is_some_and(|v| !v.is_degenerate())
                })
                .map(|(ix, _)| ix)
                .collect();
            let clusters = cluster_by_metadata(
                &entries,
                &eligible,
                self.cfg.duration_tolerance_sec,
                self.cfg.same_codec,
                self.cfg.same_container,
                self.cfg.mode.subset_detection(),
            );
            stats.clustered = clusters.iter().map(Vec::len).sum();
            trace!(target: "pipeline",
                "{} files in {} metadata clusters", stats.clustered, clusters.len());
            clusters
        };

        if !self.stopped() && !clusters.is_empty() {
            stats.fingerprinted = self.fingerprint_stage(&mut entries, &clusters, &mut failures);
        }
        if !self.stopped() {
            stats.candidate_pairs = self.overlap_stage(&mut entries, &mut edges);
        }

        // Everything not matched and not failed is terminally unmatched.
        for entry in &mut entries {
            match entry.state {
                FileState::ExactMatched
                | FileState::VisuallyMatched
                | FileState::SubsetMatched
                | FileState::Failed => {}
                _ => entry.state = FileState::Unmatched,
            }
        }

        let interrupted = self.stopped();
        if interrupted {
            self.progress.emit(ProgressEvent::Interrupted);
        }

        // Durability point: everything computed so far survives this run.
        self.cache.flush();
        if self.aborted() {
            warn!(target: "pipeline", "aborted by operator; cache flushed, no report");
            return Ok(RunOutcome {
                groups: Vec::new(),
                failures,
                artifacts: report_artifacts,
                interrupted: true,
                aborted: true,
                scan_time_sec: started.elapsed().as_secs_f64(),
                stats,
            });
        }

        // Grouping.
        let counter = StageCounter::start(&self.progress, Stage::Group, edges.len());
        let inputs: Vec<GroupInput<'_>> = entries
            .iter()
            .map(|e| GroupInput { meta: &e.meta, video: e.video.as_ref() })
            .collect();
        let groups = build_groups(&inputs, &edges, self.cfg.keep_policy, self.cfg.phash_threshold);
        counter.finish(&self.progress);
        info!(target: "pipeline",
            "{} duplicate groups ({} exact)", groups.len(), stats.exact_groups);

        Ok(RunOutcome {
            groups,
            failures,
            artifacts: report_artifacts,
            interrupted,
            aborted: false,
            scan_time_sec: started.elapsed().as_secs_f64(),
            stats,
        })
    }

    // ── Stage: partial hashing ───────────────────────────────────────────────

    fn partial_hash_stage(
        &self,
        entries: &mut [FileEntry],
        order: &[usize],
        failures: &mut Vec<FileFailure>,
    ) {
        let counter = StageCounter::start(&self.progress, Stage::PartialHash, order.len());
        let snapshot: &[FileEntry] = entries;
        let results: Vec<(usize, Option<Result<PartialHash, std::io::Error>>)> =
            self.io_pool.install(|| {
                order
                    .par_iter()
                    .map(|&ix| {
                        let entry = &snapshot[ix];
                        if self.stopped() {
                            counter.file(&self.progress, &entry.meta.path, FileOutcome::Skipped);
                            return (ix, None);
                        }
                        let key = entry.meta.cache_key();
                        let cached = self
                            .cache
                            .lookup(&key)
                            .and_then(|r| r.partial_hash)
                            .filter(|p| p.algo == self.hasher.algo());
                        let result = match cached {
                            Some(hit) => Ok(hit),
                            None => self.hasher.partial(&entry.meta.path, entry.meta.size).map(
                                |fresh| {
                                    self.cache.put(key, CacheField::Partial(fresh.clone()));
                                    fresh
                                },
                            ),
                        };
                        let outcome = if result.is_ok() {
                            FileOutcome::Succeeded
                        } else {
                            FileOutcome::Failed
                        };
                        counter.file(&self.progress, &entry.meta.path, outcome);
                        (ix, Some(result))
                    })
                    .collect()
            });
        counter.finish(&self.progress);

        for (ix, result) in results {
            match result {
                Some(Ok(partial)) => {
                    entries[ix].partial = Some(partial);
                    entries[ix].state = FileState::PartialHashed;
                }
                Some(Err(e)) => {
                    entries[ix].fail(failures, FailureKind::Io, format!("partial hash: {e}"));
                }
                None => {} // skipped by stop; stays Scanned → Unmatched
            }
        }
    }

    // ── Stage: full hashing over partial collisions ──────────────────────────

    /// Returns the number of exact-duplicate groups found.
    fn full_hash_stage(
        &self,
        entries: &mut [FileEntry],
        failures: &mut Vec<FileFailure>,
        edges: &mut Vec<MatchEdge>,
    ) -> usize {
        // Partial collision is a necessary condition for full equality, so
        // only collision groups are worth streaming end to end.
        let mut by_partial: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (ix, entry) in entries.iter().enumerate() {
            if let Some(partial) = &entry.partial {
                let (algo, head, tail, mid) = partial.collision_key();
                let key = format!(
                    "{}:{}:{}:{}",
                    algo.name(),
                    head,
                    tail,
                    mid.map(|d| d.to_hex()).unwrap_or_default(),
                );
                by_partial.entry(key).or_default().push(ix);
            }
        }
        let candidates: Vec<usize> = by_partial
            .into_values()
            .filter(|group| group.len() >= 2)
            .flatten()
            .collect();

        let counter = StageCounter::start(&self.progress, Stage::FullHash, candidates.len());
        let snapshot: &[FileEntry] = entries;
        let results: Vec<(usize, Option<Result<FullHash, std::io::Error>>)> =
            self.io_pool.install(|| {
                candidates
                    .par_iter()
                    .map(|&ix| {
                        let entry = &snapshot[ix];
                        if self.stopped() {
                            counter.file(&self.progress, &entry.meta.path, FileOutcome::Skipped);
                            return (ix, None);
                        }
                        let key = entry.meta.cache_key();
                        let cached = self
                            .cache
                            .lookup(&key)
                            .and_then(|r| r.full_hash)
                            .filter(|f| f.algo == self.hasher.algo());
                        let result = match cached {
                            Some(hit) => Ok(hit),
                            None => self.hasher.full(&entry.meta.path).map(|fresh| {
                                self.cache.put(key, CacheField::Full(fresh.clone()));
                                fresh
                            }),
                        };
                        let outcome = if result.is_ok() {
                            FileOutcome::Succeeded
                        } else {
                            FileOutcome::Failed
                        };
                        counter.file(&self.progress, &entry.meta.path, outcome);
                        (ix, Some(result))
                    })
                    .collect()
            });
        counter.finish(&self.progress);

        let mut by_digest: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (ix, result) in results {
            match result {
                Some(Ok(full)) => {
                    by_digest.entry(full.digest.to_hex()).or_default().push(ix);
                    entries[ix].full = Some(full);
                    entries[ix].state = FileState::FullHashed;
                }
                Some(Err(e)) => {
                    entries[ix].fail(failures, FailureKind::Io, format!("full hash: {e}"));
                }
                None => {}
            }
        }

        let mut exact_groups = 0usize;
        for (_, mut members) in by_digest {
            if members.len() < 2 {
                continue; // unique digest: stays in the visual path
            }
            members.sort_unstable();
            exact_groups += 1;
            let digest = entries[members[0]]
                .full
                .as_ref()
                .expect("grouped members have digests")
                .digest;
            for &ix in &members {
                entries[ix].state = FileState::ExactMatched;
            }
            for window in members.windows(2) {
                edges.push(MatchEdge {
                    a:    window[0] as u32,
                    b:    window[1] as u32,
                    kind: MatchKind::Exact { digest },
                });
            }
        }
        exact_groups
    }

    // ── Stage: probe ─────────────────────────────────────────────────────────

    fn probe_stage(&self, entries: &mut [FileEntry], failures: &mut Vec<FileFailure>) -> usize {
        let candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e.state, FileState::PartialHashed | FileState::FullHashed)
            })
            .map(|(ix, _)| ix)
            .collect();

        let counter = StageCounter::start(&self.progress, Stage::Probe, candidates.len());
        let snapshot: &[FileEntry] = entries;
        let results: Vec<(usize, Option<Result<VideoMeta, String>>)> = self.io_pool.install(|| {
            candidates
                .par_iter()
                .map(|&ix| {
                    let entry = &snapshot[ix];
                    if self.stopped() {
                        counter.file(&self.progress, &entry.meta.path, FileOutcome::Skipped);
                        return (ix, None);
                    }
                    let key = entry.meta.cache_key();
                    let cached = self.cache.lookup(&key).and_then(|r| r.video_meta);
                    let result = match cached {
                        Some(hit) => Ok(hit),
                        None => match self.tools.probe(&entry.meta.path) {
                            Ok(fresh) => {
                                self.cache.put(key, CacheField::Meta(fresh.clone()));
                                Ok(fresh)
                            }
                            Err(e) => Err(e.to_string()),
                        },
                    };
                    let outcome = if result.is_ok() {
                        FileOutcome::Succeeded
                    } else {
                        FileOutcome::Failed
                    };
                    counter.file(&self.progress, &entry.meta.path, outcome);
                    (ix, Some(result))
                })
                .collect()
        });
        counter.finish(&self.progress);

        let mut probed = 0usize;
        for (ix, result) in results {
            match result {
                Some(Ok(meta)) => {
                    entries[ix].video = Some(meta);
                    entries[ix].state = FileState::Probed;
                    probed += 1;
                }
                Some(Err(message)) => {
                    entries[ix].fail(failures, FailureKind::ExternalProcess, message);
                }
                None => {}
            }
        }
        probed
    }

    // ── Stage: fingerprinting (IO extraction → CPU hashing) ──────────────────

    /// Returns the number of fingerprints obtained (cached or fresh).
    fn fingerprint_stage(
        &self,
        entries: &mut [FileEntry],
        clusters: &[Vec<usize>],
        failures: &mut Vec<FileFailure>,
    ) -> usize {
        enum FpWork {
            /// Fingerprint straight from the cache.
            Cached(usize, Vec<FrameHash>),
            /// Raw frames extracted on the IO side: `(ix, frames, scheduled)`.
            Raw(usize, Vec<(f64, Vec<u8>)>, usize),
            Failed(usize, String),
        }

        let targets: Vec<usize> = clusters.iter().flatten().copied().collect();
        let counter = StageCounter::start(&self.progress, Stage::Fingerprint, targets.len());

        // Bounded handoff: extraction blocks once the CPU side falls behind
        // by more than 4× the pool, keeping decoded frames from piling up.
        let (tx, rx) =
            crossbeam_channel::bounded::<FpWork>(4 * self.cfg.effective_cpu_threads().max(1));

        let results: Mutex<Vec<(usize, Result<VideoFingerprint, String>)>> =
            Mutex::new(Vec::with_capacity(targets.len()));

        std::thread::scope(|scope| {
            let entries_ref: &[FileEntry] = entries;
            let results_ref = &results;
            let counter_ref = &counter;

            // IO side.
            let producer = scope.spawn(move || {
                self.io_pool.install(|| {
                    targets.par_iter().for_each(|&ix| {
                        let entry = &entries_ref[ix];
                        if self.stopped() {
                            counter_ref.file(&self.progress, &entry.meta.path, FileOutcome::Skipped);
                            return;
                        }
                        let key = entry.meta.cache_key();
                        let duration = entry
                            .video
                            .as_ref()
                            .map(|v| v.duration_sec)
                            .unwrap_or_default();

                        if let Some(frames) =
                            self.cache.lookup(&key).and_then(|r| r.fingerprint)
                        {
                            if !frames.is_empty() && is_monotonic(&frames) {
                                let _ = tx.send(FpWork::Cached(ix, frames));
                                return;
                            }
                        }

                        let timestamps = sample_timestamps(
                            duration,
                            self.cfg.mode,
                            self.cfg.phash_frames,
                        );
                        if timestamps.is_empty() {
                            counter_ref.file(&self.progress, &entry.meta.path, FileOutcome::Skipped);
                            return;
                        }
                        match extract_frames(self.tools, &entry.meta.path, &timestamps) {
                            Ok(raw) => {
                                let _ = tx.send(FpWork::Raw(ix, raw, timestamps.len()));
                            }
                            Err(e) => {
                                let _ = tx.send(FpWork::Failed(ix, e.to_string()));
                            }
                        }
                    });
                });
                drop(tx); // closes the channel; the CPU side drains and exits
            });

            // CPU side.
            self.cpu_pool.install(|| {
                rx.into_iter().par_bridge().for_each(|work| {
                    let (ix, result) = match work {
                        FpWork::Cached(ix, frames) => {
                            let entry = &entries_ref[ix];
                            let duration = entry
                                .video
                                .as_ref()
                                .map(|v| v.duration_sec)
                                .unwrap_or_default();
                            let fp = VideoFingerprint::new(
                                entry.meta.path.clone(),
                                duration,
                                frames,
                            );
                            (ix, Ok(fp))
                        }
                        FpWork::Raw(ix, raw, scheduled) => {
                            let entry = &entries_ref[ix];
                            let duration = entry
                                .video
                                .as_ref()
                                .map(|v| v.duration_sec)
                                .unwrap_or_default();
                            let result = hash_extracted(
                                &entry.meta.path,
                                duration,
                                raw,
                                scheduled,
                            )
                            .map_err(|e| e.to_string());
                            if let Ok(fp) = &result {
                                self.cache.put(
                                    entries_ref[ix].meta.cache_key(),
                                    CacheField::Fingerprint(fp.frames().to_vec()),
                                );
                            }
                            (ix, result)
                        }
                        FpWork::Failed(ix, message) => (ix, Err(message)),
                    };
                    let entry = &entries_ref[ix];
                    let outcome = if result.is_ok() {
                        FileOutcome::Succeeded
                    } else {
                        FileOutcome::Failed
                    };
                    counter_ref.file(&self.progress, &entry.meta.path, outcome);
                    results_ref.lock().unwrap_or_else(|e| e.into_inner()).push((ix, result));
                });
            });

            producer.join().expect("extraction side panicked");
        });
        counter.finish(&self.progress);

        let mut fingerprinted = 0usize;
        let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
        results.sort_by_key(|(ix, _)| *ix);
        for (ix, result) in results {
            match result {
                Ok(fp) => {
                    entries[ix].fingerprint = Some(fp);
                    entries[ix].state = FileState::Fingerprinted;
                    fingerprinted += 1;
                }
                Err(message) => {
                    entries[ix].fail(failures, FailureKind::Decode, message);
                }
            }
        }
        fingerprinted
    }

    // ── Stage: overlap search ────────────────────────────────────────────────

    /// Returns the number of candidate pairs examined.
    fn overlap_stage(&self, entries: &mut [FileEntry], edges: &mut Vec<MatchEdge>) -> usize {
        let fingerprinted: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == FileState::Fingerprinted)
            .map(|(ix, _)| ix)
            .collect();
        if fingerprinted.len() < 2 {
            return 0;
        }

        // One fresh index per run; read-only once built.
        let mut index = PHashIndex::new();
        for &ix in &fingerprinted {
            let fp = entries[ix].fingerprint.as_ref().expect("fingerprinted state");
            index.insert(ix as u32, fp.frames());
        }

        let mut pairs: BTreeSet<(u32, u32)> = BTreeSet::new();
        for &ix in &fingerprinted {
            let fp = entries[ix].fingerprint.as_ref().expect("fingerprinted state");
            let matches = index.find_matching_videos(
                fp.frames(),
                self.cfg.phash_threshold,
                self.cfg.min_streak_length,
                Some(ix as u32),
            );
            for (other, _count) in matches {
                let (a, b) = ((ix as u32).min(other), (ix as u32).max(other));
                pairs.insert((a, b));
            }
        }

        let counter = StageCounter::start(&self.progress, Stage::OverlapSearch, pairs.len());
        let params = MatchParams {
            hamming_threshold: self.cfg.phash_threshold,
            gap_tolerance:     self.cfg.gap_tolerance,
            min_streak_length: self.cfg.min_streak_length,
            min_overlap_ratio: self.cfg.min_overlap_ratio,
        };
        let subset_detection = self.cfg.mode.subset_detection();

        let pair_list: Vec<(u32, u32)> = pairs.iter().copied().collect();
        let snapshot: &[FileEntry] = entries;
        let new_edges: Vec<MatchEdge> = self.cpu_pool.install(|| {
            pair_list
                .par_iter()
                .filter_map(|&(x, y)| {
                    if self.stopped() {
                        return None;
                    }
                    // Orient each pair so A is the longer video: overlap
                    // ranges then read as "where in the container the
                    // contained footage sits".
                    let (dx, dy) = (
                        snapshot[x as usize].fingerprint.as_ref()?.duration_sec(),
                        snapshot[y as usize].fingerprint.as_ref()?.duration_sec(),
                    );
                    let (a, b) = if dy > dx { (y, x) } else { (x, y) };
                    let fa = snapshot[a as usize].fingerprint.as_ref()?;
                    let fb = snapshot[b as usize].fingerprint.as_ref()?;

                    let edge = if subset_detection {
                        let m = match_fingerprints(fa, fb, &params)?;
                        if m.is_full_duplicate() {
                            MatchEdge {
                                a,
                                b,
                                kind: MatchKind::Visual {
                                    avg_hamming:    m.avg_hamming,
                                    max_hamming:    m.max_hamming,
                                    matched_frames: m.matching_frames,
                                },
                            }
                        } else {
                            MatchEdge { a, b, kind: MatchKind::Subset { overlap: m } }
                        }
                    } else {
                        // Fast mode: frame-count evidence only, no temporal
                        // verification.
                        let (count, avg, max) =
                            frame_match_stats(fa, fb, params.hamming_threshold)?;
                        if count < params.min_streak_length {
                            return None;
                        }
                        MatchEdge {
                            a,
                            b,
                            kind: MatchKind::Visual {
                                avg_hamming:    avg,
                                max_hamming:    max,
                                matched_frames: count,
                            },
                        }
                    };
                    Some(edge)
                })
                .collect()
        });
        counter.finish(&self.progress);

        for edge in &new_edges {
            for ix in [edge.a as usize, edge.b as usize] {
                entries[ix].state = match edge.kind {
                    MatchKind::Subset { .. } => FileState::SubsetMatched,
                    _ => FileState::VisuallyMatched,
                };
            }
        }
        let examined = pair_list.len();
        edges.extend(new_edges);
        examined
    }
}

fn is_monotonic(frames: &[FrameHash]) -> bool {
    frames.windows(2).all(|w| w[0].timestamp_sec < w[1].timestamp_sec)
}

// ── Size bucketing (ordering hint) ───────────────────────────────────────────

/// Hash order: members of multi-file size buckets first (likeliest exact
/// duplicates), everything else after.  Never drops an index — size
/// uniqueness is not an exclusion criterion.
fn size_priority_order(entries: &[FileEntry]) -> Vec<usize> {
    let mut by_size: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (ix, entry) in entries.iter().enumerate() {
        by_size.entry(entry.meta.size).or_default().push(ix);
    }

    let mut priority = Vec::new();
    let mut rest = Vec::new();
    for (_, bucket) in by_size {
        if bucket.len() >= 2 {
            priority.extend(bucket);
        } else {
            rest.extend(bucket);
        }
    }
    priority.extend(rest);
    priority
}

// ── Metadata clustering ──────────────────────────────────────────────────────

/// Reduced width:height — the shape of the image survives re-encoding and
/// rescaling, the pixel counts do not.
fn aspect_ratio(width: u32, height: u32) -> (u32, u32) {
    fn gcd(mut a: u32, mut b: u32) -> u32 {
        while b != 0 {
            let t = b;
            b = a % b;
            a = t;
        }
        a.max(1)
    }
    let g = gcd(width, height);
    (width / g, height / g)
}

/// Cluster probed files by (aspect ratio, optional codec/container).
///
/// Without subset detection, members additionally chain by duration
/// proximity: consecutive files whose durations differ by at most
/// `tolerance_sec` share a cluster.  With subset detection the whole key
/// group clusters — a clip's duration bears no relation to its source's,
/// so duration gating would hide exactly the matches the stage exists to
/// find.
fn cluster_by_metadata(
    entries: &[FileEntry],
    eligible: &[usize],
    tolerance_sec: f64,
    same_codec: bool,
    same_container: bool,
    subset_detection: bool,
) -> Vec<Vec<usize>> {
    let mut keyed: BTreeMap<(u32, u32, String, String), Vec<usize>> = BTreeMap::new();
    for &ix in eligible {
        let Some(video) = entries[ix].video.as_ref() else { continue };
        let (aw, ah) = aspect_ratio(video.width, video.height);
        let key = (
            aw,
            ah,
            if same_codec { video.codec.clone() } else { String::new() },
            if same_container { video.container.clone() } else { String::new() },
        );
        keyed.entry(key).or_default().push(ix);
    }

    let mut clusters = Vec::new();
    for (_, mut members) in keyed {
        members.sort_by(|&x, &y| {
            let (dx, dy) = (
                entries[x].video.as_ref().map(|v| v.duration_sec).unwrap_or_default(),
                entries[y].video.as_ref().map(|v| v.duration_sec).unwrap_or_default(),
            );
            dx.total_cmp(&dy).then_with(|| entries[x].meta.path.cmp(&entries[y].meta.path))
        });

        if subset_detection {
            if members.len() >= 2 {
                clusters.push(members);
            }
            continue;
        }

        let mut current: Vec<usize> = Vec::new();
        let mut last_duration = f64::NEG_INFINITY;
        for ix in members {
            let duration = entries[ix]
                .video
                .as_ref()
                .map(|v| v.duration_sec)
                .unwrap_or_default();
            if !current.is_empty() && duration - last_duration > tolerance_sec {
                if current.len() >= 2 {
                    clusters.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            current.push(ix);
            last_duration = duration;
        }
        if current.len() >= 2 {
            clusters.push(current);
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry::new(FileMeta {
            path: PathBuf::from(path),
            size,
            mtime: 1000.0,
            dev: 1,
            inode: size,
        })
    }

    fn probed(path: &str, size: u64, dur: f64, w: u32, h: u32, codec: &str) -> FileEntry {
        let mut e = entry(path, size);
        e.state = FileState::Probed;
        e.video = Some(VideoMeta {
            duration_sec: dur,
            width:        w,
            height:       h,
            codec:        codec.into(),
            container:    "mp4".into(),
            bitrate:      None,
            fps:          None,
        });
        e
    }

    #[test]
    fn size_order_covers_every_file() {
        let entries = vec![
            entry("/a", 100),
            entry("/b", 100),
            entry("/c", 7),
            entry("/d", 100),
            entry("/e", 42),
        ];
        let order = size_priority_order(&entries);

        // Size bucketing eliminates nothing.
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

        // The three-way 100-byte bucket is hashed first.
        assert_eq!(&order[..3], &[0, 1, 3]);
    }

    #[test]
    fn clustering_chains_durations_within_tolerance() {
        let entries = vec![
            probed("/a", 1, 100.0, 1920, 1080, "h264"),
            probed("/b", 2, 101.5, 1920, 1080, "h264"),
            probed("/c", 3, 103.0, 1920, 1080, "h264"),
            probed("/d", 4, 200.0, 1920, 1080, "h264"),
        ];
        let clusters = cluster_by_metadata(&entries, &[0, 1, 2, 3], 2.0, false, false, false);
        // a–b–c chain through the tolerance; d stands alone (dropped).
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec![0, 1, 2]);
    }

    #[test]
    fn reencodes_share_an_aspect_cluster() {
        // A 720p re-encode of 1080p content keeps the 16:9 shape.
        let entries = vec![
            probed("/a", 1, 100.0, 1920, 1080, "h264"),
            probed("/b", 2, 100.0, 1280, 720, "hevc"),
        ];
        let clusters = cluster_by_metadata(&entries, &[0, 1], 2.0, false, false, false);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn clustering_separates_aspect_ratios() {
        let entries = vec![
            probed("/a", 1, 100.0, 1920, 1080, "h264"), // 16:9
            probed("/b", 2, 100.0, 1440, 1080, "h264"), // 4:3
        ];
        let clusters = cluster_by_metadata(&entries, &[0, 1], 2.0, false, false, false);
        assert!(clusters.is_empty());
    }

    #[test]
    fn subset_detection_ignores_duration_gating() {
        // A 50-minute source and its 15-minute clip share no duration
        // window but must still be fingerprinted together.
        let entries = vec![
            probed("/full", 1, 3000.0, 1920, 1080, "h264"),
            probed("/clip", 2, 900.0, 1920, 1080, "h264"),
        ];
        assert!(cluster_by_metadata(&entries, &[0, 1], 2.0, false, false, false).is_empty());
        let clusters = cluster_by_metadata(&entries, &[0, 1], 2.0, false, false, true);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn same_codec_flag_tightens_clusters() {
        let entries = vec![
            probed("/a", 1, 100.0, 1920, 1080, "h264"),
            probed("/b", 2, 100.0, 1920, 1080, "hevc"),
        ];
        assert_eq!(cluster_by_metadata(&entries, &[0, 1], 2.0, false, false, false).len(), 1);
        assert!(cluster_by_metadata(&entries, &[0, 1], 2.0, true, false, false).is_empty());
    }

    #[test]
    fn aspect_ratio_reduction() {
        assert_eq!(aspect_ratio(1920, 1080), (16, 9));
        assert_eq!(aspect_ratio(1280, 720), (16, 9));
        assert_eq!(aspect_ratio(1440, 1080), (4, 3));
        assert_eq!(aspect_ratio(0, 0), (0, 0));
    }

    #[test]
    fn failure_kinds_have_stable_names() {
        assert_eq!(FailureKind::Io.as_str(), "io");
        assert_eq!(FailureKind::ExternalProcess.as_str(), "external_process");
        assert_eq!(FailureKind::Decode.as_str(), "decode");
    }

    #[test]
    fn exit_codes_follow_failure_class() {
        let config_err = PipelineError::Config(ConfigError::NoRoots);
        assert_eq!(config_err.exit_code(), 1);
        let scan_err = PipelineError::Scan(ScanError::BadRoot(PathBuf::from("/x")));
        assert_eq!(scan_err.exit_code(), 2);
        let pool_err = PipelineError::ThreadPool("nope".into());
        assert_eq!(pool_err.exit_code(), 3);
    }
}

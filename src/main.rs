use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{error, info, trace, warn, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

use viddup::cache::FieldTag;
use viddup::pipeline::Pipeline;
use viddup::progress::{ProgressEvent, ProgressSink};
use viddup::{ArtifactMode, Cache, Config, FfmpegTools, KeepPolicy, Mode};

#[derive(Parser)]
#[command(name = "viddup", version = "1.0.0", about = "Find exact, visual, and partial-overlap duplicate videos")]
struct Cli {
    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories and write a duplicate report
    Scan {
        /// Root directories to search
        #[arg(required = true, num_args = 1..)]
        roots: Vec<PathBuf>,
        /// Report destination
        #[arg(short, long, default_value = "viddup-report.json")]
        output: PathBuf,
        /// Print the report to stdout instead of writing a file
        #[arg(long)]
        stdout: bool,
        /// Search effort preset
        #[arg(long, value_enum, default_value_t = Mode::Balanced)]
        mode: Mode,
        /// Directories to prune from the walk
        #[arg(long = "exclude")]
        exclude: Vec<PathBuf>,
        /// Recursion depth limit
        #[arg(long)]
        max_depth: Option<usize>,
        /// File-name globs to include (default: every file)
        #[arg(long = "glob")]
        globs: Vec<String>,
        /// Minimum overlap fraction of the longer video
        #[arg(long, default_value_t = 0.10)]
        min_overlap_ratio: f64,
        /// Max Hamming distance for a frame match
        #[arg(long, default_value_t = 12)]
        phash_threshold: u32,
        /// Override per-video frame bounds as "min,max"
        #[arg(long, value_parser = parse_frame_bounds)]
        phash_frames: Option<(usize, usize)>,
        /// Duration slack for metadata clustering (seconds)
        #[arg(long, default_value_t = 2.0)]
        duration_tolerance: f64,
        /// Cluster only files sharing a codec
        #[arg(long)]
        same_codec: bool,
        /// Cluster only files sharing a container
        #[arg(long)]
        same_container: bool,
        /// Which group member to keep
        #[arg(long, value_enum, default_value_t = KeepPolicy::BestQuality)]
        keep_policy: KeepPolicy,
        /// IO worker threads (0 = CPU count)
        #[arg(long, default_value_t = 0)]
        io_threads: usize,
        /// CPU worker threads (0 = CPU count)
        #[arg(long, default_value_t = 0)]
        cpu_threads: usize,
        /// Cache log location
        #[arg(long, default_value = "viddup.cache")]
        cache: PathBuf,
        /// Handling of .part/.tmp/.download residue
        #[arg(long, value_enum, default_value_t = ArtifactMode::Skip)]
        artifact_mode: ArtifactMode,
    },
    /// Show cache log statistics
    CacheInfo {
        #[arg(long, default_value = "viddup.cache")]
        cache: PathBuf,
    },
}

fn parse_frame_bounds(s: &str) -> Result<(usize, usize), String> {
    let (min, max) = s
        .split_once(',')
        .ok_or_else(|| "expected \"min,max\"".to_string())?;
    let min = min.trim().parse::<usize>().map_err(|e| e.to_string())?;
    let max = max.trim().parse::<usize>().map_err(|e| e.to_string())?;
    Ok((min, max))
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = TermLogger::init(level, LogConfig::default(), TerminalMode::Stderr, ColorChoice::Auto);

    let code = match cli.command {
        Commands::Scan {
            roots,
            output,
            stdout,
            mode,
            exclude,
            max_depth,
            globs,
            min_overlap_ratio,
            phash_threshold,
            phash_frames,
            duration_tolerance,
            same_codec,
            same_container,
            keep_policy,
            io_threads,
            cpu_threads,
            cache,
            artifact_mode,
        } => {
            let cfg = Config {
                roots,
                exclude_dirs: exclude,
                max_depth,
                include_globs: globs,
                mode,
                min_overlap_ratio,
                phash_threshold,
                phash_frames,
                duration_tolerance_sec: duration_tolerance,
                same_codec,
                same_container,
                keep_policy,
                io_threads,
                cpu_threads,
                cache_path: cache,
                artifact_mode,
                ..Config::default()
            };
            run_scan(&cfg, &output, stdout)
        }
        Commands::CacheInfo { cache } => cache_info(&cache),
    };
    std::process::exit(code);
}

// ── scan ─────────────────────────────────────────────────────────────────────

fn run_scan(cfg: &Config, output: &std::path::Path, to_stdout: bool) -> i32 {
    let tools = FfmpegTools::new();
    let (progress, events) = ProgressSink::attached();

    // Progress consumer: turns the event stream into log lines.
    let consumer = std::thread::spawn(move || {
        for event in events {
            match event {
                ProgressEvent::StageStarted { stage, total } => {
                    info!(target: "progress", "{}: {} item(s)", stage.name(), total);
                }
                ProgressEvent::FileFinished { stage, path, outcome } => {
                    trace!(target: "progress", "{}: {:?} {}", stage.name(), outcome, path.display());
                }
                ProgressEvent::StageFinished { stage, succeeded, skipped, failed } => {
                    info!(target: "progress",
                        "{}: {} ok, {} skipped, {} failed",
                        stage.name(), succeeded, skipped, failed);
                }
                ProgressEvent::Interrupted => {
                    warn!(target: "progress", "interrupted; finishing with partial results");
                }
            }
        }
    });

    let mut pipeline = match Pipeline::new(cfg, &tools, progress) {
        Ok(p) => p,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    // First signal: cooperative stop.  A second within 2 s: abort — flush
    // the cache and skip the report.
    let stop = pipeline.stop_flag();
    let abort = pipeline.abort_flag();
    let last_signal: Mutex<Option<Instant>> = Mutex::new(None);
    let handler = ctrlc::set_handler(move || {
        let now = Instant::now();
        let mut last = last_signal.lock().unwrap_or_else(|e| e.into_inner());
        if stop.swap(true, Ordering::SeqCst) {
            if let Some(prev) = *last {
                if now.duration_since(prev) < Duration::from_secs(2) {
                    abort.store(true, Ordering::SeqCst);
                }
            }
        }
        *last = Some(now);
    });
    if let Err(e) = handler {
        warn!("signal handler unavailable: {e}");
    }

    let outcome = match pipeline.run() {
        Ok(o) => o,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };
    drop(pipeline);
    let _ = consumer.join();

    if outcome.aborted {
        return 130;
    }

    let report = outcome.to_report();
    if to_stdout {
        match report.to_json_bytes() {
            Ok(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
            Err(e) => {
                error!("report serialization failed: {e}");
                return 1;
            }
        }
    } else if let Err(e) = report.write_atomic(output) {
        error!("failed to write report to {}: {e}", output.display());
        return 1;
    }

    println!("── viddup scan ──────────────────────────────────────────");
    println!("  Files scanned     {}", outcome.stats.discovered);
    println!("  Artifacts aside   {}", outcome.stats.artifacts);
    println!("  Duplicate groups  {}", report.summary.total_groups);
    println!("  Losers            {}", report.summary.total_losers);
    println!("  Reclaimable       {:.2} MiB",
             report.summary.bytes_reclaimable as f64 / 1048576.0);
    println!("  Failures          {}", report.failures.len());
    println!("  Elapsed           {:.1} s", report.summary.scan_time_sec);
    if !to_stdout {
        println!("  Report            {}", output.display());
    }

    if outcome.interrupted { 130 } else { 0 }
}

// ── cache-info ───────────────────────────────────────────────────────────────

fn cache_info(path: &std::path::Path) -> i32 {
    let cache = match Cache::open(path) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return 2;
        }
    };
    let stats = cache.load_stats();

    println!("── viddup cache ─────────────────────────────────────────");
    println!("  Path              {}", path.display());
    println!("  Log size          {} B", stats.log_bytes);
    println!("  Records loaded    {}", stats.records_loaded);
    println!("  Records dropped   {}", stats.dropped_records);
    println!("  Bytes truncated   {}", stats.truncated_bytes);
    println!("  Identities        {}", cache.key_count());
    for tag in [FieldTag::PartialHash, FieldTag::FullHash, FieldTag::VideoMeta, FieldTag::Fingerprint] {
        println!("  {:<17} {}", tag.name(), stats.per_tag[tag as usize]);
    }
    0
}

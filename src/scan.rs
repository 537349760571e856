//! Filesystem discovery: walk the roots, stat once per file, filter.
//!
//! Discovery never reads file contents.  Artifact suffixes (partial-download
//! residue) are excluded by default and counted separately; glob patterns,
//! when given, restrict which file names enter the pipeline at all.
//! Unreadable entries are nonfatal and recorded; an unreadable *root* is
//! fatal because it usually means the operator typo'd a path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::{debug, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::{ArtifactMode, Config};
use crate::identity::FileMeta;

/// Partial-download residue suffixes, matched case-insensitively.
pub const ARTIFACT_SUFFIXES: [&str; 4] = [".part", ".tmp", ".download", ".crdownload"];

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Root {0} is not a readable directory")]
    BadRoot(PathBuf),
}

/// Everything discovery produced for one run.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Candidate files in deterministic (path-sorted) order.
    pub files:       Vec<FileMeta>,
    /// Artifact files set aside (empty under `ArtifactMode::Include`).
    pub artifacts:   Vec<PathBuf>,
    /// Walk errors: `(path, message)` — nonfatal, reported.
    pub walk_errors: Vec<(PathBuf, String)>,
}

/// True when `name` ends in one of the artifact suffixes.
pub fn is_artifact(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARTIFACT_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Walk every root and produce the candidate file list.
pub fn discover(cfg: &Config) -> Result<ScanOutcome, ScanError> {
    // Patterns were validated with the config; recompile quietly here.
    let patterns: Vec<Pattern> = cfg
        .include_globs
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut outcome = ScanOutcome::default();
    let mut seen: HashSet<(u64, u64)> = HashSet::new();

    for root in &cfg.roots {
        if !root.is_dir() {
            return Err(ScanError::BadRoot(root.clone()));
        }

        let mut walker = WalkDir::new(root).follow_links(false);
        if let Some(depth) = cfg.max_depth {
            walker = walker.max_depth(depth);
        }

        let excluded = |path: &Path| cfg.exclude_dirs.iter().any(|ex| path.starts_with(ex));

        for entry in walker.into_iter().filter_entry(|e| !excluded(e.path())) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!(target: "scan", "walk error at {}: {e}", path.display());
                    outcome.walk_errors.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if is_artifact(&name) && cfg.artifact_mode != ArtifactMode::Include {
                debug!(target: "scan", "artifact set aside: {}", entry.path().display());
                outcome.artifacts.push(entry.path().to_path_buf());
                continue;
            }
            if !patterns.is_empty() && !patterns.iter().any(|p| p.matches(&name)) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(md) => FileMeta::from_metadata(entry.path(), &md),
                Err(e) => {
                    warn!(target: "scan", "stat failed for {}: {e}", entry.path().display());
                    outcome.walk_errors.push((entry.path().to_path_buf(), e.to_string()));
                    continue;
                }
            };
            // Overlapping roots or links can surface the same inode twice.
            if seen.insert((meta.dev, meta.inode)) {
                outcome.files.push(meta);
            }
        }
    }

    outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
    outcome.artifacts.sort();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_for(root: &Path) -> Config {
        Config { roots: vec![root.to_path_buf()], ..Config::default() }
    }

    fn touch(dir: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn artifact_suffix_matching() {
        assert!(is_artifact("movie.mp4.part"));
        assert!(is_artifact("CLIP.TMP"));
        assert!(is_artifact("x.crdownload"));
        assert!(!is_artifact("movie.mp4"));
        assert!(!is_artifact("partition.mkv"));
    }

    #[test]
    fn artifacts_are_set_aside_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.mp4", b"a");
        touch(dir.path(), "b.mp4.part", b"b");

        let out = discover(&cfg_for(dir.path())).unwrap();
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.artifacts.len(), 1);
        assert!(out.files[0].path.ends_with("a.mp4"));
    }

    #[test]
    fn include_mode_keeps_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.mp4.part", b"b");

        let cfg = Config { artifact_mode: ArtifactMode::Include, ..cfg_for(dir.path()) };
        let out = discover(&cfg).unwrap();
        assert_eq!(out.files.len(), 1);
        assert!(out.artifacts.is_empty());
    }

    #[test]
    fn globs_restrict_candidates() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.mp4", b"a");
        touch(dir.path(), "b.mkv", b"b");
        touch(dir.path(), "notes.txt", b"c");

        let cfg = Config {
            include_globs: vec!["*.mp4".into(), "*.mkv".into()],
            ..cfg_for(dir.path())
        };
        let out = discover(&cfg).unwrap();
        let names: Vec<_> = out
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.mkv"]);
    }

    #[test]
    fn depth_limit_prunes_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "top.mp4", b"a");
        touch(dir.path(), "sub/deep.mp4", b"b");

        let cfg = Config { max_depth: Some(1), ..cfg_for(dir.path()) };
        let out = discover(&cfg).unwrap();
        assert_eq!(out.files.len(), 1);
        assert!(out.files[0].path.ends_with("top.mp4"));
    }

    #[test]
    fn exclude_dirs_prune() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "keep/a.mp4", b"a");
        touch(dir.path(), "drop/b.mp4", b"b");

        let cfg = Config {
            exclude_dirs: vec![dir.path().join("drop")],
            ..cfg_for(dir.path())
        };
        let out = discover(&cfg).unwrap();
        assert_eq!(out.files.len(), 1);
        assert!(out.files[0].path.ends_with("a.mp4"));
    }

    #[test]
    fn output_is_path_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "z.mp4", b"z");
        touch(dir.path(), "a.mp4", b"a");
        touch(dir.path(), "m.mp4", b"m");

        let out = discover(&cfg_for(dir.path())).unwrap();
        let paths: Vec<_> = out.files.iter().map(|f| f.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn missing_root_is_fatal() {
        let cfg = cfg_for(Path::new("/nonexistent/viddup-root"));
        assert!(matches!(discover(&cfg), Err(ScanError::BadRoot(_))));
    }

    #[test]
    fn overlapping_roots_dedupe_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "sub/a.mp4", b"a");

        let cfg = Config {
            roots: vec![dir.path().to_path_buf(), dir.path().join("sub")],
            ..Config::default()
        };
        let out = discover(&cfg).unwrap();
        assert_eq!(out.files.len(), 1);
    }
}

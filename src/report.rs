//! The schema-versioned duplicate report and its atomic writer.
//!
//! The report is a pure function of its inputs: stable field order, groups
//! sorted by id, losers sorted by path, no wall-clock reads.  Serialising,
//! re-parsing, and serialising again yields byte-identical documents — the
//! property the cache-idempotence guarantee is verified against.
//!
//! Writes are atomic: the document lands in a temporary file in the target
//! directory, is fsync'd, then renamed over the destination.  A crash mid-
//! write leaves either the old report or none — never a torn one.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::grouper::DuplicateGroup;
use crate::pipeline::FileFailure;

pub const REPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub path:    PathBuf,
    /// Error-taxonomy bucket (`io`, `external_process`, `decode`).
    pub kind:    String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_groups:      usize,
    pub total_losers:      usize,
    /// Sum of loser sizes across all groups.
    pub bytes_reclaimable: u64,
    pub scan_time_sec:     f64,
    pub interrupted:       bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub version:   u32,
    pub groups:    Vec<DuplicateGroup>,
    pub failures:  Vec<FailureEntry>,
    /// Artifact files set aside during discovery (populated under
    /// `artifact_mode = cleanup` for external deletion).
    pub artifacts: Vec<PathBuf>,
    pub summary:   Summary,
}

impl Report {
    /// Assemble a report; the summary is derived here so counts can never
    /// drift from the group list.
    pub fn new(
        groups: Vec<DuplicateGroup>,
        failures: Vec<FileFailure>,
        artifacts: Vec<PathBuf>,
        scan_time_sec: f64,
        interrupted: bool,
    ) -> Self {
        let total_losers = groups.iter().map(|g| g.losers.len()).sum();
        let bytes_reclaimable = groups
            .iter()
            .flat_map(|g| g.losers.iter())
            .map(|l| l.size)
            .sum();
        let failures = failures
            .into_iter()
            .map(|f| FailureEntry {
                path:    f.path,
                kind:    f.kind.as_str().to_string(),
                message: f.message,
            })
            .collect();
        Self {
            version: REPORT_VERSION,
            summary: Summary {
                total_groups: groups.len(),
                total_losers,
                bytes_reclaimable,
                scan_time_sec,
                interrupted,
            },
            groups,
            failures,
            artifacts,
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Write atomically: temp file in the destination directory, fsync,
    /// rename.
    pub fn write_atomic(&self, path: &Path) -> io::Result<()> {
        let bytes = self
            .to_json_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None      => tempfile::NamedTempFile::new_in(".")?,
        };
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::{GroupEvidence, GroupKind, MemberInfo};
    use crate::pipeline::FailureKind;

    fn group(id: &str, loser_size: u64) -> DuplicateGroup {
        DuplicateGroup {
            group_id: id.to_string(),
            kind:     GroupKind::Exact,
            winner:   MemberInfo {
                path:   PathBuf::from("/keep.mp4"),
                size:   1_000_000_000,
                reason: "older file".into(),
            },
            losers:   vec![MemberInfo {
                path:   PathBuf::from("/drop.mp4"),
                size:   loser_size,
                reason: "exact duplicate of winner".into(),
            }],
            evidence: GroupEvidence::Exact { full_hash_digest: "ab".repeat(32) },
        }
    }

    #[test]
    fn summary_math() {
        let report = Report::new(
            vec![group("g1", 1_000_000_000), group("g2", 500)],
            vec![FileFailure {
                path:    PathBuf::from("/bad.mp4"),
                kind:    FailureKind::Io,
                message: "permission denied".into(),
            }],
            vec![],
            12.5,
            false,
        );
        assert_eq!(report.summary.total_groups, 2);
        assert_eq!(report.summary.total_losers, 2);
        assert_eq!(report.summary.bytes_reclaimable, 1_000_000_500);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, "io");
    }

    #[test]
    fn empty_input_empty_report() {
        let report = Report::new(vec![], vec![], vec![], 0.0, false);
        assert_eq!(report.summary.total_groups, 0);
        assert_eq!(report.summary.bytes_reclaimable, 0);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn write_parse_rewrite_is_byte_identical() {
        let report = Report::new(vec![group("g1", 42)], vec![], vec![], 3.25, false);
        let first = report.to_json_bytes().unwrap();
        let reparsed = Report::from_json_bytes(&first).unwrap();
        let second = reparsed.to_json_bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(report, reparsed);
    }

    #[test]
    fn atomic_write_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        std::fs::write(&path, b"stale").unwrap();

        let report = Report::new(vec![group("g1", 7)], vec![], vec![], 1.0, true);
        report.write_atomic(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let parsed = Report::from_json_bytes(&bytes).unwrap();
        assert_eq!(parsed.summary.total_groups, 1);
        assert!(parsed.summary.interrupted);
        // No temp residue left behind.
        let residue = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(residue, 1);
    }

    #[test]
    fn version_field_is_stamped() {
        let report = Report::new(vec![], vec![], vec![], 0.0, false);
        let json: serde_json::Value =
            serde_json::from_slice(&report.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json["version"], 1);
    }
}

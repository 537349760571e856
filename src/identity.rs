//! Stable file identity — the key every cached computation hangs off.
//!
//! A file is identified by the tuple `(dev, inode, size, mtime)` taken from a
//! single `stat` call at discovery time.  Device and inode pin the identity
//! across renames; size and mtime invalidate it on content change.  On
//! platforms without inode semantics the `(dev, inode)` half is derived from
//! the BLAKE3 of the canonical path instead, which degrades rename tracking
//! but preserves the invalidation behaviour.
//!
//! mtime is carried as fractional epoch seconds.  Filesystems disagree about
//! sub-second precision (FAT stores 2 s granularity, some archivers restore
//! whole seconds), so identity comparison tolerates ±1.0 s of mtime drift
//! when every other component matches.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Maximum mtime drift (seconds) still considered the same file state.
pub const MTIME_TOLERANCE_SEC: f64 = 1.0;

// ── FileMeta ─────────────────────────────────────────────────────────────────

/// Filesystem facts about one discovered file.  Created from a single `stat`
/// at scan time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub path:  PathBuf,
    pub size:  u64,
    /// Modification time as fractional seconds since the Unix epoch.
    pub mtime: f64,
    pub dev:   u64,
    pub inode: u64,
}

impl FileMeta {
    /// Stat `path` and build its identity.  One filesystem round-trip.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let md = std::fs::metadata(path)?;
        Ok(Self::from_metadata(path, &md))
    }

    /// Build identity from an already-fetched `Metadata` (the walker hands us
    /// one per entry; no second `stat`).
    pub fn from_metadata(path: &Path, md: &Metadata) -> Self {
        let (dev, inode) = device_inode(path, md);
        Self {
            path:  path.to_path_buf(),
            size:  md.len(),
            mtime: mtime_epoch_sec(md),
            dev,
            inode,
        }
    }

    #[inline]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            dev:   self.dev,
            inode: self.inode,
            size:  self.size,
            mtime: self.mtime,
        }
    }
}

#[cfg(unix)]
fn device_inode(_path: &Path, md: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (md.dev(), md.ino())
}

/// Fallback identity for filesystems without inode semantics: hash the
/// canonical path and split the digest into the two id halves.
#[cfg(not(unix))]
fn device_inode(path: &Path, _md: &Metadata) -> (u64, u64) {
    let canonical = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let digest = blake3::hash(canonical.to_string_lossy().as_bytes());
    let bytes = digest.as_bytes();
    let dev = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let ino = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    (dev, ino)
}

fn mtime_epoch_sec(md: &Metadata) -> f64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── CacheKey ─────────────────────────────────────────────────────────────────

/// The full identity tuple persisted with every cache record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub dev:   u64,
    pub inode: u64,
    pub size:  u64,
    pub mtime: f64,
}

impl CacheKey {
    #[inline]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            dev:   self.dev,
            inode: self.inode,
            size:  self.size,
        }
    }

    /// True when `other_mtime` is within [`MTIME_TOLERANCE_SEC`] of this key.
    #[inline]
    pub fn mtime_matches(&self, other_mtime: f64) -> bool {
        (self.mtime - other_mtime).abs() <= MTIME_TOLERANCE_SEC
    }
}

/// The hashable part of the identity.  mtime is excluded so that tolerance
/// comparison can run over the (small) set of slots sharing the exact triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub dev:   u64,
    pub inode: u64,
    pub size:  u64,
}

//! Append-only computation cache keyed by file identity.
//!
//! Every expensive per-file computation (partial hash, full hash, probe
//! metadata, fingerprint) is memoized here.  The on-disk form is a single
//! append-only log; the in-memory form is a map rebuilt by streaming that
//! log once at startup.
//!
//! # On-disk layout (all numeric fields little-endian)
//!
//! ```text
//! Header (16 bytes):
//!   0   4  magic          = "VDUP"
//!   4   4  format_version = 1        (LE u32)
//!   8   4  header_crc32   CRC32 of bytes [0..8)  (LE u32)
//!  12   4  reserved       = 0
//!
//! Record (repeated to EOF):
//!   0   4  len            byte count of everything after this field
//!   4   1  field_tag      0=partial_hash 1=full_hash 2=video_meta 3=fingerprint
//!   5   8  dev            (LE u64)
//!  13   8  inode          (LE u64)
//!  21   8  size           (LE u64)
//!  29   8  mtime          (LE f64, epoch seconds)
//!  37   N  payload        JSON value of the field
//! 37+N  4  record_crc32   CRC32 of bytes [4 .. 37+N)  ← LAST
//! ```
//!
//! # Crash safety
//! Appends are atomic at the record boundary: a crash mid-write leaves a
//! partial trailing record, which the next load detects (short read or
//! insane `len`) and physically truncates away.  A complete record whose
//! CRC32 fails is dropped with a warning and does not invalidate anything
//! after it.
//!
//! # Coalescing
//! The log may contain several records for one key and field (superseding
//! writes append, preserving history).  Load replays in file order, so the
//! latest value for each field wins.
//!
//! # Identity reconciliation
//! A lookup whose mtime differs from a stored key by at most ±1.0 s — with
//! dev, inode, and size equal — is a hit.  Anything larger is a miss.

pub mod writer;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use log::warn;
use thiserror::Error;

use crate::hasher::{FullHash, PartialHash};
use crate::identity::{CacheKey, IdentityKey};
use crate::phash::FrameHash;
use crate::probe::VideoMeta;
use writer::CacheWriter;

pub const CACHE_MAGIC: &[u8; 4] = b"VDUP";
pub const CACHE_FORMAT_VERSION: u32 = 1;
pub const CACHE_HEADER_SIZE: usize = 16;

/// Fixed prefix of a record body: tag + the four key fields.
const RECORD_KEY_SIZE: usize = 1 + 8 + 8 + 8 + 8;
/// Smallest legal record body: key prefix + empty payload + CRC.
const MIN_RECORD_LEN: u32 = (RECORD_KEY_SIZE + 4) as u32;
/// Sanity ceiling; anything larger means the length field is garbage.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Default bound of the append queue when the caller has no pool size.
pub const DEFAULT_APPEND_QUEUE: usize = 256;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cache log {path} has format version {found}; this build reads v{CACHE_FORMAT_VERSION}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

// ── Field tags ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldTag {
    PartialHash = 0,
    FullHash    = 1,
    VideoMeta   = 2,
    Fingerprint = 3,
}

impl FieldTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FieldTag::PartialHash),
            1 => Some(FieldTag::FullHash),
            2 => Some(FieldTag::VideoMeta),
            3 => Some(FieldTag::Fingerprint),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldTag::PartialHash => "partial_hash",
            FieldTag::FullHash    => "full_hash",
            FieldTag::VideoMeta   => "video_meta",
            FieldTag::Fingerprint => "fingerprint",
        }
    }
}

// ── CacheField / CacheRecord ─────────────────────────────────────────────────

/// One tagged field value — the unit of appending.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheField {
    Partial(PartialHash),
    Full(FullHash),
    Meta(VideoMeta),
    Fingerprint(Vec<FrameHash>),
}

impl CacheField {
    pub fn tag(&self) -> FieldTag {
        match self {
            CacheField::Partial(_)     => FieldTag::PartialHash,
            CacheField::Full(_)        => FieldTag::FullHash,
            CacheField::Meta(_)        => FieldTag::VideoMeta,
            CacheField::Fingerprint(_) => FieldTag::Fingerprint,
        }
    }

    fn payload_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            CacheField::Partial(v)     => serde_json::to_vec(v),
            CacheField::Full(v)        => serde_json::to_vec(v),
            CacheField::Meta(v)        => serde_json::to_vec(v),
            CacheField::Fingerprint(v) => serde_json::to_vec(v),
        }
    }

    fn from_payload(tag: FieldTag, payload: &[u8]) -> serde_json::Result<Self> {
        Ok(match tag {
            FieldTag::PartialHash => CacheField::Partial(serde_json::from_slice(payload)?),
            FieldTag::FullHash    => CacheField::Full(serde_json::from_slice(payload)?),
            FieldTag::VideoMeta   => CacheField::Meta(serde_json::from_slice(payload)?),
            FieldTag::Fingerprint => CacheField::Fingerprint(serde_json::from_slice(payload)?),
        })
    }
}

/// The coalesced view of everything cached for one file identity.  Any
/// subset of fields may be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheRecord {
    pub partial_hash: Option<PartialHash>,
    pub full_hash:    Option<FullHash>,
    pub video_meta:   Option<VideoMeta>,
    pub fingerprint:  Option<Vec<FrameHash>>,
}

impl CacheRecord {
    fn apply(&mut self, field: CacheField) {
        match field {
            CacheField::Partial(v)     => self.partial_hash = Some(v),
            CacheField::Full(v)        => self.full_hash = Some(v),
            CacheField::Meta(v)        => self.video_meta = Some(v),
            CacheField::Fingerprint(v) => self.fingerprint = Some(v),
        }
    }
}

// ── In-memory index ──────────────────────────────────────────────────────────

struct Slot {
    mtime:  f64,
    record: CacheRecord,
}

/// Map keyed by the hashable identity triple; mtime lives in the slots so
/// tolerance comparison runs over the (tiny) per-triple slot list.
#[derive(Default)]
pub struct CacheIndex {
    map: HashMap<IdentityKey, Vec<Slot>>,
}

impl CacheIndex {
    pub fn lookup(&self, key: &CacheKey) -> Option<&CacheRecord> {
        let slots = self.map.get(&key.identity())?;
        slots
            .iter()
            .filter(|s| key.mtime_matches(s.mtime))
            .min_by(|a, b| {
                let da = (a.mtime - key.mtime).abs();
                let db = (b.mtime - key.mtime).abs();
                da.total_cmp(&db)
            })
            .map(|s| &s.record)
    }

    pub fn apply(&mut self, key: &CacheKey, field: CacheField) {
        let slots = self.map.entry(key.identity()).or_default();
        if let Some(slot) = slots.iter_mut().find(|s| key.mtime_matches(s.mtime)) {
            slot.record.apply(field);
        } else {
            let mut record = CacheRecord::default();
            record.apply(field);
            slots.push(Slot { mtime: key.mtime, record });
        }
    }

    pub fn key_count(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

pub(crate) fn write_header<W: Write>(mut w: W) -> io::Result<()> {
    let mut buf = [0u8; CACHE_HEADER_SIZE];
    buf[0..4].copy_from_slice(CACHE_MAGIC);
    buf[4..8].copy_from_slice(&CACHE_FORMAT_VERSION.to_le_bytes());
    let mut crc = Crc32::new();
    crc.update(&buf[..8]);
    buf[8..12].copy_from_slice(&crc.finalize().to_le_bytes());
    w.write_all(&buf)
}

/// Encode one record (length prefix included).
pub(crate) fn encode_record(key: &CacheKey, field: &CacheField) -> io::Result<Vec<u8>> {
    let payload = field
        .payload_json()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let body_len = RECORD_KEY_SIZE + payload.len() + 4;
    let mut out = Vec::with_capacity(4 + body_len);
    out.write_u32::<LittleEndian>(body_len as u32)?;
    out.write_u8(field.tag() as u8)?;
    out.write_u64::<LittleEndian>(key.dev)?;
    out.write_u64::<LittleEndian>(key.inode)?;
    out.write_u64::<LittleEndian>(key.size)?;
    out.write_f64::<LittleEndian>(key.mtime)?;
    out.extend_from_slice(&payload);

    let mut crc = Crc32::new();
    crc.update(&out[4..]);
    out.write_u32::<LittleEndian>(crc.finalize())?;
    Ok(out)
}

fn decode_body(body: &[u8]) -> Option<(CacheKey, CacheField)> {
    // CRC first — cheapest possible check.
    let split = body.len().checked_sub(4)?;
    let mut crc = Crc32::new();
    crc.update(&body[..split]);
    let stored = u32::from_le_bytes(body[split..].try_into().ok()?);
    if crc.finalize() != stored {
        return None;
    }

    let mut cursor = io::Cursor::new(&body[..split]);
    let tag = FieldTag::from_u8(cursor.read_u8().ok()?)?;
    let key = CacheKey {
        dev:   cursor.read_u64::<LittleEndian>().ok()?,
        inode: cursor.read_u64::<LittleEndian>().ok()?,
        size:  cursor.read_u64::<LittleEndian>().ok()?,
        mtime: cursor.read_f64::<LittleEndian>().ok()?,
    };
    let payload = &body[RECORD_KEY_SIZE..split];
    let field = CacheField::from_payload(tag, payload).ok()?;
    Some((key, field))
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Statistics from the last log load, surfaced by `cache-info`.
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub records_loaded:  usize,
    pub dropped_records: usize,
    pub truncated_bytes: u64,
    pub per_tag:         [usize; 4],
    pub log_bytes:       u64,
}

/// Stream the log once, coalescing last-wins.  Returns the index, the load
/// statistics, and the byte offset where valid data ends (trailing garbage
/// past it should be truncated away).
fn load_log(file: &mut File, path: &Path) -> Result<(CacheIndex, LoadStats, u64), CacheError> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);

    // Header.
    let mut header = [0u8; CACHE_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    if &header[0..4] != CACHE_MAGIC {
        warn!(target: "cache", "{}: bad magic — starting with an empty cache", path.display());
        return Ok((CacheIndex::default(), LoadStats::default(), 0));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
    if version != CACHE_FORMAT_VERSION {
        // Never clobber a log written by a newer build.
        return Err(CacheError::UnsupportedVersion { path: path.to_path_buf(), found: version });
    }
    let mut crc = Crc32::new();
    crc.update(&header[..8]);
    let stored = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
    if crc.finalize() != stored {
        warn!(target: "cache", "{}: header CRC mismatch — starting with an empty cache", path.display());
        return Ok((CacheIndex::default(), LoadStats::default(), 0));
    }

    let mut index = CacheIndex::default();
    let mut stats = LoadStats { log_bytes: file_len, ..LoadStats::default() };
    let mut good_end = CACHE_HEADER_SIZE as u64;

    loop {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&len) {
            // Length field is garbage: everything from here on is a torn
            // tail, not individually skippable records.
            warn!(target: "cache",
                "{}: insane record length {len} at offset {good_end} — truncating tail",
                path.display());
            break;
        }
        let mut body = vec![0u8; len as usize];
        if reader.read_exact(&mut body).is_err() {
            // Partial trailing record from an interrupted append.
            break;
        }

        match decode_body(&body) {
            Some((key, field)) => {
                stats.records_loaded += 1;
                stats.per_tag[field.tag() as usize] += 1;
                index.apply(&key, field);
            }
            None => {
                stats.dropped_records += 1;
                warn!(target: "cache",
                    "{}: dropping corrupt record at offset {good_end}", path.display());
            }
        }
        good_end += 4 + u64::from(len);
    }

    stats.truncated_bytes = file_len.saturating_sub(good_end);
    Ok((index, stats, good_end))
}

// ── Cache ────────────────────────────────────────────────────────────────────

/// The live cache: read-mostly in-memory index plus a single-writer append
/// thread.  Reads never block on appends; durability is forced at stage
/// boundaries via [`Cache::flush`].
pub struct Cache {
    index:  RwLock<CacheIndex>,
    writer: CacheWriter,
    stats:  LoadStats,
    path:   PathBuf,
}

impl Cache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        Self::open_with_queue(path, DEFAULT_APPEND_QUEUE)
    }

    /// `queue_bound` caps the number of in-flight appends; producers block
    /// when it fills (backpressure toward the hashing stages).
    pub fn open_with_queue(path: &Path, queue_bound: usize) -> Result<Self, CacheError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let (index, stats, good_end) = if len < CACHE_HEADER_SIZE as u64 {
            // Fresh (or hopelessly short) log: start over with a header.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write_header(&mut file)?;
            file.sync_data()?;
            (CacheIndex::default(), LoadStats::default(), CACHE_HEADER_SIZE as u64)
        } else {
            let (index, stats, mut good_end) = load_log(&mut file, path)?;
            if good_end < CACHE_HEADER_SIZE as u64 {
                // Header was unusable; rewrite it.
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                write_header(&mut file)?;
                file.sync_data()?;
                good_end = CACHE_HEADER_SIZE as u64;
            } else if good_end < len {
                warn!(target: "cache",
                    "{}: truncating {} trailing bytes", path.display(), len - good_end);
                file.set_len(good_end)?;
            }
            (index, stats, good_end)
        };

        file.seek(SeekFrom::Start(good_end))?;
        let writer = CacheWriter::spawn(file, queue_bound);

        Ok(Self {
            index: RwLock::new(index),
            writer,
            stats,
            path: path.to_path_buf(),
        })
    }

    /// O(1) expected.  Clones the coalesced record out of the read lock.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheRecord> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup(key)
            .cloned()
    }

    /// Record a freshly computed field: the in-memory index sees it
    /// immediately, the append is queued to the writer thread.  Write
    /// failures are warnings, never fatal — the run continues uncached.
    pub fn put(&self, key: CacheKey, field: CacheField) {
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply(&key, field.clone());
        self.writer.append(key, field);
    }

    /// Block until every queued append is on disk (fsync'd).  Called at
    /// stage boundaries and before the report is written.
    pub fn flush(&self) {
        self.writer.flush();
    }

    pub fn load_stats(&self) -> &LoadStats {
        &self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of identity slots currently held.
    pub fn key_count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .key_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{Digest, HashAlgo};

    fn key(n: u64) -> CacheKey {
        CacheKey { dev: 1, inode: n, size: 100 + n, mtime: 1000.0 + n as f64 }
    }

    fn full_hash(b: u8) -> CacheField {
        CacheField::Full(FullHash { algo: HashAlgo::Blake3, digest: Digest([b; 32]) })
    }

    fn meta_field(dur: f64) -> CacheField {
        CacheField::Meta(VideoMeta {
            duration_sec: dur,
            width:        1920,
            height:       1080,
            codec:        "h264".into(),
            container:    "mp4".into(),
            bitrate:      Some(4_000_000),
            fps:          Some(25.0),
        })
    }

    #[test]
    fn roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        {
            let cache = Cache::open(&path).unwrap();
            cache.put(key(1), full_hash(0xAA));
            cache.put(key(1), meta_field(60.0));
            cache.put(key(2), full_hash(0xBB));
            cache.flush();
        }

        let cache = Cache::open(&path).unwrap();
        assert_eq!(cache.load_stats().records_loaded, 3);
        assert_eq!(cache.load_stats().dropped_records, 0);

        let rec = cache.lookup(&key(1)).unwrap();
        assert_eq!(rec.full_hash.unwrap().digest, Digest([0xAA; 32]));
        assert_eq!(rec.video_meta.unwrap().duration_sec, 60.0);
        assert!(rec.partial_hash.is_none());

        let rec2 = cache.lookup(&key(2)).unwrap();
        assert_eq!(rec2.full_hash.unwrap().digest, Digest([0xBB; 32]));
    }

    #[test]
    fn superseding_write_wins_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        {
            let cache = Cache::open(&path).unwrap();
            cache.put(key(1), full_hash(0x01));
            cache.put(key(1), full_hash(0x02));
            cache.flush();
        }

        let cache = Cache::open(&path).unwrap();
        // Both records survive in the log; the latest wins on read.
        assert_eq!(cache.load_stats().records_loaded, 2);
        let rec = cache.lookup(&key(1)).unwrap();
        assert_eq!(rec.full_hash.unwrap().digest, Digest([0x02; 32]));
    }

    #[test]
    fn mtime_within_tolerance_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let cache = Cache::open(&path).unwrap();
        cache.put(key(1), full_hash(0xCC));

        let mut probe = key(1);
        probe.mtime += 0.8;
        assert!(cache.lookup(&probe).is_some());

        probe.mtime = key(1).mtime + 1.5;
        assert!(cache.lookup(&probe).is_none());

        let mut other_size = key(1);
        other_size.size += 1;
        assert!(cache.lookup(&other_size).is_none());
    }

    #[test]
    fn corrupt_record_does_not_invalidate_followers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        {
            let cache = Cache::open(&path).unwrap();
            cache.put(key(1), full_hash(0x01));
            cache.put(key(2), full_hash(0x02));
            cache.put(key(3), full_hash(0x03));
            cache.flush();
        }

        // Flip one byte inside the middle record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes(
            bytes[CACHE_HEADER_SIZE..CACHE_HEADER_SIZE + 4].try_into().unwrap(),
        ) as usize;
        let second_payload = CACHE_HEADER_SIZE + 4 + first_len + 4 + RECORD_KEY_SIZE + 5;
        bytes[second_payload] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let cache = Cache::open(&path).unwrap();
        assert_eq!(cache.load_stats().records_loaded, 2);
        assert_eq!(cache.load_stats().dropped_records, 1);
        assert!(cache.lookup(&key(1)).is_some());
        assert!(cache.lookup(&key(2)).is_none());
        assert!(cache.lookup(&key(3)).is_some());
    }

    #[test]
    fn partial_trailing_record_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        {
            let cache = Cache::open(&path).unwrap();
            cache.put(key(1), full_hash(0x01));
            cache.flush();
        }
        let clean_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a torn append: a plausible length prefix, then EOF.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&200u32.to_le_bytes()).unwrap();
        f.write_all(&[0xAB; 10]).unwrap();
        drop(f);

        let cache = Cache::open(&path).unwrap();
        assert_eq!(cache.load_stats().records_loaded, 1);
        assert!(cache.lookup(&key(1)).is_some());
        drop(cache);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
    }

    #[test]
    fn newer_format_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        {
            let cache = Cache::open(&path).unwrap();
            cache.flush();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let mut crc = Crc32::new();
        crc.update(&bytes[..8]);
        let sum = crc.finalize();
        bytes[8..12].copy_from_slice(&sum.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            Cache::open(&path),
            Err(CacheError::UnsupportedVersion { found: 99, .. }),
        ));
    }

    #[test]
    fn fingerprint_field_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let frames = vec![
            FrameHash { timestamp_sec: 1.5, index: 0, phash: 0xDEAD },
            FrameHash { timestamp_sec: 3.0, index: 1, phash: 0xBEEF },
        ];

        {
            let cache = Cache::open(&path).unwrap();
            cache.put(key(1), CacheField::Fingerprint(frames.clone()));
            cache.flush();
        }

        let cache = Cache::open(&path).unwrap();
        let rec = cache.lookup(&key(1)).unwrap();
        assert_eq!(rec.fingerprint.unwrap(), frames);
    }
}

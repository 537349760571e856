//! Content hashing — the fast partial proxy and the authoritative full hash.
//!
//! # Partial hash
//! Three independent digests over the first, last, and middle windows of a
//! file (4 MiB each by default; the middle window only exists when the file
//! is larger than three windows).  Two files with equal content necessarily
//! have equal partial triples, so partial collision is a cheap necessary
//! condition for full equality — never a sufficient one.
//!
//! # Full hash
//! A single digest streamed over the whole file in 1 MiB blocks.  Equal full
//! digests define an exact-duplicate relation.
//!
//! Both operations are deterministic functions of file contents.  Algorithm
//! is BLAKE3 by default with SHA-256 as the fallback; the algorithm tag is
//! carried inside every digest record so cached values from either algorithm
//! remain self-describing.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// Default window size for head/tail/mid partial hashing.
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Block size for streaming the full-file hash.
pub const FULL_HASH_BLOCK_SIZE: usize = 1024 * 1024;

// ── HashAlgo ─────────────────────────────────────────────────────────────────

/// Digest algorithm tag, persisted with every digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Blake3,
    Sha256,
}

impl HashAlgo {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Blake3 => "blake3",
            HashAlgo::Sha256 => "sha256",
        }
    }
}

enum AlgoState {
    Blake3(blake3::Hasher),
    Sha256(Sha256),
}

impl AlgoState {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Blake3 => AlgoState::Blake3(blake3::Hasher::new()),
            HashAlgo::Sha256 => AlgoState::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            AlgoState::Blake3(h) => {
                h.update(data);
            }
            AlgoState::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Digest {
        match self {
            AlgoState::Blake3(h) => Digest(h.finalize().into()),
            AlgoState::Sha256(h) => Digest(h.finalize().into()),
        }
    }
}

// ── Digest ───────────────────────────────────────────────────────────────────

/// A 32-byte digest.  Hex on the wire and in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))?;
        Ok(Digest(arr))
    }
}

// ── PartialHash / FullHash ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialHash {
    pub algo:       HashAlgo,
    pub head:       Digest,
    pub tail:       Digest,
    /// Present only when the file is large enough to have a distinct middle
    /// window.
    pub mid:        Option<Digest>,
    pub head_bytes: u64,
    pub tail_bytes: u64,
    pub mid_bytes:  u64,
}

impl PartialHash {
    /// Collision key: two files are partial-collision candidates iff these
    /// tuples are equal.
    #[inline]
    pub fn collision_key(&self) -> (HashAlgo, Digest, Digest, Option<Digest>) {
        (self.algo, self.head, self.tail, self.mid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullHash {
    pub algo:   HashAlgo,
    pub digest: Digest,
}

// ── Hasher ───────────────────────────────────────────────────────────────────

/// Stateless hashing frontend.  The segment size is injectable so tests can
/// exercise the three-window geometry without multi-MiB fixtures.
#[derive(Debug, Clone, Copy)]
pub struct Hasher {
    algo:         HashAlgo,
    segment_size: u64,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(HashAlgo::Blake3)
    }
}

impl Hasher {
    pub fn new(algo: HashAlgo) -> Self {
        Self { algo, segment_size: DEFAULT_SEGMENT_SIZE }
    }

    pub fn with_segment_size(algo: HashAlgo, segment_size: u64) -> Self {
        assert!(segment_size > 0, "segment size must be non-zero");
        Self { algo, segment_size }
    }

    #[inline]
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// Hash the head, tail, and (for files larger than three windows) middle
    /// windows.  For small files head and tail overlap; that is fine — the
    /// triple stays a deterministic function of content.
    pub fn partial(&self, path: &Path, size: u64) -> io::Result<PartialHash> {
        let mut file = File::open(path)?;
        let window = self.segment_size;

        let head_len = window.min(size);
        let head = self.hash_range(&mut file, 0, head_len)?;

        let tail_len = window.min(size);
        let tail_off = size.saturating_sub(tail_len);
        let tail = self.hash_range(&mut file, tail_off, tail_len)?;

        // A distinct middle window exists only past three windows of content.
        let (mid, mid_bytes) = if size > 3 * window {
            let mid_off = size / 2 - window / 2;
            (Some(self.hash_range(&mut file, mid_off, window)?), window)
        } else {
            (None, 0)
        };

        Ok(PartialHash {
            algo:       self.algo,
            head,
            tail,
            mid,
            head_bytes: head_len,
            tail_bytes: tail_len,
            mid_bytes,
        })
    }

    /// Stream the whole file in [`FULL_HASH_BLOCK_SIZE`] blocks.
    pub fn full(&self, path: &Path) -> io::Result<FullHash> {
        let mut file = File::open(path)?;
        let mut state = AlgoState::new(self.algo);
        let mut buf = vec![0u8; FULL_HASH_BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
        }
        Ok(FullHash { algo: self.algo, digest: state.finalize() })
    }

    fn hash_range(&self, file: &mut File, offset: u64, len: u64) -> io::Result<Digest> {
        file.seek(SeekFrom::Start(offset))?;
        let mut state = AlgoState::new(self.algo);
        let mut remaining = len;
        let mut buf = vec![0u8; FULL_HASH_BLOCK_SIZE.min(len as usize).max(1)];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break; // file shrank under us; hash what was readable
            }
            state.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(state.finalize())
    }
}

//! 64-bit perceptual frame hashes and per-video fingerprints.
//!
//! # Hash construction
//! The decoder hands us a 32×32 8-bit grayscale frame.  A 2-D DCT-II reduces
//! it to frequency space; the top-left 8×8 coefficient block keeps the
//! lowest frequencies — the overall shape of the image, immune to scaling
//! and re-encoding noise.  Each of the 64 bits records whether its
//! coefficient is above the median of the block, so the hash is invariant
//! under global brightness and contrast shifts.
//!
//! Small Hamming distance between two hashes implies visual similarity of
//! the source frames.  Distance 0 is not equality of pixels — only equality
//! of low-frequency structure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use rustdct::{DctPlanner, TransformType2And3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PER_FRAME_TIMEOUT;
use crate::media::MediaTools;

/// Side length of the grayscale frame the decoder must produce.
pub const FRAME_SIDE: usize = 32;
/// Byte length of one raw frame (`FRAME_SIDE`², 8-bit gray).
pub const FRAME_BYTES: usize = FRAME_SIDE * FRAME_SIDE;
/// Side length of the low-frequency DCT block the hash is built from.
const HASH_SIDE: usize = 8;

#[derive(Error, Debug, Clone)]
pub enum FrameHashError {
    #[error("Frame buffer is {got} bytes, expected {expected}")]
    BadFrameSize { expected: usize, got: usize },
}

#[derive(Error, Debug, Clone)]
pub enum FingerprintError {
    #[error("Only {usable} of {scheduled} scheduled frames decoded")]
    TooFewFrames { usable: usize, scheduled: usize },
    #[error("Extraction deadline exceeded after {extracted} of {scheduled} frames")]
    DeadlineExceeded { extracted: usize, scheduled: usize },
}

// ── FrameHash / VideoFingerprint ─────────────────────────────────────────────

/// One sampled frame: where it sits in the video and what it looks like.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameHash {
    pub timestamp_sec: f64,
    pub index:         u32,
    pub phash:         u64,
}

/// The ordered frame-hash sequence for one video.  Timestamps are strictly
/// increasing and indices are dense 0..N; immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFingerprint {
    path:         PathBuf,
    duration_sec: f64,
    frames:       Vec<FrameHash>,
}

impl VideoFingerprint {
    /// Build from already-ordered frames.  Indices are rewritten to be dense
    /// so a sequence with extraction gaps still satisfies the 0..N contract.
    pub fn new(path: PathBuf, duration_sec: f64, mut frames: Vec<FrameHash>) -> Self {
        debug_assert!(
            frames.windows(2).all(|w| w[0].timestamp_sec < w[1].timestamp_sec),
            "frame timestamps must be strictly increasing",
        );
        for (i, frame) in frames.iter_mut().enumerate() {
            frame.index = i as u32;
        }
        Self { path, duration_sec, frames }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn duration_sec(&self) -> f64 {
        self.duration_sec
    }

    #[inline]
    pub fn frames(&self) -> &[FrameHash] {
        &self.frames
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ── Hamming ──────────────────────────────────────────────────────────────────

/// True 64-bit Hamming distance.
#[inline]
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

// ── PhashOp ──────────────────────────────────────────────────────────────────

/// The DCT operator.  Not `Send`; use [`hash_frame`] for a per-thread
/// instance.
pub struct PhashOp {
    dct: Arc<dyn TransformType2And3<f32>>,
}

impl Default for PhashOp {
    fn default() -> Self {
        Self::new()
    }
}

impl PhashOp {
    pub fn new() -> Self {
        let mut planner = DctPlanner::new();
        Self { dct: planner.plan_dct2(FRAME_SIDE) }
    }

    /// Hash one raw grayscale frame.
    pub fn hash_frame(&self, pixels: &[u8]) -> Result<u64, FrameHashError> {
        if pixels.len() != FRAME_BYTES {
            return Err(FrameHashError::BadFrameSize { expected: FRAME_BYTES, got: pixels.len() });
        }

        let mut data: Vec<f32> = pixels.iter().map(|&p| f32::from(p)).collect();
        self.dct_2d(&mut data);

        // Low-frequency block, row-major.
        let mut coeffs = [0f32; HASH_SIDE * HASH_SIDE];
        for y in 0..HASH_SIDE {
            for x in 0..HASH_SIDE {
                coeffs[y * HASH_SIDE + x] = data[y * FRAME_SIDE + x];
            }
        }

        let mut sorted = coeffs;
        sorted.sort_by(f32::total_cmp);
        let median = (sorted[31] + sorted[32]) / 2.0;

        let mut hash = 0u64;
        for (i, &c) in coeffs.iter().enumerate() {
            if c > median {
                hash |= 1u64 << i;
            }
        }
        Ok(hash)
    }

    /// Separable 2-D DCT-II: rows, transpose, rows again, transpose back.
    fn dct_2d(&self, data: &mut [f32]) {
        for row in data.chunks_exact_mut(FRAME_SIDE) {
            self.dct.process_dct2(row);
        }
        let mut flipped = vec![0f32; FRAME_BYTES];
        transpose::transpose(data, &mut flipped, FRAME_SIDE, FRAME_SIDE);
        for row in flipped.chunks_exact_mut(FRAME_SIDE) {
            self.dct.process_dct2(row);
        }
        transpose::transpose(&flipped, data, FRAME_SIDE, FRAME_SIDE);
    }
}

/// Hash a frame with a lazily-built per-thread operator.
pub fn hash_frame(pixels: &[u8]) -> Result<u64, FrameHashError> {
    thread_local! {
        static OP: PhashOp = PhashOp::new();
    }
    OP.with(|op| op.hash_frame(pixels))
}

// ── Frame extraction ─────────────────────────────────────────────────────────

/// Extract the scheduled frames for one file on the IO side.
///
/// Individual frame failures skip that frame; the whole file fails only
/// when the per-file deadline (proportional to the schedule length)
/// expires.  Hashing the returned buffers is the CPU side's job — see
/// [`hash_extracted`].
pub fn extract_frames(
    tools: &dyn MediaTools,
    path: &Path,
    timestamps: &[f64],
) -> Result<Vec<(f64, Vec<u8>)>, FingerprintError> {
    let scheduled = timestamps.len();
    let deadline = Instant::now() + PER_FRAME_TIMEOUT * scheduled as u32;

    let mut raw = Vec::with_capacity(scheduled);
    for &ts in timestamps {
        if Instant::now() >= deadline {
            return Err(FingerprintError::DeadlineExceeded {
                extracted: raw.len(),
                scheduled,
            });
        }
        match tools.extract_frame(path, ts) {
            Ok(pixels) => raw.push((ts, pixels)),
            Err(e) => {
                debug!(target: "phash", "{}: frame at {ts:.1} s skipped: {e}", path.display());
            }
        }
    }
    Ok(raw)
}

/// Hash extracted frames into a fingerprint (CPU side).
///
/// Unhashable buffers are skipped like extraction failures.  The file
/// fails when fewer than half the *scheduled* frames survive both halves
/// of the process.
pub fn hash_extracted(
    path: &Path,
    duration_sec: f64,
    raw: Vec<(f64, Vec<u8>)>,
    scheduled: usize,
) -> Result<VideoFingerprint, FingerprintError> {
    let mut frames = Vec::with_capacity(raw.len());
    for (ts, pixels) in raw {
        match hash_frame(&pixels) {
            Ok(phash) => frames.push(FrameHash {
                timestamp_sec: ts,
                index:         frames.len() as u32,
                phash,
            }),
            Err(e) => {
                debug!(target: "phash", "{}: frame at {ts:.1} s unhashable: {e}", path.display());
            }
        }
    }

    if frames.len() * 2 < scheduled {
        return Err(FingerprintError::TooFewFrames { usable: frames.len(), scheduled });
    }
    Ok(VideoFingerprint::new(path.to_path_buf(), duration_sec, frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ExtractError, ToolCheckError};
    use crate::probe::{ProbeError, VideoMeta};

    fn gradient_frame() -> Vec<u8> {
        (0..FRAME_BYTES).map(|i| (i % 256) as u8).collect()
    }

    fn checker_frame() -> Vec<u8> {
        (0..FRAME_BYTES)
            .map(|i| {
                let (x, y) = (i % FRAME_SIDE, i / FRAME_SIDE);
                if (x / 4 + y / 4) % 2 == 0 { 255 } else { 0 }
            })
            .collect()
    }

    #[test]
    fn hash_is_deterministic() {
        let frame = gradient_frame();
        assert_eq!(hash_frame(&frame).unwrap(), hash_frame(&frame).unwrap());
    }

    #[test]
    fn distinct_patterns_hash_apart() {
        let a = hash_frame(&gradient_frame()).unwrap();
        let b = hash_frame(&checker_frame()).unwrap();
        assert!(hamming(a, b) > 12, "hamming {} too close", hamming(a, b));
    }

    #[test]
    fn noise_perturbation_hashes_close() {
        let clean = gradient_frame();
        let mut noisy = clean.clone();
        for (i, p) in noisy.iter_mut().enumerate() {
            *p = p.saturating_add((i % 3) as u8); // mild, structure-preserving
        }
        let d = hamming(hash_frame(&clean).unwrap(), hash_frame(&noisy).unwrap());
        assert!(d <= 10, "hamming {d} too far for near-identical frames");
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        assert!(matches!(
            hash_frame(&[0u8; 16]),
            Err(FrameHashError::BadFrameSize { got: 16, .. }),
        ));
    }

    #[test]
    fn hamming_basics() {
        assert_eq!(hamming(0, 0), 0);
        assert_eq!(hamming(u64::MAX, 0), 64);
        assert_eq!(hamming(0b1011, 0b0010), 2);
    }

    #[test]
    fn fingerprint_reindexes_densely() {
        let frames = vec![
            FrameHash { timestamp_sec: 1.0, index: 7, phash: 1 },
            FrameHash { timestamp_sec: 2.0, index: 9, phash: 2 },
        ];
        let fp = VideoFingerprint::new(PathBuf::from("v.mp4"), 10.0, frames);
        assert_eq!(fp.frames()[0].index, 0);
        assert_eq!(fp.frames()[1].index, 1);
    }

    /// Stub decoder: succeeds on even timestamps, fails on odd ones.
    struct FlakyTools;

    impl MediaTools for FlakyTools {
        fn probe(&self, _: &Path) -> Result<VideoMeta, ProbeError> {
            unreachable!("probe not used here")
        }
        fn extract_frame(&self, _: &Path, ts: f64) -> Result<Vec<u8>, ExtractError> {
            if (ts as u64) % 2 == 0 {
                Ok(gradient_frame())
            } else {
                Err(ExtractError::NonZeroExit { code: 1, timestamp: ts })
            }
        }
        fn check_available(&self) -> Result<(), ToolCheckError> {
            Ok(())
        }
    }

    #[test]
    fn half_usable_frames_still_fingerprints() {
        let timestamps = [2.0, 3.0, 4.0, 5.0]; // two succeed, two fail
        let raw = extract_frames(&FlakyTools, Path::new("v.mp4"), &timestamps).unwrap();
        assert_eq!(raw.len(), 2);
        let fp = hash_extracted(Path::new("v.mp4"), 10.0, raw, timestamps.len()).unwrap();
        assert_eq!(fp.len(), 2);
        assert_eq!(fp.frames()[0].timestamp_sec, 2.0);
        assert_eq!(fp.frames()[1].index, 1);
    }

    #[test]
    fn mostly_failed_extraction_is_an_error() {
        let timestamps = [1.0, 2.0, 3.0, 5.0]; // one succeeds, three fail
        let raw = extract_frames(&FlakyTools, Path::new("v.mp4"), &timestamps).unwrap();
        let err =
            hash_extracted(Path::new("v.mp4"), 10.0, raw, timestamps.len()).unwrap_err();
        assert!(matches!(err, FingerprintError::TooFewFrames { usable: 1, scheduled: 4 }));
    }
}

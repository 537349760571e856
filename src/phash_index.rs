//! Bucketed near-neighbor index over 64-bit perceptual hashes.
//!
//! Each hash is split into four disjoint 16-bit segments; every frame is
//! filed under all four segment values.  A query unions the four bucket
//! lookups, deduplicates, and keeps only candidates whose *true* 64-bit
//! Hamming distance is within the threshold — segment lookup is the sole
//! approximate step, the distance check is always exact.
//!
//! # Recall
//! A pair within distance t is recalled whenever its differing bits leave at
//! least one segment untouched — always true when the flips occupy at most
//! three of the four segments, and in particular for any t ≤ 3.  Visually
//! similar frames concentrate their differences in a handful of low-order
//! coefficient bits, so at the default threshold (12) the untouched-segment
//! condition holds in practice; a pathological 4-way spread of flips is the
//! only way to evade all four buckets.
//!
//! Videos are referenced by dense slab ids; the caller owns the id → path
//! mapping.

use std::collections::{HashMap, HashSet};

use crate::phash::{hamming, FrameHash};

/// Number of disjoint segments a hash is bucketed under.
pub const SEGMENTS: usize = 4;

/// Dense per-run video identifier (slab index into the caller's table).
pub type VideoId = u32;

/// One indexed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReference {
    pub video:         VideoId,
    pub frame_index:   u32,
    pub timestamp_sec: f64,
    pub phash:         u64,
}

#[inline]
fn segment(phash: u64, i: usize) -> u16 {
    (phash >> (16 * i)) as u16
}

// ── PHashIndex ───────────────────────────────────────────────────────────────

/// Built once per run after all fingerprints are computed; read-only during
/// matching.
#[derive(Default)]
pub struct PHashIndex {
    frames:  Vec<FrameReference>,
    buckets: [HashMap<u16, Vec<u32>>; SEGMENTS],
}

impl PHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Add every frame of one video under all four segment keys.
    pub fn insert(&mut self, video: VideoId, frames: &[FrameHash]) {
        for fh in frames {
            let slot = self.frames.len() as u32;
            self.frames.push(FrameReference {
                video,
                frame_index:   fh.index,
                timestamp_sec: fh.timestamp_sec,
                phash:         fh.phash,
            });
            for seg in 0..SEGMENTS {
                self.buckets[seg]
                    .entry(segment(fh.phash, seg))
                    .or_default()
                    .push(slot);
            }
        }
    }

    /// All frames within `threshold_bits` true Hamming distance of `phash`,
    /// optionally excluding one video (a frame always matches itself).
    pub fn query(
        &self,
        phash: u64,
        threshold_bits: u32,
        exclude_video: Option<VideoId>,
    ) -> Vec<&FrameReference> {
        let mut seen: HashSet<u32> = HashSet::new();
        let mut hits = Vec::new();
        for seg in 0..SEGMENTS {
            let Some(slots) = self.buckets[seg].get(&segment(phash, seg)) else {
                continue;
            };
            for &slot in slots {
                if !seen.insert(slot) {
                    continue;
                }
                let frame = &self.frames[slot as usize];
                if Some(frame.video) == exclude_video {
                    continue;
                }
                if hamming(frame.phash, phash) <= threshold_bits {
                    hits.push(frame);
                }
            }
        }
        hits
    }

    /// Candidate videos for a whole fingerprint, by descending count of
    /// unique `(query frame, candidate frame)` matching pairs.  Ties break
    /// on ascending video id so the ordering is deterministic.
    pub fn find_matching_videos(
        &self,
        query_frames: &[FrameHash],
        threshold_bits: u32,
        min_matching_frames: usize,
        exclude_video: Option<VideoId>,
    ) -> Vec<(VideoId, usize)> {
        let mut pairs: HashMap<VideoId, HashSet<(u32, u32)>> = HashMap::new();
        for qf in query_frames {
            for hit in self.query(qf.phash, threshold_bits, exclude_video) {
                pairs
                    .entry(hit.video)
                    .or_default()
                    .insert((qf.index, hit.frame_index));
            }
        }

        let mut out: Vec<(VideoId, usize)> = pairs
            .into_iter()
            .map(|(video, set)| (video, set.len()))
            .filter(|&(_, count)| count >= min_matching_frames)
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }
}

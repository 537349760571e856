//! Temporal overlap detection between two fingerprints.
//!
//! Matching frames between videos A and B form points `(i, j)` in a 2-D
//! matrix.  Genuinely overlapping content produces a *diagonal streak*:
//! a run of points where both indices advance together.  Coincidental
//! matches (black frames, title cards, static logos) land as isolated
//! points or short horizontal/vertical bands and never build a long
//! diagonal.
//!
//! The matcher finds the longest streak, maps its endpoints back to
//! timestamps, and emits an [`OverlapMatch`] when the overlapping span is a
//! large enough fraction of the longer video.

use serde::{Deserialize, Serialize};

use crate::phash::{hamming, VideoFingerprint};
use crate::phash_index::PHashIndex;

/// Overlap ratio at or above which two videos count as full duplicates
/// rather than a subset relation.
pub const FULL_DUPLICATE_RATIO: f64 = 0.95;

// ── Parameters ───────────────────────────────────────────────────────────────

/// Knobs for one matching run; defaults mirror the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    /// Max Hamming distance for two frames to count as matching.
    pub hamming_threshold: u32,
    /// Tolerated slack in the B index between consecutive streak points.
    /// A gap absorbs a dropped or duplicated frame.
    pub gap_tolerance: u32,
    /// Minimum streak length worth reporting.
    pub min_streak_length: usize,
    /// Minimum `overlap_duration / max(duration)` to emit a match.
    pub min_overlap_ratio: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            hamming_threshold: crate::config::DEFAULT_PHASH_THRESHOLD,
            gap_tolerance:     crate::config::DEFAULT_GAP_TOLERANCE,
            min_streak_length: crate::config::DEFAULT_MIN_STREAK_LENGTH,
            min_overlap_ratio: crate::config::DEFAULT_MIN_OVERLAP_RATIO,
        }
    }
}

// ── OverlapMatch ─────────────────────────────────────────────────────────────

/// Evidence of contiguous temporal overlap between two videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapMatch {
    pub overlap_duration_sec:   f64,
    /// `overlap_duration / max(duration_a, duration_b)`.
    pub overlap_ratio:          f64,
    /// Matched timestamp span in A: (start, end) seconds.
    pub a_range:                (f64, f64),
    /// Matched timestamp span in B: (start, end) seconds.
    pub b_range:                (f64, f64),
    /// Total unique matching frame pairs between the two videos.
    pub matching_frames:        usize,
    pub diagonal_streak_length: usize,
    /// Mean Hamming distance over the streak's frame pairs.
    pub avg_hamming:            f64,
    pub max_hamming:            u32,
}

impl OverlapMatch {
    /// Full duplicates cover (almost) the whole of the longer video.
    #[inline]
    pub fn is_full_duplicate(&self) -> bool {
        self.overlap_ratio >= FULL_DUPLICATE_RATIO
    }
}

// ── Matching ─────────────────────────────────────────────────────────────────

/// Find the strongest contiguous overlap between `a` and `b`, or `None`
/// when no streak reaches the configured length and ratio.
pub fn match_fingerprints(
    a: &VideoFingerprint,
    b: &VideoFingerprint,
    params: &MatchParams,
) -> Option<OverlapMatch> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    // 1. Frame-level matches via a throwaway index over B.
    let mut b_index = PHashIndex::new();
    b_index.insert(0, b.frames());

    let mut pairs: Vec<(u32, u32, u32)> = Vec::new(); // (i, j, hamming)
    for af in a.frames() {
        for hit in b_index.query(af.phash, params.hamming_threshold, None) {
            pairs.push((af.index, hit.frame_index, hamming(af.phash, hit.phash)));
        }
    }
    if pairs.is_empty() {
        return None;
    }

    // 2–4. Longest diagonal streak over pairs sorted by (i, j).
    pairs.sort_unstable_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    let streak = longest_streak(&pairs, params.gap_tolerance);
    if streak.len() < params.min_streak_length {
        return None;
    }

    // 5–6. Map endpoint frame indices back to timestamps.
    let (a_first, b_first, _) = pairs[streak[0]];
    let (a_last, b_last, _) = pairs[*streak.last().expect("non-empty streak")];
    let a_range = (
        a.frames()[a_first as usize].timestamp_sec,
        a.frames()[a_last as usize].timestamp_sec,
    );
    let b_range = (
        b.frames()[b_first as usize].timestamp_sec,
        b.frames()[b_last as usize].timestamp_sec,
    );
    let overlap_duration = (a_range.1 - a_range.0).min(b_range.1 - b_range.0);

    let longer = a.duration_sec().max(b.duration_sec());
    if !(longer > 0.0) {
        return None;
    }
    let overlap_ratio = overlap_duration / longer;

    // 7. Ratio gate.
    if overlap_ratio < params.min_overlap_ratio {
        return None;
    }

    let distances: Vec<u32> = streak.iter().map(|&k| pairs[k].2).collect();
    let avg_hamming = distances.iter().map(|&d| f64::from(d)).sum::<f64>() / distances.len() as f64;
    let max_hamming = distances.iter().copied().max().unwrap_or(0);

    Some(OverlapMatch {
        overlap_duration_sec: overlap_duration,
        overlap_ratio,
        a_range,
        b_range,
        matching_frames: pairs.len(),
        diagonal_streak_length: streak.len(),
        avg_hamming,
        max_hamming,
    })
}

/// Frame-match statistics without temporal verification: unique matching
/// pair count, mean and max Hamming distance.  This is all the evidence a
/// run without subset detection collects for a candidate pair.
pub fn frame_match_stats(
    a: &VideoFingerprint,
    b: &VideoFingerprint,
    hamming_threshold: u32,
) -> Option<(usize, f64, u32)> {
    let mut b_index = PHashIndex::new();
    b_index.insert(0, b.frames());

    let mut count = 0usize;
    let mut sum = 0.0f64;
    let mut max = 0u32;
    for af in a.frames() {
        for hit in b_index.query(af.phash, hamming_threshold, None) {
            let d = hamming(af.phash, hit.phash);
            count += 1;
            sum += f64::from(d);
            max = max.max(d);
        }
    }
    (count > 0).then(|| (count, sum / count as f64, max))
}

/// Indices (into `pairs`, which must be sorted by `(i, j)`) of the longest
/// run where consecutive points satisfy `i' = i + 1` and
/// `|j' − j − 1| ≤ gap_tolerance`.
///
/// Multiple matches may share one `i`, so this is a chain search over
/// per-`i` buckets rather than a linear scan of neighbours.  On equal
/// lengths the streak with the smallest starting `i` wins (then smallest
/// starting `j`, for a total order).
fn longest_streak(pairs: &[(u32, u32, u32)], gap_tolerance: u32) -> Vec<usize> {
    use std::collections::HashMap;

    // i → indices of pairs with that first coordinate (ascending j).
    let mut by_i: HashMap<u32, Vec<usize>> = HashMap::new();
    for (k, &(i, _, _)) in pairs.iter().enumerate() {
        by_i.entry(i).or_default().push(k);
    }

    // best_len[k] = length of the best streak ending at pair k;
    // prev[k] links backwards for reconstruction.
    let mut best_len = vec![1usize; pairs.len()];
    let mut prev = vec![usize::MAX; pairs.len()];

    for k in 0..pairs.len() {
        let (i, j, _) = pairs[k];
        let Some(candidates) = i.checked_sub(1).and_then(|pi| by_i.get(&pi)) else {
            continue;
        };
        for &q in candidates {
            let (_, pj, _) = pairs[q];
            // j must step forward by one, give or take the gap tolerance.
            let step = i64::from(j) - i64::from(pj) - 1;
            if step.unsigned_abs() <= u64::from(gap_tolerance)
                && best_len[q] + 1 > best_len[k]
            {
                best_len[k] = best_len[q] + 1;
                prev[k] = q;
            }
        }
    }

    // Pick the longest streak; ties prefer the smallest a_start (then b_start),
    // which for equal lengths is the end pair with the smallest (i, j) because
    // pairs are sorted.
    let Some(end) = (0..pairs.len()).max_by(|&x, &y| {
        best_len[x]
            .cmp(&best_len[y])
            .then_with(|| (pairs[y].0, pairs[y].1).cmp(&(pairs[x].0, pairs[x].1)))
    }) else {
        return Vec::new();
    };

    let mut streak = Vec::with_capacity(best_len[end]);
    let mut cursor = end;
    loop {
        streak.push(cursor);
        if prev[cursor] == usize::MAX {
            break;
        }
        cursor = prev[cursor];
    }
    streak.reverse();
    streak
}

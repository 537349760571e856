//! Duplicate-group construction and winner selection.
//!
//! Match evidence arrives as edges over a slab of file indices — `(u32,
//! u32)` pairs, no ownership cycles.  Connected components become groups;
//! the strongest edge kind in a component (exact ≻ visual ≻ subset) names
//! the group's kind.  Winner selection is a total order for every policy:
//! each chain of criteria terminates in the lexicographic path tie-break,
//! so re-ordering the input files can never change the winner.

use serde::{Deserialize, Serialize};

use crate::config::KeepPolicy;
use crate::hasher::Digest;
use crate::identity::FileMeta;
use crate::probe::VideoMeta;
use crate::sequence::OverlapMatch;
use std::cmp::Ordering;
use std::path::PathBuf;

// ── Edges ────────────────────────────────────────────────────────────────────

/// Why two files are considered duplicates.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchKind {
    /// Identical full-content hash.
    Exact { digest: Digest },
    /// High perceptual similarity across (nearly) the whole runtime.
    Visual { avg_hamming: f64, max_hamming: u32, matched_frames: usize },
    /// One file's content contained within the other's.
    Subset { overlap: OverlapMatch },
}

impl MatchKind {
    /// exact ≻ visual ≻ subset.
    fn strength(&self) -> u8 {
        match self {
            MatchKind::Exact { .. }  => 2,
            MatchKind::Visual { .. } => 1,
            MatchKind::Subset { .. } => 0,
        }
    }
}

/// One undirected edge between two slab indices.
#[derive(Debug, Clone)]
pub struct MatchEdge {
    pub a:    u32,
    pub b:    u32,
    pub kind: MatchKind,
}

/// Per-file facts the grouper judges by.
#[derive(Debug, Clone, Copy)]
pub struct GroupInput<'a> {
    pub meta:  &'a FileMeta,
    pub video: Option<&'a VideoMeta>,
}

// ── Report-facing group shapes ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Exact,
    Visual,
    Subset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub path:   PathBuf,
    pub size:   u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapEvidence {
    pub video_a:                PathBuf,
    pub video_b:                PathBuf,
    pub overlap_duration_sec:   f64,
    pub overlap_ratio:          f64,
    pub a_range:                (f64, f64),
    pub b_range:                (f64, f64),
    pub matching_frames:        usize,
    pub diagonal_streak_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupEvidence {
    Exact {
        full_hash_digest: String,
    },
    Visual {
        avg_hamming:         f64,
        max_hamming:         u32,
        phash_threshold:     u32,
        matched_frame_count: usize,
    },
    Subset {
        overlap: OverlapEvidence,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub group_id: String,
    pub kind:     GroupKind,
    pub winner:   MemberInfo,
    pub losers:   Vec<MemberInfo>,
    pub evidence: GroupEvidence,
}

// ── Union-find ───────────────────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n as u32).collect() }
    }

    fn find(&mut self, x: u32) -> u32 {
        let mut root = x;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression.
        let mut cursor = x;
        while self.parent[cursor as usize] != root {
            let next = self.parent[cursor as usize];
            self.parent[cursor as usize] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Deterministic: smaller root wins.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi as usize] = lo;
        }
    }
}

// ── Group construction ───────────────────────────────────────────────────────

/// Build duplicate groups from match edges.
///
/// `phash_threshold` is echoed into visual evidence so the report states
/// the distance regime the match counts were collected under.
pub fn build_groups(
    files: &[GroupInput<'_>],
    edges: &[MatchEdge],
    policy: KeepPolicy,
    phash_threshold: u32,
) -> Vec<DuplicateGroup> {
    if edges.is_empty() {
        return Vec::new();
    }

    // Deterministic edge order regardless of discovery order.
    let mut edges: Vec<&MatchEdge> = edges.iter().collect();
    edges.sort_by_key(|e| (e.a.min(e.b), e.a.max(e.b), std::cmp::Reverse(e.kind.strength())));

    let mut uf = UnionFind::new(files.len());
    for e in &edges {
        uf.union(e.a, e.b);
    }

    // root → member indices.
    let mut components: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    for e in &edges {
        for ix in [e.a, e.b] {
            let root = uf.find(ix);
            let members = components.entry(root).or_default();
            if !members.contains(&ix) {
                members.push(ix);
            }
        }
    }

    let mut groups: Vec<DuplicateGroup> = components
        .into_iter()
        .map(|(root, mut members)| {
            members.sort_by(|&x, &y| files[x as usize].meta.path.cmp(&files[y as usize].meta.path));
            let component_edges: Vec<&MatchEdge> = edges
                .iter()
                .copied()
                .filter(|e| uf.find(e.a) == root)
                .collect();
            build_one_group(files, &members, &component_edges, policy, phash_threshold)
        })
        .collect();

    groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    groups
}

fn build_one_group(
    files: &[GroupInput<'_>],
    members: &[u32],
    edges: &[&MatchEdge],
    policy: KeepPolicy,
    phash_threshold: u32,
) -> DuplicateGroup {
    let kind = match edges.iter().map(|e| e.kind.strength()).max() {
        Some(2) => GroupKind::Exact,
        Some(1) => GroupKind::Visual,
        _       => GroupKind::Subset,
    };

    let evidence = collect_evidence(files, edges, kind, phash_threshold);
    let (winner_ix, reason) = select_winner(files, members, policy);

    let loser_reason = match kind {
        GroupKind::Exact  => "exact duplicate of winner",
        GroupKind::Visual => "visual duplicate of winner",
        GroupKind::Subset => "contained within winner",
    };

    let member_info = |ix: u32, reason: &str| {
        let f = &files[ix as usize];
        MemberInfo {
            path:   f.meta.path.clone(),
            size:   f.meta.size,
            reason: reason.to_string(),
        }
    };

    let winner = member_info(winner_ix, reason);
    let losers: Vec<MemberInfo> = members
        .iter()
        .filter(|&&ix| ix != winner_ix)
        .map(|&ix| member_info(ix, loser_reason))
        .collect();

    DuplicateGroup {
        group_id: group_id(files, members),
        kind,
        winner,
        losers,
        evidence,
    }
}

/// Content-derived group identifier: stable across runs and input order.
fn group_id(files: &[GroupInput<'_>], members: &[u32]) -> String {
    let mut hasher = blake3::Hasher::new();
    for &ix in members {
        hasher.update(files[ix as usize].meta.path.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize().as_bytes()[..8])
}

fn collect_evidence(
    files: &[GroupInput<'_>],
    edges: &[&MatchEdge],
    kind: GroupKind,
    phash_threshold: u32,
) -> GroupEvidence {
    match kind {
        GroupKind::Exact => {
            let digest = edges
                .iter()
                .find_map(|e| match &e.kind {
                    MatchKind::Exact { digest } => Some(*digest),
                    _ => None,
                })
                .expect("exact group has an exact edge");
            GroupEvidence::Exact { full_hash_digest: digest.to_hex() }
        }
        GroupKind::Visual => {
            let mut weight = 0usize;
            let mut weighted_avg = 0.0;
            let mut max = 0u32;
            let mut frames = 0usize;
            for e in edges {
                if let MatchKind::Visual { avg_hamming, max_hamming, matched_frames } = &e.kind {
                    weighted_avg += avg_hamming * *matched_frames as f64;
                    weight += matched_frames;
                    max = max.max(*max_hamming);
                    frames = frames.max(*matched_frames);
                }
            }
            GroupEvidence::Visual {
                avg_hamming: if weight > 0 { weighted_avg / weight as f64 } else { 0.0 },
                max_hamming: max,
                phash_threshold,
                matched_frame_count: frames,
            }
        }
        GroupKind::Subset => {
            // Strongest overlap (longest streak) represents the group.
            let (edge, overlap) = edges
                .iter()
                .filter_map(|e| match &e.kind {
                    MatchKind::Subset { overlap } => Some((e, overlap)),
                    _ => None,
                })
                .max_by_key(|(e, o)| {
                    (o.diagonal_streak_length, std::cmp::Reverse((e.a.min(e.b), e.a.max(e.b))))
                })
                .expect("subset group has a subset edge");
            GroupEvidence::Subset {
                overlap: OverlapEvidence {
                    video_a:                files[edge.a as usize].meta.path.clone(),
                    video_b:                files[edge.b as usize].meta.path.clone(),
                    overlap_duration_sec:   overlap.overlap_duration_sec,
                    overlap_ratio:          overlap.overlap_ratio,
                    a_range:                overlap.a_range,
                    b_range:                overlap.b_range,
                    matching_frames:        overlap.matching_frames,
                    diagonal_streak_length: overlap.diagonal_streak_length,
                },
            }
        }
    }
}

// ── Winner selection ─────────────────────────────────────────────────────────

/// One step of a tie-break chain: its human name and its ordering
/// (`Less` = first argument preferred).
type Criterion<'a> = (&'a str, Box<dyn Fn(&GroupInput<'_>, &GroupInput<'_>) -> Ordering + 'a>);

fn select_winner(
    files: &[GroupInput<'_>],
    members: &[u32],
    policy: KeepPolicy,
) -> (u32, &'static str) {
    let chain = criteria_chain(policy);

    let mut ordered: Vec<u32> = members.to_vec();
    ordered.sort_by(|&x, &y| {
        let (fx, fy) = (&files[x as usize], &files[y as usize]);
        for (_, cmp) in &chain {
            let ord = cmp(fx, fy);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    let winner = ordered[0];
    // Name the first criterion that separated the winner from the runner-up.
    let reason: &'static str = if ordered.len() > 1 {
        let (fw, fr) = (&files[winner as usize], &files[ordered[1] as usize]);
        chain
            .iter()
            .find(|(_, cmp)| cmp(fw, fr) != Ordering::Equal)
            .map(|(name, _)| *name)
            .unwrap_or("path order")
    } else {
        "only member"
    };
    (winner, reason)
}

fn criteria_chain(policy: KeepPolicy) -> Vec<Criterion<'static>> {
    fn res(f: &GroupInput<'_>) -> u64 {
        f.video.map(VideoMeta::resolution).unwrap_or(0)
    }
    fn bitrate(f: &GroupInput<'_>) -> u64 {
        f.video.and_then(|v| v.bitrate).unwrap_or(0)
    }
    fn duration(f: &GroupInput<'_>) -> f64 {
        f.video.map(|v| v.duration_sec).unwrap_or(0.0)
    }

    let by_path: Criterion<'static> =
        ("path order", Box::new(|a, b| a.meta.path.cmp(&b.meta.path)));

    match policy {
        KeepPolicy::BestQuality => {
            vec![
                ("higher resolution", Box::new(|a, b| res(b).cmp(&res(a)))),
                ("higher bitrate", Box::new(|a, b| bitrate(b).cmp(&bitrate(a)))),
                // For subset groups the containing file is the longer one, so
                // this step also prefers the container.
                ("longer duration", Box::new(|a, b| duration(b).total_cmp(&duration(a)))),
                ("larger file", Box::new(|a, b| b.meta.size.cmp(&a.meta.size))),
                ("older file", Box::new(|a, b| a.meta.mtime.total_cmp(&b.meta.mtime))),
                by_path,
            ]
        }
        KeepPolicy::Oldest => vec![
            ("older file", Box::new(|a, b| a.meta.mtime.total_cmp(&b.meta.mtime))),
            by_path,
        ],
        KeepPolicy::Newest => vec![
            ("newer file", Box::new(|a, b| b.meta.mtime.total_cmp(&a.meta.mtime))),
            by_path,
        ],
        KeepPolicy::Smallest => vec![
            ("smaller file", Box::new(|a, b| a.meta.size.cmp(&b.meta.size))),
            by_path,
        ],
        KeepPolicy::Largest => vec![
            ("larger file", Box::new(|a, b| b.meta.size.cmp(&a.meta.size))),
            by_path,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str, size: u64, mtime: f64) -> FileMeta {
        FileMeta {
            path: PathBuf::from(path),
            size,
            mtime,
            dev: 1,
            inode: size, // unique enough for tests
        }
    }

    fn video(w: u32, h: u32, dur: f64, bitrate: u64) -> VideoMeta {
        VideoMeta {
            duration_sec: dur,
            width:        w,
            height:       h,
            codec:        "h264".into(),
            container:    "mp4".into(),
            bitrate:      Some(bitrate),
            fps:          Some(25.0),
        }
    }

    fn exact_edge(a: u32, b: u32) -> MatchEdge {
        MatchEdge { a, b, kind: MatchKind::Exact { digest: Digest([9; 32]) } }
    }

    fn visual_edge(a: u32, b: u32) -> MatchEdge {
        MatchEdge {
            a,
            b,
            kind: MatchKind::Visual { avg_hamming: 3.0, max_hamming: 8, matched_frames: 40 },
        }
    }

    fn subset_edge(a: u32, b: u32, ratio: f64) -> MatchEdge {
        MatchEdge {
            a,
            b,
            kind: MatchKind::Subset {
                overlap: OverlapMatch {
                    overlap_duration_sec:   900.0,
                    overlap_ratio:          ratio,
                    a_range:                (600.0, 1500.0),
                    b_range:                (0.0, 900.0),
                    matching_frames:        120,
                    diagonal_streak_length: 100,
                    avg_hamming:            2.0,
                    max_hamming:            6,
                },
            },
        }
    }

    #[test]
    fn no_edges_no_groups() {
        let m = meta("/a.mp4", 10, 1.0);
        let inputs = [GroupInput { meta: &m, video: None }];
        assert!(build_groups(&inputs, &[], KeepPolicy::BestQuality, 12).is_empty());
    }

    #[test]
    fn exact_beats_visual_for_component_kind() {
        let metas = [meta("/a", 10, 1.0), meta("/b", 10, 2.0), meta("/c", 10, 3.0)];
        let inputs: Vec<GroupInput> =
            metas.iter().map(|m| GroupInput { meta: m, video: None }).collect();
        let edges = [visual_edge(0, 1), exact_edge(1, 2)];

        let groups = build_groups(&inputs, &edges, KeepPolicy::BestQuality, 12);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, GroupKind::Exact);
        assert_eq!(groups[0].losers.len(), 2);
        assert!(matches!(groups[0].evidence, GroupEvidence::Exact { .. }));
    }

    #[test]
    fn best_quality_prefers_resolution() {
        let metas = [meta("/small", 900, 5.0), meta("/big", 100, 9.0)];
        let videos = [video(1280, 720, 100.0, 9_000_000), video(1920, 1080, 100.0, 800_000)];
        let inputs = [
            GroupInput { meta: &metas[0], video: Some(&videos[0]) },
            GroupInput { meta: &metas[1], video: Some(&videos[1]) },
        ];
        let groups = build_groups(&inputs, &[visual_edge(0, 1)], KeepPolicy::BestQuality, 12);
        assert_eq!(groups[0].winner.path, PathBuf::from("/big"));
        assert_eq!(groups[0].winner.reason, "higher resolution");
        assert_eq!(groups[0].losers[0].reason, "visual duplicate of winner");
    }

    #[test]
    fn subset_winner_is_the_container() {
        let metas = [meta("/clip.mp4", 500, 1.0), meta("/full.mp4", 400, 2.0)];
        let videos = [video(1280, 720, 900.0, 0), video(1280, 720, 7200.0, 0)];
        let inputs = [
            GroupInput { meta: &metas[0], video: Some(&videos[0]) },
            GroupInput { meta: &metas[1], video: Some(&videos[1]) },
        ];
        // Edge direction: a = the longer (containing) file, b = the clip.
        let groups = build_groups(&inputs, &[subset_edge(1, 0, 0.125)], KeepPolicy::BestQuality, 12);
        assert_eq!(groups[0].kind, GroupKind::Subset);
        assert_eq!(groups[0].winner.path, PathBuf::from("/full.mp4"));
        assert_eq!(groups[0].winner.reason, "longer duration");
        assert_eq!(groups[0].losers[0].reason, "contained within winner");
        match &groups[0].evidence {
            GroupEvidence::Subset { overlap } => {
                assert_eq!(overlap.video_a, PathBuf::from("/full.mp4"));
                assert!((overlap.overlap_ratio - 0.125).abs() < 1e-9);
            }
            other => panic!("wrong evidence: {other:?}"),
        }
    }

    #[test]
    fn policies_are_total_orders() {
        let metas = [
            meta("/x", 300, 30.0),
            meta("/y", 100, 10.0),
            meta("/z", 200, 20.0),
        ];
        let inputs: Vec<GroupInput> =
            metas.iter().map(|m| GroupInput { meta: m, video: None }).collect();
        let edges = [exact_edge(0, 1), exact_edge(1, 2)];

        let winner_for = |policy| {
            build_groups(&inputs, &edges, policy, 12)[0].winner.path.clone()
        };
        assert_eq!(winner_for(KeepPolicy::Oldest), PathBuf::from("/y"));
        assert_eq!(winner_for(KeepPolicy::Newest), PathBuf::from("/x"));
        assert_eq!(winner_for(KeepPolicy::Smallest), PathBuf::from("/y"));
        assert_eq!(winner_for(KeepPolicy::Largest), PathBuf::from("/x"));
    }

    #[test]
    fn winner_is_input_order_invariant() {
        let metas = [meta("/a", 100, 1.0), meta("/b", 100, 1.0), meta("/c", 100, 1.0)];
        let inputs: Vec<GroupInput> =
            metas.iter().map(|m| GroupInput { meta: m, video: None }).collect();

        let forward = build_groups(
            &inputs,
            &[exact_edge(0, 1), exact_edge(1, 2)],
            KeepPolicy::BestQuality,
            12,
        );
        let backward = build_groups(
            &inputs,
            &[exact_edge(2, 1), exact_edge(1, 0)],
            KeepPolicy::BestQuality,
            12,
        );
        assert_eq!(forward, backward);
        // All criteria tie; the path decides.
        assert_eq!(forward[0].winner.path, PathBuf::from("/a"));
        assert_eq!(forward[0].winner.reason, "path order");
    }

    #[test]
    fn group_id_is_stable() {
        let metas = [meta("/a", 1, 1.0), meta("/b", 2, 1.0)];
        let inputs: Vec<GroupInput> =
            metas.iter().map(|m| GroupInput { meta: m, video: None }).collect();
        let g1 = build_groups(&inputs, &[exact_edge(0, 1)], KeepPolicy::BestQuality, 12);
        let g2 = build_groups(&inputs, &[exact_edge(1, 0)], KeepPolicy::BestQuality, 12);
        assert_eq!(g1[0].group_id, g2[0].group_id);
        assert_eq!(g1[0].group_id.len(), 16);
    }

    #[test]
    fn separate_components_stay_separate() {
        let metas = [
            meta("/a", 1, 1.0),
            meta("/b", 2, 1.0),
            meta("/c", 3, 1.0),
            meta("/d", 4, 1.0),
        ];
        let inputs: Vec<GroupInput> =
            metas.iter().map(|m| GroupInput { meta: m, video: None }).collect();
        let groups = build_groups(
            &inputs,
            &[exact_edge(0, 1), visual_edge(2, 3)],
            KeepPolicy::BestQuality,
            12,
        );
        assert_eq!(groups.len(), 2);
        let kinds: Vec<GroupKind> = groups.iter().map(|g| g.kind).collect();
        assert!(kinds.contains(&GroupKind::Exact));
        assert!(kinds.contains(&GroupKind::Visual));
    }
}

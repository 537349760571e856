//! Adaptive frame-sampling schedules.
//!
//! The schedule is table-driven: duration band × mode → (stride, min, max).
//! The frame count is `duration / stride` clamped into the band's bounds
//! (and into the per-run override bounds when configured), and timestamps
//! are spread evenly across the open interval `(0, duration)` — never the
//! first or last instant, where container padding and fade frames live.
//!
//! | Duration   | Fast              | Balanced         | Thorough          |
//! |------------|-------------------|------------------|-------------------|
//! | ≤ 5 min    | 10 s, 10–100      | 1 s, 30–500      | 0.5 s, 50–1000    |
//! | 5–60 min   | 20 s, 20–200      | 2 s, 50–1000     | 1 s, 100–2000     |
//! | > 60 min   | 30 s, 30–300      | 4 s, 50–1000     | 2 s, 100–3000     |

use crate::config::Mode;

/// One (stride, min frames, max frames) cell of the schedule table.
#[derive(Debug, Clone, Copy)]
struct Cell {
    stride_sec: f64,
    min_frames: usize,
    max_frames: usize,
}

/// One duration band: inclusive upper bound in seconds + per-mode cells.
#[derive(Debug, Clone, Copy)]
struct Band {
    max_duration_sec: f64,
    fast:             Cell,
    balanced:         Cell,
    thorough:         Cell,
}

const SCHEDULE: [Band; 3] = [
    Band {
        max_duration_sec: 5.0 * 60.0,
        fast:     Cell { stride_sec: 10.0, min_frames: 10, max_frames: 100 },
        balanced: Cell { stride_sec: 1.0,  min_frames: 30, max_frames: 500 },
        thorough: Cell { stride_sec: 0.5,  min_frames: 50, max_frames: 1000 },
    },
    Band {
        max_duration_sec: 60.0 * 60.0,
        fast:     Cell { stride_sec: 20.0, min_frames: 20,  max_frames: 200 },
        balanced: Cell { stride_sec: 2.0,  min_frames: 50,  max_frames: 1000 },
        thorough: Cell { stride_sec: 1.0,  min_frames: 100, max_frames: 2000 },
    },
    Band {
        max_duration_sec: f64::INFINITY,
        fast:     Cell { stride_sec: 30.0, min_frames: 30,  max_frames: 300 },
        balanced: Cell { stride_sec: 4.0,  min_frames: 50,  max_frames: 1000 },
        thorough: Cell { stride_sec: 2.0,  min_frames: 100, max_frames: 3000 },
    },
];

/// Number of frames the schedule would sample for `duration_sec`.
pub fn frame_count(duration_sec: f64, mode: Mode, bounds: Option<(usize, usize)>) -> usize {
    if !(duration_sec > 0.0) || !duration_sec.is_finite() {
        return 0;
    }
    let cell = lookup(duration_sec, mode);
    let by_stride = (duration_sec / cell.stride_sec) as usize;
    let mut count = by_stride.clamp(cell.min_frames, cell.max_frames);
    if let Some((min, max)) = bounds {
        count = count.clamp(min, max);
    }
    count
}

/// The ordered timestamp schedule for one video.  Degenerate durations
/// (zero, negative, NaN, missing) yield an empty schedule.
pub fn sample_timestamps(
    duration_sec: f64,
    mode: Mode,
    bounds: Option<(usize, usize)>,
) -> Vec<f64> {
    let count = frame_count(duration_sec, mode, bounds);
    if count == 0 {
        return Vec::new();
    }
    // Evenly spaced over the open interval: i of n lands at d·(i+1)/(n+1).
    (0..count)
        .map(|i| duration_sec * (i as f64 + 1.0) / (count as f64 + 1.0))
        .collect()
}

fn lookup(duration_sec: f64, mode: Mode) -> Cell {
    let band = SCHEDULE
        .iter()
        .find(|b| duration_sec <= b.max_duration_sec)
        .unwrap_or(&SCHEDULE[2]);
    match mode {
        Mode::Fast     => band.fast,
        Mode::Balanced => band.balanced,
        Mode::Thorough => band.thorough,
    }
}

//! Probe-output parsing and normalized video metadata.
//!
//! The external prober is asked for the minimum field set only:
//! `width, height, codec_name, r_frame_rate, bit_rate` from the first video
//! stream and `duration, format_name` from the container.  ffprobe emits
//! most numerics as JSON strings, so parsing is deliberately lenient about
//! string-vs-number — but strict about the presence of the fields a video
//! must have (dimensions and a stream).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("Failed to spawn prober: {0}")]
    Spawn(String),
    #[error("Probe timed out after {0} s")]
    Timeout(u64),
    #[error("Prober exited with {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("Unparseable probe output: {0}")]
    Parse(String),
    #[error("No video stream present")]
    NoVideoStream,
}

// ── VideoMeta ────────────────────────────────────────────────────────────────

/// Normalized per-file media metadata.  `duration_sec` is 0.0 when the
/// container does not declare a duration; such files are excluded from
/// metadata clustering but keep their exact-duplicate eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub duration_sec: f64,
    pub width:        u32,
    pub height:       u32,
    pub codec:        String,
    pub container:    String,
    pub bitrate:      Option<u64>,
    pub fps:          Option<f64>,
}

impl VideoMeta {
    #[inline]
    pub fn resolution(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Degenerate metadata cannot participate in duration clustering.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        !(self.duration_sec > 0.0) || !self.duration_sec.is_finite()
    }
}

// ── Raw wire shapes ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawProbe {
    #[serde(default)]
    streams: Vec<RawStream>,
    format:  Option<RawFormat>,
}

#[derive(Deserialize)]
struct RawStream {
    width:        Option<u32>,
    height:       Option<u32>,
    codec_name:   Option<String>,
    r_frame_rate: Option<String>,
    bit_rate:     Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawFormat {
    duration:    Option<serde_json::Value>,
    format_name: Option<String>,
    bit_rate:    Option<serde_json::Value>,
}

/// Parse the prober's JSON document into a [`VideoMeta`].
pub fn parse_probe_output(bytes: &[u8]) -> Result<VideoMeta, ProbeError> {
    let raw: RawProbe =
        serde_json::from_slice(bytes).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let stream = raw.streams.first().ok_or(ProbeError::NoVideoStream)?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(ProbeError::NoVideoStream),
    };

    let format = raw.format.as_ref();
    let duration_sec = format
        .and_then(|f| f.duration.as_ref())
        .and_then(lenient_f64)
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);

    // Stream bitrate when declared, container bitrate as fallback.
    let bitrate = stream
        .bit_rate
        .as_ref()
        .and_then(lenient_u64)
        .or_else(|| format.and_then(|f| f.bit_rate.as_ref()).and_then(lenient_u64));

    Ok(VideoMeta {
        duration_sec,
        width,
        height,
        codec:     stream.codec_name.clone().unwrap_or_default(),
        container: format
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        bitrate,
        fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
    })
}

/// `r_frame_rate` arrives as a rational string, e.g. `"30000/1001"`.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = match s.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (s.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || !num.is_finite() {
        return None;
    }
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn lenient_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_u64(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "streams": [{
            "width": 1920, "height": 1080,
            "codec_name": "h264",
            "r_frame_rate": "30000/1001",
            "bit_rate": "4500000"
        }],
        "format": {
            "duration": "5400.040000",
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "bit_rate": "4600000"
        }
    }"#;

    #[test]
    fn parses_typical_probe_document() {
        let meta = parse_probe_output(FULL.as_bytes()).unwrap();
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.codec, "h264");
        assert_eq!(meta.container, "mov,mp4,m4a,3gp,3g2,mj2");
        assert_eq!(meta.bitrate, Some(4_500_000));
        assert!((meta.duration_sec - 5400.04).abs() < 1e-6);
        let fps = meta.fps.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(meta.resolution(), 1920 * 1080);
        assert!(!meta.is_degenerate());
    }

    #[test]
    fn missing_stream_is_an_error() {
        let err = parse_probe_output(br#"{"streams": [], "format": {}}"#).unwrap_err();
        assert!(matches!(err, ProbeError::NoVideoStream));
    }

    #[test]
    fn missing_duration_is_degenerate_not_fatal() {
        let doc = r#"{
            "streams": [{"width": 640, "height": 480, "codec_name": "mpeg4"}],
            "format": {"format_name": "avi"}
        }"#;
        let meta = parse_probe_output(doc.as_bytes()).unwrap();
        assert_eq!(meta.duration_sec, 0.0);
        assert!(meta.is_degenerate());
    }

    #[test]
    fn container_bitrate_is_a_fallback() {
        let doc = r#"{
            "streams": [{"width": 640, "height": 480}],
            "format": {"duration": "10", "bit_rate": "900000"}
        }"#;
        let meta = parse_probe_output(doc.as_bytes()).unwrap();
        assert_eq!(meta.bitrate, Some(900_000));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(ProbeError::Parse(_)),
        ));
    }

    #[test]
    fn frame_rate_rationals() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("x/y"), None);
    }
}

//! External decoder and prober invocation.
//!
//! Everything that spawns a process lives behind the [`MediaTools`] trait so
//! the pipeline and the tests never care which binary produced a frame.  The
//! production implementation shells out to `ffprobe`/`ffmpeg` with stdout
//! capture and hard wall-clock deadlines; a hung child is killed, never
//! waited on indefinitely.
//!
//! # Decoder contract
//! One frame per invocation: fast-seek near the target timestamp before the
//! input, then an accurate seek after it (decoding forward from the nearest
//! keyframe only).  Putting the only seek after `-i` would decode from the
//! start of the file and is catastrophic for long videos.  Output is raw
//! 8-bit grayscale at the perceptual-hash geometry, written to stdout.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::config::{PER_FRAME_TIMEOUT, PROBE_TIMEOUT};
use crate::phash::{FRAME_BYTES, FRAME_SIDE};
use crate::probe::{parse_probe_output, ProbeError, VideoMeta};

#[derive(Error, Debug, Clone)]
pub enum ExtractError {
    #[error("Failed to spawn decoder: {0}")]
    Spawn(String),
    #[error("Frame extraction timed out at {0:.1} s")]
    Timeout(f64),
    #[error("Decoder exited with {code} at {timestamp:.1} s")]
    NonZeroExit { code: i32, timestamp: f64 },
    #[error("Decoder produced {got} bytes, expected {expected}")]
    ShortFrame { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum ToolCheckError {
    #[error("Required external tool '{tool}' is unavailable: {reason}")]
    Missing { tool: String, reason: String },
}

// ── MediaTools ───────────────────────────────────────────────────────────────

/// The seam between the pipeline and the external decode/probe binaries.
pub trait MediaTools: Send + Sync {
    /// Probe container and first-video-stream metadata.
    fn probe(&self, path: &Path) -> Result<VideoMeta, ProbeError>;

    /// Extract one raw grayscale frame ([`FRAME_BYTES`] bytes) at
    /// `timestamp_sec`.
    fn extract_frame(&self, path: &Path, timestamp_sec: f64) -> Result<Vec<u8>, ExtractError>;

    /// Verify the backing binaries exist.  Called once at startup; failure
    /// is fatal for the run.
    fn check_available(&self) -> Result<(), ToolCheckError>;
}

// ── FfmpegTools ──────────────────────────────────────────────────────────────

/// Production implementation backed by the ffmpeg suite.
pub struct FfmpegTools {
    ffprobe_bin:   PathBuf,
    ffmpeg_bin:    PathBuf,
    probe_timeout: Duration,
    frame_timeout: Duration,
}

impl Default for FfmpegTools {
    fn default() -> Self {
        Self {
            ffprobe_bin:   PathBuf::from("ffprobe"),
            ffmpeg_bin:    PathBuf::from("ffmpeg"),
            probe_timeout: PROBE_TIMEOUT,
            frame_timeout: PER_FRAME_TIMEOUT,
        }
    }
}

impl FfmpegTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(ffprobe_bin: PathBuf, ffmpeg_bin: PathBuf) -> Self {
        Self { ffprobe_bin, ffmpeg_bin, ..Self::default() }
    }
}

impl MediaTools for FfmpegTools {
    fn probe(&self, path: &Path) -> Result<VideoMeta, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v").arg("error")
            .arg("-hide_banner")
            .arg("-select_streams").arg("v:0")
            .arg("-show_entries").arg("stream=width,height,codec_name,r_frame_rate,bit_rate")
            .arg("-show_entries").arg("format=duration,format_name")
            .arg("-of").arg("json")
            .arg(path);

        let out = run_with_deadline(&mut cmd, self.probe_timeout)
            .map_err(|e| ProbeError::Spawn(e.to_string()))?
            .ok_or(ProbeError::Timeout(self.probe_timeout.as_secs()))?;

        if !out.success {
            return Err(ProbeError::NonZeroExit {
                code:   out.code,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        parse_probe_output(&out.stdout)
    }

    fn extract_frame(&self, path: &Path, timestamp_sec: f64) -> Result<Vec<u8>, ExtractError> {
        let (fast_seek, accurate_seek) = two_stage_seek(timestamp_sec);
        let geometry = format!("{FRAME_SIDE}x{FRAME_SIDE}");

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-v").arg("error")
            .arg("-hide_banner")
            .arg("-ss").arg(fast_seek)
            .arg("-i").arg(path)
            .arg("-ss").arg(accurate_seek)
            .arg("-frames:v").arg("1")
            .arg("-f").arg("rawvideo")
            .arg("-pix_fmt").arg("gray")
            .arg("-s").arg(geometry)
            .arg("pipe:1");

        let out = run_with_deadline(&mut cmd, self.frame_timeout)
            .map_err(|e| ExtractError::Spawn(e.to_string()))?
            .ok_or(ExtractError::Timeout(timestamp_sec))?;

        if !out.success {
            return Err(ExtractError::NonZeroExit { code: out.code, timestamp: timestamp_sec });
        }
        if out.stdout.len() != FRAME_BYTES {
            return Err(ExtractError::ShortFrame {
                expected: FRAME_BYTES,
                got:      out.stdout.len(),
            });
        }
        Ok(out.stdout)
    }

    fn check_available(&self) -> Result<(), ToolCheckError> {
        for (bin, tool) in [(&self.ffprobe_bin, "ffprobe"), (&self.ffmpeg_bin, "ffmpeg")] {
            let mut cmd = Command::new(bin);
            cmd.arg("-version");
            match run_with_deadline(&mut cmd, Duration::from_secs(5)) {
                Ok(Some(out)) if out.success => {
                    debug!(target: "media", "{tool} available at {}", bin.display());
                }
                Ok(Some(out)) => {
                    return Err(ToolCheckError::Missing {
                        tool:   tool.into(),
                        reason: format!("exited with {}", out.code),
                    });
                }
                Ok(None) => {
                    return Err(ToolCheckError::Missing {
                        tool:   tool.into(),
                        reason: "version check timed out".into(),
                    });
                }
                Err(e) => {
                    return Err(ToolCheckError::Missing { tool: tool.into(), reason: e.to_string() });
                }
            }
        }
        Ok(())
    }
}

/// Split a timestamp into (fast input seek, accurate output seek): jump to
/// three seconds before the target, then decode forward to it.
fn two_stage_seek(timestamp_sec: f64) -> (String, String) {
    if !timestamp_sec.is_finite() {
        return ("0.000".into(), "0.000".into());
    }
    let target = timestamp_sec.max(0.0);
    let fast = (target - 3.0).max(0.0);
    (format!("{fast:.3}"), format!("{:.3}", target - fast))
}

// ── Deadline-bounded process capture ─────────────────────────────────────────

struct CapturedOutput {
    success: bool,
    code:    i32,
    stdout:  Vec<u8>,
    stderr:  Vec<u8>,
}

/// Run `cmd` to completion or the deadline, whichever first.  Returns
/// `Ok(None)` on timeout; the child is killed and reaped before returning so
/// no zombie survives the deadline.
fn run_with_deadline(
    cmd: &mut Command,
    timeout: Duration,
) -> std::io::Result<Option<CapturedOutput>> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_thread = drain_pipe(child.stdout.take());
    let stderr_thread = drain_pipe(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            if let Err(e) = child.kill() {
                warn!(target: "media", "failed to kill timed-out child: {e}");
            }
            let _ = child.wait();
            let _ = stdout_thread.join();
            let _ = stderr_thread.join();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    Ok(Some(CapturedOutput {
        success: status.success(),
        code:    status.code().unwrap_or(-1),
        stdout,
        stderr,
    }))
}

fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_stage_seek_near_start() {
        assert_eq!(two_stage_seek(1.0), ("0.000".to_string(), "1.000".to_string()));
        assert_eq!(two_stage_seek(0.0), ("0.000".to_string(), "0.000".to_string()));
    }

    #[test]
    fn two_stage_seek_deep() {
        let (fast, accurate) = two_stage_seek(600.5);
        assert_eq!(fast, "597.500");
        assert_eq!(accurate, "3.000");
    }

    #[test]
    fn two_stage_seek_non_finite() {
        assert_eq!(two_stage_seek(f64::NAN), ("0.000".to_string(), "0.000".to_string()));
    }

    #[test]
    fn deadline_kills_slow_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let out = run_with_deadline(&mut cmd, Duration::from_millis(100)).unwrap();
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn capture_collects_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("frame");
        let out = run_with_deadline(&mut cmd, Duration::from_secs(5)).unwrap().unwrap();
        assert!(out.success);
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "frame");
    }

    #[test]
    fn missing_binary_fails_check() {
        let tools = FfmpegTools::with_binaries(
            PathBuf::from("/nonexistent/ffprobe"),
            PathBuf::from("/nonexistent/ffmpeg"),
        );
        assert!(tools.check_available().is_err());
    }
}

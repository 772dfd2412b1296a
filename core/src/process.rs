//! External tool helpers: command construction, ffmpeg progress parsing and
//! ffmpeg/ffprobe probing.

use std::ffi::OsStr;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Keeps console windows from flashing up for child processes on Windows.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

impl NoWindowExt for Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// A `Command` with no stdin and no console window.
pub fn tool_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null()).no_window();
    cmd
}

/// Kills the child if it is still running and reaps it.
pub fn terminate(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Owns a running child and terminates it when dropped, so early returns
/// and unwinding never leave the process behind.
pub struct ChildGuard(Child);

impl ChildGuard {
    pub fn new(child: Child) -> Self {
        Self(child)
    }
}

impl Deref for ChildGuard {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.0
    }
}

impl DerefMut for ChildGuard {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.0
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        terminate(&mut self.0);
    }
}

/// One recognised line of ffmpeg progress output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    Frame(u64),
    /// Output timestamp in seconds.
    OutTime(f64),
    End,
}

/// Parses `HH:MM:SS.ms` into seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Understands both `-progress` key=value lines and classic stderr status
/// lines (`frame=  120 fps=... time=00:00:04.00 ...`). Anything else is `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if line.contains(' ') && line.contains("time=") {
        let start = line.find("time=")? + 5;
        let rest = &line[start..];
        let end = rest.find(' ').unwrap_or(rest.len());
        return parse_time(&rest[..end]).map(ProgressLine::OutTime);
    }
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    match key.trim() {
        "frame" => value.parse().ok().map(ProgressLine::Frame),
        // out_time_ms is in microseconds as well.
        "out_time_us" | "out_time_ms" => value
            .parse::<i64>()
            .ok()
            .filter(|micros| *micros >= 0)
            .map(|micros| ProgressLine::OutTime(micros as f64 / 1_000_000.0)),
        "out_time" => parse_time(value).map(ProgressLine::OutTime),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Frames per percentage point when the media duration is unknown.
const FRAMES_PER_PERCENT: f64 = 500.0;

/// Transcode completion in `0..=100` for one progress line. Timestamps are
/// used when `total_duration` is known, frame counts otherwise.
pub fn transcode_percent(line: ProgressLine, total_duration: Option<f64>) -> Option<f64> {
    let total = total_duration.filter(|total| *total > 0.0);
    match (line, total) {
        (ProgressLine::End, _) => Some(100.0),
        (ProgressLine::OutTime(seconds), Some(total)) => Some((seconds / total * 100.0).clamp(0.0, 100.0)),
        (ProgressLine::Frame(frames), None) => Some((frames as f64 / FRAMES_PER_PERCENT).min(100.0)),
        _ => None,
    }
}

/// Runs `ffmpeg -version` and returns its first line.
pub fn probe_ffmpeg(ffmpeg: &str) -> CoreResult<String> {
    let output = tool_command(ffmpeg)
        .arg("-version")
        .output()
        .map_err(|err| CoreError::Tool(format!("cannot run {}: {}", ffmpeg, err)))?;
    if !output.status.success() {
        return Err(CoreError::Tool(format!(
            "{} -version exited with {}",
            ffmpeg, output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next().unwrap_or_default().trim().to_string();
    if version.is_empty() {
        return Err(CoreError::Tool(format!("{} printed no version", ffmpeg)));
    }
    debug!(version = %version, "ffmpeg available");
    Ok(version)
}

/// Asks ffprobe whether `file` has a video stream.
///
/// `Err(Tool)` means ffprobe itself could not be run.
pub fn has_video_stream(ffprobe: &str, file: &Path) -> CoreResult<bool> {
    let output = tool_command(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
        ])
        .arg(file)
        .output()
        .map_err(|err| CoreError::Tool(format!("cannot run {}: {}", ffprobe, err)))?;
    if !output.status.success() {
        return Ok(false);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().any(|line| line.trim() == "video"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_progress() {
        assert_eq!(parse_progress_line("frame=1200"), Some(ProgressLine::Frame(1200)));
        assert_eq!(
            parse_progress_line("out_time_us=2500000"),
            Some(ProgressLine::OutTime(2.5))
        );
        assert_eq!(
            parse_progress_line("out_time=00:01:30.500000"),
            Some(ProgressLine::OutTime(90.5))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressLine::End));
    }

    #[test]
    fn parses_classic_status_line() {
        let line = "frame=  240 fps= 60 q=-1.0 size=    1024kB time=00:00:08.00 bitrate=1048.6kbits/s speed=2.0x";
        assert_eq!(parse_progress_line(line), Some(ProgressLine::OutTime(8.0)));
    }

    #[test]
    fn ignores_unrecognised_lines() {
        for line in [
            "",
            "bitrate=N/A",
            "out_time=N/A",
            "out_time_us=-23000",
            "progress=continue",
            "Input #0, mpegts, from 'intermediate.ts':",
            "frame=abc",
        ] {
            assert_eq!(parse_progress_line(line), None, "{}", line);
        }
    }

    #[test]
    fn percent_uses_duration_or_frame_heuristic() {
        assert_eq!(transcode_percent(ProgressLine::OutTime(30.0), Some(120.0)), Some(25.0));
        assert_eq!(transcode_percent(ProgressLine::Frame(30), Some(120.0)), None);
        assert_eq!(transcode_percent(ProgressLine::Frame(5000), None), Some(10.0));
        assert_eq!(transcode_percent(ProgressLine::Frame(80_000), Some(0.0)), Some(100.0));
        assert_eq!(transcode_percent(ProgressLine::OutTime(500.0), Some(100.0)), Some(100.0));
        assert_eq!(transcode_percent(ProgressLine::End, None), Some(100.0));
    }

    #[test]
    fn missing_tool_is_a_tool_error() {
        let err = probe_ffmpeg("/nonexistent/hlsget-ffmpeg").unwrap_err();
        assert!(matches!(err, CoreError::Tool(_)));
        let err = has_video_stream("/nonexistent/hlsget-ffprobe", Path::new("x.mp4")).unwrap_err();
        assert!(matches!(err, CoreError::Tool(_)));
    }
}

//! Assembler/transcoder: concatenates ordered segment files and drives ffmpeg
//! to produce the final container.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::config::{EngineConfig, OutputFormat};
use crate::error::{CoreError, CoreResult};
use crate::process::{
    has_video_stream, parse_progress_line, terminate, tool_command, transcode_percent, ChildGuard,
};
use crate::profile::profile_for;
use crate::progress::{Phase, ProgressAggregator};

pub const INTERMEDIATE_FILE: &str = "intermediate.ts";
const STDERR_TAIL_LINES: usize = 20;
const COPY_BUFFER_BYTES: usize = 256 * 1024;

/// Share of the processing phase taken by concatenation.
const CONCAT_SHARE: f64 = 50.0;
const TRANSCODE_SHARE: f64 = 49.0;

/// What the caller wants at the end.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub timing_fix: bool,
    /// Sum of segment durations, used to turn ffmpeg timestamps into percentages.
    pub total_duration: Option<f64>,
    pub dest_dir: PathBuf,
    pub output_name: Option<String>,
    /// `WxH` of the selected variant, appended to generated names.
    pub resolution: Option<String>,
}

pub struct Assembler<'a> {
    settings: &'a EngineConfig,
    cancel: &'a CancelToken,
    progress: &'a ProgressAggregator,
    workspace: &'a Path,
}

impl<'a> Assembler<'a> {
    pub fn new(
        settings: &'a EngineConfig,
        cancel: &'a CancelToken,
        progress: &'a ProgressAggregator,
        workspace: &'a Path,
    ) -> Self {
        Self {
            settings,
            cancel,
            progress,
            workspace,
        }
    }

    /// Concatenate, transcode, verify and move into `spec.dest_dir`.
    pub fn assemble(&self, segments: &[PathBuf], spec: &OutputSpec) -> CoreResult<PathBuf> {
        let intermediate = self.workspace.join(INTERMEDIATE_FILE);
        self.concat(segments, &intermediate)?;

        let produced = self
            .workspace
            .join(format!("output.{}", spec.format.extension()));
        self.transcode(&intermediate, &produced, spec)?;
        self.verify(&produced)?;

        let name = output_file_name(
            spec.output_name.as_deref(),
            spec.resolution.as_deref(),
            spec.format.extension(),
            Local::now(),
        );
        let dest = move_into_place(&produced, &spec.dest_dir, &name)?;
        info!(output = %dest.display(), "output ready");
        Ok(dest)
    }

    /// Byte-exact concatenation in the given order.
    pub fn concat(&self, segments: &[PathBuf], intermediate: &Path) -> CoreResult<u64> {
        self.progress.processing(Phase::Merging, 0.0)?;
        let mut total = 0u64;
        for segment in segments {
            total += fs::metadata(segment)?.len();
        }
        let mut out = BufWriter::new(File::create(intermediate)?);
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        let mut written = 0u64;
        for segment in segments {
            self.cancel.check()?;
            let mut input = File::open(segment)?;
            loop {
                let read = input.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                out.write_all(&buffer[..read])?;
                written += read as u64;
            }
            if total > 0 {
                let share = written as f64 / total as f64 * CONCAT_SHARE;
                self.progress.processing(Phase::Merging, share)?;
            }
        }
        out.flush()?;
        debug!(segments = segments.len(), bytes = written, "segments concatenated");
        Ok(written)
    }

    /// Runs ffmpeg under supervision: cancellation, overall timeout and stall
    /// timeout each kill and reap the child.
    pub fn transcode(&self, input: &Path, output: &Path, spec: &OutputSpec) -> CoreResult<()> {
        self.cancel.check()?;
        let args = profile_for(spec.format).ffmpeg_args(
            input,
            output,
            spec.timing_fix,
            spec.resolution.as_deref(),
        );
        debug!(ffmpeg = %self.settings.ffmpeg_path, args = ?args, "starting transcode");
        let mut child = ChildGuard::new(
            tool_command(&self.settings.ffmpeg_path)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| {
                    CoreError::Tool(format!("cannot start {}: {}", self.settings.ffmpeg_path, err))
                })?,
        );

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, StreamKind::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, StreamKind::Stderr, tx.clone());
        }
        drop(tx);

        self.progress.processing(Phase::Transcoding, CONCAT_SHARE)?;
        let overall = self.settings.transcode_timeout();
        let stall = self.settings.stall_timeout();
        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let status = loop {
            if self.cancel.is_cancelled() {
                terminate(&mut child);
                info!("transcode cancelled");
                return Err(CoreError::Cancelled);
            }
            if started.elapsed() >= overall {
                terminate(&mut child);
                warn!(timeout_secs = overall.as_secs(), "transcode timed out");
                return Err(CoreError::TranscodeTimeout(overall.as_secs()));
            }
            if last_activity.elapsed() >= stall {
                terminate(&mut child);
                warn!(stall_secs = stall.as_secs(), "transcode stalled");
                return Err(CoreError::TranscodeStalled(stall.as_secs()));
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((kind, line)) => {
                    if self.observe_line(kind, &line, spec, &mut stderr_tail)? {
                        last_activity = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    terminate(&mut child);
                    return Err(CoreError::Io(err.to_string()));
                }
            }
        };

        // Pick up whatever the readers still had buffered.
        while let Ok((kind, line)) = rx.recv_timeout(Duration::from_millis(200)) {
            self.observe_line(kind, &line, spec, &mut stderr_tail)?;
        }

        if !status.success() {
            let tail: Vec<String> = stderr_tail.into_iter().collect();
            return Err(CoreError::TranscodeFailed {
                exit_code: status.code(),
                stderr_tail: tail.join("\n"),
            });
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "transcode finished");
        Ok(())
    }

    /// Returns whether the line counted as progress.
    fn observe_line(
        &self,
        kind: StreamKind,
        line: &str,
        spec: &OutputSpec,
        stderr_tail: &mut VecDeque<String>,
    ) -> CoreResult<bool> {
        let Some(parsed) = parse_progress_line(line) else {
            if kind == StreamKind::Stderr && !line.trim().is_empty() {
                if stderr_tail.len() == STDERR_TAIL_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line.trim_end().to_string());
            }
            return Ok(false);
        };
        if let Some(percent) = transcode_percent(parsed, spec.total_duration) {
            let sub = CONCAT_SHARE + percent / 100.0 * TRANSCODE_SHARE;
            self.progress.processing(Phase::Transcoding, sub)?;
        }
        Ok(true)
    }

    /// Size check, then an optional ffprobe check for a video stream.
    pub fn verify(&self, output: &Path) -> CoreResult<()> {
        let size = match fs::metadata(output) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(CoreError::OutputInvalid(format!(
                    "{} was not produced",
                    output.display()
                )))
            }
        };
        if size < self.settings.min_output_bytes {
            return Err(CoreError::OutputInvalid(format!(
                "{} is only {} bytes",
                output.display(),
                size
            )));
        }
        if !self.settings.verify_output {
            return Ok(());
        }
        self.progress.phase(Phase::Verifying)?;
        match has_video_stream(&self.settings.ffprobe_path, output) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::OutputInvalid(format!(
                "{} has no video stream",
                output.display()
            ))),
            Err(CoreError::Tool(detail)) => {
                warn!(error = %detail, "skipping video stream check");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    kind: StreamKind,
    tx: Sender<(StreamKind, String)>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                    if tx.send((kind, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn sanitize_stem(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

/// `video_<YYYYmmdd_HHMMSS>[_<WxH>].<ext>`, or `<output_name>.<ext>` when a
/// usable name was given.
pub fn output_file_name(
    output_name: Option<&str>,
    resolution: Option<&str>,
    extension: &str,
    now: DateTime<Local>,
) -> String {
    if let Some(stem) = output_name.map(sanitize_stem).filter(|stem| !stem.is_empty()) {
        return format!("{}.{}", stem, extension);
    }
    let stamp = now.format("%Y%m%d_%H%M%S");
    match resolution {
        Some(resolution) => format!("video_{}_{}.{}", stamp, resolution, extension),
        None => format!("video_{}.{}", stamp, extension),
    }
}

/// Reserves a path in `dir` that does not exist yet, appending ` (n)` to the
/// stem until one is free.
pub fn reserve_destination(dir: &Path, file_name: &str) -> CoreResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let candidate = Path::new(file_name);
    let stem = candidate
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = candidate
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());
    for attempt in 0..10_000u32 {
        let name = match (attempt, &extension) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(CoreError::Io(format!(
        "no free file name for {} in {}",
        file_name,
        dir.display()
    )))
}

/// Moves `produced` into `dir` under a free variant of `file_name`.
pub fn move_into_place(produced: &Path, dir: &Path, file_name: &str) -> CoreResult<PathBuf> {
    let dest = reserve_destination(dir, file_name)?;
    if fs::rename(produced, &dest).is_err() {
        // Different filesystem.
        if let Err(err) = fs::copy(produced, &dest) {
            let _ = fs::remove_file(&dest);
            return Err(err.into());
        }
        let _ = fs::remove_file(produced);
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::{ChannelObserver, JobEvent, JobObserver, NullObserver};
    use crate::job::JobId;
    use chrono::TimeZone;
    use std::sync::Arc;
    use uuid::Uuid;

    fn write_segments(dir: &Path, parts: &[&[u8]]) -> Vec<PathBuf> {
        parts
            .iter()
            .enumerate()
            .map(|(ordinal, bytes)| {
                let path = dir.join(format!("segment_{:05}.ts", ordinal));
                fs::write(&path, bytes).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn concat_preserves_order_and_reports_first_half() {
        let dir = tempfile::tempdir().unwrap();
        let segments = write_segments(dir.path(), &[b"aaaa", b"bb", b"cccccc"]);
        let (observer, rx) = ChannelObserver::new();
        let progress = ProgressAggregator::new(Uuid::new_v4(), 3, Arc::new(observer));
        let settings = EngineConfig::default();
        let cancel = CancelToken::new();
        let assembler = Assembler::new(&settings, &cancel, &progress, dir.path());
        let out = dir.path().join(INTERMEDIATE_FILE);
        assert_eq!(assembler.concat(&segments, &out).unwrap(), 12);
        assert_eq!(fs::read(&out).unwrap(), b"aaaabbcccccc".to_vec());
        let last = rx
            .try_iter()
            .filter_map(|event| match event {
                JobEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .last()
            .unwrap();
        assert!((last - 95.0).abs() < 1e-9);
    }

    #[test]
    fn concat_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let segments = write_segments(dir.path(), &[b"aaaa"]);
        let progress = ProgressAggregator::new(Uuid::new_v4(), 1, Arc::new(NullObserver));
        let settings = EngineConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let assembler = Assembler::new(&settings, &cancel, &progress, dir.path());
        let err = assembler
            .concat(&segments, &dir.path().join(INTERMEDIATE_FILE))
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn generated_names_follow_the_pattern() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            output_file_name(None, Some("1920x1080"), "mp4", now),
            "video_20240309_140507_1920x1080.mp4"
        );
        assert_eq!(output_file_name(None, None, "ts", now), "video_20240309_140507.ts");
        assert_eq!(output_file_name(Some("My: Show?"), None, "mkv", now), "My_ Show_.mkv");
        assert_eq!(output_file_name(Some(" .. "), None, "mkv", now), "video_20240309_140507.mkv");
    }

    #[test]
    fn existing_files_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("clip.mp4"), b"old").unwrap();
        fs::write(dir.path().join("clip (1).mp4"), b"old").unwrap();
        let produced = dir.path().join("output.mp4");
        fs::write(&produced, b"new").unwrap();
        let dest = move_into_place(&produced, dir.path(), "clip.mp4").unwrap();
        assert_eq!(dest, dir.path().join("clip (2).mp4"));
        assert_eq!(fs::read(&dest).unwrap(), b"new".to_vec());
        assert_eq!(fs::read(dir.path().join("clip.mp4")).unwrap(), b"old".to_vec());
        assert!(!produced.exists());
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use crate::test_support::fake_tools;

        struct Fixture {
            dir: tempfile::TempDir,
            settings: EngineConfig,
            cancel: CancelToken,
            progress: ProgressAggregator,
        }

        impl Fixture {
            fn new(ffmpeg: &Path) -> Self {
                let mut settings = EngineConfig::default();
                settings.ffmpeg_path = ffmpeg.to_string_lossy().into_owned();
                settings.ffprobe_path = fake_tools().ffprobe_video.to_string_lossy().into_owned();
                settings.stall_timeout_secs = 1;
                settings.transcode_timeout_secs = 30;
                Self {
                    dir: tempfile::tempdir().unwrap(),
                    settings,
                    cancel: CancelToken::new(),
                    progress: ProgressAggregator::new(Uuid::new_v4(), 1, Arc::new(NullObserver)),
                }
            }

            fn assembler(&self) -> Assembler<'_> {
                Assembler::new(&self.settings, &self.cancel, &self.progress, self.dir.path())
            }

            fn spec(&self) -> OutputSpec {
                OutputSpec {
                    format: OutputFormat::Mp4,
                    timing_fix: false,
                    total_duration: Some(4.0),
                    dest_dir: self.dir.path().join("out"),
                    output_name: Some("result".to_string()),
                    resolution: None,
                }
            }

            fn transcode(&self) -> CoreResult<()> {
                let input = self.dir.path().join(INTERMEDIATE_FILE);
                fs::write(&input, vec![7u8; 4096]).unwrap();
                self.assembler()
                    .transcode(&input, &self.dir.path().join("output.mp4"), &self.spec())
            }
        }

        #[test]
        fn successful_run_produces_named_output() {
            let fixture = Fixture::new(&fake_tools().ffmpeg_copy);
            let segments = write_segments(fixture.dir.path(), &[&[1u8; 800], &[2u8; 800]]);
            let dest = fixture
                .assembler()
                .assemble(&segments, &fixture.spec())
                .unwrap();
            assert_eq!(dest, fixture.dir.path().join("out").join("result.mp4"));
            assert_eq!(fs::metadata(&dest).unwrap().len(), 1600);
            assert!(fixture.progress.last_percent().unwrap() <= 99.0);
        }

        #[test]
        fn non_zero_exit_reports_stderr_tail() {
            let fixture = Fixture::new(&fake_tools().ffmpeg_fail);
            match fixture.transcode().unwrap_err() {
                CoreError::TranscodeFailed { exit_code, stderr_tail } => {
                    assert_eq!(exit_code, Some(3));
                    assert!(stderr_tail.contains("Invalid data found"));
                }
                other => panic!("unexpected error {other:?}"),
            }
        }

        #[test]
        fn silent_process_is_stalled_and_reaped() {
            let fixture = Fixture::new(&fake_tools().ffmpeg_stall);
            let started = Instant::now();
            let err = fixture.transcode().unwrap_err();
            assert!(matches!(err, CoreError::TranscodeStalled(1)), "{err:?}");
            assert!(started.elapsed() < Duration::from_secs(10));
            let pid = fs::read_to_string(fixture.dir.path().join("ffmpeg.pid")).unwrap();
            let proc_entry = PathBuf::from(format!("/proc/{}", pid.trim()));
            if Path::new("/proc/self").exists() {
                assert!(!proc_entry.exists(), "ffmpeg process {} still present", pid.trim());
            }
        }

        #[test]
        fn chatty_process_still_hits_overall_timeout() {
            let mut fixture = Fixture::new(&fake_tools().ffmpeg_endless);
            fixture.settings.transcode_timeout_secs = 1;
            fixture.settings.stall_timeout_secs = 60;
            let err = fixture.transcode().unwrap_err();
            assert!(matches!(err, CoreError::TranscodeTimeout(1)), "{err:?}");
        }

        #[test]
        fn cancellation_kills_the_process() {
            let fixture = Fixture::new(&fake_tools().ffmpeg_endless);
            let cancel = fixture.cancel.clone();
            let canceller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                cancel.cancel();
            });
            let started = Instant::now();
            let err = fixture.transcode().unwrap_err();
            canceller.join().unwrap();
            assert!(err.is_cancelled());
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        /// Panics on progress only from the thread named `poisoner`, leaving
        /// the aggregator lock poisoned for everyone else.
        struct PoisoningObserver;

        impl JobObserver for PoisoningObserver {
            fn on_progress(&self, _job: JobId, _percent: f64, _phase: &str) {
                if thread::current().name() == Some("poisoner") {
                    panic!("observer failure");
                }
            }
            fn on_complete(&self, _job: JobId, _output: &Path) {}
            fn on_error(&self, _job: JobId, _kind: ErrorKind, _detail: &str) {}
            fn on_cancelled(&self, _job: JobId) {}
        }

        #[test]
        fn progress_failure_still_kills_the_process() {
            let mut fixture = Fixture::new(&fake_tools().ffmpeg_endless);
            fixture.settings.stall_timeout_secs = 60;
            fixture.progress = ProgressAggregator::new(Uuid::new_v4(), 1, Arc::new(PoisoningObserver));
            let input = fixture.dir.path().join(INTERMEDIATE_FILE);
            fs::write(&input, vec![7u8; 4096]).unwrap();
            let spec = OutputSpec {
                total_duration: None,
                ..fixture.spec()
            };

            let started = Instant::now();
            let err = thread::scope(|scope| {
                let poisoner = thread::Builder::new()
                    .name("poisoner".to_string())
                    .spawn_scoped(scope, || {
                        thread::sleep(Duration::from_millis(300));
                        let _ = fixture.progress.processing(Phase::Verifying, 60.0);
                    })
                    .unwrap();
                let result = fixture
                    .assembler()
                    .transcode(&input, &fixture.dir.path().join("output.mp4"), &spec);
                assert!(poisoner.join().is_err());
                result.unwrap_err()
            });

            assert!(matches!(err, CoreError::InvalidState(_)), "{err:?}");
            assert!(started.elapsed() < Duration::from_secs(10));
            let pid = fs::read_to_string(fixture.dir.path().join("ffmpeg.pid")).unwrap();
            let proc_entry = PathBuf::from(format!("/proc/{}", pid.trim()));
            if Path::new("/proc/self").exists() {
                assert!(!proc_entry.exists(), "ffmpeg process {} still present", pid.trim());
            }
        }

        #[test]
        fn tiny_output_is_invalid() {
            let fixture = Fixture::new(&fake_tools().ffmpeg_tiny);
            fixture.transcode().unwrap();
            let err = fixture
                .assembler()
                .verify(&fixture.dir.path().join("output.mp4"))
                .unwrap_err();
            assert!(matches!(err, CoreError::OutputInvalid(_)));
        }

        #[test]
        fn output_without_video_stream_is_invalid() {
            let mut fixture = Fixture::new(&fake_tools().ffmpeg_copy);
            fixture.settings.ffprobe_path = fake_tools().ffprobe_audio_only.to_string_lossy().into_owned();
            fixture.transcode().unwrap();
            let err = fixture
                .assembler()
                .verify(&fixture.dir.path().join("output.mp4"))
                .unwrap_err();
            assert!(err.to_string().contains("no video stream"));
        }

        #[test]
        fn missing_ffprobe_skips_verification() {
            let mut fixture = Fixture::new(&fake_tools().ffmpeg_copy);
            fixture.settings.ffprobe_path = "/nonexistent/hlsget-ffprobe".to_string();
            fixture.transcode().unwrap();
            fixture
                .assembler()
                .verify(&fixture.dir.path().join("output.mp4"))
                .unwrap();
        }
    }
}

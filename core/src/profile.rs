//! Compiled-in output profiles: the ffmpeg arguments used for each container.

use std::path::Path;

use crate::config::OutputFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputProfile {
    pub format: OutputFormat,
    maps: &'static [&'static str],
    video: &'static [&'static str],
    audio: &'static [&'static str],
    subtitles: &'static [&'static str],
    container: &'static [&'static str],
}

const ALL_STREAMS: &[&str] = &["-map", "0:v?", "-map", "0:a?", "-map", "0:s?"];
const COPY_VIDEO: &[&str] = &["-c:v", "copy"];
const COPY_AUDIO: &[&str] = &["-c:a", "copy"];
const AAC_AUDIO: &[&str] = &["-c:a", "aac", "-b:a", "384k"];

const TIMING_FIX_VIDEO: &[&str] = &[
    "-c:v",
    "libx264",
    "-preset",
    "ultrafast",
    "-tune",
    "zerolatency",
    "-profile:v",
    "baseline",
    "-r",
    "30",
    "-g",
    "30",
    "-keyint_min",
    "30",
    "-sc_threshold",
    "0",
    "-bf",
    "0",
];
const TIMING_FIX_SYNC: &[&str] = &["-vsync", "cfr", "-async", "1"];

static PROFILES: [OutputProfile; 3] = [
    OutputProfile {
        format: OutputFormat::Mp4,
        maps: ALL_STREAMS,
        video: COPY_VIDEO,
        audio: AAC_AUDIO,
        subtitles: &["-c:s", "mov_text"],
        container: &["-movflags", "+faststart"],
    },
    OutputProfile {
        format: OutputFormat::Mkv,
        maps: ALL_STREAMS,
        video: COPY_VIDEO,
        audio: COPY_AUDIO,
        subtitles: &["-c:s", "copy"],
        container: &[],
    },
    OutputProfile {
        format: OutputFormat::Ts,
        maps: ALL_STREAMS,
        video: COPY_VIDEO,
        audio: COPY_AUDIO,
        subtitles: &["-c:s", "copy"],
        container: &["-f", "mpegts"],
    },
];

pub fn profile_for(format: OutputFormat) -> &'static OutputProfile {
    match format {
        OutputFormat::Mp4 => &PROFILES[0],
        OutputFormat::Mkv => &PROFILES[1],
        OutputFormat::Ts => &PROFILES[2],
    }
}

impl OutputProfile {
    /// Stream mapping and codec arguments. `timing_fix` swaps stream copy for a
    /// constant-frame-rate re-encode with audio resampled to stay in sync.
    pub fn codec_args(&self, timing_fix: bool) -> Vec<String> {
        let mut parts: Vec<&[&str]> = vec![self.maps];
        if timing_fix {
            parts.push(TIMING_FIX_VIDEO);
            parts.push(AAC_AUDIO);
        } else {
            parts.push(self.video);
            parts.push(self.audio);
        }
        parts.push(self.subtitles);
        if timing_fix {
            parts.push(TIMING_FIX_SYNC);
        }
        parts.push(self.container);
        parts
            .into_iter()
            .flatten()
            .map(|arg| arg.to_string())
            .collect()
    }

    /// Full argument list for one run, progress reported as key=value on stdout.
    /// A known `WxH` resolution is written into the container metadata.
    pub fn ffmpeg_args(
        &self,
        input: &Path,
        output: &Path,
        timing_fix: bool,
        resolution: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "error",
            "-progress",
            "pipe:1",
            "-i",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        args.push(input.to_string_lossy().into_owned());
        args.extend(self.codec_args(timing_fix));
        if let Some(resolution) = resolution {
            args.push("-metadata".to_string());
            args.push(format!("resolution={}", resolution));
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_maps_all_stream_kinds() {
        for format in [OutputFormat::Mp4, OutputFormat::Mkv, OutputFormat::Ts] {
            let args = profile_for(format).codec_args(false).join(" ");
            assert!(args.starts_with("-map 0:v? -map 0:a? -map 0:s?"), "{}", args);
        }
    }

    #[test]
    fn mp4_copies_video_and_converts_audio() {
        let args = profile_for(OutputFormat::Mp4).codec_args(false).join(" ");
        assert!(args.contains("-c:v copy"));
        assert!(args.contains("-c:a aac -b:a 384k"));
        assert!(args.contains("-c:s mov_text"));
        assert!(args.ends_with("-movflags +faststart"));
    }

    #[test]
    fn timing_fix_reencodes_at_fixed_rate() {
        let args = profile_for(OutputFormat::Ts).codec_args(true).join(" ");
        assert!(args.contains("-c:v libx264"));
        assert!(args.contains("-r 30"));
        assert!(args.contains("-vsync cfr -async 1"));
        assert!(!args.contains("-c:v copy"));
        assert!(args.ends_with("-f mpegts"));
    }

    #[test]
    fn full_command_line_wraps_codec_args() {
        let args = profile_for(OutputFormat::Mkv).ffmpeg_args(
            Path::new("/w/intermediate.ts"),
            Path::new("/w/output.mkv"),
            false,
            None,
        );
        assert_eq!(args[..7].join(" "), "-y -hide_banner -nostats -loglevel error -progress pipe:1");
        assert_eq!(args[7], "-i");
        assert_eq!(args[8], "/w/intermediate.ts");
        assert_eq!(args.last().map(String::as_str), Some("/w/output.mkv"));
        assert!(!args.iter().any(|arg| arg == "-metadata"));
    }

    #[test]
    fn selected_resolution_is_tagged_before_the_output() {
        let args = profile_for(OutputFormat::Mp4).ffmpeg_args(
            Path::new("/w/intermediate.ts"),
            Path::new("/w/output.mp4"),
            false,
            Some("1920x1080"),
        );
        let tail: Vec<&str> = args[args.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, ["-metadata", "resolution=1920x1080", "/w/output.mp4"]);
    }
}

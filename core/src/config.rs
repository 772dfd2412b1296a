use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Best,
    Medium,
    Worst,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::Medium => "medium",
            Quality::Worst => "worst",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "best" => Some(Quality::Best),
            "medium" => Some(Quality::Medium),
            "worst" => Some(Quality::Worst),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mkv,
    Ts,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Ts => "ts",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mp4" => Some(OutputFormat::Mp4),
            "mkv" => Some(OutputFormat::Mkv),
            "ts" => Some(OutputFormat::Ts),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named settings bundles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Preset {
    Standard,
    HighQuality,
    SmallSize,
}

impl Preset {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "standard" => Some(Preset::Standard),
            "highquality" => Some(Preset::HighQuality),
            "smallsize" => Some(Preset::SmallSize),
            _ => None,
        }
    }

    pub fn apply(&self, job: &mut JobConfig) {
        let (quality, format) = match self {
            Preset::Standard => (Quality::Best, OutputFormat::Mp4),
            Preset::HighQuality => (Quality::Best, OutputFormat::Mkv),
            Preset::SmallSize => (Quality::Medium, OutputFormat::Mp4),
        };
        job.quality = quality;
        job.output_format = format;
    }
}

/// Per-job settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub quality: Quality,
    pub output_format: OutputFormat,
    pub concurrency_limit: usize,
    pub segment_timeout_secs: u64,
    /// Total attempts per segment, including the first one.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub mirror_domains: Vec<String>,
    pub min_segment_bytes: u64,
    /// Re-encode with a fixed frame rate instead of stream copy.
    pub timing_fix: bool,
    pub output_name: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            quality: Quality::Best,
            output_format: OutputFormat::Mp4,
            concurrency_limit: 4,
            segment_timeout_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            mirror_domains: Vec::new(),
            min_segment_bytes: 100,
            timing_fix: false,
            output_name: None,
        }
    }
}

impl JobConfig {
    pub fn effective_concurrency(&self, segment_count: usize) -> usize {
        self.concurrency_limit
            .clamp(1, MAX_CONCURRENCY)
            .min(segment_count.max(1))
    }

    pub fn effective_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs.max(1))
    }
}

/// Process-wide settings shared by every job the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_jobs: usize,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
    pub request_spacing_ms: u64,
    pub speed_limit_bytes_per_sec: Option<u64>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub transcode_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub min_output_bytes: u64,
    pub verify_output: bool,
    pub temp_root: Option<PathBuf>,
    pub job: JobConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            accept_invalid_certs: true,
            request_spacing_ms: 0,
            speed_limit_bytes_per_sec: None,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            transcode_timeout_secs: 3600,
            stall_timeout_secs: 120,
            min_output_bytes: 1000,
            verify_output: true,
            temp_root: None,
            job: JobConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> CoreResult<Self> {
        serde_json::from_str(raw).map_err(|err| CoreError::InvalidState(format!("config: {}", err)))
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"max_concurrent_jobs": 2, "job": {"quality": "worst", "mirror_domains": ["a.example"]}}"#,
        )
        .expect("parse");
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.job.quality, Quality::Worst);
        assert_eq!(config.job.mirror_domains, vec!["a.example".to_string()]);
        assert_eq!(config.job.retry_attempts, 3);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn concurrency_is_bounded_by_segment_count() {
        let mut job = JobConfig::default();
        job.concurrency_limit = 16;
        assert_eq!(job.effective_concurrency(3), 3);
        job.concurrency_limit = 0;
        assert_eq!(job.effective_concurrency(10), 1);
        job.concurrency_limit = 500;
        assert_eq!(job.effective_concurrency(1000), 64);
    }

    #[test]
    fn presets_set_quality_and_format() {
        let mut job = JobConfig::default();
        Preset::from_str("High Quality").expect("preset").apply(&mut job);
        assert_eq!((job.quality, job.output_format), (Quality::Best, OutputFormat::Mkv));
        Preset::SmallSize.apply(&mut job);
        assert_eq!((job.quality, job.output_format), (Quality::Medium, OutputFormat::Mp4));
    }

    #[test]
    fn zero_retry_attempts_still_tries_once() {
        let mut job = JobConfig::default();
        job.retry_attempts = 0;
        assert_eq!(job.effective_attempts(), 1);
    }
}

pub mod assemble;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod job;
pub mod locator;
pub mod manifest;
pub mod net;
pub mod process;
pub mod profile;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod throttle;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use crate::cancel::CancelToken;
pub use crate::config::{EngineConfig, JobConfig, OutputFormat, Preset, Quality};
pub use crate::engine::{run_job, DownloadEngine, JobOutcome};
pub use crate::error::{CoreError, CoreResult, ErrorKind};
pub use crate::events::{ChannelObserver, JobEvent, JobObserver};
pub use crate::job::{Job, JobId, JobRequest, JobState};
pub use crate::process::probe_ffmpeg;

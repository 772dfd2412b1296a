use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::JobConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::JobObserver;
use crate::manifest::ManifestSource;
use crate::net::NetClient;
use crate::throttle::RateLimiter;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Resolving,
    Downloading,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Resolving => "resolving",
            JobState::Downloading => "downloading",
            JobState::Assembling => "assembling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Resolving => 1,
            JobState::Downloading => 2,
            JobState::Assembling => 3,
            JobState::Completed | JobState::Failed | JobState::Cancelled => 4,
        }
    }

    /// Forward-only transition check. Terminal states are never left and
    /// `Failed`/`Cancelled` are reachable from every non-terminal state.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed | JobState::Cancelled => true,
            JobState::Completed => *self == JobState::Assembling,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller hands to the engine.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Manifest URL or literal manifest text.
    pub source: String,
    pub dest_dir: PathBuf,
    /// Base URL for relative segment URIs when `source` is literal text.
    pub base_url: Option<String>,
    pub config: JobConfig,
}

impl JobRequest {
    pub fn new(source: impl Into<String>, dest_dir: impl Into<PathBuf>, config: JobConfig) -> Self {
        Self {
            source: source.into(),
            dest_dir: dest_dir.into(),
            base_url: None,
            config,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source: ManifestSource,
    pub dest_dir: PathBuf,
    pub base_url: Option<String>,
    pub config: JobConfig,
    pub state: JobState,
    pub created_at: u64,
    pub updated_at: u64,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = now_epoch();
        Self {
            id: Uuid::new_v4(),
            source: ManifestSource::detect(&request.source),
            dest_dir: request.dest_dir,
            base_url: request.base_url,
            config: request.config,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            output: None,
            error: None,
        }
    }

    pub fn advance(&mut self, next: JobState) -> CoreResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(CoreError::InvalidState(format!(
                "job {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = now_epoch();
    }
}

/// Everything a running job needs, passed explicitly to each component.
#[derive(Clone)]
pub struct JobContext {
    pub id: JobId,
    pub net: Arc<dyn NetClient>,
    pub limiter: Arc<RateLimiter>,
    pub cancel: CancelToken,
    pub config: JobConfig,
    pub observer: Arc<dyn JobObserver>,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

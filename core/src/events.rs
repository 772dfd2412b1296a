use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::error::ErrorKind;
use crate::job::JobId;

/// Callbacks delivered to the caller. Every job produces any number of
/// progress calls followed by exactly one terminal call.
pub trait JobObserver: Send + Sync {
    fn on_progress(&self, job: JobId, percent: f64, phase: &str);
    fn on_complete(&self, job: JobId, output: &Path);
    fn on_error(&self, job: JobId, kind: ErrorKind, detail: &str);
    fn on_cancelled(&self, job: JobId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress {
        job: JobId,
        percent: f64,
        phase: String,
    },
    Completed {
        job: JobId,
        output: PathBuf,
    },
    Failed {
        job: JobId,
        kind: ErrorKind,
        detail: String,
    },
    Cancelled {
        job: JobId,
    },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::Progress { job, .. }
            | JobEvent::Completed { job, .. }
            | JobEvent::Failed { job, .. }
            | JobEvent::Cancelled { job } => *job,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

/// Forwards every callback into an mpsc channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<JobEvent>>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn send(&self, event: JobEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

impl JobObserver for ChannelObserver {
    fn on_progress(&self, job: JobId, percent: f64, phase: &str) {
        self.send(JobEvent::Progress {
            job,
            percent,
            phase: phase.to_string(),
        });
    }

    fn on_complete(&self, job: JobId, output: &Path) {
        self.send(JobEvent::Completed {
            job,
            output: output.to_path_buf(),
        });
    }

    fn on_error(&self, job: JobId, kind: ErrorKind, detail: &str) {
        self.send(JobEvent::Failed {
            job,
            kind,
            detail: detail.to_string(),
        });
    }

    fn on_cancelled(&self, job: JobId) {
        self.send(JobEvent::Cancelled { job });
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl JobObserver for NullObserver {
    fn on_progress(&self, _job: JobId, _percent: f64, _phase: &str) {}
    fn on_complete(&self, _job: JobId, _output: &Path) {}
    fn on_error(&self, _job: JobId, _kind: ErrorKind, _detail: &str) {}
    fn on_cancelled(&self, _job: JobId) {}
}

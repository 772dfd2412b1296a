//! Per-job progress aggregation.
//!
//! Fetch workers report segment outcomes concurrently; the aggregator turns
//! them into one monotonic percentage and is the only emitter of progress
//! callbacks for its job.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};
use crate::events::JobObserver;
use crate::job::JobId;

/// Share of the scale owned by the download phase.
pub const DOWNLOAD_SHARE: f64 = 90.0;
/// Highest value emitted before the output has been verified.
pub const PROCESSING_CAP: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Downloading,
    Merging,
    Transcoding,
    Verifying,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Resolving => "resolving",
            Phase::Downloading => "downloading",
            Phase::Merging => "merging",
            Phase::Transcoding => "transcoding",
            Phase::Verifying => "verifying",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    total: usize,
    completed: usize,
    failed: usize,
    /// Fraction of the current attempt for segments still in flight.
    partial: HashMap<usize, f64>,
    last_percent: f64,
    last_phase: Option<Phase>,
}

pub struct ProgressAggregator {
    job: JobId,
    observer: Arc<dyn JobObserver>,
    state: Mutex<ProgressState>,
}

impl ProgressAggregator {
    pub fn new(job: JobId, total: usize, observer: Arc<dyn JobObserver>) -> Self {
        Self {
            job,
            observer,
            state: Mutex::new(ProgressState {
                total,
                ..Default::default()
            }),
        }
    }

    /// Segment count, once the media manifest is known.
    pub fn set_total(&self, total: usize) -> CoreResult<()> {
        self.lock()?.total = total;
        Ok(())
    }

    /// `(completed, failed)` segment counts.
    #[cfg(test)]
    pub fn counts(&self) -> CoreResult<(usize, usize)> {
        let state = self.lock()?;
        Ok((state.completed, state.failed))
    }

    pub fn segment_progress(&self, ordinal: usize, fraction: f64) -> CoreResult<()> {
        let mut state = self.lock()?;
        state.partial.insert(ordinal, fraction.clamp(0.0, 1.0));
        let percent = self.download_percent(&state);
        self.emit(&mut state, percent, Phase::Downloading);
        Ok(())
    }

    pub fn segment_completed(&self, ordinal: usize) -> CoreResult<()> {
        let mut state = self.lock()?;
        state.partial.remove(&ordinal);
        state.completed += 1;
        let percent = self.download_percent(&state);
        self.emit(&mut state, percent, Phase::Downloading);
        Ok(())
    }

    pub fn segment_failed(&self, ordinal: usize) -> CoreResult<()> {
        let mut state = self.lock()?;
        state.partial.remove(&ordinal);
        state.failed += 1;
        Ok(())
    }

    /// Processing sub-progress in `0..=100`, mapped onto `90..=99`.
    pub fn processing(&self, phase: Phase, sub_percent: f64) -> CoreResult<()> {
        let sub = if sub_percent.is_finite() {
            sub_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let percent = (DOWNLOAD_SHARE + sub / 10.0).min(PROCESSING_CAP);
        let mut state = self.lock()?;
        self.emit(&mut state, percent, phase);
        Ok(())
    }

    pub fn phase(&self, phase: Phase) -> CoreResult<()> {
        let mut state = self.lock()?;
        let percent = state.last_percent;
        self.emit(&mut state, percent, phase);
        Ok(())
    }

    /// The only path that reaches 100.
    pub fn finished(&self) -> CoreResult<()> {
        let mut state = self.lock()?;
        self.emit(&mut state, 100.0, Phase::Completed);
        Ok(())
    }

    pub fn last_percent(&self) -> CoreResult<f64> {
        Ok(self.lock()?.last_percent)
    }

    fn download_percent(&self, state: &ProgressState) -> f64 {
        if state.total == 0 {
            return 0.0;
        }
        let partial: f64 = state.partial.values().sum();
        let done = state.completed as f64 + partial;
        (done / state.total as f64 * DOWNLOAD_SHARE).min(DOWNLOAD_SHARE)
    }

    // Called with the lock held so observers see values in order.
    fn emit(&self, state: &mut ProgressState, percent: f64, phase: Phase) {
        let percent = percent.max(state.last_percent);
        let phase_changed = state.last_phase != Some(phase);
        if !phase_changed && percent <= state.last_percent {
            return;
        }
        state.last_percent = percent;
        state.last_phase = Some(phase);
        self.observer.on_progress(self.job, percent, phase.as_str());
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, ProgressState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::InvalidState("progress lock poisoned".to_string()))
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};

/// Upper bound on how long any blocking wait goes without looking at the flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared by a job and all of its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint: `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps in `POLL_INTERVAL` slices. Returns `Err(Cancelled)` as soon as the
    /// flag is observed.
    pub fn sleep(&self, duration: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

#[derive(Debug)]
struct ByteRateState {
    start: Instant,
    bytes: u64,
    limit_bytes_per_sec: u64,
}

impl ByteRateState {
    fn new(limit_bytes_per_sec: u64) -> Self {
        Self {
            start: Instant::now(),
            bytes: 0,
            limit_bytes_per_sec,
        }
    }

    fn reserve_sleep(&mut self, bytes: u64) -> Duration {
        self.bytes = self.bytes.saturating_add(bytes);
        if self.limit_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let expected = self.bytes as f64 / self.limit_bytes_per_sec as f64;
        let elapsed = self.start.elapsed().as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }
}

/// Process-wide limiter shared by every job: a minimum spacing between
/// consecutive HTTP requests plus an optional byte rate.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
    bytes: Option<Mutex<ByteRateState>>,
}

impl RateLimiter {
    pub fn new(request_spacing: Duration, bytes_per_sec: Option<u64>) -> Self {
        Self {
            spacing: request_spacing,
            next_slot: Mutex::new(None),
            bytes: bytes_per_sec.map(|limit| Mutex::new(ByteRateState::new(limit))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, None)
    }

    /// Reserves the next request slot and waits for it.
    pub fn before_request(&self, cancel: &CancelToken) -> CoreResult<()> {
        if self.spacing.is_zero() {
            return cancel.check();
        }
        let wait = {
            let mut next = self
                .next_slot
                .lock()
                .map_err(|_| CoreError::InvalidState("rate limiter lock poisoned".to_string()))?;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.spacing);
            slot.saturating_duration_since(now)
        };
        cancel.sleep(wait)
    }

    pub fn after_bytes(&self, bytes: u64, cancel: &CancelToken) -> CoreResult<()> {
        let Some(state) = &self.bytes else {
            return Ok(());
        };
        let wait = state
            .lock()
            .map_err(|_| CoreError::InvalidState("rate limiter lock poisoned".to_string()))?
            .reserve_sleep(bytes);
        if wait.is_zero() {
            return Ok(());
        }
        cancel.sleep(wait)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

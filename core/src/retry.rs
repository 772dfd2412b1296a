//! Retry building blocks for segment and manifest fetches.
//!
//! Backoff and mirror selection are independent policies; `run_with_retry`
//! only owns the attempt loop.

use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};

/// Linear backoff: the wait after failed attempt `n` (1-based) is `base * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
}

impl BackoffPolicy {
    pub fn linear(base: Duration) -> Self {
        Self { base }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1))
    }
}

/// Cycles attempts across the canonical host followed by each configured mirror.
#[derive(Debug, Clone, Default)]
pub struct MirrorRotation {
    mirrors: Vec<String>,
}

impl MirrorRotation {
    pub fn new(mirrors: &[String]) -> Self {
        let mirrors = mirrors
            .iter()
            .filter_map(|raw| mirror_host(raw))
            .collect();
        Self { mirrors }
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// URL for the given 0-based attempt. Attempt 0 is always the canonical URL.
    pub fn url_for_attempt(&self, canonical: &str, attempt: u32) -> String {
        if self.mirrors.is_empty() {
            return canonical.to_string();
        }
        let slot = attempt as usize % (self.mirrors.len() + 1);
        if slot == 0 {
            return canonical.to_string();
        }
        substitute_host(canonical, &self.mirrors[slot - 1]).unwrap_or_else(|| canonical.to_string())
    }
}

fn mirror_host(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return None;
    }
    if raw.contains("://") {
        let parsed = Url::parse(raw).ok()?;
        let host = parsed.host_str()?;
        return Some(match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        });
    }
    Some(raw.to_string())
}

fn substitute_host(url: &str, host: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (name, port.parse::<u16>().ok())
        }
        _ => (host, None),
    };
    parsed.set_host(Some(name)).ok()?;
    parsed.set_port(port).ok()?;
    Some(parsed.to_string())
}

/// Runs `op` up to `attempts` times, sleeping per `backoff` between failures.
///
/// `op` receives the 0-based attempt number. Cancellation and manifest errors
/// are returned at once and never retried.
pub fn run_with_retry<T, F>(
    attempts: u32,
    backoff: &BackoffPolicy,
    cancel: &CancelToken,
    mut op: F,
) -> CoreResult<T>
where
    F: FnMut(u32) -> CoreResult<T>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        cancel.check()?;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(err @ CoreError::InvalidManifest(_)) => return Err(err),
            Err(err) => {
                warn!(attempt = attempt + 1, max = attempts, error = %err, "attempt failed");
                last_error = Some(err);
                if attempt + 1 < attempts {
                    cancel.sleep(backoff.delay_after(attempt + 1))?;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| CoreError::Fetch("no attempt was made".to_string())))
}

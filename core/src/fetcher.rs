//! Segment fetcher pool.
//!
//! Workers pull ordinals from a shared counter, stream each segment into
//! `<ordinal>.tmp` and rename it to its final name once it passes the size
//! check. Results are returned per worker and reordered by ordinal afterwards.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::POLL_INTERVAL;
use crate::error::{CoreError, CoreResult};
use crate::job::JobContext;
use crate::locator::SegmentLocator;
use crate::manifest::{MediaManifest, Segment};
use crate::net::NetRequest;
use crate::progress::ProgressAggregator;
use crate::retry::{run_with_retry, BackoffPolicy};

const READ_BUFFER_BYTES: usize = 64 * 1024;
/// How long cancelled workers get to notice the flag before they are abandoned.
const CANCEL_JOIN_GRACE: Duration = Duration::from_secs(2);

type SegmentOutcome = (usize, Result<PathBuf, String>);

pub fn segment_file_name(ordinal: usize) -> String {
    format!("segment_{:05}.ts", ordinal)
}

fn partial_file_name(ordinal: usize) -> String {
    format!("{}.tmp", ordinal)
}

/// Downloads every segment of `media` into `dir`.
///
/// Returns the segment files in manifest order, `Cancelled` if the job was
/// cancelled, or `SegmentsMissing` when any ordinal failed.
pub fn fetch_all(
    ctx: &JobContext,
    media: &MediaManifest,
    locator: &SegmentLocator,
    dir: &Path,
    progress: &Arc<ProgressAggregator>,
) -> CoreResult<Vec<PathBuf>> {
    let total = media.segments.len();
    if total == 0 {
        return Err(CoreError::NoSegments);
    }
    ctx.cancel.check()?;

    let workers = ctx.config.effective_concurrency(total);
    info!(job = %ctx.id, segments = total, workers, "segment download started");

    let segments = Arc::new(media.segments.clone());
    let next = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let ctx = ctx.clone();
        let segments = Arc::clone(&segments);
        let next = Arc::clone(&next);
        let locator = locator.clone();
        let dir = dir.to_path_buf();
        let progress = Arc::clone(progress);
        let handle = thread::Builder::new()
            .name(format!("segment-worker-{}", worker))
            .spawn(move || run_worker(&ctx, &segments, &next, &locator, &dir, &progress))
            .map_err(|err| CoreError::Io(format!("cannot spawn segment worker: {}", err)))?;
        handles.push(handle);
    }

    let outcomes = join_workers(handles, ctx);
    ctx.cancel.check()?;

    let mut files: Vec<Option<PathBuf>> = vec![None; total];
    let mut errors: Vec<Option<String>> = vec![None; total];
    for (ordinal, outcome) in outcomes {
        match outcome {
            Ok(path) => files[ordinal] = Some(path),
            Err(err) => errors[ordinal] = Some(err),
        }
    }

    let missing: Vec<usize> = (0..total).filter(|ordinal| files[*ordinal].is_none()).collect();
    if !missing.is_empty() {
        let last_error = missing
            .iter()
            .rev()
            .find_map(|ordinal| errors[*ordinal].clone())
            .unwrap_or_else(|| "worker exited without reporting".to_string());
        warn!(job = %ctx.id, missing = missing.len(), error = %last_error, "segments missing");
        return Err(CoreError::SegmentsMissing {
            count: missing.len(),
            ordinals: missing,
            last_error,
        });
    }

    info!(job = %ctx.id, segments = total, "segment download finished");
    Ok(files.into_iter().flatten().collect())
}

fn run_worker(
    ctx: &JobContext,
    segments: &[Segment],
    next: &AtomicUsize,
    locator: &SegmentLocator,
    dir: &Path,
    progress: &ProgressAggregator,
) -> Vec<SegmentOutcome> {
    let mut outcomes = Vec::new();
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let index = next.fetch_add(1, Ordering::SeqCst);
        let Some(segment) = segments.get(index) else {
            break;
        };
        match fetch_segment(ctx, segment, locator, dir, progress) {
            Ok(path) => {
                if let Err(err) = progress.segment_completed(segment.ordinal) {
                    warn!(job = %ctx.id, ordinal = segment.ordinal, error = %err, "progress update failed");
                }
                outcomes.push((segment.ordinal, Ok(path)));
            }
            Err(CoreError::Cancelled) => break,
            Err(err) => {
                if let Err(progress_err) = progress.segment_failed(segment.ordinal) {
                    warn!(job = %ctx.id, ordinal = segment.ordinal, error = %progress_err, "progress update failed");
                }
                outcomes.push((segment.ordinal, Err(err.to_string())));
            }
        }
    }
    outcomes
}

/// Joins finished workers while polling for cancellation. Once cancelled,
/// stragglers get a short grace period and are then left to exit on their own.
fn join_workers(
    mut handles: Vec<JoinHandle<Vec<SegmentOutcome>>>,
    ctx: &JobContext,
) -> Vec<SegmentOutcome> {
    let mut outcomes = Vec::new();
    let mut deadline: Option<Instant> = None;
    while !handles.is_empty() {
        let mut index = 0usize;
        while index < handles.len() {
            if handles[index].is_finished() {
                let handle = handles.remove(index);
                match handle.join() {
                    Ok(mut finished) => outcomes.append(&mut finished),
                    Err(_) => warn!(job = %ctx.id, "segment worker panicked"),
                }
            } else {
                index += 1;
            }
        }
        if handles.is_empty() {
            break;
        }
        if ctx.cancel.is_cancelled() {
            let limit = *deadline.get_or_insert_with(|| Instant::now() + CANCEL_JOIN_GRACE);
            if Instant::now() >= limit {
                warn!(job = %ctx.id, workers = handles.len(), "abandoning workers after cancellation");
                break;
            }
        }
        thread::sleep(POLL_INTERVAL.min(Duration::from_millis(20)));
    }
    outcomes
}

/// One segment with retries. Each attempt may target a different mirror.
pub fn fetch_segment(
    ctx: &JobContext,
    segment: &Segment,
    locator: &SegmentLocator,
    dir: &Path,
    progress: &ProgressAggregator,
) -> CoreResult<PathBuf> {
    let final_path = dir.join(segment_file_name(segment.ordinal));
    let partial_path = dir.join(partial_file_name(segment.ordinal));
    let backoff = BackoffPolicy::linear(Duration::from_millis(ctx.config.retry_backoff_ms));

    run_with_retry(ctx.config.effective_attempts(), &backoff, &ctx.cancel, |attempt| {
        let url = locator.for_attempt(&segment.uri, attempt)?;
        debug!(job = %ctx.id, ordinal = segment.ordinal, attempt = attempt + 1, url = %url, "fetching segment");
        let result = download_attempt(ctx, segment, &url, &partial_path, progress).and_then(|bytes| {
            if bytes < ctx.config.min_segment_bytes {
                return Err(CoreError::Fetch(format!(
                    "segment {} is only {} bytes",
                    segment.ordinal, bytes
                )));
            }
            fs::rename(&partial_path, &final_path)?;
            Ok(final_path.clone())
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial_path);
        }
        result
    })
}

fn download_attempt(
    ctx: &JobContext,
    segment: &Segment,
    url: &str,
    partial_path: &Path,
    progress: &ProgressAggregator,
) -> CoreResult<u64> {
    ctx.limiter.before_request(&ctx.cancel)?;
    let req = NetRequest::new(url)
        .with_range(segment.byte_range)
        .with_timeout(ctx.config.segment_timeout());
    let mut response = ctx.net.get_stream(&req)?;
    if !response.is_success() {
        return Err(CoreError::Fetch(format!(
            "{} returned status {}",
            url, response.status_code
        )));
    }
    if segment.byte_range.is_some() && response.status_code != 206 {
        return Err(CoreError::Fetch(format!(
            "range not honoured by {} (status {})",
            url, response.status_code
        )));
    }

    let expected = response
        .content_length
        .or_else(|| {
            segment
                .byte_range
                .and_then(|(start, end)| end.checked_sub(start))
                .and_then(|span| span.checked_add(1))
        })
        .filter(|len| *len > 0);
    let mut file = File::create(partial_path)?;
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    let mut written = 0u64;
    loop {
        ctx.cancel.check()?;
        let read = response
            .body
            .read(&mut buffer)
            .map_err(|err| CoreError::Fetch(format!("{}: {}", url, err)))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        written += read as u64;
        ctx.limiter.after_bytes(read as u64, &ctx.cancel)?;
        if let Some(expected) = expected {
            progress.segment_progress(segment.ordinal, written as f64 / expected as f64)?;
        }
    }
    file.flush()?;
    Ok(written)
}

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::assemble::{Assembler, OutputSpec};
use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::events::{JobObserver, NullObserver};
use crate::fetcher::fetch_all;
use crate::job::{Job, JobContext, JobId, JobRequest, JobState};
use crate::locator::SegmentLocator;
use crate::manifest::ManifestResolver;
use crate::net::{NetClient, ReqwestNetClient};
use crate::progress::{Phase, ProgressAggregator};
use crate::queue::JobQueue;
use crate::retry::BackoffPolicy;
use crate::throttle::RateLimiter;
use crate::workspace::Workspace;

/// Terminal outcome of one job, mirroring the callback it produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(PathBuf),
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

/// Runs one job to its terminal state.
///
/// The workspace is removed before the single terminal callback fires, on
/// every exit path.
pub fn run_job(mut job: Job, ctx: &JobContext, settings: &EngineConfig) -> JobOutcome {
    info!(job = %job.id, "job started");
    let mut workspace: Option<Workspace> = None;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        execute(&mut job, ctx, settings, &mut workspace)
    }))
    .unwrap_or_else(|payload| {
        Err(CoreError::InvalidState(format!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        )))
    });
    if let Some(workspace) = workspace.as_mut() {
        workspace.close();
    }

    match result {
        Ok(output) => {
            let _ = job.advance(JobState::Completed);
            job.output = Some(output.clone());
            info!(job = %job.id, output = %output.display(), "job completed");
            ctx.observer.on_complete(job.id, &output);
            JobOutcome::Completed(output)
        }
        Err(CoreError::Cancelled) => {
            let _ = job.advance(JobState::Cancelled);
            info!(job = %job.id, "job cancelled");
            ctx.observer.on_cancelled(job.id);
            JobOutcome::Cancelled
        }
        Err(err) => {
            let _ = job.advance(JobState::Failed);
            let kind = err.kind().unwrap_or(ErrorKind::Internal);
            let detail = err.to_string();
            job.error = Some(detail.clone());
            error!(job = %job.id, kind = %kind, error = %detail, "job failed");
            ctx.observer.on_error(job.id, kind, &detail);
            JobOutcome::Failed { kind, detail }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn execute(
    job: &mut Job,
    ctx: &JobContext,
    settings: &EngineConfig,
    workspace: &mut Option<Workspace>,
) -> CoreResult<PathBuf> {
    let config = &ctx.config;
    ctx.cancel.check()?;
    job.advance(JobState::Resolving)?;
    let progress = Arc::new(ProgressAggregator::new(job.id, 0, Arc::clone(&ctx.observer)));
    progress.phase(Phase::Resolving)?;

    let backoff = BackoffPolicy::linear(Duration::from_millis(config.retry_backoff_ms));
    let resolved = ManifestResolver::new(ctx.net.as_ref(), &ctx.limiter, &ctx.cancel)
        .with_retry(config.effective_attempts(), backoff)
        .with_timeout(config.segment_timeout())
        .resolve(&job.source, job.base_url.as_deref(), config.quality)?;

    let locator = SegmentLocator::new(resolved.base_url.clone(), &config.mirror_domains);
    for segment in &resolved.media.segments {
        locator.canonical(&segment.uri)?;
    }

    ctx.cancel.check()?;
    let workspace = workspace.insert(Workspace::create(job.id, settings.temp_root.as_deref())?);
    job.advance(JobState::Downloading)?;
    progress.set_total(resolved.media.segments.len())?;
    let files = fetch_all(ctx, &resolved.media, &locator, workspace.path(), &progress)?;

    ctx.cancel.check()?;
    job.advance(JobState::Assembling)?;
    let total_duration = resolved.media.total_duration();
    let spec = OutputSpec {
        format: config.output_format,
        timing_fix: config.timing_fix,
        total_duration: (total_duration > 0.0).then_some(total_duration),
        dest_dir: job.dest_dir.clone(),
        output_name: config.output_name.clone(),
        resolution: resolved
            .variant
            .as_ref()
            .and_then(|variant| variant.resolution_label()),
    };
    let output = Assembler::new(settings, &ctx.cancel, &progress, workspace.path())
        .assemble(&files, &spec)?;
    progress.finished()?;
    Ok(output)
}

/// Frees the job's scheduler slot when its thread ends, panics included.
struct ActiveSlot {
    id: JobId,
    active: Arc<Mutex<HashMap<JobId, CancelToken>>>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// Job queue and scheduler: runs submitted jobs in order, at most
/// `max_concurrent_jobs` at a time, each on its own supervising thread.
pub struct DownloadEngine {
    pub config: EngineConfig,
    net: Arc<dyn NetClient>,
    limiter: Arc<RateLimiter>,
    observer: Arc<dyn JobObserver>,
    queue: Mutex<JobQueue>,
    active: Arc<Mutex<HashMap<JobId, CancelToken>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(&config.user_agent, config.accept_invalid_certs)?;
        let limiter = RateLimiter::new(
            Duration::from_millis(config.request_spacing_ms),
            config.speed_limit_bytes_per_sec,
        );
        Ok(Self {
            queue: Mutex::new(JobQueue::new(config.max_concurrent_jobs)),
            config,
            net: Arc::new(net),
            limiter: Arc::new(limiter),
            observer: Arc::new(NullObserver),
            active: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = net;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn submit(&self, request: JobRequest) -> CoreResult<JobId> {
        let job = Job::new(request);
        let id = job.id;
        self.lock_queue()?.push(job);
        info!(job = %id, "job queued");
        Ok(id)
    }

    /// Cancels a queued or running job. A queued job is dropped at once and
    /// reported cancelled; a running one stops at its next checkpoint.
    pub fn cancel(&self, id: &JobId) -> CoreResult<()> {
        let mut queue = self.lock_queue()?;
        if queue.remove(id).is_some() {
            drop(queue);
            info!(job = %id, "queued job cancelled");
            self.observer.on_cancelled(*id);
            return Ok(());
        }
        let active = self.lock_active()?;
        match active.get(id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(CoreError::InvalidState(format!("job {} is not queued or running", id))),
        }
    }

    /// Cancels everything, queued and running.
    pub fn cancel_all(&self) -> CoreResult<()> {
        let queued: Vec<Job> = {
            let mut queue = self.lock_queue()?;
            let mut drained = Vec::with_capacity(queue.len());
            while let Some(job) = queue.pop_ready(0) {
                drained.push(job);
            }
            drained
        };
        for job in queued {
            self.observer.on_cancelled(job.id);
        }
        for token in self.lock_active()?.values() {
            token.cancel();
        }
        Ok(())
    }

    pub fn queued_count(&self) -> CoreResult<usize> {
        Ok(self.lock_queue()?.len())
    }

    pub fn active_count(&self) -> CoreResult<usize> {
        Ok(self.lock_active()?.len())
    }

    pub fn start_next(&self) -> CoreResult<Option<JobId>> {
        let mut queue = self.lock_queue()?;
        let mut active = self.lock_active()?;
        let Some(job) = queue.pop_ready(active.len()) else {
            return Ok(None);
        };

        let id = job.id;
        let cancel = CancelToken::new();
        active.insert(id, cancel.clone());
        drop(active);
        drop(queue);

        let ctx = JobContext {
            id,
            net: Arc::clone(&self.net),
            limiter: Arc::clone(&self.limiter),
            cancel,
            config: job.config.clone(),
            observer: Arc::clone(&self.observer),
        };
        let settings = self.config.clone();
        let active = Arc::clone(&self.active);
        let spawned = thread::Builder::new()
            .name(format!("job-{}", id.simple()))
            .spawn(move || {
                let _slot = ActiveSlot { id, active };
                let _ = run_job(job, &ctx, &settings);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                if let Ok(mut active) = self.active.lock() {
                    active.remove(&id);
                }
                let detail = format!("cannot spawn job thread: {}", err);
                self.observer.on_error(id, ErrorKind::Internal, &detail);
                return Err(CoreError::Io(detail));
            }
        };

        self.handles
            .lock()
            .map_err(|_| CoreError::InvalidState("handle lock poisoned".to_string()))?
            .push(handle);
        Ok(Some(id))
    }

    /// Starts queued jobs as slots free up until nothing is queued or running.
    pub fn run(&self) -> CoreResult<()> {
        loop {
            while self.start_next()?.is_some() {}
            self.reap_handles();
            let drained = self.lock_queue()?.is_empty();
            if drained && self.active_count()? == 0 {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.wait_all();
        Ok(())
    }

    pub fn wait_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    warn!("job thread panicked");
                }
            }
        }
    }

    fn reap_handles(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            let mut index = 0usize;
            while index < handles.len() {
                if handles[index].is_finished() {
                    let handle = handles.remove(index);
                    if handle.join().is_err() {
                        warn!("job thread panicked");
                    }
                } else {
                    index += 1;
                }
            }
        }
    }

    fn lock_queue(&self) -> CoreResult<std::sync::MutexGuard<'_, JobQueue>> {
        self.queue
            .lock()
            .map_err(|_| CoreError::InvalidState("queue lock poisoned".to_string()))
    }

    fn lock_active(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<JobId, CancelToken>>> {
        self.active
            .lock()
            .map_err(|_| CoreError::InvalidState("active lock poisoned".to_string()))
    }
}

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use hlsget_core::{
    probe_ffmpeg, ChannelObserver, CoreError, DownloadEngine, EngineConfig, JobConfig, JobEvent,
    JobId, JobRequest, OutputFormat, Preset, Quality,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Options {
    job: JobConfig,
    base_url: Option<String>,
    jobs: Option<usize>,
}

fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(2);
    }

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    };
    let (positional, options) = match parse_options(&args[2..], settings.job.clone()) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("error: {}", message);
            print_usage();
            process::exit(2);
        }
    };

    let sources = match (args[1].as_str(), positional.first()) {
        ("get", Some(source)) => vec![source.clone()],
        ("batch", Some(path)) => match read_batch(Path::new(path)) {
            Ok(sources) => sources,
            Err(err) => {
                eprintln!("error: {}", err);
                process::exit(1);
            }
        },
        _ => {
            print_usage();
            process::exit(2);
        }
    };
    if sources.is_empty() {
        println!("nothing to download");
        return;
    }
    let dest = positional
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_dest);

    match probe_ffmpeg(&settings.ffmpeg_path) {
        Ok(version) => info!(version = %version, "ffmpeg found"),
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    }

    match run(settings, options, sources, &dest) {
        Ok(0) => {}
        Ok(failed) => {
            eprintln!("{} job(s) did not complete", failed);
            process::exit(1);
        }
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hlsget=info,hlsget_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings() -> Result<EngineConfig, CoreError> {
    match env::var("HLSGET_CONFIG") {
        Ok(path) => EngineConfig::from_json_file(path),
        Err(_) => Ok(EngineConfig::default()),
    }
}

fn default_dest() -> PathBuf {
    env::var("HLSGET_DOWNLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn parse_options(args: &[String], job: JobConfig) -> Result<(Vec<String>, Options), String> {
    let mut options = Options {
        job,
        base_url: None,
        jobs: None,
    };
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--timing-fix" {
            options.job.timing_fix = true;
            continue;
        }
        if !arg.starts_with("--") {
            positional.push(arg.clone());
            continue;
        }
        let value = iter
            .next()
            .ok_or_else(|| format!("{} needs a value", arg))?;
        match arg.as_str() {
            "--quality" => {
                options.job.quality =
                    Quality::from_str(value).ok_or_else(|| format!("unknown quality {}", value))?;
            }
            "--format" => {
                options.job.output_format = OutputFormat::from_str(value)
                    .ok_or_else(|| format!("unknown format {}", value))?;
            }
            "--preset" => {
                Preset::from_str(value)
                    .ok_or_else(|| format!("unknown preset {}", value))?
                    .apply(&mut options.job);
            }
            "--concurrency" => options.job.concurrency_limit = parse_number(arg, value)?,
            "--retries" => options.job.retry_attempts = parse_number(arg, value)?,
            "--timeout" => options.job.segment_timeout_secs = parse_number(arg, value)?,
            "--mirror" => options.job.mirror_domains.push(value.clone()),
            "--name" => options.job.output_name = Some(value.clone()),
            "--base-url" => options.base_url = Some(value.clone()),
            "--jobs" => options.jobs = Some(parse_number(arg, value)?),
            _ => return Err(format!("unknown option {}", arg)),
        }
    }
    Ok((positional, options))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{} expects a number, got {}", flag, value))
}

/// `.m3u8` files are one source; anything else is a list of URLs or
/// single-line manifests, duplicates dropped.
fn read_batch(path: &Path) -> Result<Vec<String>, CoreError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
    let is_playlist = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("m3u8"))
        .unwrap_or(false);
    if is_playlist {
        return Ok(vec![raw]);
    }

    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || (line.starts_with('#') && !line.starts_with("#EXTM3U")) {
            continue;
        }
        if seen.insert(line.to_string()) {
            sources.push(line.to_string());
        } else {
            warn!(source = line, "duplicate entry skipped");
        }
    }
    Ok(sources)
}

fn run(
    mut settings: EngineConfig,
    options: Options,
    sources: Vec<String>,
    dest: &Path,
) -> Result<usize, CoreError> {
    if let Some(jobs) = options.jobs {
        settings.max_concurrent_jobs = jobs;
    }
    fs::create_dir_all(dest)?;

    let (observer, events) = ChannelObserver::new();
    let engine = DownloadEngine::new(settings)?.with_observer(Arc::new(observer));
    let mut submitted = 0usize;
    for source in sources {
        let mut request = JobRequest::new(source, dest, options.job.clone());
        if let Some(base_url) = &options.base_url {
            request = request.with_base_url(base_url.clone());
        }
        let id = engine.submit(request)?;
        println!("queued job: {}", id);
        submitted += 1;
    }

    let printer = thread::spawn(move || print_events(events, submitted));
    let result = engine.run();
    let failed = printer.join().unwrap_or(submitted);
    result?;
    Ok(failed)
}

/// Prints events until every job has reported its terminal state and
/// returns how many did not complete.
fn print_events(events: Receiver<JobEvent>, expected: usize) -> usize {
    let mut last: HashMap<JobId, (u64, String)> = HashMap::new();
    let mut finished = 0usize;
    let mut failed = 0usize;
    while finished < expected {
        let Ok(event) = events.recv() else {
            return failed + expected - finished;
        };
        let short = event.job().to_string()[..8].to_string();
        match event {
            JobEvent::Progress { job, percent, phase } => {
                let whole = percent.floor() as u64;
                let changed = last
                    .get(&job)
                    .map(|(seen, seen_phase)| *seen != whole || *seen_phase != phase)
                    .unwrap_or(true);
                if changed {
                    println!("[{}] {:>3}% {}", short, whole, phase);
                    last.insert(job, (whole, phase));
                }
            }
            JobEvent::Completed { output, .. } => {
                let size = fs::metadata(&output).map(|meta| meta.len()).unwrap_or(0);
                println!("[{}] done {} ({})", short, output.display(), format_bytes(size));
                finished += 1;
            }
            JobEvent::Failed { kind, detail, .. } => {
                eprintln!("[{}] failed ({}): {}", short, kind, detail);
                finished += 1;
                failed += 1;
            }
            JobEvent::Cancelled { .. } => {
                println!("[{}] cancelled", short);
                finished += 1;
                failed += 1;
            }
        }
    }
    failed
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn print_usage() {
    eprintln!(
        "Usage: hlsget <command> [args] [options]\n\
Commands:\n\
  get <source> [dest]    Download one stream (URL or manifest text)\n\
  batch <file> [dest]    Download every entry of a .txt list or one .m3u8 file\n\
Options:\n\
  --quality best|medium|worst\n\
  --format mp4|mkv|ts\n\
  --preset standard|high-quality|small-size\n\
  --concurrency <n>      Parallel segment downloads per job\n\
  --retries <n>          Attempts per segment\n\
  --timeout <secs>       Per-request timeout\n\
  --mirror <domain>      Mirror domain, repeatable\n\
  --name <name>          Output file name without extension\n\
  --base-url <url>       Base for relative URIs in manifest text\n\
  --timing-fix           Re-encode at a fixed frame rate\n\
  --jobs <n>             Jobs running at once\n\
Environment:\n\
  HLSGET_CONFIG          JSON engine config\n\
  HLSGET_DOWNLOAD_DIR    Default destination when dest is missing\n\
  RUST_LOG               Log filter"
    );
}

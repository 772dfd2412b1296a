//! Fakes shared by the unit and flow tests: a scripted `NetClient` and small
//! shell scripts standing in for ffmpeg/ffprobe.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::net::{NetClient, NetRequest, NetResponse};

type RequestHook = Box<dyn Fn(&str, u32) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Route {
    body: Vec<u8>,
    status: u16,
    /// Requests answered with HTTP 500 before `status` is served.
    failures: u32,
    delay: Duration,
}

/// In-memory HTTP server keyed by full URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeNet {
    routes: Mutex<HashMap<String, Route>>,
    attempts: Mutex<HashMap<String, u32>>,
    total: Mutex<u32>,
    hook: Mutex<Option<RequestHook>>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.route(
            url,
            Route {
                body: body.into(),
                status: 200,
                ..Default::default()
            },
        );
    }

    pub fn serve_status(&self, url: &str, status: u16) {
        self.route(
            url,
            Route {
                status,
                ..Default::default()
            },
        );
    }

    pub fn serve_flaky(&self, url: &str, failures: u32, body: impl Into<Vec<u8>>) {
        self.route(
            url,
            Route {
                body: body.into(),
                status: 200,
                failures,
                ..Default::default()
            },
        );
    }

    pub fn serve_delayed(&self, url: &str, delay: Duration, body: impl Into<Vec<u8>>) {
        self.route(
            url,
            Route {
                body: body.into(),
                status: 200,
                delay,
                ..Default::default()
            },
        );
    }

    /// Called with the URL and the running request count before each answer.
    pub fn on_request(&self, hook: impl Fn(&str, u32) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn attempts(&self, url: &str) -> u32 {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> u32 {
        *self.total.lock().unwrap()
    }
}

impl NetClient for FakeNet {
    fn get_stream(&self, req: &NetRequest) -> CoreResult<NetResponse> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(req.url.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let total = {
            let mut total = self.total.lock().unwrap();
            *total += 1;
            *total
        };
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&req.url, total);
        }
        let route = self.routes.lock().unwrap().get(&req.url).cloned();
        let Some(route) = route else {
            return Ok(NetResponse {
                status_code: 404,
                content_length: Some(0),
                body: Box::new(Cursor::new(Vec::new())),
            });
        };
        if !route.delay.is_zero() {
            thread::sleep(route.delay);
        }
        if attempt <= route.failures {
            return Err(CoreError::Fetch(format!("connection reset by {}", req.url)));
        }
        Ok(NetResponse {
            status_code: route.status,
            content_length: Some(route.body.len() as u64),
            body: Box::new(Cursor::new(route.body)),
        })
    }
}

/// Deterministic segment payload, large enough to pass the size check.
pub fn segment_bytes(ordinal: usize) -> Vec<u8> {
    (0..512).map(|i| ((ordinal * 31 + i) % 251) as u8).collect()
}

/// Media manifest text for `count` segments named `seg<n>.ts`.
pub fn media_manifest(count: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    for ordinal in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", ordinal));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

#[cfg(unix)]
pub use self::tools::{fake_tools, FakeTools};

#[cfg(unix)]
mod tools {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    pub struct FakeTools {
        /// Copies the `-i` input to the output path.
        pub ffmpeg_copy: PathBuf,
        pub ffmpeg_fail: PathBuf,
        /// Prints one progress line, records its pid next to the output, then hangs.
        pub ffmpeg_stall: PathBuf,
        /// Prints progress forever.
        pub ffmpeg_endless: PathBuf,
        /// Writes a 10 byte output.
        pub ffmpeg_tiny: PathBuf,
        pub ffprobe_video: PathBuf,
        pub ffprobe_audio_only: PathBuf,
    }

    const ARGS: &str = r#"prev=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then input="$arg"; fi
  prev="$arg"
  out="$arg"
done
"#;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}{}", ARGS, body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn fake_tools() -> &'static FakeTools {
        static TOOLS: OnceLock<FakeTools> = OnceLock::new();
        TOOLS.get_or_init(|| {
            let dir = std::env::temp_dir().join(format!("hlsget-fake-tools-{}", std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            FakeTools {
                ffmpeg_copy: script(
                    &dir,
                    "ffmpeg-copy",
                    "echo frame=1\necho out_time_us=1000000\necho progress=continue\n\
                     cat \"$input\" > \"$out\" || exit 1\necho progress=end\n",
                ),
                ffmpeg_fail: script(
                    &dir,
                    "ffmpeg-fail",
                    "echo \"$input: Invalid data found when processing input\" >&2\nexit 3\n",
                ),
                ffmpeg_stall: script(
                    &dir,
                    "ffmpeg-stall",
                    "echo $$ > \"$(dirname \"$out\")/ffmpeg.pid\"\necho frame=1\nexec sleep 30\n",
                ),
                ffmpeg_endless: script(
                    &dir,
                    "ffmpeg-endless",
                    "echo $$ > \"$(dirname \"$out\")/ffmpeg.pid\"\nwhile true; do echo frame=1; sleep 0.1; done\n",
                ),
                ffmpeg_tiny: script(&dir, "ffmpeg-tiny", "printf 0123456789 > \"$out\"\n"),
                ffprobe_video: script(&dir, "ffprobe-video", "echo video\necho audio\n"),
                ffprobe_audio_only: script(&dir, "ffprobe-audio", "echo audio\n"),
            }
        })
    }
}

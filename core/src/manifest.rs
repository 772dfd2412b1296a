//! Manifest parsing and master/variant resolution.

use std::time::Duration;

use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::Quality;
use crate::error::{CoreError, CoreResult};
use crate::locator::locate;
use crate::net::{fetch_text, NetClient, NetRequest};
use crate::retry::{run_with_retry, BackoffPolicy};
use crate::throttle::RateLimiter;

pub const HLS_HEADER: &str = "#EXTM3U";

/// Where a manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Text(String),
    Url(String),
}

impl ManifestSource {
    /// Literal manifest text when it starts with the HLS header, otherwise a URL.
    pub fn detect(raw: &str) -> Self {
        let cleaned = raw.trim().trim_end_matches(':').trim_end();
        if cleaned.starts_with(HLS_HEADER) {
            ManifestSource::Text(cleaned.to_string())
        } else {
            ManifestSource::Url(cleaned.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
}

impl Variant {
    pub fn height(&self) -> Option<u64> {
        self.resolution.map(|(_, height)| height)
    }

    pub fn resolution_label(&self) -> Option<String> {
        self.resolution
            .map(|(width, height)| format!("{}x{}", width, height))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub ordinal: usize,
    pub uri: String,
    /// Inclusive `(start, end)` byte offsets.
    pub byte_range: Option<(u64, u64)>,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaManifest {
    pub segments: Vec<Segment>,
}

impl MediaManifest {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Master(Vec<Variant>),
    Media(MediaManifest),
}

pub fn parse_manifest(content: &[u8]) -> CoreResult<Manifest> {
    match m3u8_rs::parse_playlist(content) {
        Ok((_, Playlist::MasterPlaylist(master))) => Ok(Manifest::Master(master_variants(&master))),
        Ok((_, Playlist::MediaPlaylist(media))) => media_manifest(&media).map(Manifest::Media),
        Err(err) => Err(CoreError::InvalidManifest(format!(
            "failed to parse m3u8 playlist: {:?}",
            err
        ))),
    }
}

fn master_variants(master: &MasterPlaylist) -> Vec<Variant> {
    master
        .variants
        .iter()
        .filter(|variant| !variant.is_i_frame)
        .map(|variant| Variant {
            uri: variant.uri.clone(),
            bandwidth: variant.bandwidth,
            resolution: variant
                .resolution
                .as_ref()
                .map(|resolution| (resolution.width, resolution.height)),
        })
        .collect()
}

fn media_manifest(media: &MediaPlaylist) -> CoreResult<MediaManifest> {
    let mut segments = Vec::with_capacity(media.segments.len());
    let mut next_offset = 0u64;
    for (ordinal, segment) in media.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            if !matches!(key.method, KeyMethod::None) {
                return Err(CoreError::InvalidManifest(
                    "encrypted streams are not supported".to_string(),
                ));
            }
        }
        let byte_range = match &segment.byte_range {
            Some(range) if range.length > 0 => {
                let start = range.offset.unwrap_or(next_offset);
                let end = start.checked_add(range.length - 1).ok_or_else(|| {
                    CoreError::InvalidManifest(format!(
                        "byte range {}@{} of segment {} overflows",
                        range.length, start, ordinal
                    ))
                })?;
                next_offset = end.saturating_add(1);
                Some((start, end))
            }
            _ => None,
        };
        segments.push(Segment {
            ordinal,
            uri: segment.uri.clone(),
            byte_range,
            duration: f64::from(segment.duration),
        });
    }
    Ok(MediaManifest { segments })
}

/// Picks one variant according to the quality policy.
///
/// When any variant declares a resolution only those are ranked, by height and
/// then bandwidth; otherwise variants are ranked by bandwidth alone.
pub fn select_variant(variants: &[Variant], quality: Quality) -> Option<&Variant> {
    let with_resolution: Vec<&Variant> = variants
        .iter()
        .filter(|variant| variant.resolution.is_some())
        .collect();
    let mut ranked = if with_resolution.is_empty() {
        variants.iter().collect::<Vec<_>>()
    } else {
        with_resolution
    };
    ranked.sort_by(|a, b| {
        (b.height().unwrap_or(0), b.bandwidth).cmp(&(a.height().unwrap_or(0), a.bandwidth))
    });
    match quality {
        Quality::Best => ranked
            .iter()
            .find(|variant| variant.height() == Some(1080))
            .or_else(|| ranked.first())
            .copied(),
        Quality::Worst => ranked.last().copied(),
        Quality::Medium => ranked.get(ranked.len() / 2).copied(),
    }
}

/// A media manifest ready for download.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub media: MediaManifest,
    /// URL the segment URIs are relative to, when known.
    pub base_url: Option<String>,
    pub variant: Option<Variant>,
}

pub struct ManifestResolver<'a> {
    net: &'a dyn NetClient,
    limiter: &'a RateLimiter,
    cancel: &'a CancelToken,
    attempts: u32,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(net: &'a dyn NetClient, limiter: &'a RateLimiter, cancel: &'a CancelToken) -> Self {
        Self {
            net,
            limiter,
            cancel,
            attempts: 3,
            backoff: BackoffPolicy::linear(Duration::from_millis(500)),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: BackoffPolicy) -> Self {
        self.attempts = attempts;
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolve(
        &self,
        source: &ManifestSource,
        base_hint: Option<&str>,
        quality: Quality,
    ) -> CoreResult<ResolvedManifest> {
        self.cancel.check()?;
        let (content, base_url) = match source {
            ManifestSource::Text(text) => (text.clone(), base_hint.map(str::to_string)),
            ManifestSource::Url(url) => (self.fetch(url)?, Some(url.clone())),
        };

        let (media, base_url, variant) = match parse_manifest(content.as_bytes())? {
            Manifest::Media(media) => (media, base_url, None),
            Manifest::Master(variants) => {
                let variant = select_variant(&variants, quality)
                    .cloned()
                    .ok_or(CoreError::NoVariants)?;
                info!(
                    resolution = variant.resolution_label().as_deref().unwrap_or("unknown"),
                    bandwidth = variant.bandwidth,
                    variants = variants.len(),
                    "selected variant"
                );
                let variant_url = locate(&variant.uri, base_url.as_deref())?;
                self.cancel.check()?;
                let content = self.fetch(&variant_url)?;
                match parse_manifest(content.as_bytes())? {
                    Manifest::Media(media) => (media, Some(variant_url), Some(variant)),
                    Manifest::Master(_) => {
                        return Err(CoreError::InvalidManifest(
                            "variant playlist is itself a master manifest".to_string(),
                        ))
                    }
                }
            }
        };

        if media.segments.is_empty() {
            return Err(CoreError::NoSegments);
        }
        debug!(segments = media.segments.len(), "media manifest resolved");
        Ok(ResolvedManifest {
            media,
            base_url,
            variant,
        })
    }

    fn fetch(&self, url: &str) -> CoreResult<String> {
        let req = NetRequest::new(url).with_timeout(self.timeout);
        run_with_retry(self.attempts, &self.backoff, self.cancel, |_| {
            self.limiter.before_request(self.cancel)?;
            fetch_text(self.net, &req)
        })
    }
}

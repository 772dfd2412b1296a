use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::retry::MirrorRotation;

fn is_absolute(uri: &str) -> bool {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Turns a manifest URI into a fetchable absolute URL.
///
/// `//host/path` gets an `https:` scheme, absolute URLs pass through, and
/// anything else is resolved against the directory of `base_url`.
pub fn locate(uri: &str, base_url: Option<&str>) -> CoreResult<String> {
    let uri = uri.trim();
    if uri.starts_with("//") {
        return Ok(format!("https:{}", uri));
    }
    if is_absolute(uri) {
        return Ok(uri.to_string());
    }
    let base = base_url.ok_or_else(|| {
        CoreError::InvalidManifest(format!("relative URI {} has no base URL to resolve against", uri))
    })?;
    let directory = base_directory(base)?;
    directory
        .join(uri)
        .map(|joined| joined.to_string())
        .map_err(|err| CoreError::InvalidManifest(format!("cannot resolve {}: {}", uri, err)))
}

/// The manifest URL with its last path segment, query and fragment removed.
pub fn base_directory(manifest_url: &str) -> CoreResult<Url> {
    let mut url = Url::parse(manifest_url)
        .map_err(|err| CoreError::InvalidManifest(format!("bad base URL {}: {}", manifest_url, err)))?;
    url.set_query(None);
    url.set_fragment(None);
    let path = url.path();
    let directory = match path.rfind('/') {
        Some(idx) => path[..=idx].to_string(),
        None => "/".to_string(),
    };
    url.set_path(&directory);
    Ok(url)
}

/// Per-job locator: the canonical URL plus its mirror variants.
#[derive(Debug, Clone)]
pub struct SegmentLocator {
    base_url: Option<String>,
    rotation: MirrorRotation,
}

impl SegmentLocator {
    pub fn new(base_url: Option<String>, mirror_domains: &[String]) -> Self {
        Self {
            base_url,
            rotation: MirrorRotation::new(mirror_domains),
        }
    }

    pub fn canonical(&self, uri: &str) -> CoreResult<String> {
        locate(uri, self.base_url.as_deref())
    }

    pub fn for_attempt(&self, uri: &str, attempt: u32) -> CoreResult<String> {
        let canonical = self.canonical(uri)?;
        Ok(self.rotation.url_for_attempt(&canonical, attempt))
    }
}

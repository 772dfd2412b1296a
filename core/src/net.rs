use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct NetRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub range: Option<(u64, u64)>,
    pub timeout: Option<Duration>,
}

impl NetRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            range: None,
            timeout: None,
        }
    }

    pub fn with_range(mut self, range: Option<(u64, u64)>) -> Self {
        self.range = range;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Streaming response. The body is read incrementally by the caller.
pub struct NetResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl NetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn text(mut self) -> CoreResult<String> {
        let mut raw = Vec::new();
        self.body
            .read_to_end(&mut raw)
            .map_err(|err| CoreError::Fetch(err.to_string()))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl fmt::Debug for NetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetResponse")
            .field("status_code", &self.status_code)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

pub trait NetClient: Send + Sync {
    fn get_stream(&self, req: &NetRequest) -> CoreResult<NetResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(user_agent: &str, accept_invalid_certs: bool) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(None)
            .build()
            .map_err(|err| CoreError::Fetch(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &NetRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Fetch(err.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|err| CoreError::Fetch(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Fetch(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn get_stream(&self, req: &NetRequest) -> CoreResult<NetResponse> {
        let mut request = self.client.get(&req.url).headers(self.request_headers(req)?);
        if let Some(timeout) = req.timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .map_err(|err| CoreError::Fetch(err.to_string()))?;
        Ok(NetResponse {
            status_code: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// GET a whole document as text, failing on non-2xx statuses.
pub fn fetch_text(net: &dyn NetClient, req: &NetRequest) -> CoreResult<String> {
    let response = net.get_stream(req)?;
    if !response.is_success() {
        return Err(CoreError::Fetch(format!(
            "{} returned status {}",
            req.url, response.status_code
        )));
    }
    response.text()
}

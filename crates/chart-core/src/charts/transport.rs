use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

/// Largest metadata body (sidecar, release JSON) read into memory.
pub const MAX_TEXT_BODY: u64 = 1024 * 1024;

/// Response to a GET request: status, advertised length, and a streaming body.
pub struct TransportResponse {
    status: u16,
    content_length: Option<u64>,
    body: Box<dyn Read + Send>,
}

impl TransportResponse {
    pub fn new(status: u16, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn body_mut(&mut self) -> &mut (dyn Read + Send) {
        self.body.as_mut()
    }

    /// Read a small metadata body into memory.
    ///
    /// Returns `Ok(None)` when the body is larger than [`MAX_TEXT_BODY`].
    /// Bytes are returned undecoded; callers decide what malformed content means.
    pub fn into_capped_bytes(self) -> io::Result<Option<Vec<u8>>> {
        let mut bytes = Vec::new();
        self.body.take(MAX_TEXT_BODY + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_TEXT_BODY {
            return Ok(None);
        }
        Ok(Some(bytes))
    }
}

/// Unauthenticated HTTP GET, injectable so tests can run without a network.
///
/// Implementations return `Err` only for transport failures; any HTTP status,
/// including errors, is reported through [`TransportResponse::status`].
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> Result<TransportResponse>;
}

/// Blocking reqwest client with an overall per-request timeout.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chart-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        Ok(TransportResponse::new(
            status,
            content_length,
            Box::new(response),
        ))
    }
}

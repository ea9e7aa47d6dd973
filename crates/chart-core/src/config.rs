use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://github.com/chart-cache/charts/releases/download";
pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/chart-cache/charts/releases/latest";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment-driven configuration for chart acquisition.
#[derive(Debug, Clone)]
pub struct ChartConfig {
    /// Release store root; artifacts live at `<base_url>/v<version>/<name>-<version>.tgz`.
    pub base_url: Url,
    /// "Latest release" metadata endpoint.
    pub release_url: Url,
    pub cache_dir: PathBuf,
    /// Upper bound for a whole HTTP exchange, body included.
    pub timeout: Duration,
    /// Number of versions per chart retained after a fresh download.
    pub keep: Option<usize>,
}

impl ChartConfig {
    /// Build a [`ChartConfig`] by reading the documented CHART_* variables.
    pub fn from_env() -> Result<Self> {
        let base_url = match env::var("CHART_BASE_URL") {
            Ok(value) => parse_http_url(&value, "CHART_BASE_URL")?,
            Err(_) => parse_http_url(DEFAULT_BASE_URL, "CHART_BASE_URL")?,
        };
        let release_url = match env::var("CHART_RELEASE_URL") {
            Ok(value) => parse_http_url(&value, "CHART_RELEASE_URL")?,
            Err(_) => parse_http_url(DEFAULT_RELEASE_URL, "CHART_RELEASE_URL")?,
        };

        let cache_dir = env::var("CHART_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_cache_dir());

        let timeout = env::var("CHART_HTTP_TIMEOUT_SECS")
            .ok()
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("CHART_HTTP_TIMEOUT_SECS `{raw}` is not a number"))
            })
            .transpose()?
            .unwrap_or(DEFAULT_TIMEOUT);

        let keep = env::var("CHART_KEEP")
            .ok()
            .map(|raw| {
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("CHART_KEEP `{raw}` is not a number"))
            })
            .transpose()?;

        Ok(Self {
            base_url,
            release_url,
            cache_dir,
            timeout,
            keep,
        })
    }

    /// Configuration pointing at explicit endpoints, with defaults for the rest.
    pub fn new(base_url: Url, release_url: Url, cache_dir: PathBuf) -> Self {
        Self {
            base_url,
            release_url,
            cache_dir,
            timeout: DEFAULT_TIMEOUT,
            keep: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keep(mut self, keep: Option<usize>) -> Self {
        self.keep = keep;
        self
    }
}

/// Parse and validate an http(s) URL coming from configuration.
pub fn parse_http_url(value: &str, what: &str) -> Result<Url> {
    let url = Url::parse(value.trim()).with_context(|| format!("{what} is not a valid URL"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("{what} uses unsupported scheme `{other}`"),
    }
}

/// `<platform cache dir>/chart-cache/charts`, or `.charts` when the platform has none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("chart-cache").join("charts"))
        .unwrap_or_else(|| PathBuf::from(".charts"))
}

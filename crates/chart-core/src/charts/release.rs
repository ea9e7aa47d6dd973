use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use url::Url;

use crate::error::ResolveError;

use super::transport::{MAX_TEXT_BODY, Transport};

/// Newest published release as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseInfo {
    pub version: String,
    /// Publication date as `YYYY-MM-DD`, when upstream provides a parseable one.
    pub published_at: Option<String>,
}

/// Queries the "latest release" endpoint. Every call goes upstream.
pub struct ReleaseResolver {
    endpoint: Url,
    transport: Arc<dyn Transport>,
}

impl ReleaseResolver {
    pub fn new(endpoint: Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn resolve_latest(&self) -> Result<ReleaseInfo, ResolveError> {
        let response = self
            .transport
            .get(self.endpoint.as_str())
            .map_err(ResolveError::UpstreamUnavailable)?;
        if !response.is_ok() {
            return Err(ResolveError::UpstreamUnavailable(anyhow!(
                "{} returned HTTP status {}",
                self.endpoint,
                response.status()
            )));
        }
        let body = response
            .into_capped_bytes()
            .map_err(|err| {
                ResolveError::UpstreamUnavailable(
                    anyhow!(err).context(format!("reading {}", self.endpoint)),
                )
            })?
            .ok_or_else(|| ResolveError::MalformedResponse {
                reason: format!("release JSON is larger than {MAX_TEXT_BODY} bytes"),
            })?;
        let info = parse_release(&body)?;
        tracing::debug!(
            endpoint = %self.endpoint,
            version = %info.version,
            published_at = info.published_at.as_deref().unwrap_or("-"),
            "resolved latest release"
        );
        Ok(info)
    }
}

#[derive(Deserialize)]
struct RawRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
}

fn parse_release(body: &[u8]) -> Result<ReleaseInfo, ResolveError> {
    let raw: RawRelease =
        serde_json::from_slice(body).map_err(|err| ResolveError::MalformedResponse {
            reason: format!("release JSON is not valid: {err}"),
        })?;
    let tag = raw
        .tag_name
        .as_deref()
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .ok_or_else(|| ResolveError::MalformedResponse {
            reason: "`tag_name` is missing".into(),
        })?;
    if tag
        .chars()
        .any(|ch| matches!(ch, '/' | '\\') || ch.is_whitespace() || ch.is_control())
    {
        return Err(ResolveError::MalformedResponse {
            reason: format!("`tag_name` `{tag}` cannot name a cached file"),
        });
    }
    Ok(ReleaseInfo {
        version: normalize_version(tag).to_string(),
        published_at: raw.published_at.as_deref().and_then(publication_date),
    })
}

/// `v1.2.3` and `1.2.3` name the same release; a `v` not followed by a digit is kept.
pub(crate) fn normalize_version(version: &str) -> &str {
    match version.strip_prefix('v') {
        Some(rest) if rest.starts_with(|ch: char| ch.is_ascii_digit()) => rest,
        _ => version,
    }
}

fn publication_date(raw: &str) -> Option<String> {
    let timestamp = OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()?;
    timestamp
        .date()
        .format(format_description!("[year]-[month]-[day]"))
        .ok()
}

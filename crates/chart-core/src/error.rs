//! Structured error types produced across resolution, download, verification,
//! storage, and extraction.

use std::io;
use std::path::PathBuf;

use anyhow::Error as AnyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("failed to resolve the latest release: {source}")]
    ResolutionFailed {
        #[source]
        source: ResolveError,
    },
    #[error("failed to download {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: DownloadError,
    },
    #[error("checksum verification failed for {name}-{version}: {source}")]
    ChecksumFailed {
        name: String,
        version: String,
        #[source]
        source: ChecksumError,
    },
    #[error("failed to extract {}: {source}", .archive.display())]
    ExtractionFailed {
        archive: PathBuf,
        #[source]
        source: ExtractError,
    },
    #[error("cache storage error at {}: {source}", .path.display())]
    StorageFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Discriminant of [`ChartError`] for callers that only branch on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartErrorKind {
    ResolutionFailed,
    DownloadFailed,
    ChecksumFailed,
    ExtractionFailed,
    StorageFailed,
}

impl ChartError {
    pub fn resolution(source: ResolveError) -> Self {
        Self::ResolutionFailed { source }
    }

    pub fn download(url: impl Into<String>, source: DownloadError) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            source,
        }
    }

    pub fn checksum(
        name: impl Into<String>,
        version: impl Into<String>,
        source: ChecksumError,
    ) -> Self {
        Self::ChecksumFailed {
            name: name.into(),
            version: version.into(),
            source,
        }
    }

    pub fn extraction(archive: impl Into<PathBuf>, source: ExtractError) -> Self {
        Self::ExtractionFailed {
            archive: archive.into(),
            source,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StorageFailed {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ChartErrorKind {
        match self {
            Self::ResolutionFailed { .. } => ChartErrorKind::ResolutionFailed,
            Self::DownloadFailed { .. } => ChartErrorKind::DownloadFailed,
            Self::ChecksumFailed { .. } => ChartErrorKind::ChecksumFailed,
            Self::ExtractionFailed { .. } => ChartErrorKind::ExtractionFailed,
            Self::StorageFailed { .. } => ChartErrorKind::StorageFailed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream release endpoint unavailable: {0:#}")]
    UpstreamUnavailable(AnyError),
    #[error("release metadata is malformed: {reason}")]
    MalformedResponse { reason: String },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transport error: {0:#}")]
    Transport(AnyError),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
    #[error("I/O error while streaming the response")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum sidecar {url} returned HTTP status {status}")]
    SidecarStatus { url: String, status: u16 },
    #[error("checksum sidecar {url} does not start with a sha256 hex digest")]
    SidecarMalformed { url: String },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("I/O error while hashing the artifact")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive entry `{path}` has unsupported type {kind}")]
    UnsupportedEntry { path: String, kind: String },
    #[error("archive entry `{path}` escapes the extraction directory")]
    UnsafePath { path: String },
    #[error("I/O error while unpacking")]
    Io(#[from] io::Error),
}

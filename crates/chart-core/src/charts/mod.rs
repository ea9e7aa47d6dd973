use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::config::ChartConfig;
use crate::error::{ChartError, ChecksumError, DownloadError};

pub use cache::{ChartCache, PruneFailure, PruneReport, sort_oldest_first};
pub use extract::{extract, extract_in};
pub use progress::{ProgressObserver, TracingProgress};
pub use release::{ReleaseInfo, ReleaseResolver};

use release::normalize_version;
pub use transport::{HttpTransport, Transport, TransportResponse};

mod cache;
pub mod digest;
mod extract;
mod progress;
mod release;
pub mod transport;

const CHUNK_SIZE: usize = 32 * 1024;
const LATEST: &str = "latest";

/// A verified chart archive available in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    pub source_url: String,
    /// Lower-case hex SHA-256 of `local_path`.
    pub digest: String,
    /// `false` when the archive was served from the cache without network I/O.
    pub was_downloaded: bool,
    pub local_path: PathBuf,
}

/// Coordinates release resolution, cache lookups, downloads, and verification.
pub struct ChartAcquirer {
    cfg: ChartConfig,
    cache: ChartCache,
    transport: Arc<dyn Transport>,
    resolver: ReleaseResolver,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl ChartAcquirer {
    /// Acquirer backed by a blocking HTTP client using `cfg.timeout`.
    pub fn new(cfg: ChartConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(cfg.timeout)?);
        Ok(Self::with_transport(cfg, transport))
    }

    pub fn with_transport(cfg: ChartConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache: ChartCache::new(cfg.cache_dir.clone()),
            resolver: ReleaseResolver::new(cfg.release_url.clone(), Arc::clone(&transport)),
            cfg,
            transport,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &ChartConfig {
        &self.cfg
    }

    pub fn cache(&self) -> &ChartCache {
        &self.cache
    }

    pub fn resolver(&self) -> &ReleaseResolver {
        &self.resolver
    }

    /// `<base_url>/v<version>/<name>-<version>.tgz`
    pub fn artifact_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/v{version}/{name}-{version}.tgz",
            self.cfg.base_url.as_str().trim_end_matches('/')
        )
    }

    /// Return a verified local copy of (name, version), downloading it on a cache miss.
    ///
    /// An empty version or `latest` is resolved upstream first.
    pub fn acquire(&self, name: &str, version: &str) -> Result<ArtifactDescriptor, ChartError> {
        let version = self.requested_version(version)?;
        let source_url = self.artifact_url(name, &version);

        if let Some(local_path) = self.cache.lookup(name, &version) {
            let digest = digest::digest_of(&local_path)
                .map_err(|err| ChartError::storage(&local_path, err))?;
            tracing::info!(
                chart = %name,
                %version,
                path = %local_path.display(),
                "chart served from cache"
            );
            return Ok(ArtifactDescriptor {
                name: name.to_string(),
                version,
                source_url,
                digest,
                was_downloaded: false,
                local_path,
            });
        }

        let checksum_url = format!("{source_url}.sha256");
        let expected = self.fetch_checksum(name, &version, &checksum_url)?;

        let mut staged = self.cache.staging_file(name, &version)?;
        let bytes = self.fetch_artifact(&source_url, &mut staged)?;

        let actual = digest::digest_of(staged.path())
            .map_err(|err| ChartError::checksum(name, &version, ChecksumError::Io(err)))?;
        if actual != expected {
            let staged_path = staged.path().to_path_buf();
            if let Err(err) = staged.close() {
                tracing::warn!(
                    path = %staged_path.display(),
                    error = %err,
                    "failed to remove rejected download"
                );
            }
            tracing::warn!(
                chart = %name,
                %version,
                %expected,
                %actual,
                "digest mismatch; download discarded"
            );
            return Err(ChartError::checksum(
                name,
                &version,
                ChecksumError::DigestMismatch { expected, actual },
            ));
        }

        let local_path = self.cache.store(staged, name, &version)?;
        tracing::info!(
            chart = %name,
            %version,
            bytes,
            path = %local_path.display(),
            "chart downloaded and verified"
        );

        if let Some(keep) = self.cfg.keep {
            self.prune_after_download(name, &version, keep);
        }

        Ok(ArtifactDescriptor {
            name: name.to_string(),
            version,
            source_url,
            digest: actual,
            was_downloaded: true,
            local_path,
        })
    }

    fn requested_version(&self, version: &str) -> Result<String, ChartError> {
        let version = version.trim();
        if version.is_empty() || version == LATEST {
            let release = self
                .resolver
                .resolve_latest()
                .map_err(ChartError::resolution)?;
            tracing::info!(version = %release.version, "resolved latest chart release");
            return Ok(release.version);
        }
        Ok(normalize_version(version).to_string())
    }

    fn fetch_checksum(&self, name: &str, version: &str, url: &str) -> Result<String, ChartError> {
        tracing::debug!(%url, "fetching checksum sidecar");
        let response = self
            .transport
            .get(url)
            .map_err(|err| ChartError::download(url, DownloadError::Transport(err)))?;
        if !response.is_ok() {
            return Err(ChartError::checksum(
                name,
                version,
                ChecksumError::SidecarStatus {
                    url: url.to_string(),
                    status: response.status(),
                },
            ));
        }
        let body = response
            .into_capped_bytes()
            .map_err(|err| ChartError::download(url, DownloadError::Io(err)))?;
        let text = body.as_deref().and_then(|bytes| std::str::from_utf8(bytes).ok());
        text.and_then(digest::parse_sidecar).ok_or_else(|| {
            ChartError::checksum(
                name,
                version,
                ChecksumError::SidecarMalformed {
                    url: url.to_string(),
                },
            )
        })
    }

    fn fetch_artifact(&self, url: &str, staged: &mut NamedTempFile) -> Result<u64, ChartError> {
        tracing::debug!(%url, "downloading chart archive");
        let mut response = self
            .transport
            .get(url)
            .map_err(|err| ChartError::download(url, DownloadError::Transport(err)))?;
        if !response.is_ok() {
            return Err(ChartError::download(
                url,
                DownloadError::Status {
                    status: response.status(),
                },
            ));
        }

        let total = response.content_length();
        let staged_path = staged.path().to_path_buf();
        let file = staged.as_file_mut();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        loop {
            let read = match response.body_mut().read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChartError::download(url, DownloadError::Io(err))),
            };
            file.write_all(&buf[..read])
                .map_err(|err| ChartError::storage(&staged_path, err))?;
            transferred += read as u64;
            if let Some(observer) = &self.observer {
                observer.on_progress(transferred, total);
            }
        }
        file.sync_all()
            .map_err(|err| ChartError::storage(&staged_path, err))?;
        Ok(transferred)
    }

    fn prune_after_download(&self, name: &str, version: &str, keep: usize) {
        match self.cache.prune_except(name, keep, Some(version)) {
            Ok(report) if !report.removed.is_empty() || !report.failed.is_empty() => {
                tracing::info!(
                    chart = %name,
                    removed = report.removed.len(),
                    failed = report.failed.len(),
                    "pruned chart cache"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(chart = %name, error = %err, "chart cache pruning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use sha2::{Digest, Sha256};
    use url::Url;

    use super::*;
    use crate::error::ChartErrorKind;
    use super::transport::fake::FakeTransport;

    const BASE: &str = "https://charts.test/releases/download";
    const LATEST_URL: &str = "https://charts.test/api/releases/latest";

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn config(root: &std::path::Path) -> ChartConfig {
        ChartConfig::new(
            Url::parse(BASE).unwrap(),
            Url::parse(LATEST_URL).unwrap(),
            root.join("cache"),
        )
    }

    fn serve_chart(
        transport: FakeTransport,
        version: &str,
        body: &[u8],
        sidecar: &str,
    ) -> FakeTransport {
        let url = format!("{BASE}/v{version}/demo-{version}.tgz");
        transport
            .route(&format!("{url}.sha256"), 200, sidecar.to_string())
            .route(&url, 200, body.to_vec())
    }

    fn acquirer(cfg: ChartConfig, transport: FakeTransport) -> (ChartAcquirer, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let acquirer = ChartAcquirer::with_transport(cfg, transport.clone());
        (acquirer, transport)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, Option<u64>)>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, transferred: u64, total: Option<u64>) {
            self.0.lock().unwrap().push((transferred, total));
        }
    }

    #[test]
    fn downloads_verifies_and_caches() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = b"chart archive bytes".to_vec();
        let sidecar = format!("{}  demo-1.2.3.tgz\n", sha256_hex(&body));
        let (acquirer, _) = acquirer(
            config(tmp.path()),
            serve_chart(FakeTransport::default(), "1.2.3", &body, &sidecar),
        );

        let descriptor = acquirer.acquire("demo", "1.2.3").expect("acquire");
        assert_eq!(descriptor.name, "demo");
        assert_eq!(descriptor.version, "1.2.3");
        assert!(descriptor.was_downloaded);
        assert_eq!(descriptor.source_url, format!("{BASE}/v1.2.3/demo-1.2.3.tgz"));
        assert_eq!(descriptor.local_path, tmp.path().join("cache/demo-1.2.3.tgz"));
        assert_eq!(descriptor.digest, sha256_hex(&body));
        assert!(digest::verify(&descriptor.local_path, &descriptor.digest).expect("verify"));
        assert_eq!(fs::read_dir(tmp.path().join("cache")).unwrap().count(), 1);
    }

    #[test]
    fn second_acquire_is_served_from_cache() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = b"cached".to_vec();
        let (acquirer, transport) = acquirer(
            config(tmp.path()),
            serve_chart(FakeTransport::default(), "1.0.0", &body, &sha256_hex(&body)),
        );

        let first = acquirer.acquire("demo", "1.0.0").expect("first");
        let requests_after_first = transport.requests().len();
        let second = acquirer.acquire("demo", "v1.0.0").expect("second");

        assert!(first.was_downloaded);
        assert!(!second.was_downloaded);
        assert_eq!(first.local_path, second.local_path);
        assert_eq!(first.digest, second.digest);
        assert_eq!(requests_after_first, 2);
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn mismatched_digest_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sidecar = format!("{}  demo-1.2.3.tgz", sha256_hex(b"something else"));
        let (acquirer, _) = acquirer(
            config(tmp.path()),
            serve_chart(FakeTransport::default(), "1.2.3", b"tampered", &sidecar),
        );

        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::ChecksumFailed);
        assert!(matches!(
            err,
            ChartError::ChecksumFailed {
                source: ChecksumError::DigestMismatch { .. },
                ..
            }
        ));
        assert!(fs::metadata(tmp.path().join("cache/demo-1.2.3.tgz")).is_err());
        assert_eq!(fs::read_dir(tmp.path().join("cache")).unwrap().count(), 0);
    }

    #[test]
    fn sidecar_problems_are_checksum_failures() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let url = format!("{BASE}/v1.2.3/demo-1.2.3.tgz");
        let transport = FakeTransport::default()
            .route(&format!("{url}.sha256"), 404, "not found")
            .route(&url, 200, b"bytes".to_vec());
        let (acquirer, transport) = acquirer(config(tmp.path()), transport);

        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::ChecksumFailed);
        assert_eq!(transport.requests(), vec![format!("{url}.sha256")]);

        let malformed = FakeTransport::default()
            .route(&format!("{url}.sha256"), 200, "<html>oops</html>")
            .route(&url, 200, b"bytes".to_vec());
        let (acquirer, _) = self::acquirer(config(tmp.path()), malformed);
        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert!(matches!(
            err,
            ChartError::ChecksumFailed {
                source: ChecksumError::SidecarMalformed { .. },
                ..
            }
        ));
    }

    #[test]
    fn undecodable_sidecar_is_a_checksum_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let url = format!("{BASE}/v1.2.3/demo-1.2.3.tgz");
        let transport = FakeTransport::default()
            .route(&format!("{url}.sha256"), 200, vec![0xff, 0xfe, 0x00, 0x41])
            .route(&url, 200, b"bytes".to_vec());
        let (acquirer, transport) = acquirer(config(tmp.path()), transport);

        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::ChecksumFailed);
        assert!(matches!(
            err,
            ChartError::ChecksumFailed {
                source: ChecksumError::SidecarMalformed { .. },
                ..
            }
        ));
        assert_eq!(transport.requests(), vec![format!("{url}.sha256")]);
    }

    #[test]
    fn unusable_cache_root_is_a_storage_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let cfg = ChartConfig::new(
            Url::parse(BASE).unwrap(),
            Url::parse(LATEST_URL).unwrap(),
            blocker.join("cache"),
        );
        let body = b"chart".to_vec();
        let (acquirer, transport) = acquirer(
            cfg,
            serve_chart(FakeTransport::default(), "1.0.0", &body, &sha256_hex(&body)),
        );

        let err = acquirer.acquire("demo", "1.0.0").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::StorageFailed);
        assert!(blocker.is_file());
        assert_eq!(acquirer.cache().lookup("demo", "1.0.0"), None);
        let artifact_url = format!("{BASE}/v1.0.0/demo-1.0.0.tgz");
        assert!(!transport.requests().contains(&artifact_url));
    }

    #[test]
    fn transport_and_status_errors_are_download_failures() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (acquirer, _) = acquirer(config(tmp.path()), FakeTransport::default());
        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::DownloadFailed);

        let url = format!("{BASE}/v1.2.3/demo-1.2.3.tgz");
        let transport = FakeTransport::default()
            .route(&format!("{url}.sha256"), 200, sha256_hex(b"x"))
            .route(&url, 500, "boom");
        let (acquirer, _) = self::acquirer(config(tmp.path()), transport);
        let err = acquirer.acquire("demo", "1.2.3").expect_err("should fail");
        assert!(matches!(
            err,
            ChartError::DownloadFailed {
                source: DownloadError::Status { status: 500 },
                ..
            }
        ));
        assert!(acquirer.cache().list("demo").unwrap().is_empty());
        assert_eq!(fs::read_dir(tmp.path().join("cache")).unwrap().count(), 0);
    }

    #[test]
    fn latest_is_resolved_upstream() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = b"latest chart".to_vec();
        let transport = serve_chart(FakeTransport::default(), "2.0.0", &body, &sha256_hex(&body))
            .route(LATEST_URL, 200, r#"{"tag_name":"v2.0.0"}"#);
        let (acquirer, transport) = acquirer(config(tmp.path()), transport);

        let first = acquirer.acquire("demo", "latest").expect("latest");
        assert_eq!(first.version, "2.0.0");
        assert!(first.was_downloaded);

        let second = acquirer.acquire("demo", "").expect("empty version");
        assert!(!second.was_downloaded);
        let latest_queries = transport
            .requests()
            .iter()
            .filter(|url| url.as_str() == LATEST_URL)
            .count();
        assert_eq!(latest_queries, 2);
    }

    #[test]
    fn resolution_failure_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let transport = FakeTransport::default().route(LATEST_URL, 200, r#"{"name":"x"}"#);
        let (acquirer, _) = acquirer(config(tmp.path()), transport);
        let err = acquirer.acquire("demo", "latest").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::ResolutionFailed);
    }

    #[test]
    fn tags_with_path_separators_fail_before_downloading() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let transport =
            FakeTransport::default().route(LATEST_URL, 200, r#"{"tag_name":"v1.0/rc"}"#);
        let (acquirer, transport) = acquirer(config(tmp.path()), transport);

        let err = acquirer.acquire("demo", "latest").expect_err("should fail");
        assert_eq!(err.kind(), ChartErrorKind::ResolutionFailed);
        assert_eq!(transport.requests(), vec![LATEST_URL.to_string()]);
    }

    #[test]
    fn retention_prunes_older_versions_but_not_the_new_one() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = config(tmp.path()).with_keep(Some(2));
        let cache_dir = cfg.cache_dir.clone();
        fs::create_dir_all(&cache_dir).unwrap();
        for version in ["2.9.0", "2.10.0", "3.0.0"] {
            fs::write(cache_dir.join(format!("demo-{version}.tgz")), version).unwrap();
        }
        let body = b"old release".to_vec();
        let (acquirer, _) = acquirer(
            cfg,
            serve_chart(FakeTransport::default(), "1.0.0", &body, &sha256_hex(&body)),
        );

        let descriptor = acquirer.acquire("demo", "1.0.0").expect("acquire");
        assert!(descriptor.local_path.exists());
        let remaining: Vec<_> = acquirer.cache().list("demo").unwrap().into_iter().collect();
        assert_eq!(remaining, vec!["1.0.0".to_string(), "3.0.0".to_string()]);
    }

    #[test]
    fn progress_is_reported_per_chunk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let body = vec![42u8; CHUNK_SIZE * 2 + 10];
        let recorder = Arc::new(Recorder::default());
        let (acquirer, _) = acquirer(
            config(tmp.path()),
            serve_chart(FakeTransport::default(), "1.0.0", &body, &sha256_hex(&body)),
        );
        let acquirer = acquirer.with_observer(recorder.clone());

        acquirer.acquire("demo", "1.0.0").expect("acquire");
        let events = recorder.0.lock().unwrap().clone();
        let total = Some(body.len() as u64);
        assert!(events.len() >= 3);
        assert_eq!(events.last(), Some(&(body.len() as u64, total)));
        assert!(events.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let url = format!("{BASE}/v1.1.0/demo-1.1.0.tgz");
        let transport = FakeTransport::default()
            .route(&format!("{url}.sha256"), 200, sha256_hex(&body))
            .route_unsized(&url, 200, body.clone());
        let recorder = Arc::new(Recorder::default());
        let (acquirer, _) = self::acquirer(config(tmp.path()), transport);
        let acquirer = acquirer.with_observer(recorder.clone());

        acquirer.acquire("demo", "1.1.0").expect("acquire unsized");
        let events = recorder.0.lock().unwrap().clone();
        assert!(events.len() >= 3);
        assert!(events.iter().all(|(_, total)| total.is_none()));
        assert_eq!(events.last().map(|event| event.0), Some(body.len() as u64));
    }

    #[test]
    fn normalizes_leading_v() {
        assert_eq!(normalize_version("v1.2.3"), "1.2.3");
        assert_eq!(normalize_version("1.2.3"), "1.2.3");
        assert_eq!(normalize_version("vnext"), "vnext");
    }
}

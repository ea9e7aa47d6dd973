use std::collections::BTreeSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use semver::Version;
use tempfile::NamedTempFile;

use crate::error::ChartError;

const ARCHIVE_SUFFIX: &str = ".tgz";

/// Flat directory of verified chart archives named `<name>-<version>.tgz`.
///
/// The directory listing is the index: a file present at the deterministic
/// path is a cache hit and is trusted without re-verification.
#[derive(Debug, Clone)]
pub struct ChartCache {
    root: PathBuf,
}

/// Outcome of a prune pass. Failed deletions are reported, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub failed: Vec<PruneFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneFailure {
    pub version: String,
    pub path: PathBuf,
    pub reason: String,
}

impl ChartCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(archive_file_name(name, version))
    }

    /// Cached archive path for (name, version), if one exists. Existence check only.
    pub fn lookup(&self, name: &str, version: &str) -> Option<PathBuf> {
        let path = self.path_for(name, version);
        path.is_file().then_some(path)
    }

    /// Versions of `name` present in the cache. A missing cache root is empty.
    pub fn list(&self, name: &str) -> Result<BTreeSet<String>, ChartError> {
        let mut versions = BTreeSet::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(ChartError::storage(&self.root, err)),
        };

        let prefix = format!("{}-", sanitize_segment(name));
        for entry in entries {
            let entry = entry.map_err(|err| ChartError::storage(&self.root, err))?;
            if !entry.file_type().map(|ty| ty.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(version) = version_component(file_name, &prefix) {
                versions.insert(version.to_string());
            }
        }
        Ok(versions)
    }

    /// Remove the oldest cached versions of `name` until at most `keep` remain.
    pub fn prune(&self, name: &str, keep: usize) -> Result<PruneReport, ChartError> {
        self.prune_except(name, keep, None)
    }

    /// Like [`ChartCache::prune`], but `protected` is never a removal candidate.
    pub(crate) fn prune_except(
        &self,
        name: &str,
        keep: usize,
        protected: Option<&str>,
    ) -> Result<PruneReport, ChartError> {
        self.prune_with(name, keep, protected, |path| fs::remove_file(path))
    }

    fn prune_with(
        &self,
        name: &str,
        keep: usize,
        protected: Option<&str>,
        mut remove: impl FnMut(&Path) -> io::Result<()>,
    ) -> Result<PruneReport, ChartError> {
        let versions = self.list(name)?;
        let mut report = PruneReport::default();
        if versions.len() <= keep {
            return Ok(report);
        }

        let excess = versions.len() - keep;
        let candidates = sort_oldest_first(versions.into_iter())
            .into_iter()
            .filter(|version| Some(version.as_str()) != protected)
            .take(excess);

        for version in candidates {
            let path = self.path_for(name, &version);
            match remove(&path) {
                Ok(()) => {
                    tracing::info!(chart = %name, %version, "pruned cached chart");
                    report.removed.push(version);
                }
                Err(err) => {
                    tracing::warn!(
                        chart = %name,
                        %version,
                        path = %path.display(),
                        error = %err,
                        "failed to prune cached chart"
                    );
                    report.failed.push(PruneFailure {
                        version,
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub(crate) fn ensure_root(&self) -> Result<(), ChartError> {
        fs::create_dir_all(&self.root).map_err(|err| ChartError::storage(&self.root, err))
    }

    /// Uniquely named hidden file in the cache root that never matches [`ChartCache::list`].
    pub(crate) fn staging_file(
        &self,
        name: &str,
        version: &str,
    ) -> Result<NamedTempFile, ChartError> {
        self.ensure_root()?;
        tempfile::Builder::new()
            .prefix(&format!(
                ".{}-{}.",
                sanitize_segment(name),
                sanitize_segment(version)
            ))
            .suffix(".partial")
            .tempfile_in(&self.root)
            .map_err(|err| ChartError::storage(&self.root, err))
    }

    /// Atomically move a verified staging file to its cache path.
    pub(crate) fn store(
        &self,
        staged: NamedTempFile,
        name: &str,
        version: &str,
    ) -> Result<PathBuf, ChartError> {
        let dest = self.path_for(name, version);
        staged
            .persist(&dest)
            .map_err(|err| ChartError::storage(&dest, err.error))?;
        Ok(dest)
    }
}

/// Versions ordered oldest first: unparseable versions, then semver order.
pub fn sort_oldest_first(versions: impl Iterator<Item = String>) -> Vec<String> {
    let mut keyed: Vec<(VersionKey, String)> = versions
        .map(|raw| (VersionKey::from_raw(&raw), raw))
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, raw)| raw).collect()
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionKey {
    Unparsed(String),
    Semver(Version),
}

impl VersionKey {
    fn from_raw(raw: &str) -> Self {
        let trimmed = raw.strip_prefix('v').unwrap_or(raw);
        match Version::parse(trimmed) {
            Ok(version) => Self::Semver(version),
            Err(_) => Self::Unparsed(raw.to_string()),
        }
    }
}

fn archive_file_name(name: &str, version: &str) -> String {
    format!(
        "{}-{}{}",
        sanitize_segment(name),
        sanitize_segment(version),
        ARCHIVE_SUFFIX
    )
}

fn version_component<'a>(file_name: &'a str, prefix: &str) -> Option<&'a str> {
    let version = file_name
        .strip_prefix(prefix)?
        .strip_suffix(ARCHIVE_SUFFIX)?;
    version
        .chars()
        .next()
        .filter(char::is_ascii_digit)
        .map(|_| version)
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

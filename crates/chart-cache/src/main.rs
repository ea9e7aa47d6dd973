use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chart_core::charts::{self, TracingProgress};
use chart_core::config::parse_http_url;
use chart_core::{ArtifactDescriptor, ChartAcquirer, ChartCache, ChartConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chart-cache", version, about = "Fetch, verify and cache chart archives")]
struct Cli {
    /// Cache directory (overrides CHART_CACHE_DIR)
    #[arg(long, value_name = "PATH", global = true)]
    cache_dir: Option<PathBuf>,

    /// Release store root (overrides CHART_BASE_URL)
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Latest-release metadata endpoint (overrides CHART_RELEASE_URL)
    #[arg(long, value_name = "URL", global = true)]
    release_url: Option<String>,

    /// Overall HTTP timeout in seconds (overrides CHART_HTTP_TIMEOUT_SECS)
    #[arg(long, value_name = "SECS", global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download (or reuse) a verified chart archive and print its descriptor as JSON
    Fetch {
        name: String,
        /// Version to fetch; `latest` asks the release endpoint
        #[arg(long, default_value = "latest")]
        version: String,
        /// Versions of this chart to retain after a download (overrides CHART_KEEP)
        #[arg(long)]
        keep: Option<usize>,
        /// Also unpack the archive into a fresh temporary directory
        #[arg(long)]
        extract: bool,
    },
    /// List cached versions of a chart, newest first
    List { name: String },
    /// Remove the oldest cached versions of a chart
    Prune {
        name: String,
        #[arg(long)]
        keep: usize,
    },
    /// Unpack a chart archive and print the directory it was unpacked into
    Extract { archive: PathBuf },
}

#[derive(Serialize)]
struct FetchOutput<'a> {
    #[serde(flatten)]
    artifact: &'a ArtifactDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    extracted_to: Option<PathBuf>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        let error = format!("{err:#}");
        tracing::error!(%error, "chart-cache failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Fetch {
            name,
            version,
            keep,
            extract,
        } => {
            let mut cfg = load_config(&cli)?;
            if keep.is_some() {
                cfg.keep = *keep;
            }
            tracing::debug!(
                cache_dir = %cfg.cache_dir.display(),
                base_url = %cfg.base_url,
                timeout_secs = cfg.timeout.as_secs(),
                "loaded chart configuration"
            );
            let acquirer = ChartAcquirer::new(cfg)?.with_observer(Arc::new(TracingProgress));
            let artifact = acquirer
                .acquire(name, version)
                .with_context(|| format!("failed to acquire chart {name}@{version}"))?;
            let extracted_to = if *extract {
                Some(charts::extract(&artifact.local_path)?)
            } else {
                None
            };
            let output = FetchOutput {
                artifact: &artifact,
                extracted_to,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::List { name } => {
            let cache = ChartCache::new(load_config(&cli)?.cache_dir);
            let mut versions = charts::sort_oldest_first(cache.list(name)?.into_iter());
            versions.reverse();
            for version in versions {
                println!("{version}");
            }
        }
        Command::Prune { name, keep } => {
            let cache = ChartCache::new(load_config(&cli)?.cache_dir);
            let report = cache.prune(name, *keep)?;
            for version in &report.removed {
                println!("removed {name}-{version}");
            }
            for failure in &report.failed {
                println!("kept {name}-{} ({})", failure.version, failure.reason);
            }
        }
        Command::Extract { archive } => {
            let dir = charts::extract(archive)?;
            println!("{}", dir.display());
        }
    }
    Ok(())
}

/// Environment configuration with command-line overrides applied.
fn load_config(cli: &Cli) -> Result<ChartConfig> {
    let mut cfg = ChartConfig::from_env().context("failed to load chart configuration")?;
    if let Some(dir) = &cli.cache_dir {
        cfg.cache_dir = dir.clone();
    }
    if let Some(url) = &cli.base_url {
        cfg.base_url = parse_http_url(url, "--base-url")?;
    }
    if let Some(url) = &cli.release_url {
        cfg.release_url = parse_http_url(url, "--release-url")?;
    }
    if let Some(secs) = cli.timeout_secs {
        cfg.timeout = Duration::from_secs(secs);
    }
    Ok(cfg)
}

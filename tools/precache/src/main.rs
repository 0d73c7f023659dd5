//! Command-line host for the Sruti Gita offline cache.
//!
//! Runs the service worker lifecycle against the real network and a
//! file-backed cache store.
//!
//! ## Usage
//!
//! ```bash
//! # Pre-cache the manifest into ./sw-cache and purge older versions
//! precache install
//!
//! # Bump the version with a custom manifest
//! precache --config gita.json --cache-version 2 install
//!
//! # Answer requests through the installed worker
//! precache serve /index.html /no-such-page.css
//!
//! # Inspect or wipe the store
//! precache list
//! precache purge
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shutri_common::{init_logging, LogConfig, LogFormat, OptionExt, ResultExt, ShutriError};
use shutri_net::{HttpFetcher, LoaderConfig, Request};
use shutri_sw::config::DEFAULT_CACHE_PREFIX;
use shutri_sw::{CacheStorage, FetchStrategy, FileCacheStorage, ServiceWorkerContainer, WorkerConfig};
use tracing::{debug, error, info, Level};
use url::Url;

#[derive(Parser)]
#[command(name = "precache")]
#[command(about = "Offline asset cache for the Sruti Gita page")]
#[command(version)]
struct Cli {
    /// Cache store directory
    #[arg(long, global = true, default_value = "sw-cache")]
    store: PathBuf,

    /// JSON worker config (defaults to the built-in manifest)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Origin that local manifest paths resolve against
    #[arg(long, global = true)]
    origin: Option<Url>,

    /// Cache version; the bucket is named `sruti-gita-v<N>`
    #[arg(long, global = true)]
    cache_version: Option<u32>,

    /// Fetch strategy: cache-first or stale-while-revalidate
    #[arg(long, global = true)]
    strategy: Option<FetchStrategy>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Debug logs from the Shutri crates, with source locations
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-cache the manifest and activate this version
    Install,

    /// Fetch URLs through the installed worker
    Serve {
        /// Absolute URLs or paths relative to the origin
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// List buckets and their entries
    List,

    /// Delete every bucket
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::new(cli.log_level)
    };
    if let Err(e) = init_logging(log_config.with_format(cli.log_format)) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(category = e.category(), error = %e, "precache failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> shutri_common::Result<()> {
    let storage = Arc::new(FileCacheStorage::open_dir(&cli.store).await?);

    match cli.command {
        Commands::Install => {
            let config = load_config(&cli).await?;
            let container = container(&config, storage.clone())?;
            container.register(config.clone()).await?;

            let stored = storage.entries(&config.cache_name).await?.len();
            println!("Installed {} ({stored} entries)", config.cache_name);
            println!("  Strategy: {}", config.strategy);
            println!("  Store:    {}", storage.dir().display());
        }

        Commands::Serve { ref urls } => {
            let config = load_config(&cli).await?;
            storage
                .keys()
                .await?
                .into_iter()
                .find(|name| *name == config.cache_name)
                .ok_or_not_found(format!(
                    "{} (run `precache install` first)",
                    config.cache_name
                ))?;

            let container = container(&config, storage)?;
            container.resume(config.clone()).await?;

            for url in urls {
                let url = resolve(&config.origin, url)?;
                let answer = container.handle_fetch(Request::get(url.clone()), None).await?;
                println!(
                    "{} {:<7} {:>9} {}",
                    answer.response.status.as_u16(),
                    if answer.from_cache() { "cache" } else { "network" },
                    answer.response.body().len(),
                    url
                );
            }

            container.settle().await;
        }

        Commands::List => {
            let names = storage.keys().await?;
            if names.is_empty() {
                println!("No caches in {}", storage.dir().display());
            }
            for name in names {
                let entries = storage.entries(&name).await?;
                println!("{name} ({} entries)", entries.len());
                for entry in entries {
                    println!(
                        "  {} {} {} {}",
                        entry.method,
                        entry.status,
                        entry.body.len(),
                        entry.url
                    );
                }
            }
        }

        Commands::Purge => {
            for name in storage.keys().await? {
                if storage.delete(&name).await? {
                    info!(cache = %name, "Deleted cache");
                    println!("Deleted {name}");
                }
            }
        }
    }

    Ok(())
}

fn container(
    config: &WorkerConfig,
    storage: Arc<FileCacheStorage>,
) -> shutri_common::Result<ServiceWorkerContainer> {
    let fetcher = HttpFetcher::new(LoaderConfig::default())
        .map_err(|e| ShutriError::network_with_source("building HTTP client", e))?;
    let (container, mut events) =
        ServiceWorkerContainer::new(config.origin.clone(), storage, Arc::new(fetcher));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Service worker event");
        }
    });

    Ok(container)
}

/// Build the worker config from the config file and command-line overrides.
async fn load_config(cli: &Cli) -> shutri_common::Result<WorkerConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config(path).await?,
        None => WorkerConfig::default(),
    };

    if let Some(origin) = &cli.origin {
        config.origin = origin.clone();
    }
    if let Some(version) = cli.cache_version {
        config.cache_name = WorkerConfig::versioned(DEFAULT_CACHE_PREFIX, version).cache_name;
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }

    // Surface bad manifest entries before touching the store.
    config.resolved_manifest()?;
    debug!(cache = %config.cache_name, strategy = %config.strategy, "Loaded config");
    Ok(config)
}

async fn read_config(path: &Path) -> shutri_common::Result<WorkerConfig> {
    let json = tokio::fs::read_to_string(path)
        .await
        .context(format!("reading {}", path.display()))?;
    WorkerConfig::from_json(&json)
        .map_err(|e| ShutriError::config_with_source(format!("parsing {}", path.display()), e))
}

fn resolve(origin: &Url, url: &str) -> shutri_common::Result<Url> {
    origin
        .join(url)
        .map_err(|e| ShutriError::InvalidArgument(format!("{url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("precache").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_global_flags_after_command() {
        let cli = parse(&["serve", "/index.html", "--strategy", "swr", "--log-format", "json"]);
        assert_eq!(cli.strategy, Some(FetchStrategy::StaleWhileRevalidate));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.store, PathBuf::from("sw-cache"));
        match cli.command {
            Commands::Serve { urls } => assert_eq!(urls, vec!["/index.html"]),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_verbose_flag() {
        assert!(!parse(&["list"]).verbose);
        assert!(parse(&["list", "-v"]).verbose);
        assert!(parse(&["--verbose", "install"]).verbose);
    }

    #[test]
    fn test_serve_requires_urls() {
        assert!(Cli::try_parse_from(["precache", "serve"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        assert!(Cli::try_parse_from(["precache", "--strategy", "network-first", "list"]).is_err());
    }

    #[tokio::test]
    async fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gita.json");
        std::fs::write(&path, r#"{ "manifest": ["/", "/index.html"] }"#).unwrap();

        let cli = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--origin",
            "https://gita.example/",
            "--cache-version",
            "4",
            "install",
        ]);
        let config = load_config(&cli).await.unwrap();

        assert_eq!(config.cache_name, "sruti-gita-v4");
        assert_eq!(config.origin.as_str(), "https://gita.example/");
        assert_eq!(config.manifest, vec!["/", "/index.html"]);
        assert_eq!(config.strategy, FetchStrategy::CacheFirst);
    }

    #[tokio::test]
    async fn test_malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gita.json");
        std::fs::write(&path, "{ \"manifest\": [").unwrap();

        let err = read_config(&path).await.unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("gita.json"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_missing_config_file_is_an_error() {
        let cli = parse(&["--config", "/definitely/not/here.json", "list"]);
        assert!(load_config(&cli).await.is_err());
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let origin = Url::parse("https://gita.example/").unwrap();
        assert_eq!(
            resolve(&origin, "/index.html").unwrap().as_str(),
            "https://gita.example/index.html"
        );
        assert_eq!(
            resolve(&origin, "https://cdn.example/bg01.mp3").unwrap().as_str(),
            "https://cdn.example/bg01.mp3"
        );
    }
}

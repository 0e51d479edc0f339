//! Command-line host for the Bermy offline agent.
//!
//! Registers the agent against the configured origin, keeping its caches in
//! a SQLite database, then fetches each URL given on the command line
//! through a page controlled by the agent and prints one JSON line per URL.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bermy_common::{
    init_logging, retry_with_backoff_if, with_timeout, BermyError, LogConfig, LogFormat, RetryConfig,
};
use bermy_net::{HttpFetcher, LoaderConfig, Request};
use bermy_sw::{AgentConfig, ContainerEvent, OfflineAgent, ServiceWorkerContainer, SqliteCacheStorage};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, error, info};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "bermy-host")]
#[command(about = "Run the Bermy offline agent and fetch URLs through it")]
struct Args {
    /// Agent config (JSON). Without it the default site list is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Origin served by the agent when no config file is given
    #[arg(long, default_value = "http://localhost:1313/")]
    origin: Url,

    /// Directory holding the cache database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Give up on install after this many seconds
    #[arg(long, default_value = "120")]
    install_timeout: u64,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,

    /// URLs to fetch through the agent
    urls: Vec<Url>,
}

#[derive(Serialize)]
struct FetchReport {
    url: String,
    status: Option<u16>,
    bytes: Option<usize>,
    elapsed_ms: u128,
    error: Option<String>,
}

fn data_dir(args: &Args) -> PathBuf {
    args.data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|dir| dir.join("bermy")))
        .unwrap_or_else(|| PathBuf::from(".bermy"))
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading agent config from {}", path.display()))?,
        None => AgentConfig::new(args.origin.clone()),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(args.log_format));

    let config = load_config(&args)?;
    let dir = data_dir(&args);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let storage = Arc::new(SqliteCacheStorage::open_path(&dir.join("caches.db"))?);
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);

    let (container, mut events) = ServiceWorkerContainer::new(config.origin.clone(), fetcher.clone());
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ContainerEvent::InstallFailed { worker_id, error } => {
                    error!(worker = %worker_id, %error, "Install failed")
                }
                ContainerEvent::ActivateFailed { worker_id, error } => {
                    error!(worker = %worker_id, %error, "Activate failed")
                }
                other => debug!(event = ?other, "Container event"),
            }
        }
    });

    info!(
        origin = %config.origin,
        cache = %config.precache_name(),
        resources = config.precache_urls.len(),
        "Registering offline agent"
    );
    let install_timeout = Duration::from_secs(args.install_timeout);
    let retry = RetryConfig::install();
    let worker_id = with_timeout(install_timeout, || {
        retry_with_backoff_if(
            &retry,
            || {
                let agent = OfflineAgent::new(config.clone(), storage.clone(), fetcher.clone());
                let container = &container;
                async move {
                    let agent = agent.map_err(BermyError::from)?;
                    container.register(agent).await.map_err(BermyError::from)
                }
            },
            BermyError::is_retryable,
        )
    })
    .await??;
    info!(worker = %worker_id, "Offline agent active");

    let page = container.open_client(config.origin.clone()).await;
    for url in args.urls {
        let started = Instant::now();
        let result = container.dispatch_fetch(page.id, Request::get(url.clone())).await;

        let report = match result {
            Ok(response) => {
                let status = response.status.as_u16();
                match response.bytes().await {
                    Ok(body) => FetchReport {
                        url: url.to_string(),
                        status: Some(status),
                        bytes: Some(body.len()),
                        elapsed_ms: started.elapsed().as_millis(),
                        error: None,
                    },
                    Err(e) => FetchReport {
                        url: url.to_string(),
                        status: Some(status),
                        bytes: None,
                        elapsed_ms: started.elapsed().as_millis(),
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => FetchReport {
                url: url.to_string(),
                status: None,
                bytes: None,
                elapsed_ms: started.elapsed().as_millis(),
                error: Some(e.to_string()),
            },
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    container.close_client(page.id).await?;
    Ok(())
}

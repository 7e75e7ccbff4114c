//! fleetcache — fetch resources through a cache proxy.
//!
//! Runs a single proxy instance against an HTTP backend with an in-process
//! record store, fetching each key given on the command line. Useful for
//! checking a configuration and watching the lease protocol in the logs
//! (`RUST_LOG=fleetcache=debug`).

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use fleetcache::{CacheProxy, FileConfig, HttpBackend, InMemoryRecordStore};

/// Fetch resources through a single-flight cache proxy.
#[derive(Parser)]
#[command(name = "fleetcache")]
#[command(version)]
#[command(about = "Single-flight cache proxy")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Backend base URL (overrides `[backend] base_url`).
    #[arg(short, long, env = "FLEETCACHE_BACKEND_URL")]
    backend_url: Option<String>,

    /// Concurrent callers per key.
    #[arg(short = 'n', long, default_value_t = 1)]
    callers: usize,

    /// Resource ids to fetch.
    #[arg(required = true)]
    keys: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    // An explicit --config must exist; otherwise fall back to defaults
    let file = match FileConfig::load(args.config.as_deref()) {
        Ok(file) => file,
        Err(e) if args.config.is_none() => {
            warn!(error = %e, "using default configuration");
            FileConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    let base_url = args.backend_url.unwrap_or(file.backend.base_url.clone());
    let proxy = CacheProxy::builder()
        .config(file.proxy_config())
        .store(Arc::new(InMemoryRecordStore::new()))
        .backend(Arc::new(HttpBackend::new(&base_url)?))
        .build()
        .await?;
    let proxy = Arc::new(proxy);

    info!(instance = %proxy.instance_id(), %base_url, "fleetcache started");

    let mut tasks = Vec::new();
    for key in &args.keys {
        for _ in 0..args.callers.max(1) {
            let proxy = Arc::clone(&proxy);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let result = proxy.get_resource(&key).await;
                (key, result)
            }));
        }
    }

    let mut failures = 0usize;
    for task in tasks {
        let (key, result) = task.await?;
        match result {
            Ok(body) => println!("{key}\t{} bytes", body.len()),
            Err(e) => {
                failures += 1;
                eprintln!("{key}\terror: {e}");
            }
        }
    }

    proxy.shutdown().await;

    if failures > 0 {
        return Err(format!("{failures} request(s) failed").into());
    }
    Ok(())
}

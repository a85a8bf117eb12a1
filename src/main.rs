use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use lobby_sync::core::observer::ObserverSet;
use lobby_sync::utils::{ensure_dir_exists, filter_for_level, init_tracing};
use lobby_sync::{
    spawn_sync_runtime, AppConfig, CatalogSource, FileCatalogSource, HttpCatalogSource,
    JsonFileStore, SyncCoordinator, TracingObserver,
};

struct Args {
    config: Option<PathBuf>,
    once: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        once: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--once" => args.once = true,
            "-h" | "--help" => {
                println!("Usage: lobby-sync [--config <path>] [--once]");
                std::process::exit(0);
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    Ok(args)
}

fn catalog_source(config: &AppConfig) -> Result<Arc<dyn CatalogSource>> {
    if let Some(ref url) = config.catalog.url {
        let source = HttpCatalogSource::new(
            url.clone(),
            &config.sync.user_agent,
            std::time::Duration::from_secs(30),
        )?;
        return Ok(Arc::new(source));
    }

    if let Some(ref file) = config.catalog.file {
        return Ok(Arc::new(FileCatalogSource::new(file.clone())));
    }

    anyhow::bail!("No catalog configured: set catalog.url or catalog.file")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let config = match args.config {
        Some(ref path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    init_tracing(&filter_for_level(&config.logging.level));

    info!("🚀 Starting {} v{}", lobby_sync::NAME, lobby_sync::VERSION);

    let data_dir = AppConfig::get_data_dir().unwrap_or_else(|_| config.sync.cache_root.clone());
    ensure_dir_exists(&data_dir)?;
    ensure_dir_exists(&config.sync.cache_root)?;
    let store = JsonFileStore::open(data_dir.join("graph.json")).await?;

    let observers = ObserverSet::new();
    observers.add(Arc::new(TracingObserver));

    let coordinator = Arc::new(SyncCoordinator::with_http(
        config.sync.clone(),
        Arc::new(store),
        Arc::new(observers),
    )?);
    let source = catalog_source(&config)?;

    if args.once {
        let catalog = source.fetch_catalog().await?;
        let report = coordinator.synchronize(&catalog).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (handle, join) = spawn_sync_runtime(coordinator, source, config.catalog.poll_interval());

    match handle.sync_now().await {
        Ok(report) => info!(
            "✅ Initial sync: {} fetched, {} up to date, {} failed",
            report.fetched, report.up_to_date, report.failed
        ),
        Err(e) => warn!("Initial sync did not complete: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("📦 Shutdown requested");

    if let Err(e) = handle.shutdown().await {
        error!("Runtime shutdown failed: {}", e);
    }
    join.await.context("Sync runtime task failed")?;

    info!("🔚 Stopped");
    Ok(())
}

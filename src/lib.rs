//! Lobby Sync - Core Library
//!
//! Content synchronization and configuration versioning for lobby
//! presentation terminals: catalog diffing, verified downloads, and a
//! transactional configuration graph the player can read at any time.

pub mod core;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    catalog::{Catalog, CatalogEntry, CatalogSource, FileCatalogSource, HttpCatalogSource},
    config::{AppConfig, SyncConfig},
    coordinator::{SyncCoordinator, SyncError},
    graph::{ConfigurationGraph, PresentationConfiguration, PresentationGroup},
    models::{AppError, AppResult, DownloadStatus, RemoteItem, SyncReport, TransferState},
    observer::{ChannelObserver, PresentationObserver, SyncEvent, TracingObserver},
    runtime::{spawn_sync_runtime, SyncRuntimeHandle},
    store::{JsonFileStore, MemoryStore, StoreGateway},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    // 初始化日志系统（重复初始化会被忽略）
    utils::init_tracing(utils::DEFAULT_LOG_FILTER);

    tracing::info!("📚 {} v{} initialized", NAME, VERSION);
    Ok(())
}

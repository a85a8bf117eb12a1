//! Core synchronization engine
//!
//! This module contains the domain models, the configuration graph, the fetch
//! pipeline and the coordinator that ties them to a store and a catalog.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error_handling;
pub mod fetcher;
pub mod graph;
pub mod integrity_checker;
pub mod models;
pub mod observer;
pub mod progress;
pub mod runtime;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;


pub use catalog::{Catalog, CatalogEntry, CatalogSource};
pub use config::AppConfig;
pub use coordinator::SyncCoordinator;
pub use graph::ConfigurationGraph;
pub use models::{AppError, AppResult, DownloadStatus, RemoteItem, SyncReport};
pub use observer::PresentationObserver;
pub use store::StoreGateway;

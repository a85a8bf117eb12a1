//! Remote catalog snapshots and the sources they are read from

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::core::integrity_checker::ExpectedDigest;
use crate::core::models::{ItemId, ItemKind};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("catalog could not be read: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog entry: {0}")]
    Invalid(String),
}

/// One item announced by the remote catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: ItemId,

    /// Opaque version token (content hash, ETag, timestamp...)
    pub version: String,

    pub url: String,

    #[serde(default)]
    pub kind: ItemKind,

    #[serde(default)]
    pub size: Option<u64>,

    /// `"<algo>:<hex>"`
    #[serde(default)]
    pub checksum: Option<String>,
}

impl CatalogEntry {
    pub fn new(id: impl Into<ItemId>, version: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            url: url.into(),
            kind: ItemKind::Media,
            size: None,
            checksum: None,
        }
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::Invalid("entry without id".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(CatalogError::Invalid(format!(
                "{}: empty version token",
                self.id
            )));
        }

        let url = Url::parse(&self.url)
            .map_err(|e| CatalogError::Invalid(format!("{}: bad url {}: {}", self.id, self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CatalogError::Invalid(format!(
                "{}: unsupported scheme {}",
                self.id,
                url.scheme()
            )));
        }

        if let Some(ref checksum) = self.checksum {
            if ExpectedDigest::parse_lenient(checksum).is_none() {
                return Err(CatalogError::Invalid(format!(
                    "{}: unsupported or malformed checksum {}",
                    self.id, checksum
                )));
            }
        }

        Ok(())
    }

    /// Same version at the same location
    fn same_announcement(&self, other: &CatalogEntry) -> bool {
        self.version == other.version && self.url == other.url
    }
}

/// Snapshot of the remote catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub items: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogWire {
    Wrapped { items: Vec<CatalogEntry> },
    Bare(Vec<CatalogEntry>),
}

/// Catalog with malformed and repeated entries removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCatalog {
    pub entries: Vec<CatalogEntry>,
    pub rejected: usize,
    pub duplicates: usize,
}

impl ResolvedCatalog {
    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }
}

impl Catalog {
    pub fn new(items: Vec<CatalogEntry>) -> Self {
        Self { items }
    }

    /// Accepts `{"items": [...]}` or a bare array
    pub fn parse_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let items = match serde_json::from_slice::<CatalogWire>(bytes)? {
            CatalogWire::Wrapped { items } | CatalogWire::Bare(items) => items,
        };
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// One entry per ID, in first-seen order. The first occurrence wins;
    /// later ones that disagree with it are logged.
    pub fn resolve(&self) -> ResolvedCatalog {
        let mut resolved = ResolvedCatalog::default();
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for entry in &self.items {
            if let Err(e) = entry.validate() {
                warn!("Skipping catalog entry: {}", e);
                resolved.rejected += 1;
                continue;
            }

            match seen.get(entry.id.as_str()) {
                Some(&index) => {
                    resolved.duplicates += 1;
                    let first = &resolved.entries[index];
                    if !first.same_announcement(entry) {
                        warn!(
                            "Catalog lists {} twice with different versions ({} vs {}); keeping the first",
                            entry.id, first.version, entry.version
                        );
                    }
                }
                None => {
                    seen.insert(entry.id.as_str(), resolved.entries.len());
                    resolved.entries.push(entry.clone());
                }
            }
        }

        resolved
    }
}

/// Where catalog snapshots come from
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Human-readable label identifying this source
    fn label(&self) -> &str;

    async fn fetch_catalog(&self) -> Result<Catalog, CatalogError>;
}

/// Catalog served as JSON over HTTP
pub struct HttpCatalogSource {
    url: String,
    client: reqwest::Client,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, user_agent: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn label(&self) -> &str {
        &self.url
    }

    async fn fetch_catalog(&self) -> Result<Catalog, CatalogError> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        let catalog = Catalog::parse_json(&bytes)?;
        debug!("Fetched catalog with {} entries from {}", catalog.len(), self.url);
        Ok(catalog)
    }
}

/// Catalog dropped on disk by provisioning tools
pub struct FileCatalogSource {
    path: PathBuf,
    label: String,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.display().to_string();
        Self { path, label }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch_catalog(&self) -> Result<Catalog, CatalogError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Catalog::parse_json(&bytes)
    }
}

/// In-memory catalog that can be swapped between polls
#[derive(Debug, Default)]
pub struct StaticCatalogSource {
    catalog: Mutex<Catalog>,
}

impl StaticCatalogSource {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Mutex::new(catalog),
        }
    }

    pub fn replace(&self, catalog: Catalog) {
        *self.catalog.lock() = catalog;
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    fn label(&self) -> &str {
        "static"
    }

    async fn fetch_catalog(&self) -> Result<Catalog, CatalogError> {
        Ok(self.catalog.lock().clone())
    }
}

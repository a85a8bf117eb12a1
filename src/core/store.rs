//! Transactional persistence boundary for the configuration graph

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::graph::{ConfigurationGraph, GraphWrite, PresentationConfiguration, PresentationGroup};
use crate::core::models::{ItemId, RemoteItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Writes collected against a snapshot, committed all together or not at all.
///
/// Reads through `graph()` see the writes already recorded in this
/// transaction.
#[derive(Debug, Clone)]
pub struct StoreTransaction {
    base_revision: u64,
    view: ConfigurationGraph,
    writes: Vec<GraphWrite>,
}

impl StoreTransaction {
    pub fn new(snapshot: ConfigurationGraph) -> Self {
        Self {
            base_revision: snapshot.revision(),
            view: snapshot,
            writes: Vec::new(),
        }
    }

    /// Revision of the snapshot the transaction started from
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    pub fn graph(&self) -> &ConfigurationGraph {
        &self.view
    }

    pub fn writes(&self) -> &[GraphWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn record(&mut self, write: GraphWrite) {
        self.view.apply(write.clone());
        self.writes.push(write);
    }

    pub fn write_remote_item(&mut self, item: RemoteItem) {
        self.record(GraphWrite::RemoteItem(item));
    }

    pub fn remove_remote_item(&mut self, id: impl Into<ItemId>) {
        self.record(GraphWrite::RemoveRemoteItem(id.into()));
    }

    pub fn write_configuration(&mut self, config: PresentationConfiguration) {
        self.record(GraphWrite::Configuration(config));
    }

    pub fn remove_configuration(&mut self, id: impl Into<ItemId>) {
        self.record(GraphWrite::RemoveConfiguration(id.into()));
    }

    pub fn write_group(&mut self, group: PresentationGroup) {
        self.record(GraphWrite::Group(group));
    }

    pub fn remove_group(&mut self, id: impl Into<String>) {
        self.record(GraphWrite::RemoveGroup(id.into()));
    }

    pub fn mark_gc_candidate(&mut self, id: impl Into<ItemId>) {
        self.record(GraphWrite::MarkGcCandidate(id.into()));
    }

    pub fn clear_gc_candidate(&mut self, id: impl Into<ItemId>) {
        self.record(GraphWrite::ClearGcCandidate(id.into()));
    }
}

/// Atomic read and write access to the configuration graph.
///
/// A commit either applies every write of the transaction and returns the new
/// revision, or applies none of them. Readers only ever see committed graphs.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn read_graph(&self) -> Result<ConfigurationGraph, StoreError>;

    async fn begin_transaction(&self) -> Result<StoreTransaction, StoreError> {
        Ok(StoreTransaction::new(self.read_graph().await?))
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<u64, StoreError>;

    async fn rollback(&self, tx: StoreTransaction) {
        debug!(
            "{}: rolled back {} pending writes (base revision {})",
            self.name(),
            tx.writes().len(),
            tx.base_revision()
        );
    }
}

/// Volatile store, used by tests and `--once` dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    graph: RwLock<ConfigurationGraph>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(graph: ConfigurationGraph) -> Self {
        Self {
            graph: RwLock::new(graph),
        }
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read_graph(&self) -> Result<ConfigurationGraph, StoreError> {
        Ok(self.graph.read().await.clone())
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<u64, StoreError> {
        let mut graph = self.graph.write().await;
        if tx.is_empty() {
            return Ok(graph.revision());
        }
        Ok(graph.commit_writes(tx.writes()))
    }
}

/// Graph persisted as one pretty-printed JSON document.
///
/// Commits build the next graph on a copy, write it to a sibling temp file
/// and rename it over the old one before publishing it in memory.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    graph: RwLock<ConfigurationGraph>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty when the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let graph = match fs::read(&path).await {
            Ok(bytes) => {
                let graph: ConfigurationGraph = serde_json::from_slice(&bytes)?;
                info!(
                    "📂 Loaded configuration graph revision {} from {}",
                    graph.revision(),
                    path.display()
                );
                repair(graph)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating new configuration graph at {}", path.display());
                ConfigurationGraph::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            graph: RwLock::new(graph),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, graph: &ConfigurationGraph) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_vec_pretty(graph)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// Records edited by hand may break the cache-state invariant; forget the
/// cache for those so the next pass downloads them again.
fn repair(graph: ConfigurationGraph) -> ConfigurationGraph {
    let broken: Vec<RemoteItem> = graph
        .items()
        .filter(|item| !item.has_consistent_cache_state())
        .cloned()
        .collect();

    if broken.is_empty() {
        return graph;
    }

    let mut graph = graph;
    let writes: Vec<GraphWrite> = broken
        .into_iter()
        .map(|mut item| {
            warn!("Clearing inconsistent cache state for item {}", item.id);
            item.clear_cache();
            GraphWrite::RemoteItem(item)
        })
        .collect();
    graph.commit_writes(&writes);
    graph
}

#[async_trait]
impl StoreGateway for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn read_graph(&self) -> Result<ConfigurationGraph, StoreError> {
        Ok(self.graph.read().await.clone())
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<u64, StoreError> {
        let mut current = self.graph.write().await;
        if tx.is_empty() {
            return Ok(current.revision());
        }

        let mut next = current.clone();
        let revision = next.commit_writes(tx.writes());
        self.persist(&next).await?;

        *current = next;
        debug!("Committed graph revision {} to {}", revision, self.path.display());
        Ok(revision)
    }
}

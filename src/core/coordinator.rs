//! Sync coordinator
//!
//! Diffs a catalog snapshot against the local configuration graph, runs the
//! resulting fetches under a bounded admission gate, and commits each
//! verified artifact into the graph in its own transaction.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock as AsyncRwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::catalog::{Catalog, CatalogEntry};
use crate::core::config::SyncConfig;
use crate::core::error_handling::{errors, FetchError, RetryPolicy};
use crate::core::fetcher::{CacheLayout, Fetcher, HttpTransport, Transport};
use crate::core::graph::{
    ConfigurationDocument, ConfigurationGraph, PresentationConfiguration, PresentationGroup,
    ValidationReport,
};
use crate::core::models::{
    DownloadStatus, ItemId, ItemKind, ItemOutcome, LocalArtifact, RemoteItem, SweepReport,
    SyncReport,
};
use crate::core::observer::{PresentationObserver, StatusRegistry, StatusReporter};
use crate::core::store::{StoreError, StoreGateway};
use crate::utils::{dir_usage, format_bytes, remove_file_if_exists};

/// Failures that stop a whole operation rather than a single item
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache maintenance failed: {0}")]
    Cache(#[from] std::io::Error),

    #[error("invalid group: {0}")]
    InvalidGroup(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Why an item is being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchReason {
    /// No local record yet
    New,
    /// Catalog announces a different version than the one cached
    VersionChanged,
    /// Record exists but nothing was ever cached for it
    NotCached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFetch {
    pub entry: CatalogEntry,
    pub reason: FetchReason,
}

/// Outcome of diffing a catalog against the graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub fetches: Vec<PlannedFetch>,
    /// Entries whose cached version is the announced one
    pub up_to_date: Vec<CatalogEntry>,
    /// Local items the catalog no longer lists
    pub gc_candidates: Vec<ItemId>,
    pub rejected: usize,
}

impl SyncPlan {
    /// Pure diff; touches neither the store nor the network
    pub fn build(graph: &ConfigurationGraph, catalog: &Catalog) -> Self {
        let resolved = catalog.resolve();
        let mut plan = SyncPlan {
            rejected: resolved.rejected,
            ..Default::default()
        };

        for entry in &resolved.entries {
            let reason = match graph.item(&entry.id) {
                None => Some(FetchReason::New),
                Some(item) if !item.is_cached() => Some(FetchReason::NotCached),
                Some(item) if item.synced_version() != Some(entry.version.as_str()) => {
                    Some(FetchReason::VersionChanged)
                }
                Some(_) => None,
            };

            match reason {
                Some(reason) => plan.fetches.push(PlannedFetch {
                    entry: entry.clone(),
                    reason,
                }),
                None => plan.up_to_date.push(entry.clone()),
            }
        }

        plan.gc_candidates = graph
            .items()
            .filter(|item| !resolved.contains(&item.id))
            .map(|item| item.id.clone())
            .collect();

        plan
    }
}

/// Releases an item's in-flight claim when its worker ends, however it ends
struct InFlightGuard {
    map: Arc<DashMap<ItemId, CancellationToken>>,
    item_id: ItemId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.item_id);
    }
}

/// Everything a fetch worker needs, cloned into its task
#[derive(Clone)]
struct Worker {
    store: Arc<dyn StoreGateway>,
    fetcher: Arc<Fetcher>,
    admission: Arc<Semaphore>,
    cache_gate: Arc<AsyncRwLock<()>>,
    commit_lock: Arc<Mutex<()>>,
    retry: RetryPolicy,
    commit_attempts: u32,
}

impl Worker {
    async fn run(
        self,
        entry: CatalogEntry,
        mut reporter: StatusReporter,
        cancel: CancellationToken,
    ) -> ItemOutcome {
        let item = RemoteItem::from(&entry);
        let mut attempts = 0u32;

        loop {
            // 等待并发许可（FIFO）
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    reporter.cancel();
                    return ItemOutcome::cancelled(item.id.clone(), attempts);
                }
                permit = self.admission.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        reporter.cancel();
                        return ItemOutcome::cancelled(item.id.clone(), attempts);
                    }
                },
            };

            // held through the commit so a sweep never prunes this attempt's files
            let cache = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    reporter.cancel();
                    return ItemOutcome::cancelled(item.id.clone(), attempts);
                }
                guard = self.cache_gate.read() => guard,
            };

            attempts += 1;
            let result = self.fetcher.fetch(&item, &mut reporter, &cancel).await;
            drop(permit);

            let error = match result {
                Ok(artifact) => {
                    return self
                        .finish(&item, artifact, attempts, &mut reporter, &cancel)
                        .await
                }
                Err(e) => e,
            };
            drop(cache);

            match error {
                FetchError::Cancelled => {
                    return ItemOutcome::cancelled(item.id.clone(), attempts);
                }
                e if self.retry.should_retry(&e, attempts) => {
                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        "🔄 {} attempt {}/{} failed: {}; retrying in {:?}",
                        item.id, attempts, self.retry.max_attempts, e, delay
                    );
                    reporter.reschedule();

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            reporter.cancel();
                            return ItemOutcome::cancelled(item.id.clone(), attempts);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                e => {
                    error!(
                        "❌ {} failed after {} attempt(s): {}",
                        item.id, attempts, e
                    );
                    return ItemOutcome::failed(item.id.clone(), attempts, &e);
                }
            }
        }
    }

    /// Commit a verified artifact. Only the commit is retried here; the
    /// artifact stays where it is so nothing is downloaded twice.
    async fn finish(
        &self,
        item: &RemoteItem,
        artifact: LocalArtifact,
        attempts: u32,
        reporter: &mut StatusReporter,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let document = if item.kind == ItemKind::Configuration {
            match read_document(&artifact).await {
                Ok(document) => Some(document),
                Err(e) => {
                    discard(&artifact).await;
                    reporter.fail(&e);
                    return ItemOutcome::failed(item.id.clone(), attempts, &e);
                }
            }
        } else {
            None
        };

        if cancel.is_cancelled() {
            if !artifact.reused {
                discard(&artifact).await;
            }
            reporter.cancel();
            return ItemOutcome::cancelled(item.id.clone(), attempts);
        }

        let mut last_error = String::new();
        for commit_attempt in 1..=self.commit_attempts {
            let committed = {
                // same-item and validation ordering both rely on this lock
                let _serialized = self.commit_lock.lock().await;
                self.commit(item, &artifact, document.clone()).await
            };

            match committed {
                Ok(revision) => {
                    reporter.complete();
                    info!(
                        "💾 Committed {} {} at graph revision {}",
                        item.id, artifact.version, revision
                    );
                    return ItemOutcome::fetched(&artifact, attempts);
                }
                Err(e) => {
                    warn!(
                        "💾 Commit {}/{} for {} failed: {}",
                        commit_attempt, self.commit_attempts, item.id, e
                    );
                    last_error = e.to_string();
                }
            }

            if commit_attempt < self.commit_attempts {
                tokio::time::sleep(self.retry.delay_for(commit_attempt)).await;
            }
        }

        // the verified artifact is left at its canonical path for the next pass
        let err = errors::gateway_commit(last_error);
        reporter.fail(&err);
        ItemOutcome::failed(item.id.clone(), attempts, &err)
    }

    async fn commit(
        &self,
        item: &RemoteItem,
        artifact: &LocalArtifact,
        document: Option<ConfigurationDocument>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.store.begin_transaction().await?;

        let mut record = tx
            .graph()
            .item(&item.id)
            .cloned()
            .unwrap_or_else(|| item.clone());
        record.mark_synced(artifact.version.clone(), artifact.path.clone());
        tx.write_remote_item(record);

        if let Some(document) = document {
            tx.write_configuration(PresentationConfiguration::from_document(
                item.id.clone(),
                document,
            ));
        }

        let dependents = tx.graph().dependents_of(&item.id);
        let revision = self.store.commit(tx).await?;

        if !dependents.is_empty() {
            debug!(
                "Revalidated {} configuration(s) depending on {}",
                dependents.len(),
                item.id
            );
        }
        Ok(revision)
    }
}

async fn read_document(artifact: &LocalArtifact) -> Result<ConfigurationDocument, FetchError> {
    let bytes = tokio::fs::read(&artifact.path).await?;
    ConfigurationDocument::parse(&bytes).map_err(|e| {
        errors::permanent(format!(
            "configuration document {} is malformed: {}",
            artifact.item_id, e
        ))
    })
}

async fn discard(artifact: &LocalArtifact) {
    if let Err(e) = remove_file_if_exists(&artifact.path).await {
        warn!("Failed to remove {}: {}", artifact.path.display(), e);
    }
}

/// Orchestrates synchronization passes for one terminal
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn StoreGateway>,
    fetcher: Arc<Fetcher>,
    observer: Arc<dyn PresentationObserver>,
    statuses: StatusRegistry,
    in_flight: Arc<DashMap<ItemId, CancellationToken>>,
    admission: Arc<Semaphore>,
    run_token: RwLock<CancellationToken>,
    /// Fetch attempts hold it shared, sweeps exclusively
    cache_gate: Arc<AsyncRwLock<()>>,
    commit_lock: Arc<Mutex<()>>,
    retry: RetryPolicy,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StoreGateway>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn PresentationObserver>,
    ) -> Self {
        let layout = CacheLayout::new(config.cache_root.clone());
        let fetcher = Fetcher::new(transport, layout, config.fetcher_config());
        let permits = config.max_concurrent_fetches.max(1);

        Self {
            retry: config.retry_policy(),
            config,
            store,
            fetcher: Arc::new(fetcher),
            observer,
            statuses: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            admission: Arc::new(Semaphore::new(permits)),
            run_token: RwLock::new(CancellationToken::new()),
            cache_gate: Arc::new(AsyncRwLock::new(())),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Coordinator fetching over HTTP
    pub fn with_http(
        config: SyncConfig,
        store: Arc<dyn StoreGateway>,
        observer: Arc<dyn PresentationObserver>,
    ) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config.user_agent, Duration::from_secs(30))?;
        Ok(Self::new(config, store, Arc::new(transport), observer))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        self.fetcher.layout()
    }

    fn worker(&self) -> Worker {
        Worker {
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            admission: self.admission.clone(),
            cache_gate: self.cache_gate.clone(),
            commit_lock: self.commit_lock.clone(),
            retry: self.retry.clone(),
            commit_attempts: self.config.commit_retry_attempts.max(1),
        }
    }

    /// Diff `catalog` against the committed graph without doing anything
    pub async fn plan(&self, catalog: &Catalog) -> Result<SyncPlan, SyncError> {
        let graph = self.store.read_graph().await?;
        Ok(SyncPlan::build(&graph, catalog))
    }

    /// Run one synchronization pass and wait for every fetch it scheduled.
    ///
    /// Per-item failures end up in the report; only a store that cannot be
    /// read or written at intake aborts the pass.
    #[instrument(skip(self, catalog), fields(entries = catalog.len()))]
    pub async fn synchronize(&self, catalog: &Catalog) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(Utc::now());
        let run_token = self.run_token.read().clone();

        let graph = self.store.read_graph().await?;
        let plan = SyncPlan::build(&graph, catalog);
        report.rejected = plan.rejected;
        report.up_to_date = plan.up_to_date.len();
        report.gc_candidates = plan.gc_candidates.len();

        // claim items before anything else so a concurrent pass cannot start them too
        let mut claimed: Vec<(PlannedFetch, CancellationToken, InFlightGuard)> = Vec::new();
        for planned in plan.fetches {
            let id = planned.entry.id.clone();
            let token = run_token.child_token();
            match self.in_flight.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!("{} is already being fetched; skipping", id);
                    report.in_flight += 1;
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(token.clone());
                }
            }
            let guard = InFlightGuard {
                map: self.in_flight.clone(),
                item_id: id,
            };
            claimed.push((planned, token, guard));
        }

        // intake: catalog metadata and gc marks, one transaction
        let mut tx = self.store.begin_transaction().await?;
        let catalog_entries = claimed
            .iter()
            .map(|(planned, _, _)| &planned.entry)
            .chain(plan.up_to_date.iter());
        for entry in catalog_entries {
            match tx.graph().item(&entry.id).cloned() {
                Some(mut existing) => {
                    if existing.apply_entry(entry) {
                        tx.write_remote_item(existing);
                    }
                }
                None => tx.write_remote_item(RemoteItem::from(entry)),
            }
            if tx.graph().is_gc_candidate(&entry.id) {
                tx.clear_gc_candidate(entry.id.clone());
            }
        }
        for id in &plan.gc_candidates {
            if !tx.graph().is_gc_candidate(id) {
                tx.mark_gc_candidate(id.clone());
            }
        }
        let intake_revision = self.store.commit(tx).await?;

        info!(
            "🔍 Sync plan: {} to fetch, {} up to date, {} in flight, {} gc candidates",
            claimed.len(),
            report.up_to_date,
            report.in_flight,
            report.gc_candidates
        );

        let mut handles = Vec::with_capacity(claimed.len());
        for (planned, token, guard) in claimed {
            let id = planned.entry.id.clone();
            debug!("Scheduling {} ({:?})", id, planned.reason);
            let reporter =
                StatusReporter::schedule(id.clone(), self.statuses.clone(), self.observer.clone());
            let worker = self.worker();
            let handle = tokio::spawn(async move {
                let _claim = guard;
                worker.run(planned.entry, reporter, token).await
            });
            handles.push((id, handle));
        }

        let ids: Vec<ItemId> = handles.iter().map(|(id, _)| id.clone()).collect();
        let results = futures::future::join_all(handles.into_iter().map(|(_, handle)| handle)).await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(join_error) => {
                    error!("Fetch worker for {} died: {}", id, join_error);
                    let err = errors::permanent(format!("worker failed: {}", join_error));
                    report.record(ItemOutcome::failed(id, 0, &err));
                }
            }
        }

        report.graph_revision = match self.store.read_graph().await {
            Ok(graph) => graph.revision(),
            Err(e) => {
                warn!("Could not read graph revision after sync: {}", e);
                intake_revision
            }
        };
        report.finished_at = Utc::now();

        self.observer.on_graph_updated(&report);
        Ok(report)
    }

    /// Cancel the fetch for one item. Returns false when none is running.
    pub fn cancel(&self, item_id: &str) -> bool {
        match self.in_flight.get(item_id) {
            Some(token) => {
                info!("🛑 Cancelling fetch for {}", item_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every queued and running fetch. Passes started afterwards are
    /// unaffected. Returns how many fetches were signalled.
    pub fn cancel_all(&self) -> usize {
        let previous = std::mem::take(&mut *self.run_token.write());
        previous.cancel();

        let mut count = 0;
        for entry in self.in_flight.iter() {
            entry.value().cancel();
            count += 1;
        }
        info!("🛑 Cancelled {} in-flight fetch(es)", count);
        count
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn busy_items(&self) -> HashSet<ItemId> {
        self.in_flight.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Reclaim configurations and items the catalog dropped, plus stale
    /// artifacts and abandoned staging files. Items being fetched are skipped.
    ///
    /// Waits for running fetch attempts to finish their commits and holds new
    /// ones back until the cache has been pruned.
    pub async fn sweep(&self) -> Result<SweepReport, SyncError> {
        let _exclusive = self.cache_gate.write().await;

        let (plan, graph_revision) = {
            let _serialized = self.commit_lock.lock().await;

            let mut tx = self.store.begin_transaction().await?;
            let plan = tx.graph().plan_sweep(&self.busy_items());
            for id in &plan.configurations {
                tx.remove_configuration(id.clone());
            }
            for item in &plan.items {
                tx.remove_remote_item(item.id.clone());
            }

            let revision = if tx.is_empty() {
                let revision = tx.base_revision();
                self.store.rollback(tx).await;
                revision
            } else {
                self.store.commit(tx).await?
            };
            (plan, revision)
        };

        let graph = self.store.read_graph().await?;
        let keep: HashSet<PathBuf> = graph
            .items()
            .filter_map(|item| item.local_path().map(|path| path.to_path_buf()))
            .collect();
        let busy = self.busy_items();
        let layout = self.fetcher.layout().clone();

        let ((files_removed, bytes_freed), (cache_files, cache_bytes)) =
            tokio::task::spawn_blocking(move || {
                let pruned = layout.prune(&keep, &busy)?;
                let usage = dir_usage(layout.root())?;
                Ok::<_, std::io::Error>((pruned, usage))
            })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        for item in &plan.items {
            self.statuses.remove(&item.id);
        }

        let report = SweepReport {
            items_removed: plan.items.len(),
            configurations_removed: plan.configurations.len(),
            files_removed,
            bytes_freed,
            cache_files,
            cache_bytes,
            graph_revision,
        };
        info!(
            "🧹 Sweep removed {} item(s), {} configuration(s), {} file(s), {}; cache now {}",
            report.items_removed,
            report.configurations_removed,
            report.files_removed,
            format_bytes(report.bytes_freed),
            format_bytes(report.cache_bytes)
        );
        Ok(report)
    }

    /// Current status of an item's latest fetch
    pub fn status(&self, item_id: &str) -> Option<DownloadStatus> {
        self.statuses.get(item_id).map(|status| status.clone())
    }

    pub fn statuses(&self) -> HashMap<ItemId, DownloadStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Latest committed graph
    pub async fn graph_snapshot(&self) -> Result<ConfigurationGraph, SyncError> {
        Ok(self.store.read_graph().await?)
    }

    pub async fn validate(&self, config_id: &str) -> Result<Option<ValidationReport>, SyncError> {
        Ok(self.store.read_graph().await?.validate_id(config_id))
    }

    pub async fn displayable_groups(&self) -> Result<Vec<PresentationGroup>, SyncError> {
        let graph = self.store.read_graph().await?;
        Ok(graph.displayable_groups().into_iter().cloned().collect())
    }

    pub async fn upsert_group(&self, group: PresentationGroup) -> Result<u64, SyncError> {
        if group.id.trim().is_empty() {
            return Err(SyncError::InvalidGroup("group id must not be empty".to_string()));
        }
        if group.name.trim().is_empty() {
            return Err(SyncError::InvalidGroup(format!(
                "group {} has no name",
                group.id
            )));
        }

        let _serialized = self.commit_lock.lock().await;
        let mut tx = self.store.begin_transaction().await?;
        tx.write_group(group);
        Ok(self.store.commit(tx).await?)
    }

    /// Returns false when no such group existed
    pub async fn remove_group(&self, group_id: &str) -> Result<bool, SyncError> {
        let _serialized = self.commit_lock.lock().await;
        let mut tx = self.store.begin_transaction().await?;
        if tx.graph().group(group_id).is_none() {
            self.store.rollback(tx).await;
            return Ok(false);
        }
        tx.remove_group(group_id);
        self.store.commit(tx).await?;
        Ok(true)
    }
}

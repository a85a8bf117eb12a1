//! Core data models for the lobby synchronization engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::catalog::{CatalogEntry, CatalogError};
use crate::core::coordinator::SyncError;
use crate::core::error_handling::{FetchError, FetchErrorKind};
use crate::core::store::StoreError;
use crate::utils::format_bytes;

/// Stable identifier of a remote item
pub type ItemId = String;

/// What a remote item holds

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Image, video or web content shown on a slide
    #[default]
    Media,

    /// Serialized presentation configuration document
    Configuration,
}

/// A fetchable resource and its local cache state.
///
/// `local_path` and `synced_version` are set and cleared together, so a
/// cached path always names a completed download of the synced version.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteItem {
    pub id: ItemId,

    pub url: String,

    #[serde(default)]
    pub kind: ItemKind,

    /// Version token last announced by the catalog
    pub remote_version: String,

    #[serde(default)]
    pub expected_size: Option<u64>,

    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    local_path: Option<PathBuf>,

    #[serde(default)]
    synced_version: Option<String>,

    #[serde(default)]
    synced_at: Option<DateTime<Utc>>,
}

impl RemoteItem {
    pub fn new(
        id: impl Into<ItemId>,
        url: impl Into<String>,
        kind: ItemKind,
        remote_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            kind,
            remote_version: remote_version.into(),
            expected_size: None,
            checksum: None,
            local_path: None,
            synced_version: None,
            synced_at: None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn synced_version(&self) -> Option<&str> {
        self.synced_version.as_deref()
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    /// True when some completed version is on disk
    pub fn is_cached(&self) -> bool {
        self.local_path.is_some()
    }

    /// True when the cached version is the one the catalog announces
    pub fn is_current(&self) -> bool {
        self.is_cached() && self.synced_version.as_deref() == Some(self.remote_version.as_str())
    }

    /// Record a completed download. Both halves of the cache state change together.
    pub fn mark_synced(&mut self, version: impl Into<String>, path: impl Into<PathBuf>) {
        self.synced_version = Some(version.into());
        self.local_path = Some(path.into());
        self.synced_at = Some(Utc::now());
    }

    pub fn clear_cache(&mut self) {
        self.synced_version = None;
        self.local_path = None;
        self.synced_at = None;
    }

    /// Copy catalog metadata onto the record without touching the cache state.
    /// Returns true when anything changed.
    pub fn apply_entry(&mut self, entry: &CatalogEntry) -> bool {
        let changed = self.url != entry.url
            || self.kind != entry.kind
            || self.remote_version != entry.version
            || self.expected_size != entry.size
            || self.checksum != entry.checksum;

        self.url = entry.url.clone();
        self.kind = entry.kind;
        self.remote_version = entry.version.clone();
        self.expected_size = entry.size;
        self.checksum = entry.checksum.clone();
        changed
    }

    /// Records read back from disk may have been edited by hand.
    pub fn has_consistent_cache_state(&self) -> bool {
        self.local_path.is_some() == self.synced_version.is_some()
    }
}

impl From<&CatalogEntry> for RemoteItem {
    fn from(entry: &CatalogEntry) -> Self {
        let mut item = RemoteItem::new(
            entry.id.clone(),
            entry.url.clone(),
            entry.kind,
            entry.version.clone(),
        );
        item.expected_size = entry.size;
        item.checksum = entry.checksum.clone();
        item
    }
}

/// Transfer state of a single fetch

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,

    InProgress,

    Completed,

    Failed,

    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Failure attached to a `failed` status

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub kind: FetchErrorKind,

    pub message: String,
}

impl From<&FetchError> for FailureInfo {
    fn from(err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Rejected state-machine transition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("illegal status transition for {item_id}: {from:?} -> {to:?}")]
pub struct StatusError {
    pub item_id: ItemId,
    pub from: TransferState,
    pub to: TransferState,
}

/// Progress and outcome of the current fetch of one item.
///
/// `pending -> in_progress -> {completed | failed | cancelled}`; a queued fetch
/// may also go straight from `pending` to `cancelled` or `failed`. Terminal
/// states never change again; a new fetch gets a fresh status.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadStatus {
    item_id: ItemId,

    state: TransferState,

    bytes_transferred: u64,

    total_bytes: Option<u64>,

    last_error: Option<FailureInfo>,

    scheduled_at: DateTime<Utc>,

    started_at: Option<DateTime<Utc>>,

    finished_at: Option<DateTime<Utc>>,
}

impl DownloadStatus {
    /// Status of a freshly scheduled fetch
    pub fn pending(item_id: impl Into<ItemId>) -> Self {
        Self {
            item_id: item_id.into(),
            state: TransferState::Pending,
            bytes_transferred: 0,
            total_bytes: None,
            last_error: None,
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn last_error(&self) -> Option<&FailureInfo> {
        self.last_error.as_ref()
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn transition(&mut self, to: TransferState) -> Result<(), StatusError> {
        let allowed = match (self.state, to) {
            (TransferState::Pending, TransferState::InProgress) => true,
            (TransferState::Pending, TransferState::Failed) => true,
            (TransferState::Pending, TransferState::Cancelled) => true,
            (TransferState::InProgress, next) => next.is_terminal(),
            _ => false,
        };

        if !allowed {
            return Err(StatusError {
                item_id: self.item_id.clone(),
                from: self.state,
                to,
            });
        }

        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), StatusError> {
        self.transition(TransferState::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Byte counters only move while the transfer runs.
    pub fn record_progress(&mut self, bytes: u64, total: Option<u64>) -> Result<(), StatusError> {
        if self.state != TransferState::InProgress {
            return Err(StatusError {
                item_id: self.item_id.clone(),
                from: self.state,
                to: TransferState::InProgress,
            });
        }

        self.bytes_transferred = bytes;
        if total.is_some() {
            self.total_bytes = total;
        }
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), StatusError> {
        self.transition(TransferState::Completed)?;
        if self.total_bytes.is_none() {
            self.total_bytes = Some(self.bytes_transferred);
        }
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, failure: FailureInfo) -> Result<(), StatusError> {
        self.transition(TransferState::Failed)?;
        self.last_error = Some(failure);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), StatusError> {
        self.transition(TransferState::Cancelled)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Fraction in `0.0..=1.0`, when the total size is known
    pub fn progress(&self) -> Option<f64> {
        if self.state == TransferState::Completed {
            return Some(1.0);
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_transferred as f64 / total as f64).min(1.0))
            }
            _ => None,
        }
    }

    /// Short text for a progress cell
    pub fn progress_label(&self) -> String {
        match self.state {
            TransferState::Pending => "Waiting".to_string(),
            TransferState::Cancelled => "Cancelled".to_string(),
            TransferState::Failed => match &self.last_error {
                Some(failure) => format!("Failed: {}", failure.message),
                None => "Failed".to_string(),
            },
            TransferState::InProgress | TransferState::Completed => match self.total_bytes {
                Some(total) => format!(
                    "{} / {}",
                    format_bytes(self.bytes_transferred),
                    format_bytes(total)
                ),
                None => format_bytes(self.bytes_transferred),
            },
        }
    }
}

/// A verified download sitting at its canonical cache path

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalArtifact {
    pub item_id: ItemId,

    pub version: String,

    pub path: PathBuf,

    pub size: u64,

    /// Tagged digest computed while streaming, when one was expected
    pub checksum: Option<String>,

    /// Found already complete at the canonical path instead of downloaded
    pub reused: bool,
}

/// Final outcome for one item in a sync pass

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemOutcome {
    pub item_id: ItemId,

    pub state: TransferState,

    /// Transfer attempts made in this pass (1 when no retry happened)
    pub attempts: u32,

    pub error: Option<FailureInfo>,

    pub artifact_path: Option<PathBuf>,

    pub reused: bool,
}

impl ItemOutcome {
    pub fn fetched(artifact: &LocalArtifact, attempts: u32) -> Self {
        Self {
            item_id: artifact.item_id.clone(),
            state: TransferState::Completed,
            attempts,
            error: None,
            artifact_path: Some(artifact.path.clone()),
            reused: artifact.reused,
        }
    }

    pub fn failed(item_id: impl Into<ItemId>, attempts: u32, error: &FetchError) -> Self {
        Self {
            item_id: item_id.into(),
            state: TransferState::Failed,
            attempts,
            error: Some(FailureInfo::from(error)),
            artifact_path: None,
            reused: false,
        }
    }

    pub fn cancelled(item_id: impl Into<ItemId>, attempts: u32) -> Self {
        Self {
            item_id: item_id.into(),
            state: TransferState::Cancelled,
            attempts,
            error: None,
            artifact_path: None,
            reused: false,
        }
    }
}

/// Summary of one `synchronize` pass

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub up_to_date: usize,

    pub fetched: usize,

    pub failed: usize,

    pub cancelled: usize,

    pub gc_candidates: usize,

    /// Items skipped because a fetch for them was already running
    pub in_flight: usize,

    /// Catalog entries dropped as malformed
    pub rejected: usize,

    pub outcomes: BTreeMap<ItemId, ItemOutcome>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    pub graph_revision: u64,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            up_to_date: 0,
            fetched: 0,
            failed: 0,
            cancelled: 0,
            gc_candidates: 0,
            in_flight: 0,
            rejected: 0,
            outcomes: BTreeMap::new(),
            started_at,
            finished_at: started_at,
            graph_revision: 0,
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome.state {
            TransferState::Completed => self.fetched += 1,
            TransferState::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
        self.outcomes.insert(outcome.item_id.clone(), outcome);
    }

    /// Number of fetches scheduled in this pass
    pub fn scheduled(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome(&self, item_id: &str) -> Option<&ItemOutcome> {
        self.outcomes.get(item_id)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Result of a reachability sweep

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub items_removed: usize,

    pub configurations_removed: usize,

    pub files_removed: usize,

    pub bytes_freed: u64,

    /// Files left in the cache after the sweep
    pub cache_files: usize,

    pub cache_bytes: u64,

    pub graph_revision: u64,
}

/// Application error types

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for application operations

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FetchErrorKind) -> FailureInfo {
        FailureInfo {
            kind,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_status_happy_path() {
        let mut status = DownloadStatus::pending("video-1");
        assert_eq!(status.state(), TransferState::Pending);
        assert!(status.started_at().is_none());

        status.begin().unwrap();
        status.record_progress(512, Some(1024)).unwrap();
        assert_eq!(status.progress(), Some(0.5));

        status.complete().unwrap();
        assert_eq!(status.state(), TransferState::Completed);
        assert!(status.finished_at().is_some());
        assert!(status.last_error().is_none());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut status = DownloadStatus::pending("video-1");
        status.begin().unwrap();
        status
            .fail(failure(FetchErrorKind::ChecksumMismatch))
            .unwrap();

        assert!(status.begin().is_err());
        assert!(status.complete().is_err());
        assert!(status.cancel().is_err());
        assert!(status.record_progress(10, None).is_err());
        assert_eq!(status.state(), TransferState::Failed);
        assert_eq!(
            status.last_error().map(|f| f.kind),
            Some(FetchErrorKind::ChecksumMismatch)
        );
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_completed() {
        let mut status = DownloadStatus::pending("video-1");
        let err = status.complete().unwrap_err();
        assert_eq!(err.from, TransferState::Pending);
        assert_eq!(err.to, TransferState::Completed);

        status.cancel().unwrap();
        assert_eq!(status.state(), TransferState::Cancelled);
    }

    #[test]
    fn test_completion_fills_unknown_total() {
        let mut status = DownloadStatus::pending("page");
        status.begin().unwrap();
        status.record_progress(2048, None).unwrap();
        assert_eq!(status.progress(), None);
        assert_eq!(status.progress_label(), "2.0 KB");

        status.complete().unwrap();
        assert_eq!(status.total_bytes(), Some(2048));
        assert_eq!(status.progress(), Some(1.0));
    }

    #[test]
    fn test_progress_labels() {
        let mut status = DownloadStatus::pending("clip");
        assert_eq!(status.progress_label(), "Waiting");

        status.begin().unwrap();
        status
            .record_progress(1536 * 1024, Some(3 * 1024 * 1024))
            .unwrap();
        assert_eq!(status.progress_label(), "1.5 MB / 3.0 MB");

        status
            .fail(FailureInfo {
                kind: FetchErrorKind::PermanentFetch,
                message: "404 Not Found".to_string(),
            })
            .unwrap();
        assert_eq!(status.progress_label(), "Failed: 404 Not Found");
    }

    #[test]
    fn test_remote_item_cache_state_moves_together() {
        let mut item = RemoteItem::new("logo", "https://cdn/logo.png", ItemKind::Media, "v1");
        assert!(!item.is_cached());
        assert!(item.has_consistent_cache_state());

        item.mark_synced("v1", "/cache/logo/v1.png");
        assert!(item.is_current());
        assert_eq!(item.synced_version(), Some("v1"));

        item.remote_version = "v2".to_string();
        assert!(item.is_cached());
        assert!(!item.is_current());

        item.clear_cache();
        assert!(item.local_path().is_none());
        assert!(item.synced_version().is_none());
    }

    #[test]
    fn test_apply_entry_keeps_cache_state() {
        let mut item = RemoteItem::new("logo", "https://cdn/logo.png", ItemKind::Media, "v1");
        item.mark_synced("v1", "/cache/logo/v1.png");

        let entry = CatalogEntry::new("logo", "v2", "https://cdn/logo-v2.png").with_size(42);
        assert!(item.apply_entry(&entry));
        assert!(!item.apply_entry(&entry));

        assert_eq!(item.remote_version, "v2");
        assert_eq!(item.expected_size, Some(42));
        assert_eq!(item.synced_version(), Some("v1"));
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::new(Utc::now());
        let artifact = LocalArtifact {
            item_id: "a".into(),
            version: "v1".into(),
            path: PathBuf::from("/cache/a/v1"),
            size: 1,
            checksum: None,
            reused: false,
        };
        report.record(ItemOutcome::fetched(&artifact, 1));
        report.record(ItemOutcome::failed(
            "b",
            3,
            &crate::core::error_handling::errors::transient("timeout"),
        ));
        report.record(ItemOutcome::cancelled("c", 1));

        assert_eq!(report.fetched, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.scheduled(), 3);
        assert_eq!(report.outcome("b").map(|o| o.attempts), Some(3));
        assert!(!report.is_clean());
    }
}

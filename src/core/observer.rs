//! Publish interface toward the presentation layer

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::core::error_handling::FetchError;
use crate::core::models::{DownloadStatus, FailureInfo, ItemId, StatusError, SyncReport, TransferState};

/// Receives engine notifications. Calls are fire-and-forget and must not block.
pub trait PresentationObserver: Send + Sync {
    fn on_status_changed(&self, item_id: &str, status: &DownloadStatus);

    fn on_graph_updated(&self, report: &SyncReport);
}

/// Serializable form of an observer notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged {
        item_id: ItemId,
        status: DownloadStatus,
    },
    GraphUpdated {
        report: SyncReport,
    },
}

/// Forwards notifications into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PresentationObserver for ChannelObserver {
    fn on_status_changed(&self, item_id: &str, status: &DownloadStatus) {
        // a dropped receiver just means nobody is watching
        let _ = self.sender.send(SyncEvent::StatusChanged {
            item_id: item_id.to_string(),
            status: status.clone(),
        });
    }

    fn on_graph_updated(&self, report: &SyncReport) {
        let _ = self.sender.send(SyncEvent::GraphUpdated {
            report: report.clone(),
        });
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PresentationObserver for TracingObserver {
    fn on_status_changed(&self, item_id: &str, status: &DownloadStatus) {
        match status.state() {
            TransferState::Pending => debug!("⏳ {} queued", item_id),
            TransferState::InProgress => {
                trace!("⬇️  {} {}", item_id, status.progress_label())
            }
            TransferState::Completed => info!("✅ {} synced ({})", item_id, status.progress_label()),
            TransferState::Failed => warn!("❌ {} {}", item_id, status.progress_label()),
            TransferState::Cancelled => info!("🛑 {} cancelled", item_id),
        }
    }

    fn on_graph_updated(&self, report: &SyncReport) {
        info!(
            "📊 Sync pass finished: {} up to date, {} fetched, {} failed, {} cancelled, {} gc candidates (revision {})",
            report.up_to_date,
            report.fetched,
            report.failed,
            report.cancelled,
            report.gc_candidates,
            report.graph_revision
        );
    }
}

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PresentationObserver for NullObserver {
    fn on_status_changed(&self, _item_id: &str, _status: &DownloadStatus) {}

    fn on_graph_updated(&self, _report: &SyncReport) {}
}

/// Fans notifications out to several observers
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn PresentationObserver>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn PresentationObserver>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

impl PresentationObserver for ObserverSet {
    fn on_status_changed(&self, item_id: &str, status: &DownloadStatus) {
        for observer in self.observers.read().iter() {
            observer.on_status_changed(item_id, status);
        }
    }

    fn on_graph_updated(&self, report: &SyncReport) {
        for observer in self.observers.read().iter() {
            observer.on_graph_updated(report);
        }
    }
}

/// Current status of every item that has been scheduled at least once
pub type StatusRegistry = Arc<DashMap<ItemId, DownloadStatus>>;

/// Owner of one item's current `DownloadStatus`.
///
/// Every accepted transition is stored in the registry and published to the
/// observer. Rejected transitions are logged and leave the status unchanged.
pub struct StatusReporter {
    status: DownloadStatus,
    registry: StatusRegistry,
    observer: Arc<dyn PresentationObserver>,
}

impl StatusReporter {
    /// Schedule a fetch: publishes a fresh `pending` status
    pub fn schedule(
        item_id: impl Into<ItemId>,
        registry: StatusRegistry,
        observer: Arc<dyn PresentationObserver>,
    ) -> Self {
        let reporter = Self {
            status: DownloadStatus::pending(item_id),
            registry,
            observer,
        };
        reporter.publish();
        reporter
    }

    /// Start another attempt: the old status is replaced, not merged
    pub fn reschedule(&mut self) {
        self.status = DownloadStatus::pending(self.status.item_id());
        self.publish();
    }

    pub fn status(&self) -> &DownloadStatus {
        &self.status
    }

    pub fn state(&self) -> TransferState {
        self.status.state()
    }

    fn publish(&self) {
        let item_id = self.status.item_id();
        self.registry
            .insert(item_id.to_string(), self.status.clone());
        self.observer.on_status_changed(item_id, &self.status);
    }

    fn apply<F>(&mut self, change: F) -> bool
    where
        F: FnOnce(&mut DownloadStatus) -> Result<(), StatusError>,
    {
        match change(&mut self.status) {
            Ok(()) => {
                self.publish();
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    pub fn begin(&mut self) -> bool {
        self.apply(|status| status.begin())
    }

    pub fn progress(&mut self, bytes: u64, total: Option<u64>) -> bool {
        self.apply(|status| status.record_progress(bytes, total))
    }

    pub fn complete(&mut self) -> bool {
        self.apply(|status| status.complete())
    }

    pub fn fail(&mut self, error: &FetchError) -> bool {
        let failure = FailureInfo::from(error);
        self.apply(|status| status.fail(failure))
    }

    pub fn cancel(&mut self) -> bool {
        self.apply(|status| status.cancel())
    }

    /// Settle the status for a fetch that ended with `error`
    pub fn finish_with_error(&mut self, error: &FetchError) -> bool {
        match error {
            FetchError::Cancelled => self.cancel(),
            other => self.fail(other),
        }
    }
}

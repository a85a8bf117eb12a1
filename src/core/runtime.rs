//! Sync runtime command router.
//!
//! Polls the catalog on a fixed interval and serializes control calls from
//! the rest of the terminal. Passes run in their own tasks so cancellation
//! commands are served while a pass is still downloading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::core::catalog::CatalogSource;
use crate::core::coordinator::SyncCoordinator;
use crate::core::models::{AppError, AppResult, SweepReport, SyncReport};

/// Commands understood by the runtime router.
#[derive(Debug)]
pub enum RuntimeCommand {
    SyncNow {
        respond_to: oneshot::Sender<AppResult<SyncReport>>,
    },
    Cancel {
        item_id: String,
        respond_to: oneshot::Sender<AppResult<bool>>,
    },
    CancelAll {
        respond_to: oneshot::Sender<AppResult<usize>>,
    },
    Sweep {
        respond_to: oneshot::Sender<AppResult<SweepReport>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<AppResult<()>>,
    },
}

/// Handle exposed to the daemon and the presentation layer.
#[derive(Clone)]
pub struct SyncRuntimeHandle {
    sender: mpsc::Sender<RuntimeCommand>,
}

impl SyncRuntimeHandle {
    pub fn new(sender: mpsc::Sender<RuntimeCommand>) -> Self {
        Self { sender }
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> RuntimeCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| AppError::System(format!("Sync runtime unavailable: {}", e)))?;
        rx.await
            .map_err(|_| AppError::System("Sync runtime dropped response".into()))?
    }

    /// Fetch the catalog and run a pass now, waiting for its report
    pub async fn sync_now(&self) -> AppResult<SyncReport> {
        self.send_command(|tx| RuntimeCommand::SyncNow { respond_to: tx })
            .await
    }

    pub async fn cancel(&self, item_id: impl Into<String>) -> AppResult<bool> {
        let item_id = item_id.into();
        self.send_command(|tx| RuntimeCommand::Cancel {
            item_id,
            respond_to: tx,
        })
        .await
    }

    pub async fn cancel_all(&self) -> AppResult<usize> {
        self.send_command(|tx| RuntimeCommand::CancelAll { respond_to: tx })
            .await
    }

    pub async fn sweep(&self) -> AppResult<SweepReport> {
        self.send_command(|tx| RuntimeCommand::Sweep { respond_to: tx })
            .await
    }

    /// Cancel everything, wait for running passes, stop the router
    pub async fn shutdown(&self) -> AppResult<()> {
        self.send_command(|tx| RuntimeCommand::Shutdown { respond_to: tx })
            .await
    }
}

/// Spawn the router loop in the current tokio runtime. The first periodic
/// pass runs one `poll_interval` after start; call `sync_now` for an
/// immediate one.
pub fn spawn_sync_runtime(
    coordinator: Arc<SyncCoordinator>,
    source: Arc<dyn CatalogSource>,
    poll_interval: Duration,
) -> (SyncRuntimeHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    info!(
        "[RUNTIME] Starting sync runtime: catalog {} every {:?}",
        source.label(),
        poll_interval
    );

    let router = Router {
        coordinator,
        source,
        poll_interval,
        passes: JoinSet::new(),
        periodic_busy: Arc::new(AtomicBool::new(false)),
    };
    let join = tokio::spawn(router.run(rx));

    (SyncRuntimeHandle::new(tx), join)
}

/// Fetch the catalog and synchronize against it
async fn run_pass(
    coordinator: &SyncCoordinator,
    source: &dyn CatalogSource,
) -> AppResult<SyncReport> {
    let catalog = source.fetch_catalog().await.map_err(|e| {
        warn!(
            "Catalog {} unavailable, keeping current content: {}",
            source.label(),
            e
        );
        e
    })?;
    Ok(coordinator.synchronize(&catalog).await?)
}

struct Router {
    coordinator: Arc<SyncCoordinator>,
    source: Arc<dyn CatalogSource>,
    poll_interval: Duration,
    passes: JoinSet<()>,
    periodic_busy: Arc<AtomicBool>,
}

impl Router {
    async fn run(mut self, mut rx: mpsc::Receiver<RuntimeCommand>) {
        let start = Instant::now() + self.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.periodic_pass(),
                command = rx.recv() => match command {
                    Some(RuntimeCommand::Shutdown { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("[RUNTIME] Command channel closed");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(finished) = self.passes.join_next(), if !self.passes.is_empty() => {
                    if let Err(e) = finished {
                        warn!("[RUNTIME] Background task ended abnormally: {}", e);
                    }
                }
            }
        }

        info!("[RUNTIME] Sync runtime stopped");
    }

    fn periodic_pass(&mut self) {
        if self.periodic_busy.swap(true, Ordering::SeqCst) {
            debug!("[RUNTIME] Previous periodic pass still running; skipping tick");
            return;
        }

        let coordinator = self.coordinator.clone();
        let source = self.source.clone();
        let busy = self.periodic_busy.clone();
        self.passes.spawn(async move {
            let _ = run_pass(&coordinator, source.as_ref()).await;
            busy.store(false, Ordering::SeqCst);
        });
    }

    #[instrument(skip(self, command), fields(?command))]
    fn handle_command(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::SyncNow { respond_to } => {
                let coordinator = self.coordinator.clone();
                let source = self.source.clone();
                self.passes.spawn(async move {
                    let result = run_pass(&coordinator, source.as_ref()).await;
                    let _ = respond_to.send(result);
                });
            }
            RuntimeCommand::Cancel {
                item_id,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.coordinator.cancel(&item_id)));
            }
            RuntimeCommand::CancelAll { respond_to } => {
                let _ = respond_to.send(Ok(self.coordinator.cancel_all()));
            }
            RuntimeCommand::Sweep { respond_to } => {
                let coordinator = self.coordinator.clone();
                self.passes.spawn(async move {
                    let result = coordinator.sweep().await.map_err(AppError::from);
                    let _ = respond_to.send(result);
                });
            }
            RuntimeCommand::Shutdown { respond_to } => {
                // handled by the router loop
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn shutdown(&mut self) {
        let cancelled = self.coordinator.cancel_all();
        debug!(
            "[RUNTIME] Shutting down, waiting for {} task(s), {} fetch(es) cancelled",
            self.passes.len(),
            cancelled
        );
        while self.passes.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{Catalog, CatalogEntry, StaticCatalogSource};
    use crate::core::config::SyncConfig;
    use crate::core::models::TransferState;
    use crate::core::observer::NullObserver;
    use crate::core::store::MemoryStore;
    use crate::core::test_support::{Reply, ScriptedTransport};
    use tempfile::tempdir;

    fn runtime_parts(
        root: &std::path::Path,
    ) -> (Arc<SyncCoordinator>, Arc<ScriptedTransport>, Arc<StaticCatalogSource>) {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            SyncConfig::for_cache_root(root),
            Arc::new(MemoryStore::new()),
            transport.clone(),
            Arc::new(NullObserver),
        ));
        let source = Arc::new(StaticCatalogSource::new(Catalog::new(vec![
            CatalogEntry::new("logo", "v1", "https://cdn/logo.png"),
        ])));
        (coordinator, transport, source)
    }

    #[tokio::test]
    async fn test_sync_now_and_shutdown() {
        let dir = tempdir().unwrap();
        let (coordinator, transport, source) = runtime_parts(dir.path());
        transport.serve("https://cdn/logo.png", b"png".to_vec());

        let (handle, join) =
            spawn_sync_runtime(coordinator.clone(), source.clone(), Duration::from_secs(3600));

        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.fetched, 1);

        let again = handle.sync_now().await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.up_to_date, 1);

        assert!(!handle.cancel("logo").await.unwrap());

        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(handle.sync_now().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_served_while_a_pass_runs() {
        let dir = tempdir().unwrap();
        let (coordinator, transport, source) = runtime_parts(dir.path());
        transport.push("https://cdn/logo.png", Reply::stall_after(b"p".to_vec()));

        let (handle, join) =
            spawn_sync_runtime(coordinator.clone(), source.clone(), Duration::from_secs(3600));

        let pass = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.sync_now().await })
        };
        transport.wait_for_calls("https://cdn/logo.png", 1).await;

        assert_eq!(handle.cancel_all().await.unwrap(), 1);
        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            coordinator.status("logo").map(|s| s.state()),
            Some(TransferState::Cancelled)
        );

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_catalog_is_reported() {
        let dir = tempdir().unwrap();
        let (coordinator, _transport, _) = runtime_parts(dir.path());
        let source = Arc::new(crate::core::catalog::FileCatalogSource::new(
            dir.path().join("missing.json"),
        ));

        let (handle, join) = spawn_sync_runtime(coordinator, source, Duration::from_secs(3600));
        assert!(matches!(
            handle.sync_now().await,
            Err(AppError::Catalog(_))
        ));

        let sweep = handle.sweep().await.unwrap();
        assert_eq!(sweep.items_removed, 0);

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }
}

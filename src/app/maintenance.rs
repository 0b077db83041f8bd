//! Scheduled storage maintenance
//!
//! Background tasks that keep local storage within bounds: the age-based
//! auto cleanup configured by `auto_cleanup_enabled`/`auto_cleanup_days`, and
//! a quota check that logs when usage crosses the warning threshold. Tasks
//! stop on a shutdown broadcast; a cleanup in progress is interrupted before
//! its next deletion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::storage::{ChapterStorage, CleanupResult};
use crate::errors::StorageResult;

/// Run one auto cleanup pass if the storage configuration enables it
///
/// Returns `None` when auto cleanup is disabled.
pub async fn run_auto_cleanup(storage: &ChapterStorage) -> StorageResult<Option<CleanupResult>> {
    let config = storage.config();
    if !config.auto_cleanup_enabled {
        debug!("Auto cleanup disabled");
        return Ok(None);
    }
    let result = storage.cleanup_old_downloads(config.auto_cleanup_days).await?;
    Ok(Some(result))
}

/// Owner of the maintenance background tasks
pub struct MaintenanceTasks {
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    storage: Option<Arc<ChapterStorage>>,
}

impl Default for MaintenanceTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceTasks {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
            storage: None,
        }
    }

    /// Number of running tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start the periodic cleanup; does nothing when auto cleanup is disabled
    ///
    /// The first pass runs immediately.
    pub fn start_auto_cleanup(&mut self, storage: Arc<ChapterStorage>, every: Duration) -> bool {
        if !storage.config().auto_cleanup_enabled {
            return false;
        }

        self.storage = Some(Arc::clone(&storage));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match run_auto_cleanup(&storage).await {
                            Ok(Some(result)) if !result.deleted_chapters.is_empty() => {
                                info!(
                                    "Auto cleanup removed {} chapters ({} bytes)",
                                    result.deleted_chapters.len(),
                                    result.freed_space_bytes
                                );
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Auto cleanup failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Auto cleanup task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.tasks.push(task);
        true
    }

    /// Log a warning whenever usage is at or above the warning threshold
    pub fn start_quota_monitor(&mut self, storage: Arc<ChapterStorage>, every: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let status = storage.quota_status().await;
                        if status.is_warning() {
                            warn!("Storage quota {}", status);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Quota monitor received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.tasks.push(task);
    }

    /// Stop every task and wait for them
    pub async fn shutdown(self) {
        if let Some(storage) = &self.storage {
            storage.interrupt_cleanup();
        }
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
    }
}

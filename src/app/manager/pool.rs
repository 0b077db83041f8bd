//! Transfer dispatcher
//!
//! A background loop that drains queue admissions into manager transfers.
//! The queue enforces the concurrency limit; the dispatcher only reacts to
//! its wake-ups and keeps the handles of running transfers so shutdown can
//! wait for them.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::constants::downloads;
use crate::errors::{DownloadError, DownloadResult};

use super::core::{DownloadManager, TransferHandle, TransferOutcome};

/// Current state of the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum PoolState {
    /// Created but not started
    Created,
    /// Admitting and running transfers
    Running,
    /// Waiting for running transfers to finish
    ShuttingDown,
    /// Stopped
    Shutdown,
}

/// Runs queue admissions on the download manager
#[derive(Debug)]
pub struct DownloadPool {
    manager: Arc<DownloadManager>,
    dispatcher: Option<JoinHandle<Vec<TransferHandle>>>,
    shutdown_tx: broadcast::Sender<()>,
    state: PoolState,
}

impl DownloadPool {
    pub fn new(manager: Arc<DownloadManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            manager,
            dispatcher: None,
            shutdown_tx,
            state: PoolState::Created,
        }
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub fn state(&self) -> PoolState {
        self.state.clone()
    }

    /// Start the dispatcher loop
    pub fn start(&mut self) -> DownloadResult<()> {
        if self.state != PoolState::Created {
            return Err(DownloadError::ConfigurationError(format!(
                "Cannot start pool in state: {:?}",
                self.state
            )));
        }

        let manager = Arc::clone(&self.manager);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.dispatcher = Some(tokio::spawn(dispatch(manager, shutdown_rx)));
        self.state = PoolState::Running;
        info!(
            "Download pool started (limit {})",
            self.manager.queue().max_concurrent()
        );
        Ok(())
    }

    /// Stop admitting and wait for running transfers to finish
    pub async fn shutdown(mut self) -> DownloadResult<()> {
        if self.state == PoolState::Shutdown {
            return Ok(());
        }
        if self.state != PoolState::Running {
            warn!("Shutting down pool in state: {:?}", self.state);
        }

        self.state = PoolState::ShuttingDown;
        info!("Shutting down download pool");
        let _ = self.shutdown_tx.send(());

        let handles = match self.dispatcher.take() {
            Some(dispatcher) => match dispatcher.await {
                Ok(handles) => handles,
                Err(e) => {
                    error!("Dispatcher panicked: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut error_count = 0;
        for handle in handles {
            let id = handle.id().to_string();
            if let TransferOutcome::Failed(e) = handle.wait().await {
                debug!("Transfer {} failed: {}", id, e);
                error_count += 1;
            }
        }
        if error_count > 0 {
            warn!("{} transfers failed during shutdown", error_count);
        }

        self.state = PoolState::Shutdown;
        info!("Download pool shutdown complete");
        Ok(())
    }

    /// Pause running transfers, then shut down
    ///
    /// Paused items keep their staged pages and stay in the persisted
    /// backlog.
    pub async fn pause_and_shutdown(self) -> DownloadResult<()> {
        let paused = self.manager.pause_all().await;
        if paused > 0 {
            info!("Paused {} running transfers", paused);
        }
        self.shutdown().await
    }
}

async fn dispatch(
    manager: Arc<DownloadManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Vec<TransferHandle> {
    let queue = Arc::clone(manager.queue());
    let mut running: Vec<TransferHandle> = Vec::new();

    loop {
        running.retain(|handle| !handle.is_finished());

        loop {
            match queue.dequeue_next().await {
                Ok(Some(item)) => {
                    let id = item.id.clone();
                    match manager.start(item).await {
                        Ok(handle) => running.push(handle),
                        // cancelled or paused between admission and start
                        Err(DownloadError::NotAdmitted { .. }) => {
                            debug!("Skipping {}, no longer admitted", id);
                        }
                        Err(e) => {
                            warn!("Could not start {}: {}", id, e);
                            if let Err(e) = queue.mark_failed(&id, &e.to_string()).await {
                                warn!("Could not mark {} failed: {}", id, e);
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Queue admission failed: {}", e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => return running,
                        _ = tokio::time::sleep(downloads::DISPATCH_ERROR_SLEEP) => {}
                    }
                    break;
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Dispatcher received shutdown signal");
                return running;
            }
            _ = queue.wait_for_work() => {}
        }
    }
}

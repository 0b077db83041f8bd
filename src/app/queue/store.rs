//! Persisted queue backlog
//!
//! The backlog is a small JSON document rewritten atomically after every
//! queue mutation, so pending work survives a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::app::storage::write_atomic;
use crate::errors::{QueueError, QueueResult};

use super::state::QueueEntry;

const BACKLOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct BacklogDocument {
    version: u32,
    entries: Vec<QueueEntry>,
}

/// File-backed backlog
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the backlog; a missing file is an empty backlog
    pub async fn load(&self) -> QueueResult<Vec<QueueEntry>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(QueueError::Persistence {
                    reason: format!("cannot read {}: {}", self.path.display(), e),
                })
            }
        };

        match serde_json::from_slice::<BacklogDocument>(&bytes) {
            Ok(document) => {
                debug!("Loaded {} backlog entries", document.entries.len());
                Ok(document.entries)
            }
            Err(e) => {
                // an unreadable backlog must not block startup
                warn!(
                    "Discarding unreadable backlog {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn save(&self, entries: Vec<QueueEntry>) -> QueueResult<()> {
        let document = BacklogDocument {
            version: BACKLOG_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| QueueError::Persistence {
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, bytes)
            .await
            .map_err(|e| QueueError::Persistence {
                reason: e.to_string(),
            })
    }
}

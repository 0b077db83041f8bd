//! Persisted chapter record index
//!
//! All [`ChapterRecord`]s live in one JSON document that is rewritten
//! atomically on every mutation. A damaged index is moved aside instead of
//! being overwritten so it can be inspected later.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info};

use crate::app::models::{ChapterKey, ChapterRecord};
use crate::constants::storage;
use crate::errors::{StorageError, StorageResult};

use super::path::write_atomic;

/// Chapter records keyed by identity
pub type RecordMap = BTreeMap<ChapterKey, ChapterRecord>;

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    format_version: u32,
    records: Vec<ChapterRecord>,
}

/// Read the index, treating a missing file as empty
pub async fn load_index(path: &Path) -> StorageResult<RecordMap> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No record index at {}, starting empty", path.display());
            return Ok(RecordMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    let document: IndexDocument =
        serde_json::from_slice(&bytes).map_err(|e| StorageError::IndexCorrupted {
            reason: e.to_string(),
        })?;

    if document.format_version > storage::FORMAT_VERSION {
        return Err(StorageError::IndexCorrupted {
            reason: format!(
                "index format {} is newer than supported format {}",
                document.format_version,
                storage::FORMAT_VERSION
            ),
        });
    }

    Ok(document
        .records
        .into_iter()
        .map(|record| (record.key(), record))
        .collect())
}

/// Load the index, moving an unreadable one aside and starting empty
pub async fn load_or_recover(path: &Path) -> StorageResult<RecordMap> {
    match load_index(path).await {
        Ok(records) => Ok(records),
        Err(StorageError::IndexCorrupted { reason }) => {
            let backup = path.with_extension(format!("corrupt-{}", Utc::now().timestamp()));
            error!(
                "Record index corrupted ({}), moving it to {}",
                reason,
                backup.display()
            );
            fs::rename(path, &backup).await?;
            Ok(RecordMap::new())
        }
        Err(e) => Err(e),
    }
}

/// Atomically replace the index with `records`
pub async fn save_index(path: &Path, records: &RecordMap) -> StorageResult<()> {
    let document = IndexDocument {
        format_version: storage::FORMAT_VERSION,
        records: records.values().cloned().collect(),
    };
    let bytes = serde_json::to_vec_pretty(&document)?;
    write_atomic(path, bytes).await?;
    debug!("Saved record index with {} chapters", records.len());
    Ok(())
}

/// Log a one-line summary after opening
pub fn log_summary(path: &Path, records: &RecordMap) {
    info!(
        "Loaded {} chapter records from {}",
        records.len(),
        path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::{PageAsset, PageStatus};
    use tempfile::TempDir;

    fn record(content: &str, chapter: &str) -> ChapterRecord {
        let mut page = PageAsset::pending(1, "https://example.com/1.jpg");
        page.status = PageStatus::Completed;
        page.size_bytes = 10;
        ChapterRecord::new(&ChapterKey::new(content, chapter), None, vec![page])
    }

    #[tokio::test]
    async fn test_missing_index_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let records = load_index(&temp_dir.path().join("records.json"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("records.json");

        let mut records = RecordMap::new();
        for r in [record("a", "1"), record("a", "2"), record("b", "1")] {
            records.insert(r.key(), r);
        }
        save_index(&path, &records).await.unwrap();

        let loaded = load_index(&path).await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_corrupt_index_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("records.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            load_index(&path).await,
            Err(StorageError::IndexCorrupted { .. })
        ));

        let records = load_or_recover(&path).await.unwrap();
        assert!(records.is_empty());
        assert!(!path.exists());
        let moved = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(moved, 1);
    }
}

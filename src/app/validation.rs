//! Download validation and repair
//!
//! Integrity checks over chapters held by [`ChapterStorage`]. A full
//! validation reads every page file, checks its image signature and its
//! content hash, and writes the resulting score back onto the chapter record.
//! The offline readiness check only looks at file metadata and is cheap
//! enough to run before opening a chapter. Repair refetches the damaged pages
//! and replaces them in place, leaving valid pages untouched.
//!
//! Integrity score: `100 - 10 * missing - 5 * corrupt`, floored at 0.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::app::hash::Md5Hash;
use crate::app::manager::{PageDownloader, TransferControl};
use crate::app::models::{ChapterKey, ChapterRecord, PageAsset, PageImage};
use crate::app::sources::Connectivity;
use crate::app::storage::{ChapterStorage, ImageFormat};
use crate::constants::{storage, validation};
use crate::errors::{ValidationError, ValidationResult};

/// Which checks a validation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Compare file contents with the stored content hash
    pub verify_checksums: bool,
    /// Require a recognised image signature
    pub check_format: bool,
    /// Write score and errors onto the chapter record
    pub record_result: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            check_format: true,
            record_result: true,
        }
    }
}

/// What the user should do about a chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    Repair,
    Redownload,
}

/// Problem found on one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageIssue {
    pub page_number: u32,
    pub reason: String,
}

/// Result of [`ValidationService::validate_chapter_integrity`]
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub integrity_score: u8,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub missing_pages: Vec<PageIssue>,
    pub corrupted_pages: Vec<PageIssue>,
    pub pages_checked: usize,
    #[serde(skip)]
    pub validation_time: Duration,
}

impl ValidationReport {
    /// Page numbers that need refetching, ascending
    pub fn damaged_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .missing_pages
            .iter()
            .chain(self.corrupted_pages.iter())
            .map(|issue| issue.page_number)
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

/// Result of [`ValidationService::validate_for_offline_reading`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineReadiness {
    pub can_read: bool,
    pub missing_pages: Vec<u32>,
    pub corrupted_pages: Vec<u32>,
}

/// Result of [`ValidationService::repair_corrupted_chapter`]
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub repaired_pages: Vec<u32>,
    pub failed_pages: Vec<PageIssue>,
    /// Validation run after the repair
    pub validation: ValidationReport,
}

impl RepairReport {
    pub fn is_fully_repaired(&self) -> bool {
        self.failed_pages.is_empty() && self.validation.is_valid
    }
}

/// Integrity score from issue counts
pub fn integrity_score(missing: usize, corrupt: usize) -> u8 {
    let penalty = missing as u64 * validation::MISSING_PAGE_WEIGHT as u64
        + corrupt as u64 * validation::CORRUPT_PAGE_WEIGHT as u64;
    100u64.saturating_sub(penalty) as u8
}

fn recommend(total: usize, damaged: usize) -> RecommendedAction {
    if damaged == 0 {
        RecommendedAction::None
    } else if total == 0 || damaged as f64 / total as f64 > validation::REDOWNLOAD_RATIO {
        RecommendedAction::Redownload
    } else {
        RecommendedAction::Repair
    }
}

/// Page file state as seen from metadata only
enum PageFile {
    Missing(String),
    Present(u64),
}

async fn stat_page(page: &PageAsset) -> PageFile {
    if !page.is_completed() {
        return PageFile::Missing(format!("page status is {:?}", page.status));
    }
    let Some(path) = page.local_path.as_deref() else {
        return PageFile::Missing("no local file recorded".to_string());
    };
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => PageFile::Present(meta.len()),
        Ok(_) => PageFile::Missing(format!("{} is not a file", path)),
        Err(_) => PageFile::Missing(format!("{} not found", path)),
    }
}

/// Cheap checks shared by both validation paths
fn check_size(page: &PageAsset, actual: u64) -> Option<String> {
    if actual == 0 {
        Some("file is empty".to_string())
    } else if actual != page.size_bytes {
        Some(format!(
            "size is {} bytes, expected {}",
            actual, page.size_bytes
        ))
    } else if actual < validation::MIN_PAGE_BYTES {
        Some(format!("file is implausibly small ({} bytes)", actual))
    } else {
        None
    }
}

/// Validation Service over stored chapters
pub struct ValidationService {
    storage: Arc<ChapterStorage>,
    downloader: PageDownloader,
    connectivity: Arc<dyn Connectivity>,
}

impl std::fmt::Debug for ValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationService")
            .field("root", &self.storage.root())
            .finish_non_exhaustive()
    }
}

impl ValidationService {
    pub fn new(
        storage: Arc<ChapterStorage>,
        downloader: PageDownloader,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            storage,
            downloader,
            connectivity,
        }
    }

    async fn record_for(&self, key: &ChapterKey) -> ValidationResult<ChapterRecord> {
        self.storage
            .get_record(key)
            .await
            .ok_or_else(|| ValidationError::NotDownloaded {
                content_id: key.content_id.clone(),
                chapter: key.chapter.clone(),
            })
    }

    /// Score a stored chapter and report every problem found
    ///
    /// # Errors
    ///
    /// `ValidationError::NotDownloaded` if the chapter has no record.
    pub async fn validate_chapter_integrity(
        &self,
        key: &ChapterKey,
        options: ValidationOptions,
    ) -> ValidationResult<ValidationReport> {
        let started = Instant::now();
        let record = self.record_for(key).await?;

        let mut missing_pages = Vec::new();
        let mut corrupted_pages = Vec::new();
        let mut warnings = Vec::new();

        if record.format_version < storage::FORMAT_VERSION {
            warnings.push(format!(
                "stored with format version {}, current is {}",
                record.format_version,
                storage::FORMAT_VERSION
            ));
        }
        if record.page_count != record.pages.len() {
            warnings.push(format!(
                "record lists {} pages but holds {}",
                record.page_count,
                record.pages.len()
            ));
        }

        for page in &record.pages {
            let size = match stat_page(page).await {
                PageFile::Missing(reason) => {
                    missing_pages.push(PageIssue {
                        page_number: page.page_number,
                        reason,
                    });
                    continue;
                }
                PageFile::Present(size) => size,
            };

            if let Some(reason) = check_size(page, size) {
                corrupted_pages.push(PageIssue {
                    page_number: page.page_number,
                    reason,
                });
                continue;
            }

            if options.check_format || options.verify_checksums {
                if let Some(reason) = self.inspect_contents(page, options, &mut warnings).await {
                    corrupted_pages.push(PageIssue {
                        page_number: page.page_number,
                        reason,
                    });
                }
            }
        }

        let score = integrity_score(missing_pages.len(), corrupted_pages.len());
        let errors: Vec<String> = missing_pages
            .iter()
            .map(|issue| format!("page {} missing: {}", issue.page_number, issue.reason))
            .chain(
                corrupted_pages
                    .iter()
                    .map(|issue| format!("page {} corrupted: {}", issue.page_number, issue.reason)),
            )
            .collect();

        let report = ValidationReport {
            is_valid: errors.is_empty(),
            integrity_score: score,
            recommended_action: recommend(
                record.pages.len(),
                missing_pages.len() + corrupted_pages.len(),
            ),
            errors,
            warnings,
            missing_pages,
            corrupted_pages,
            pages_checked: record.pages.len(),
            validation_time: started.elapsed(),
        };

        if options.record_result {
            self.storage
                .record_validation(key, report.integrity_score, report.errors.clone())
                .await?;
        }

        if report.is_valid {
            debug!(content_id = %key.content_id, chapter = %key.chapter, "Chapter is intact");
        } else {
            warn!(
                content_id = %key.content_id,
                chapter = %key.chapter,
                "Integrity score {} ({} problems)",
                report.integrity_score,
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Read one page file and check its signature and hash
    async fn inspect_contents(
        &self,
        page: &PageAsset,
        options: ValidationOptions,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let path = page.local_path.as_deref()?;
        let bytes = match fs::read(Path::new(path)).await {
            Ok(bytes) => bytes,
            Err(e) => return Some(format!("unreadable: {}", e)),
        };

        let mut problems = Vec::new();
        if options.check_format && ImageFormat::sniff(&bytes).is_none() {
            problems.push("not a recognised image".to_string());
        }
        if options.verify_checksums {
            match &page.content_hash {
                Some(expected) if !expected.matches(&bytes) => problems.push(format!(
                    "checksum mismatch (expected {}, found {})",
                    expected,
                    Md5Hash::compute(&bytes)
                )),
                Some(_) => {}
                None => warnings.push(format!("page {} has no stored checksum", page.page_number)),
            }
        }

        if problems.is_empty() {
            None
        } else {
            Some(problems.join(", "))
        }
    }

    /// Metadata-only check run before opening a chapter offline
    pub async fn validate_for_offline_reading(&self, key: &ChapterKey) -> OfflineReadiness {
        let Some(record) = self.storage.get_record(key).await else {
            return OfflineReadiness {
                can_read: false,
                missing_pages: Vec::new(),
                corrupted_pages: Vec::new(),
            };
        };

        let mut missing_pages = Vec::new();
        let mut corrupted_pages = Vec::new();
        for page in &record.pages {
            match stat_page(page).await {
                PageFile::Missing(_) => missing_pages.push(page.page_number),
                PageFile::Present(size) => {
                    if check_size(page, size).is_some() {
                        corrupted_pages.push(page.page_number);
                    }
                }
            }
        }

        OfflineReadiness {
            can_read: !record.pages.is_empty()
                && missing_pages.is_empty()
                && corrupted_pages.is_empty(),
            missing_pages,
            corrupted_pages,
        }
    }

    /// Refetch damaged pages of a stored chapter
    ///
    /// `pages` names the pages to refetch, usually
    /// [`ValidationReport::damaged_pages`] of a prior validation. When empty,
    /// a validation is run first to find them.
    ///
    /// # Errors
    ///
    /// `ValidationError::RepairUnavailable` while the device is offline.
    pub async fn repair_corrupted_chapter(
        &self,
        key: &ChapterKey,
        pages: &[u32],
    ) -> ValidationResult<RepairReport> {
        if !self.connectivity.is_online() {
            return Err(ValidationError::RepairUnavailable {
                reason: "device is offline".to_string(),
            });
        }

        let record = self.record_for(key).await?;
        let targets = if pages.is_empty() {
            let options = ValidationOptions {
                record_result: false,
                ..Default::default()
            };
            self.validate_chapter_integrity(key, options)
                .await?
                .damaged_pages()
        } else {
            pages.to_vec()
        };

        let control = TransferControl::new();
        let mut repaired_pages = Vec::new();
        let mut failed_pages = Vec::new();

        for page_number in targets {
            let Some(asset) = record.pages.iter().find(|p| p.page_number == page_number) else {
                failed_pages.push(PageIssue {
                    page_number,
                    reason: format!("chapter has no page {}", page_number),
                });
                continue;
            };

            let fetched = self.downloader.fetch(&asset.source_url, &control).await;
            let outcome = match fetched {
                Ok(bytes) => self
                    .storage
                    .replace_page(
                        key,
                        PageImage {
                            page_number,
                            source_url: asset.source_url.clone(),
                            bytes,
                        },
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(()) => repaired_pages.push(page_number),
                Err(reason) => {
                    warn!(
                        content_id = %key.content_id,
                        chapter = %key.chapter,
                        page = page_number,
                        "Repair failed: {}",
                        reason
                    );
                    failed_pages.push(PageIssue {
                        page_number,
                        reason,
                    });
                }
            }
        }

        let validation = self
            .validate_chapter_integrity(key, ValidationOptions::default())
            .await?;
        info!(
            content_id = %key.content_id,
            chapter = %key.chapter,
            "Repaired {} pages, {} failed, score now {}",
            repaired_pages.len(),
            failed_pages.len(),
            validation.integrity_score
        );

        Ok(RepairReport {
            repaired_pages,
            failed_pages,
            validation,
        })
    }
}

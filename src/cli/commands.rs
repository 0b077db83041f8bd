//! Command handlers for Chapter Fetcher CLI
//!
//! This module implements the command handlers that connect CLI arguments to
//! the download engine.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::app::client::SourceClient;
use crate::app::events::EventEmitter;
use crate::app::manager::PageDownloader;
use crate::app::models::{compare_chapters, ChapterKey};
use crate::app::sources::NetworkMonitor;
use crate::app::storage::format_bytes;
use crate::app::validation::{RecommendedAction, ValidationOptions, ValidationReport, ValidationService};
use crate::cli::args::validate_cleanup_days;
use crate::cli::startup::{open_queue, open_storage, show_startup_status, Engine};
use crate::cli::{
    DownloadArgs, ProgressConfig, ProgressDisplay, ProgressEvent, QueueAction, QueueArgs,
    StorageAction, StorageArgs, ValidateArgs,
};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};

/// Handle the download command
///
/// Starts a batch session for the selected chapters and renders its progress
/// until the session is idle again. Ctrl-C cancels the session; completed
/// chapters are kept.
pub async fn handle_download(args: DownloadArgs, mut config: AppConfig, quiet: bool) -> Result<()> {
    let start_time = Instant::now();
    args.validate().map_err(AppError::generic)?;

    if let Some(concurrent) = args.concurrent {
        config.downloads.max_concurrent_downloads = concurrent;
    }
    if let Some(quality) = args.quality() {
        config.downloads.quality = quality;
    }

    let engine = Engine::start(config).await?;
    if !engine.status.is_ready() {
        let summary = engine.status.summary();
        engine.shutdown().await?;
        return Err(AppError::generic(summary));
    }
    if !quiet && engine.status.recovered_items() > 0 {
        show_startup_status(&engine.status);
    }

    let selection = args.selection();
    info!("Downloading {} of {}", selection, args.content_id);

    let mut progress = ProgressDisplay::new(ProgressConfig {
        enable_progress_bars: !quiet,
        ..Default::default()
    });

    let started = match engine
        .orchestrator
        .start_batch_download(&args.content_id, selection)
        .await
    {
        Ok(view) => view,
        Err(e) => {
            engine.shutdown().await?;
            return Err(e.into());
        }
    };
    progress.start(&started).await.map_err(AppError::Download)?;

    let tx = progress
        .sender()
        .ok_or_else(|| AppError::generic("Progress display did not start"))?;
    let events_tx = tx.clone();
    let events = engine.emitter.subscribe_content(&args.content_id, move |event| {
        let _ = events_tx.send(ProgressEvent::Chapter(event.clone()));
    });
    let state = engine.orchestrator.subscribe_state(&args.content_id, move |view| {
        let _ = tx.send(ProgressEvent::Session(view.clone()));
    });

    let orchestrator = Arc::clone(&engine.orchestrator);
    let content_id = args.content_id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n🛑 Ctrl-C received - cancelling remaining chapters");
            if let Err(e) = orchestrator.cancel_batch_download(&content_id).await {
                warn!("Cancel failed: {}", e);
            }
        }
    });

    let finished = engine.orchestrator.wait_for_idle(&args.content_id).await;
    interrupt.abort();
    state.unsubscribe();
    events.unsubscribe();
    progress.finish(&finished).await.map_err(AppError::Download)?;

    info!(
        "Batch for {} finished in {:?}: {}",
        args.content_id,
        start_time.elapsed(),
        finished.message
    );
    engine.shutdown().await?;

    if finished.storage_full {
        return Err(AppError::generic(finished.message));
    }
    Ok(())
}

/// Handle storage management commands
pub async fn handle_storage(args: StorageArgs, config: AppConfig) -> Result<()> {
    let storage = open_storage(&config).await?;

    match args.action {
        StorageAction::Stats => {
            let stats = storage.get_storage_stats().await;

            println!("💾 Storage Information");
            println!("=====================");
            println!("Location: {}", storage.root().display());
            println!("Chapters: {}", stats.chapter_count);
            println!("Content items: {}", stats.distinct_content_count);
            println!(
                "Used: {} of {} ({:.1}%)",
                stats.format_total_size(),
                format_bytes(stats.max_storage_size),
                stats.usage_percentage()
            );
            println!("Available: {}", stats.format_available_space());
            if let Some(oldest) = stats.oldest_download_at {
                println!("Oldest download: {}", oldest.format("%Y-%m-%d %H:%M"));
            }
            println!("Quota: {}", stats.quota_status());
        }
        StorageAction::List { content_id } => {
            let mut records: Vec<_> = storage
                .list_records()
                .await
                .into_iter()
                .filter(|r| content_id.as_ref().map_or(true, |c| &r.content_id == c))
                .collect();
            records.sort_by(|a, b| {
                a.content_id
                    .cmp(&b.content_id)
                    .then_with(|| compare_chapters(&a.chapter, &b.chapter))
            });

            if records.is_empty() {
                println!("No chapters stored");
                return Ok(());
            }

            println!("{:<24} {:>8} {:>6} {:>10} {:>6}  Downloaded", "Content", "Chapter", "Pages", "Size", "Score");
            println!("{}", "-".repeat(78));
            for record in &records {
                let score = record
                    .integrity_score
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:>8} {:>6} {:>10} {:>6}  {}",
                    record.content_id,
                    record.chapter,
                    record.page_count,
                    format_bytes(record.total_size_bytes),
                    score,
                    record.downloaded_at.format("%Y-%m-%d")
                );
            }
            println!("{}", "-".repeat(78));
            println!("{} chapters", records.len());
        }
        StorageAction::Cleanup { days } => {
            let days = validate_cleanup_days(days).map_err(AppError::generic)?;

            println!("🧹 Storage Cleanup");
            println!("=================");
            let result = storage.cleanup_old_downloads(days).await?;
            for key in &result.deleted_chapters {
                println!("🗑️  {}", key);
            }
            println!(
                "Removed {} chapters older than {} days, freed {}",
                result.deleted_chapters.len(),
                days,
                format_bytes(result.freed_space_bytes)
            );
            if result.interrupted {
                println!("⚠️  Cleanup was interrupted before finishing");
            }
        }
        StorageAction::Delete {
            content_id,
            chapter,
        } => {
            let key = ChapterKey::new(content_id, chapter);
            match storage.delete_chapter(&key).await? {
                Some(record) => println!(
                    "🗑️  Deleted {} ({})",
                    key,
                    format_bytes(record.total_size_bytes)
                ),
                None => println!("Chapter {} is not stored", key),
            }
        }
    }

    Ok(())
}

fn print_report(key: &ChapterKey, report: &ValidationReport) {
    let verdict = if report.is_valid { "✅ valid" } else { "❌ damaged" };
    println!("🔍 {}: {}", key, verdict);
    println!("   Integrity score: {}/100", report.integrity_score);
    println!(
        "   Pages checked: {} in {:?}",
        report.pages_checked, report.validation_time
    );
    for issue in report.missing_pages.iter().chain(&report.corrupted_pages) {
        println!("   Page {}: {}", issue.page_number, issue.reason);
    }
    for warning in &report.warnings {
        println!("   ⚠️  {}", warning);
    }
    match report.recommended_action {
        RecommendedAction::None => {}
        RecommendedAction::Repair => println!("   Recommended: repair (--repair)"),
        RecommendedAction::Redownload => println!("   Recommended: download the chapter again"),
    }
}

/// Handle the validate command
pub async fn handle_validate(args: ValidateArgs, config: AppConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    let client = Arc::new(SourceClient::new(&config.client_config())?);
    let validation = ValidationService::new(
        storage,
        PageDownloader::new(client, config.manager_config()),
        Arc::new(NetworkMonitor::default()),
    );

    let key = ChapterKey::new(args.content_id, args.chapter);
    let report = validation
        .validate_chapter_integrity(&key, ValidationOptions::default())
        .await?;
    print_report(&key, &report);

    if !args.repair || report.is_valid {
        return Ok(());
    }

    println!();
    println!("🔧 Repairing {} pages...", report.damaged_pages().len());
    let repair = validation.repair_corrupted_chapter(&key, &[]).await?;
    for page in &repair.repaired_pages {
        println!("   Page {}: repaired", page);
    }
    for issue in &repair.failed_pages {
        println!("   Page {}: {}", issue.page_number, issue.reason);
    }
    print_report(&key, &repair.validation);

    if !repair.is_fully_repaired() {
        return Err(AppError::generic(format!(
            "{} pages could not be repaired",
            repair.failed_pages.len()
        )));
    }
    Ok(())
}

/// Handle queue inspection commands
pub async fn handle_queue(args: QueueArgs, config: AppConfig) -> Result<()> {
    match args.action {
        QueueAction::Status => {
            let storage = open_storage(&config).await?;
            let queue = open_queue(&config, storage.root(), EventEmitter::new()).await?;
            let status = queue.status().await;

            println!("📋 Download Queue");
            println!("================");
            println!("Total: {}", status.total_items);
            println!("Queued: {}", status.queued_count);
            println!("Paused: {}", status.paused_count);
            println!("Failed: {}", status.failed_count);
            println!("Completed: {}", status.completed_count);
            println!("Max concurrent: {}", queue.max_concurrent());

            let unfinished: Vec<_> = queue
                .entries()
                .await
                .into_iter()
                .filter(|e| !e.status.is_terminal())
                .collect();
            if !unfinished.is_empty() {
                println!();
                for entry in unfinished {
                    match &entry.last_error {
                        Some(error) => println!("  {} [{}] {}", entry.item.id, entry.status, error),
                        None => println!("  {} [{}]", entry.item.id, entry.status),
                    }
                }
            }
        }
    }
    Ok(())
}

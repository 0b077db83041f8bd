//! End-to-end batch sessions over in-memory sources

mod fakes;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;

use chapter_fetcher::app::events::EventEmitter;
use chapter_fetcher::app::models::WorkItem;
use chapter_fetcher::app::orchestrator::ChapterSelection;
use chapter_fetcher::app::queue::{DownloadQueue, QueueConfig};
use fakes::{FakeSandbox, FakeSource, HarnessBuilder};

#[tokio::test]
async fn test_retry_resolves_only_failed_chapters() {
    let source = FakeSource::new(false).with_content("berserk", &["1", "2", "3"]);
    source.break_chapter("berserk", "2");
    let h = HarnessBuilder::new(source).build().await;

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    let first = h.finish("berserk").await;
    assert_eq!(first.failed_chapters, vec!["2"]);
    assert_eq!(first.completed_chapters, 2);
    assert!(!first.is_success());
    assert!(h.is_stored("berserk", "1").await);
    assert!(!h.is_stored("berserk", "2").await);

    let resolved_before = h.source.resolved().len();
    h.source.repair_all();
    h.orchestrator.retry_failed_chapters("berserk").await.unwrap();
    let second = h.finish("berserk").await;

    assert!(second.is_success());
    assert_eq!(second.completed_chapters, 3);
    assert!(h.is_stored("berserk", "2").await);

    let resolved_after = h.source.resolved();
    let retried = &resolved_after[resolved_before..];
    assert!(!retried.is_empty());
    assert!(retried.iter().all(|chapter| chapter == "2"));
}

#[tokio::test]
async fn test_token_derivations_are_single_flight_across_sessions() {
    let source = FakeSource::new(true)
        .with_content("berserk", &["1", "2", "3"])
        .with_content("vagabond", &["1", "2", "3"]);
    let h = HarnessBuilder::new(source)
        .sandbox(FakeSandbox::with_delay(Duration::from_millis(10)))
        .build()
        .await;

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    h.orchestrator
        .start_batch_download("vagabond", ChapterSelection::All)
        .await
        .unwrap();

    assert!(h.finish("berserk").await.is_success());
    assert!(h.finish("vagabond").await.is_success());

    assert_eq!(h.sandbox.calls.load(Ordering::SeqCst), 6);
    assert_eq!(h.sandbox.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(h
        .source
        .tokens_seen()
        .iter()
        .all(|t| t.as_deref().is_some_and(|t| t.starts_with("token-for-"))));
}

#[tokio::test]
async fn test_active_chapters_bounded_by_queue_limit() {
    let source = FakeSource::new(false)
        .with_content("berserk", &["1", "2", "3", "4", "5"])
        .with_page_delay(Duration::from_millis(20));
    let h = HarnessBuilder::new(source).max_concurrent(2).build().await;

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    let done = h.finish("berserk").await;

    assert!(done.is_success());
    assert_eq!(done.completed_chapters, 5);
    assert_eq!(h.source.max_active_chapters(), 2);
    assert_eq!(h.manager.queue().status().await.active_count, 0);
}

#[tokio::test]
async fn test_selection_plans_matching_chapters_in_order() {
    let source = FakeSource::new(false)
        .with_content("berserk", &["10", "1", "2.5", "2", "3", "4"])
        .with_content("vagabond", &["1", "2", "3", "extra"]);
    let h = HarnessBuilder::new(source).build().await;

    let ranged = h
        .orchestrator
        .start_batch_download("berserk", ChapterSelection::range(3.0, 2.0))
        .await
        .unwrap();
    assert_eq!(ranged.planned_chapters, vec!["2", "2.5", "3"]);

    let up_to = h
        .orchestrator
        .start_batch_download("vagabond", ChapterSelection::UpTo(2.0))
        .await
        .unwrap();
    assert_eq!(up_to.planned_chapters, vec!["1", "2"]);

    assert!(h.finish("berserk").await.is_success());
    assert!(h.finish("vagabond").await.is_success());
    assert!(h.is_stored("berserk", "2.5").await);
    assert!(!h.is_stored("berserk", "4").await);
    assert!(!h.is_stored("vagabond", "3").await);
}

#[tokio::test]
async fn test_hard_quota_reports_storage_full() {
    let source = FakeSource::new(false).with_content("berserk", &["1", "2"]);
    let h = HarnessBuilder::new(source).hard_quota(50).build().await;

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    let done = h.finish("berserk").await;

    assert!(done.storage_full);
    assert!(!done.is_success());
    assert!(done.message.starts_with("Storage is full"));
    assert!(!h.is_stored("berserk", "1").await);
    assert_eq!(h.storage.get_storage_stats().await.chapter_count, 0);
}

#[tokio::test]
async fn test_cancel_running_session_keeps_no_partial_chapters() {
    let source = FakeSource::new(false)
        .with_content("berserk", &["1", "2", "3", "4"])
        .with_page_delay(Duration::from_millis(100));
    let h = HarnessBuilder::new(source).max_concurrent(1).build().await;

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.source.max_active_chapters() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no chapter started");

    h.orchestrator.cancel_batch_download("berserk").await.unwrap();
    let done = h.finish("berserk").await;

    assert!(!done.is_running());
    assert!(done.failed_chapters.is_empty());
    assert!(done.message.starts_with("Download cancelled"));
    assert!(done.completed_chapters < 4);

    let mut stored = 0;
    for chapter in ["1", "2", "3", "4"] {
        if h.is_stored("berserk", chapter).await {
            stored += 1;
        }
    }
    assert_eq!(stored, done.completed_chapters);
    assert!(!h.is_stored("berserk", "4").await);
    assert_eq!(
        h.storage.get_storage_stats().await.chapter_count,
        done.completed_chapters
    );
    assert_eq!(h.manager.queue().status().await.active_count, 0);
}

#[tokio::test]
async fn test_new_session_resumes_chapter_paused_by_previous_run() {
    let root = TempDir::new().unwrap();
    {
        let queue = DownloadQueue::open(
            QueueConfig::default().with_backlog_path(root.path().join("backlog.json")),
            EventEmitter::new(),
        )
        .await
        .unwrap();
        queue
            .enqueue(WorkItem::new(
                "berserk",
                "BERSERK",
                "1",
                "https://reader.test/berserk/1",
            ))
            .await
            .unwrap();
        let admitted = queue.dequeue_next().await.unwrap().unwrap();
        // shutdown pauses the running transfer
        queue.mark_paused(&admitted.id).await.unwrap();
    }

    let source = FakeSource::new(false).with_content("berserk", &["1", "2"]);
    let h = HarnessBuilder::new(source).root(root.path()).build().await;
    assert_eq!(h.manager.queue().status().await.paused_count, 1);

    h.orchestrator
        .start_batch_download("berserk", ChapterSelection::All)
        .await
        .unwrap();
    let done = h.finish("berserk").await;

    assert!(done.is_success());
    assert_eq!(done.completed_chapters, 2);
    assert!(h.is_stored("berserk", "1").await);
    assert_eq!(h.manager.queue().status().await.paused_count, 0);
}

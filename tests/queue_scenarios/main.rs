//! Download queue scenarios across workers and restarts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use chapter_fetcher::app::events::EventEmitter;
use chapter_fetcher::app::models::{DownloadStatus, WorkItem};
use chapter_fetcher::app::queue::{DownloadQueue, QueueConfig};

fn item(content_id: &str, chapter: &str) -> WorkItem {
    WorkItem::new(
        content_id,
        content_id.to_uppercase(),
        chapter,
        format!("https://reader.test/{}/{}", content_id, chapter),
    )
}

async fn persisted_queue(temp_dir: &TempDir, limit: usize) -> DownloadQueue {
    let config = QueueConfig::default()
        .with_max_concurrent(limit)
        .with_backlog_path(temp_dir.path().join("backlog.json"));
    DownloadQueue::open(config, EventEmitter::new()).await.unwrap()
}

#[tokio::test]
async fn test_workers_never_exceed_limit() {
    let queue = Arc::new(
        DownloadQueue::open(QueueConfig::default().with_max_concurrent(2), EventEmitter::new())
            .await
            .unwrap(),
    );
    for n in 1..=12 {
        queue.enqueue(item("berserk", &n.to_string())).await.unwrap();
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        workers.push(tokio::spawn(async move {
            loop {
                match queue.dequeue_next().await.unwrap() {
                    Some(admitted) => {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);

                        let chapter: u32 = admitted.chapter.parse().unwrap();
                        if chapter % 4 == 0 {
                            queue.mark_failed(&admitted.id, "page 2 missing").await.unwrap();
                        } else {
                            queue.mark_completed(&admitted.id).await.unwrap();
                        }
                    }
                    None => {
                        let status = queue.status().await;
                        if status.queued_count == 0 && status.active_count == 0 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        }));
    }
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let status = queue.status().await;
    assert_eq!(status.completed_count, 9);
    assert_eq!(status.failed_count, 3);

    let failed = queue.get("berserk::8").await.unwrap();
    assert_eq!(failed.status, DownloadStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("page 2 missing"));
}

#[tokio::test]
async fn test_restart_recovers_interrupted_and_keeps_paused() {
    let temp_dir = TempDir::new().unwrap();

    {
        let queue = persisted_queue(&temp_dir, 2).await;
        queue.enqueue(item("vagabond", "1")).await.unwrap();
        queue.enqueue(item("vagabond", "2")).await.unwrap();
        queue
            .enqueue(item("berserk", "1").with_priority(1))
            .await
            .unwrap();

        let urgent = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(urgent.id, "berserk::1");
        let second = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(second.id, "vagabond::1");
        queue.mark_paused(&second.id).await.unwrap();
        // process dies with berserk::1 still in flight
    }

    let queue = persisted_queue(&temp_dir, 2).await;
    let status = queue.status().await;
    assert_eq!(status.active_count, 0);
    assert_eq!(status.queued_count, 2);
    assert_eq!(status.paused_count, 1);

    let recovered = queue.get("berserk::1").await.unwrap();
    assert_eq!(recovered.status, DownloadStatus::Queued);
    assert_eq!(recovered.attempts, 1);

    // priority order survives the restart; the paused item is not admitted
    let first = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(first.id, "berserk::1");
    let next = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(next.id, "vagabond::2");
    assert_eq!(
        queue.get("vagabond::1").await.unwrap().status,
        DownloadStatus::Paused
    );
    assert_eq!(queue.get("berserk::1").await.unwrap().attempts, 2);
}

#[tokio::test]
async fn test_completed_items_are_forgotten_on_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let queue = persisted_queue(&temp_dir, 1).await;
        queue.enqueue(item("berserk", "1")).await.unwrap();
        queue.enqueue(item("berserk", "2")).await.unwrap();
        let done = queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_completed(&done.id).await.unwrap();

        assert!(queue.enqueue(item("berserk", "2")).await.is_err());
    }

    let queue = persisted_queue(&temp_dir, 1).await;
    assert!(queue.get("berserk::1").await.is_none());
    assert_eq!(queue.status().await.total_items, 1);

    queue.enqueue(item("berserk", "1")).await.unwrap();
    let entries = queue.entries_for_content("berserk").await;
    let ids: Vec<&str> = entries.iter().map(|e| e.item.id.as_str()).collect();
    assert_eq!(ids, vec!["berserk::2", "berserk::1"]);
}

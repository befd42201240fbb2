mod common;

use std::time::Duration;

use robotq_db::models::queue_item::{NewQueueItem, QueueFilter};
use robotq_db::models::run_record::RunFilter;
use robotq_db::models::status::{QueueStatus, RunKind, RunStatus};
use robotq_db::models::Page;
use robotq_worker::dispatcher::FINISH_ATTEMPTS;
use robotq_worker::reaper::{ReaperSettings, StaleClaimReaper, ABANDONED_MESSAGE};
use robotq_worker::worker_pool::{process_next, Iteration, PoolSettings, WorkerPool};
use serde_json::json;

use common::Harness;

#[tokio::test]
async fn empty_queue_is_idle() {
    let h = Harness::new().await;
    let iteration = process_next(&h.store, &h.dispatcher).await.expect("iteration");
    assert_eq!(iteration, Iteration::Idle);
}

#[tokio::test]
async fn processed_item_is_deleted_after_run_finishes() {
    let h = Harness::new().await;
    let item = h
        .store
        .enqueue(&NewQueueItem {
            case_id: h.failing_case,
            priority: 3,
            config: json!({"loglevel": "debug"}),
            queued_by: Some("ci".to_string()),
        })
        .await
        .expect("enqueue");

    let iteration = process_next(&h.store, &h.dispatcher).await.expect("iteration");
    assert_eq!(iteration, Iteration::Processed);
    assert!(h.store.find_item(item.id).await.expect("find").is_none());

    let run = h
        .store
        .latest_for_queue_item(item.id)
        .await
        .expect("latest")
        .expect("run exists");
    assert_eq!(run.kind, RunKind::Queued);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.triggered_by.as_deref(), Some("ci"));

    // The case can be queued again once its item is gone.
    h.store
        .enqueue(&NewQueueItem::new(h.failing_case, 0, json!({})))
        .await
        .expect("re-enqueue");
}

#[tokio::test]
async fn dispatch_failure_marks_item_failed() {
    let h = Harness::new().await;
    let item = h
        .store
        .enqueue(&NewQueueItem::new(h.passing_case, 0, json!({})))
        .await
        .expect("enqueue");
    assert!(h.memory.delete_case(h.passing_case).await);

    let iteration = process_next(&h.store, &h.dispatcher).await.expect("iteration");
    assert_eq!(iteration, Iteration::Failed);

    let stored = h.store.find_item(item.id).await.expect("find").expect("kept");
    assert_eq!(stored.status, QueueStatus::Failed);
    assert!(stored.completed_at.is_some());
    let runs = h
        .store
        .list_runs(&RunFilter::default(), Page::default())
        .await
        .expect("list");
    assert!(runs.is_empty());
}

#[tokio::test]
async fn items_are_processed_in_priority_order() {
    let h = Harness::new().await;
    h.store
        .enqueue(&NewQueueItem::new(h.passing_case, 5, json!({})))
        .await
        .expect("enqueue");
    h.store
        .enqueue(&NewQueueItem::new(h.failing_case, 1, json!({})))
        .await
        .expect("enqueue");

    process_next(&h.store, &h.dispatcher).await.expect("first");
    let runs = h
        .store
        .list_runs(&RunFilter::default(), Page::default())
        .await
        .expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].case_id, h.failing_case);
}

#[tokio::test]
async fn pool_drains_queue_and_shuts_down() {
    let h = Harness::new().await;
    for case_id in [h.passing_case, h.failing_case] {
        h.store
            .enqueue(&NewQueueItem::new(case_id, 0, json!({})))
            .await
            .expect("enqueue");
    }

    let pool = WorkerPool::start(
        h.store.clone(),
        h.dispatcher.clone(),
        PoolSettings {
            workers: 2,
            poll_interval: Duration::from_millis(50),
        },
    );

    let drained = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let remaining = h
                .store
                .list_items(&QueueFilter::default(), Page::default())
                .await
                .expect("list");
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "queue was not drained");

    let aborted = pool.shutdown(Duration::from_secs(5)).await;
    assert_eq!(aborted, 0);

    let runs = h
        .store
        .list_runs(&RunFilter::default(), Page::default())
        .await
        .expect("list");
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn outcome_write_is_retried() {
    let h = Harness::with_flaky_finish(1).await;
    let item = h
        .store
        .enqueue(&NewQueueItem::new(h.passing_case, 0, json!({})))
        .await
        .expect("enqueue");

    let iteration = process_next(&h.store, &h.dispatcher).await.expect("iteration");
    assert_eq!(iteration, Iteration::Processed);
    assert!(h.store.find_item(item.id).await.expect("find").is_none());

    let run = h
        .store
        .latest_for_queue_item(item.id)
        .await
        .expect("latest")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn unwritable_outcome_leaves_item_for_reaper() {
    let h = Harness::with_flaky_finish(FINISH_ATTEMPTS as usize).await;
    let item = h
        .store
        .enqueue(&NewQueueItem::new(h.passing_case, 0, json!({})))
        .await
        .expect("enqueue");

    let iteration = process_next(&h.store, &h.dispatcher).await.expect("iteration");
    assert_eq!(iteration, Iteration::Unsettled);

    let stored = h.store.find_item(item.id).await.expect("find").expect("kept");
    assert_eq!(stored.status, QueueStatus::Processing);
    let run = h
        .store
        .latest_for_queue_item(item.id)
        .await
        .expect("latest")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Running);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reaper = StaleClaimReaper::new(
        h.store.clone(),
        ReaperSettings {
            stale_after: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            finished_retention: Duration::from_secs(3600),
            max_attempts: 3,
        },
    );
    let report = reaper.sweep_once().await.expect("sweep");
    assert_eq!(report.abandoned_runs, 1);
    assert_eq!(report.requeued, 1);

    let run = h.store.get_run(run.id).await.expect("get").expect("run");
    assert_eq!(run.status, RunStatus::Error);
    assert_eq!(run.error_message.as_deref(), Some(ABANDONED_MESSAGE));
    let stored = h.store.find_item(item.id).await.expect("find").expect("kept");
    assert_eq!(stored.status, QueueStatus::Queued);
}

#[tokio::test]
async fn reclaimed_item_survives_previous_worker() {
    let h = Harness::new().await;
    let item = h
        .store
        .enqueue(&NewQueueItem::new(h.slow_case, 0, json!({})))
        .await
        .expect("enqueue");

    let store = h.store.clone();
    let dispatcher = h.dispatcher.clone();
    let first_worker = tokio::spawn(async move { process_next(&store, &dispatcher).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The first claim is reaped and handed to another worker.
    let first_claim = h
        .store
        .find_item(item.id)
        .await
        .expect("find")
        .and_then(|i| i.started_at)
        .expect("claimed");
    assert!(h.store.requeue(item.id, first_claim).await.expect("requeue"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.store.dequeue_next().await.expect("dequeue").expect("reclaimed");
    assert_eq!(second.attempts, 2);

    assert_eq!(h.dispatcher.cancel_all(), 1);
    let iteration = tokio::time::timeout(Duration::from_secs(10), first_worker)
        .await
        .expect("first worker finishes")
        .expect("join")
        .expect("iteration");
    assert_eq!(iteration, Iteration::Processed);

    let stored = h.store.find_item(item.id).await.expect("find").expect("kept");
    assert_eq!(stored.status, QueueStatus::Processing);
    assert_eq!(stored.started_at, second.started_at);
}

#[tokio::test]
async fn shutdown_cancels_runs_past_grace() {
    let h = Harness::new().await;
    let item = h
        .store
        .enqueue(&NewQueueItem::new(h.slow_case, 0, json!({})))
        .await
        .expect("enqueue");

    let pool = WorkerPool::start(
        h.store.clone(),
        h.dispatcher.clone(),
        PoolSettings {
            workers: 1,
            poll_interval: Duration::from_millis(20),
        },
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let aborted = pool.shutdown(Duration::from_millis(200)).await;
    assert_eq!(aborted, 0);

    let run = h
        .store
        .latest_for_queue_item(item.id)
        .await
        .expect("latest")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(h.store.find_item(item.id).await.expect("find").is_none());
}

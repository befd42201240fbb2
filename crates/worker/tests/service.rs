mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use robotq_core::error::CoreError;
use robotq_db::models::queue_item::QueueFilter;
use robotq_db::models::run_record::RunFilter;
use robotq_db::models::status::{QueueStatus, RunKind, RunStatus};
use robotq_db::models::Page;
use robotq_storage::DEFAULT_URL_TTL;
use robotq_worker::dispatcher::CONSOLE_LOG;
use robotq_worker::error::ServiceError;
use robotq_worker::service::{ExecutionService, ExecutionTicket};
use robotq_worker::worker_pool::process_next;
use serde_json::json;

use common::Harness;

fn service(h: &Harness) -> ExecutionService {
    ExecutionService::new(
        h.store.clone(),
        Arc::clone(&h.dispatcher),
        h.artifacts.clone(),
        DEFAULT_URL_TTL,
    )
}

#[tokio::test]
async fn enqueue_reports_failures_per_case() {
    let h = Harness::new().await;
    let svc = service(&h);

    let first = svc
        .enqueue(&[h.passing_case], 2, json!({}), Some("alice".into()))
        .await
        .expect("enqueue");
    assert_eq!(first.succeeded.len(), 1);
    assert!(first.failed.is_empty());

    let second = svc
        .enqueue(&[h.passing_case, 4_242, h.failing_case], 2, json!({}), None)
        .await
        .expect("enqueue");
    assert_eq!(second.succeeded.len(), 1);
    assert_eq!(second.succeeded[0].case_id, h.failing_case);

    let failed: Vec<_> = second.failed.iter().map(|f| f.case_id).collect();
    assert_eq!(failed, vec![h.passing_case, 4_242]);
    assert!(second.failed[0].error.contains("active queue item"), "{}", second.failed[0].error);
    assert!(second.failed[1].error.contains("not found"), "{}", second.failed[1].error);
}

#[tokio::test]
async fn request_wide_problems_are_rejected_up_front() {
    let h = Harness::new().await;
    let svc = service(&h);

    assert_matches!(
        svc.enqueue(&[], 0, json!({}), None).await,
        Err(ServiceError::Core(CoreError::Validation(_)))
    );
    assert_matches!(
        svc.enqueue(&[h.passing_case], 0, json!("fast"), None).await,
        Err(ServiceError::Core(CoreError::Validation(_)))
    );
    assert_matches!(
        svc.execute(&[h.passing_case], "nightly", json!({}), None).await,
        Err(ServiceError::Core(CoreError::Validation(_)))
    );

    let items = svc
        .list_queue(&QueueFilter::default(), Page::default())
        .await
        .expect("list");
    assert!(items.is_empty());
}

#[tokio::test]
async fn dequeue_and_cancel_only_touch_queued_items() {
    let h = Harness::new().await;
    let svc = service(&h);
    svc.enqueue(&[h.passing_case, h.failing_case], 0, json!({}), None)
        .await
        .expect("enqueue");

    assert!(svc.dequeue_remove(h.passing_case).await.expect("remove"));
    assert!(!svc.dequeue_remove(h.passing_case).await.expect("remove again"));

    assert!(svc.cancel_queued(h.failing_case).await.expect("cancel"));
    let cancelled = svc
        .list_queue(
            &QueueFilter {
                status: Some(QueueStatus::Cancelled),
                case_id: None,
            },
            Page::default(),
        )
        .await
        .expect("list");
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].case_id, h.failing_case);
}

#[tokio::test]
async fn queued_execution_enqueues_at_default_priority() {
    let h = Harness::new().await;
    let svc = service(&h);

    let outcome = svc
        .execute(&[h.passing_case], "queued", json!({}), Some("ci".into()))
        .await
        .expect("execute");
    let item_id = assert_matches!(
        outcome.succeeded.as_slice(),
        [ExecutionTicket::Queued { item_id, .. }] => *item_id
    );

    let item = h.store.find_item(item_id).await.expect("find").expect("item");
    assert_eq!(item.priority, 0);
    assert_eq!(item.queued_by.as_deref(), Some("ci"));

    // A worker picks it up as a queued run.
    process_next(&h.store, &h.dispatcher).await.expect("process");
    let runs = svc
        .list_runs(
            &RunFilter {
                kind: Some(RunKind::Queued),
                ..RunFilter::default()
            },
            Page::default(),
        )
        .await
        .expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].queue_item_id, Some(item_id));
    assert!(h.store.find_item(item_id).await.expect("find").is_none());

    let url = svc.get_log_url(runs[0].id).await.expect("log url");
    assert!(url.contains(&format!("runs/{}/log.html", runs[0].id)), "{url}");
}

#[tokio::test]
async fn ad_hoc_execution_runs_in_background() {
    let h = Harness::new().await;
    let svc = service(&h);

    let outcome = svc
        .execute(&[h.passing_case, 777], "ad_hoc", json!({}), Some("bob".into()))
        .await
        .expect("execute");
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].case_id, 777);
    let run_id = assert_matches!(
        outcome.succeeded.as_slice(),
        [ExecutionTicket::Started { run_id, .. }] => *run_id
    );
    assert_eq!(outcome.succeeded[0].case_id(), h.passing_case);

    assert!(svc.drain(Duration::from_secs(20)).await, "run did not finish");
    assert_eq!(svc.background_runs(), 0);

    let run = svc.get_run(run_id).await.expect("get");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.kind, RunKind::AdHoc);
    assert_eq!(run.triggered_by.as_deref(), Some("bob"));
    assert!(!svc.cancel_run(run_id).await.expect("cancel"), "finished runs cannot be cancelled");

    let url = svc.get_log_url(run_id).await.expect("log url");
    assert!(url.contains(&format!("runs/{run_id}/log.html")), "{url}");

    let console = svc.download_artifact(run_id, CONSOLE_LOG).await.expect("download");
    assert!(String::from_utf8_lossy(&console).contains("1 passed"));
}

#[tokio::test]
async fn ad_hoc_run_can_be_cancelled() {
    let h = Harness::new().await;
    let svc = service(&h);

    let outcome = svc
        .execute(&[h.slow_case], "ad_hoc", json!(null), None)
        .await
        .expect("execute");
    let run_id = assert_matches!(
        outcome.succeeded.as_slice(),
        [ExecutionTicket::Started { run_id, .. }] => *run_id
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(svc.cancel_run(run_id).await.expect("cancel"));
    assert!(svc.drain(Duration::from_secs(10)).await);

    let run = svc.get_run(run_id).await.expect("get");
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn log_url_falls_back_and_reports_missing_logs() {
    let h = Harness::with_failing_storage().await;
    let svc = service(&h);

    let outcome = svc
        .execute(&[h.passing_case], "ad_hoc", json!({}), None)
        .await
        .expect("execute");
    let run_id = assert_matches!(
        outcome.succeeded.as_slice(),
        [ExecutionTicket::Started { run_id, .. }] => *run_id
    );
    assert!(svc.drain(Duration::from_secs(20)).await);

    assert_matches!(
        svc.get_log_url(run_id).await,
        Err(ServiceError::Core(CoreError::NotFound { entity: "run log", .. }))
    );
    assert_matches!(
        svc.download_artifact(run_id, "log.html").await,
        Err(ServiceError::Core(CoreError::NotFound { entity: "run artifact", .. }))
    );
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let h = Harness::new().await;
    let svc = service(&h);

    assert_matches!(
        svc.get_run(31_337).await,
        Err(ServiceError::Core(CoreError::NotFound { entity: "run", id: 31_337 }))
    );
    assert_matches!(
        svc.cancel_run(31_337).await,
        Err(ServiceError::Core(CoreError::NotFound { .. }))
    );
}

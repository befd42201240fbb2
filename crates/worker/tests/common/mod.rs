#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use robotq_core::runner::robot::{RobotRunner, RobotRunnerConfig};
use robotq_core::types::{DbId, Timestamp};
use robotq_db::memory::MemoryStore;
use robotq_db::models::queue_item::{NewQueueItem, QueueFilter, QueueItem};
use robotq_db::models::run_record::{NewRunRecord, RunCompletion, RunFilter, RunRecord};
use robotq_db::models::status::QueueStatus;
use robotq_db::models::test_case::TestCaseView;
use robotq_db::models::Page;
use robotq_db::store::{CaseCatalog, QueueStore, RunHistoryStore, SharedStore, StoreError};
use robotq_storage::{ArtifactStore, LocalArtifactStore, StorageError};
use robotq_worker::config::RunLimits;
use robotq_worker::dispatcher::Dispatcher;
use tempfile::{NamedTempFile, TempDir};

/// Stand-in for the `robot` executable. The suite text selects the
/// behaviour: `SLEEP` hangs, `FAIL` exits 1 after writing outputs, anything
/// else passes. The runner passes `--outputdir <dir>` first and the suite
/// path last.
const FAKE_ROBOT: &str = r#"#!/bin/bash
out="$2"
suite="${@: -1}"
echo "robot $*"
if grep -q SLEEP "$suite"; then exec sleep 30; fi
echo '<robot/>' > "$out/output.xml"
echo '<html>log</html>' > "$out/log.html"
echo '<html>report</html>' > "$out/report.html"
if grep -q FAIL "$suite"; then
  echo "1 test, 0 passed, 1 failed"
  exit 1
fi
echo "1 test, 1 passed, 0 failed"
exit 0
"#;

pub const LIMITS: RunLimits = RunLimits {
    default_timeout: Duration::from_secs(30),
    max_timeout: Duration::from_secs(60),
};

/// Memory store, fake robot and artifact store wired into a dispatcher.
pub struct Harness {
    pub memory: MemoryStore,
    pub store: SharedStore,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub passing_case: DbId,
    pub failing_case: DbId,
    pub slow_case: DbId,
    _robot: NamedTempFile,
    _scratch: TempDir,
    _artifact_root: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let artifact_root = tempfile::tempdir().expect("artifact dir");
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(
            LocalArtifactStore::new(artifact_root.path())
                .await
                .expect("local store"),
        );
        Self::build(artifacts, artifact_root, 0).await
    }

    /// Harness whose artifact uploads always fail.
    pub async fn with_failing_storage() -> Self {
        let unused = tempfile::tempdir().expect("artifact dir");
        Self::build(Arc::new(FailingArtifactStore), unused, 0).await
    }

    /// Harness whose store rejects the first `failures` terminal run writes.
    pub async fn with_flaky_finish(failures: usize) -> Self {
        let artifact_root = tempfile::tempdir().expect("artifact dir");
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(
            LocalArtifactStore::new(artifact_root.path())
                .await
                .expect("local store"),
        );
        Self::build(artifacts, artifact_root, failures).await
    }

    async fn build(artifacts: Arc<dyn ArtifactStore>, artifact_root: TempDir, finish_failures: usize) -> Self {
        let mut robot = NamedTempFile::new().expect("robot script");
        robot.write_all(FAKE_ROBOT.as_bytes()).expect("write robot script");
        robot.flush().expect("flush robot script");
        let scratch = tempfile::tempdir().expect("scratch dir");

        let memory = MemoryStore::new();
        let passing = memory
            .insert_script("login.robot", "*** Test Cases ***\nLogin\n    Log    ok\n")
            .await;
        let failing = memory
            .insert_script("checkout.robot", "*** Test Cases ***\nCheckout\n    Fail    FAIL\n")
            .await;
        let slow = memory
            .insert_script("soak.robot", "*** Test Cases ***\nSoak\n    Sleep    SLEEP\n")
            .await;
        let passing_case = memory
            .insert_case(passing, "login works", serde_json::json!({"USER": "alice"}))
            .await;
        let failing_case = memory
            .insert_case(failing, "checkout works", serde_json::json!({}))
            .await;
        let slow_case = memory.insert_case(slow, "soak", serde_json::Value::Null).await;

        let store: SharedStore = if finish_failures == 0 {
            Arc::new(memory.clone())
        } else {
            Arc::new(FlakyFinishStore::new(memory.clone(), finish_failures))
        };
        let runner = Arc::new(RobotRunner::new(RobotRunnerConfig {
            program: "bash".to_string(),
            base_args: vec![robot.path().to_string_lossy().into_owned()],
            scratch_root: scratch.path().to_path_buf(),
        }));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            runner,
            Arc::clone(&artifacts),
            LIMITS,
        ));

        Self {
            memory,
            store,
            artifacts,
            dispatcher,
            passing_case,
            failing_case,
            slow_case,
            _robot: robot,
            _scratch: scratch,
            _artifact_root: artifact_root,
        }
    }
}

/// Artifact store whose writes and reads always fail.
pub struct FailingArtifactStore;

fn backend_error(operation: &'static str, key: &str) -> StorageError {
    StorageError::Backend {
        operation,
        key: key.to_string(),
        message: "connection refused".to_string(),
    }
}

#[async_trait]
impl ArtifactStore for FailingArtifactStore {
    async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<String, StorageError> {
        Err(backend_error("put", key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        Err(backend_error("get", key))
    }

    async fn presign(&self, key: &str, _ttl: Duration) -> Result<String, StorageError> {
        Err(backend_error("presign", key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Err(backend_error("delete", key))
    }
}

/// Memory store whose `finish_run` times out a fixed number of times
/// before delegating.
pub struct FlakyFinishStore {
    inner: MemoryStore,
    remaining_failures: AtomicUsize,
}

impl FlakyFinishStore {
    pub fn new(inner: MemoryStore, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl QueueStore for FlakyFinishStore {
    async fn enqueue(&self, item: &NewQueueItem) -> Result<QueueItem, StoreError> {
        self.inner.enqueue(item).await
    }

    async fn dequeue_next(&self) -> Result<Option<QueueItem>, StoreError> {
        self.inner.dequeue_next().await
    }

    async fn remove(&self, case_id: DbId) -> Result<bool, StoreError> {
        self.inner.remove(case_id).await
    }

    async fn cancel(&self, case_id: DbId) -> Result<bool, StoreError> {
        self.inner.cancel(case_id).await
    }

    async fn list_items(&self, filter: &QueueFilter, page: Page) -> Result<Vec<QueueItem>, StoreError> {
        self.inner.list_items(filter, page).await
    }

    async fn find_item(&self, item_id: DbId) -> Result<Option<QueueItem>, StoreError> {
        self.inner.find_item(item_id).await
    }

    async fn delete_claimed(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        self.inner.delete_claimed(item_id, claimed_at).await
    }

    async fn mark_finished(
        &self,
        item_id: DbId,
        claimed_at: Timestamp,
        status: QueueStatus,
    ) -> Result<bool, StoreError> {
        self.inner.mark_finished(item_id, claimed_at, status).await
    }

    async fn find_stale(&self, older_than: Timestamp) -> Result<Vec<QueueItem>, StoreError> {
        self.inner.find_stale(older_than).await
    }

    async fn requeue(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        self.inner.requeue(item_id, claimed_at).await
    }

    async fn purge_finished(&self, older_than: Timestamp) -> Result<u64, StoreError> {
        self.inner.purge_finished(older_than).await
    }
}

#[async_trait]
impl RunHistoryStore for FlakyFinishStore {
    async fn create_run(&self, run: &NewRunRecord) -> Result<RunRecord, StoreError> {
        self.inner.create_run(run).await
    }

    async fn finish_run(&self, run_id: DbId, completion: &RunCompletion) -> Result<bool, StoreError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.finish_run(run_id, completion).await
    }

    async fn get_run(&self, run_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.list_runs(filter, page).await
    }

    async fn latest_for_queue_item(&self, item_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        self.inner.latest_for_queue_item(item_id).await
    }

    async fn find_orphaned_runs(&self, older_than: Timestamp) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.find_orphaned_runs(older_than).await
    }
}

#[async_trait]
impl CaseCatalog for FlakyFinishStore {
    async fn get_case(&self, case_id: DbId) -> Result<Option<TestCaseView>, StoreError> {
        self.inner.get_case(case_id).await
    }
}

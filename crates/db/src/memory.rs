//! In-process store implementing the same traits as [`crate::store::PgStore`].
//!
//! All state sits behind one async mutex, so every trait method is atomic
//! with respect to every other, including the claim in `dequeue_next` and
//! the duplicate check in `enqueue`. Used by tests and local runs without a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use robotq_core::types::{self, DbId, Timestamp};
use tokio::sync::Mutex;

use crate::models::queue_item::{NewQueueItem, QueueFilter, QueueItem};
use crate::models::run_record::{NewRunRecord, RunCompletion, RunFilter, RunRecord};
use crate::models::status::{QueueStatus, RunStatus};
use crate::models::test_case::TestCaseView;
use crate::models::Page;
use crate::store::{
    ensure_closing_status, ensure_terminal, CaseCatalog, QueueStore, RunHistoryStore, StoreError,
};

#[derive(Debug, Clone)]
struct Script {
    name: String,
    content: String,
}

#[derive(Debug, Clone)]
struct Case {
    script_id: DbId,
    name: String,
    variables: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    next_id: DbId,
    scripts: HashMap<DbId, Script>,
    cases: HashMap<DbId, Case>,
    items: BTreeMap<DbId, QueueItem>,
    runs: BTreeMap<DbId, RunRecord>,
}

impl State {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }
}

/// Cloneable handle to shared in-memory state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a script to the catalog and return its id.
    pub async fn insert_script(&self, name: &str, content: &str) -> DbId {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.scripts.insert(
            id,
            Script {
                name: name.to_string(),
                content: content.to_string(),
            },
        );
        id
    }

    /// Add a case under `script_id` and return its id.
    pub async fn insert_case(&self, script_id: DbId, name: &str, variables: serde_json::Value) -> DbId {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.cases.insert(
            id,
            Case {
                script_id,
                name: name.to_string(),
                variables,
            },
        );
        id
    }

    /// Remove a case from the catalog (queue items and runs are kept).
    pub async fn delete_case(&self, case_id: DbId) -> bool {
        self.state.lock().await.cases.remove(&case_id).is_some()
    }
}

fn sort_claim_order(items: &mut [QueueItem]) {
    items.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.queued_at.cmp(&b.queued_at))
            .then(a.id.cmp(&b.id))
    });
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    let offset = usize::try_from(page.clamp_offset()).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.clamp_limit()).unwrap_or(0);
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, input: &NewQueueItem) -> Result<QueueItem, StoreError> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .items
            .values()
            .any(|i| i.case_id == input.case_id && i.status.is_active());
        if duplicate {
            return Err(StoreError::Duplicate {
                case_id: input.case_id,
            });
        }
        let id = state.next_id();
        let item = QueueItem {
            id,
            case_id: input.case_id,
            status: QueueStatus::Queued,
            priority: input.priority,
            config: input.config.clone(),
            attempts: 0,
            queued_by: input.queued_by.clone(),
            queued_at: types::now(),
            started_at: None,
            completed_at: None,
        };
        state.items.insert(id, item.clone());
        Ok(item)
    }

    async fn dequeue_next(&self) -> Result<Option<QueueItem>, StoreError> {
        let mut state = self.state.lock().await;
        let mut queued: Vec<QueueItem> = state
            .items
            .values()
            .filter(|i| i.status == QueueStatus::Queued)
            .cloned()
            .collect();
        sort_claim_order(&mut queued);
        let Some(next) = queued.into_iter().next() else {
            return Ok(None);
        };
        let Some(item) = state.items.get_mut(&next.id) else {
            return Ok(None);
        };
        item.status = QueueStatus::Processing;
        item.started_at = Some(types::now());
        item.attempts += 1;
        Ok(Some(item.clone()))
    }

    async fn remove(&self, case_id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let target = state
            .items
            .values()
            .find(|i| i.case_id == case_id && i.status == QueueStatus::Queued)
            .map(|i| i.id);
        Ok(target.and_then(|id| state.items.remove(&id)).is_some())
    }

    async fn cancel(&self, case_id: DbId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state
            .items
            .values_mut()
            .find(|i| i.case_id == case_id && i.status == QueueStatus::Queued)
        {
            Some(item) => {
                item.status = QueueStatus::Cancelled;
                item.completed_at = Some(types::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_items(&self, filter: &QueueFilter, page: Page) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        sort_claim_order(&mut items);
        Ok(paginate(items, page))
    }

    async fn find_item(&self, item_id: DbId) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn delete_claimed(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = state
            .items
            .get(&item_id)
            .is_some_and(|i| i.status == QueueStatus::Processing && i.started_at == Some(claimed_at));
        Ok(owned && state.items.remove(&item_id).is_some())
    }

    async fn mark_finished(
        &self,
        item_id: DbId,
        claimed_at: Timestamp,
        status: QueueStatus,
    ) -> Result<bool, StoreError> {
        ensure_closing_status(item_id, status)?;
        let mut state = self.state.lock().await;
        match state.items.get_mut(&item_id) {
            Some(item)
                if item.status == QueueStatus::Processing && item.started_at == Some(claimed_at) =>
            {
                item.status = status;
                item.completed_at = Some(types::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(&self, older_than: Timestamp) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<QueueItem> = state
            .items
            .values()
            .filter(|i| {
                i.status == QueueStatus::Processing && i.started_at.is_some_and(|t| t < older_than)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|i| (i.started_at, i.id));
        Ok(stale)
    }

    async fn requeue(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.items.get_mut(&item_id) {
            Some(item)
                if item.status == QueueStatus::Processing && item.started_at == Some(claimed_at) =>
            {
                item.status = QueueStatus::Queued;
                item.started_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_finished(&self, older_than: Timestamp) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|_, i| {
            !(i.status.is_finished() && i.completed_at.is_some_and(|t| t < older_than))
        });
        Ok((before - state.items.len()) as u64)
    }
}

#[async_trait]
impl RunHistoryStore for MemoryStore {
    async fn create_run(&self, input: &NewRunRecord) -> Result<RunRecord, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let run = RunRecord {
            id,
            case_id: input.case_id,
            queue_item_id: input.queue_item_id,
            kind: input.kind,
            status: RunStatus::Running,
            started_at: Some(input.started_at),
            finished_at: None,
            results: None,
            error_message: None,
            log_keys: BTreeMap::new(),
            triggered_by: input.triggered_by.clone(),
            created_at: input.started_at,
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn finish_run(&self, run_id: DbId, completion: &RunCompletion) -> Result<bool, StoreError> {
        ensure_terminal(run_id, completion)?;
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.can_transition_to(completion.status) => {
                let finished_at = match run.started_at {
                    Some(started) => completion.finished_at.max(started),
                    None => completion.finished_at,
                };
                run.status = completion.status;
                run.finished_at = Some(finished_at);
                run.results = completion.results.clone();
                run.error_message = completion.error_message.clone();
                run.log_keys = completion.log_keys.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_run(&self, run_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(runs, page))
    }

    async fn latest_for_queue_item(&self, item_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.queue_item_id == Some(item_id))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn find_orphaned_runs(&self, older_than: Timestamp) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut orphans: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Running
                    && r.queue_item_id.is_none()
                    && r.started_at.is_some_and(|t| t < older_than)
            })
            .cloned()
            .collect();
        orphans.sort_by_key(|r| (r.started_at, r.id));
        Ok(orphans)
    }
}

#[async_trait]
impl CaseCatalog for MemoryStore {
    async fn get_case(&self, case_id: DbId) -> Result<Option<TestCaseView>, StoreError> {
        let state = self.state.lock().await;
        let Some(case) = state.cases.get(&case_id) else {
            return Ok(None);
        };
        let Some(script) = state.scripts.get(&case.script_id) else {
            return Ok(None);
        };
        Ok(Some(TestCaseView {
            id: case_id,
            name: case.name.clone(),
            script_id: case.script_id,
            variables: case.variables.clone(),
            script_name: script.name.clone(),
            script_content: script.content.clone(),
        }))
    }
}

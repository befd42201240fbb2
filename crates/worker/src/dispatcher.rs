//! Run lifecycle for one execution attempt.
//!
//! ```text
//! running -> completed | failed | error | cancelled
//! ```
//!
//! Runs are opened directly in `running` by [`Dispatcher::begin`]. The
//! terminal state is written exactly once by [`Dispatcher::complete`].
//! Runner failures, timeouts and storage errors all end up in the run
//! record; only validation, lookup and persistence failures are returned
//! as errors.
//!
//! An error from `begin` means no run exists. An error from `complete`
//! means the run may still be `running` in the store after
//! [`FINISH_ATTEMPTS`] writes; the stale-claim reaper finishes it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use robotq_core::runner::options::RobotOptions;
use robotq_core::runner::{ExecutionOutcome, OutcomeStatus, ProducedArtifact, RunRequest, TestRunner};
use robotq_core::types::DbId;
use robotq_db::models::queue_item::QueueItem;
use robotq_db::models::run_record::{NewRunRecord, RunCompletion, RunRecord, RunResults};
use robotq_db::models::status::{RunKind, RunStatus};
use robotq_db::store::SharedStore;
use robotq_storage::{artifact_key, ArtifactStore};
use tokio_util::sync::CancellationToken;

use crate::config::RunLimits;
use crate::error::{ServiceError, ServiceResult};

/// File name of the persisted stdout/stderr transcript.
pub const CONSOLE_LOG: &str = "console.txt";

/// Attempts at writing a run's terminal state before giving up.
pub const FINISH_ATTEMPTS: u32 = 3;

/// Delay before the second terminal write; doubles per attempt.
const FINISH_BACKOFF: Duration = Duration::from_millis(50);

/// One request to execute a case.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub case_id: DbId,
    pub kind: RunKind,
    pub config: serde_json::Value,
    pub queue_item_id: Option<DbId>,
    pub triggered_by: Option<String>,
}

impl ExecuteRequest {
    pub fn ad_hoc(case_id: DbId, config: serde_json::Value) -> Self {
        Self {
            case_id,
            kind: RunKind::AdHoc,
            config,
            queue_item_id: None,
            triggered_by: None,
        }
    }

    /// Request for a claimed queue item.
    pub fn for_queue_item(item: &QueueItem) -> Self {
        Self {
            case_id: item.case_id,
            kind: RunKind::Queued,
            config: item.config.clone(),
            queue_item_id: Some(item.id),
            triggered_by: item.queued_by.clone(),
        }
    }
}

/// A run that has been opened but not executed yet.
#[derive(Debug)]
pub struct PreparedRun {
    pub record: RunRecord,
    request: RunRequest,
    cancel: CancellationToken,
}

/// Cancellation tokens of runs currently executing in this process.
type ActiveRuns = Arc<Mutex<HashMap<DbId, CancellationToken>>>;

pub struct Dispatcher {
    store: SharedStore,
    runner: Arc<dyn TestRunner>,
    artifacts: Arc<dyn ArtifactStore>,
    limits: RunLimits,
    active: ActiveRuns,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        runner: Arc<dyn TestRunner>,
        artifacts: Arc<dyn ArtifactStore>,
        limits: RunLimits,
    ) -> Self {
        Self {
            store,
            runner,
            artifacts,
            limits,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate the request and open a `running` record.
    ///
    /// Unknown cases and invalid configs fail here, before any record
    /// exists.
    pub async fn begin(&self, req: &ExecuteRequest) -> ServiceResult<PreparedRun> {
        let case = self
            .store
            .get_case(req.case_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("test case", req.case_id))?;

        let options = RobotOptions::from_config(&req.config)?;
        if !(case.variables.is_object() || case.variables.is_null()) {
            return Err(ServiceError::validation(format!(
                "Variables of case {} are not a JSON object",
                case.id
            )));
        }
        let timeout = options.effective_timeout(self.limits.default_timeout, self.limits.max_timeout);

        let mut new_run = NewRunRecord::new(case.id, req.kind).triggered_by(req.triggered_by.clone());
        if let Some(item_id) = req.queue_item_id {
            new_run = new_run.for_queue_item(item_id);
        }
        let record = self.store.create_run(&new_run).await?;

        let cancel = CancellationToken::new();
        self.registry().insert(record.id, cancel.clone());

        tracing::info!(
            run_id = record.id,
            case_id = case.id,
            kind = %req.kind,
            queue_item_id = ?req.queue_item_id,
            timeout_secs = timeout.as_secs(),
            "Run started",
        );

        Ok(PreparedRun {
            record,
            request: RunRequest {
                script_name: case.script_name,
                script_content: case.script_content,
                variables: case.variables,
                config: req.config.clone(),
                timeout,
            },
            cancel,
        })
    }

    /// Execute an opened run, persist its artifacts and write the terminal
    /// state. Returns the stored record.
    pub async fn complete(&self, prepared: PreparedRun) -> ServiceResult<RunRecord> {
        let PreparedRun {
            record,
            request,
            cancel,
        } = prepared;
        let run_id = record.id;
        let started = Instant::now();

        let result = self.runner.run(request, cancel).await;
        self.registry().remove(&run_id);

        let completion = match result {
            Ok(outcome) => self.settle(run_id, outcome).await,
            Err(e) => {
                tracing::error!(run_id, error = %e, "Runner failed");
                let mut completion =
                    RunCompletion::new(RunStatus::Error).with_error(format!("Runner failed: {e}"));
                completion.results = Some(RunResults {
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    outcome: None,
                    missing_artifacts: Vec::new(),
                });
                completion
            }
        };

        let stored = self.finish(run_id, &completion).await?;

        tracing::info!(
            run_id,
            case_id = stored.case_id,
            status = %stored.status,
            "Run finished",
        );
        Ok(stored)
    }

    /// Write the terminal state and read the stored record back, retrying
    /// transient store failures.
    async fn finish(&self, run_id: DbId, completion: &RunCompletion) -> ServiceResult<RunRecord> {
        let mut attempt = 1;
        loop {
            match self.try_finish(run_id, completion).await {
                Ok(stored) => return Ok(stored),
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(run_id, attempt, error = %e, "Failed to write run outcome; retrying");
                    tokio::time::sleep(FINISH_BACKOFF * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(run_id, attempts = attempt, error = %e, "Giving up on run outcome");
                    return Err(e);
                }
            }
        }
    }

    async fn try_finish(&self, run_id: DbId, completion: &RunCompletion) -> ServiceResult<RunRecord> {
        if !self.store.finish_run(run_id, completion).await? {
            tracing::warn!(run_id, "Run was already finished; keeping the stored outcome");
        }
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("run", run_id))
    }

    /// [`begin`](Self::begin) then [`complete`](Self::complete).
    pub async fn execute(&self, req: &ExecuteRequest) -> ServiceResult<RunRecord> {
        let prepared = self.begin(req).await?;
        self.complete(prepared).await
    }

    /// Signal cancellation to a run executing in this process. Returns
    /// `false` if the run is not active here.
    pub fn cancel_run(&self, run_id: DbId) -> bool {
        match self.registry().get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id, "Run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Signal cancellation to every run executing in this process. Returns
    /// the number of runs signalled.
    pub fn cancel_all(&self) -> usize {
        let registry = self.registry();
        for token in registry.values() {
            token.cancel();
        }
        if !registry.is_empty() {
            tracing::info!(runs = registry.len(), "Cancelling all active runs");
        }
        registry.len()
    }

    /// Number of runs currently executing in this process.
    pub fn active_runs(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<DbId, CancellationToken>> {
        // A poisoned map only means another thread panicked mid-insert;
        // the tokens themselves are still valid.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Map a runner outcome to a completion, persisting artifacts first.
    async fn settle(&self, run_id: DbId, outcome: ExecutionOutcome) -> RunCompletion {
        let transcript = outcome.console_transcript();
        let ExecutionOutcome {
            status,
            exit_code,
            duration_ms,
            mut artifacts,
            error,
            ..
        } = outcome;
        if let Some(text) = transcript {
            artifacts.push(ProducedArtifact::new(CONSOLE_LOG, text.into_bytes()));
        }

        let (log_keys, missing_artifacts) = self.persist_artifacts(run_id, artifacts).await;

        let (run_status, message) = match status {
            OutcomeStatus::Passed => (RunStatus::Completed, None),
            OutcomeStatus::Failed => (RunStatus::Failed, exit_code.and_then(describe_exit_code)),
            OutcomeStatus::TimedOut | OutcomeStatus::Crashed => (
                RunStatus::Error,
                Some(error.unwrap_or_else(|| "Runner did not finish".to_string())),
            ),
            OutcomeStatus::Cancelled => (
                RunStatus::Cancelled,
                Some(error.unwrap_or_else(|| "Run cancelled".to_string())),
            ),
        };

        let mut completion = RunCompletion::new(run_status);
        completion.error_message = message;
        completion.log_keys = log_keys;
        completion.results = Some(RunResults {
            exit_code,
            duration_ms,
            outcome: Some(status),
            missing_artifacts,
        });
        completion
    }

    /// Store every artifact under `runs/{run_id}/`. Failures are logged and
    /// reported as missing; they never change the run's verdict.
    async fn persist_artifacts(
        &self,
        run_id: DbId,
        artifacts: Vec<ProducedArtifact>,
    ) -> (BTreeMap<String, String>, Vec<String>) {
        let mut keys = BTreeMap::new();
        let mut missing = Vec::new();

        for artifact in artifacts {
            let key = artifact_key(run_id, &artifact.name);
            match self
                .artifacts
                .put(&key, artifact.bytes, artifact.content_type)
                .await
            {
                Ok(stored) => {
                    keys.insert(artifact.name, stored);
                }
                Err(e) => {
                    tracing::warn!(run_id, artifact = %artifact.name, error = %e, "Failed to store artifact");
                    missing.push(artifact.name);
                }
            }
        }
        (keys, missing)
    }
}

/// Robot reserves exit codes above 250 for execution errors rather than
/// failed-test counts.
fn describe_exit_code(code: i32) -> Option<String> {
    let reason = match code {
        251 => "help or version information printed",
        252 => "invalid test data or command line options",
        253 => "execution stopped by user",
        255 => "unexpected internal error",
        _ => return None,
    };
    Some(format!("Robot exited with code {code}: {reason}"))
}

//! Background conversion of stored documents.
//!
//! Every successful write is offered to the [`ConversionOrchestrator`]. When
//! the item qualifies, a job is registered under the item's mapped key and a
//! task runs the external converter once, bounded by a worker pool and a
//! timeout. Only the latest job per key is authoritative: a newer write or a
//! remove cancels whatever is still in flight for that key.

mod job;
mod policy;
mod supervisor;

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use blob_store::{ByteStore, PutResult};
use chrono::Utc;
use job::{CapturedOutput, ConversionFailure};
pub use job::{JobId, JobSnapshot, JobState};
use metrics::{create_timed_future, AutoIncrement};
use opentelemetry::KeyValue;
use policy::{ConversionPlan, ConversionPolicy};
use supervisor::{Finished, ProcessEnd, Supervisor};
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::ConversionConfig,
    gateway::WriteHook,
    key_mapper::{map_key_to_path, InvalidKey, PathSegments},
};

struct JobEntry {
    attempt: u64,
    snapshot: JobSnapshot,
    cancel: CancellationToken,
}

struct Inner {
    store: Arc<dyn ByteStore>,
    policy: ConversionPolicy,
    supervisor: Supervisor,
    enabled: bool,
    verify_artifact: bool,
    max_retained_outcomes: usize,
    jobs: Mutex<HashMap<String, JobEntry>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    metrics: metrics::conversions::Metrics,
}

#[derive(Clone)]
pub struct ConversionOrchestrator {
    inner: Arc<Inner>,
}

impl ConversionOrchestrator {
    pub fn new(config: &ConversionConfig, store: Arc<dyn ByteStore>) -> Self {
        let supervisor = Supervisor::new(
            config.converter.clone(),
            config.timeout(),
            config.max_captured_output_bytes,
        );
        Self {
            inner: Arc::new(Inner {
                store,
                policy: ConversionPolicy::new(config),
                supervisor,
                enabled: config.enabled,
                verify_artifact: config.verify_artifact,
                max_retained_outcomes: config.max_retained_outcomes,
                jobs: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                metrics: metrics::conversions::Metrics::new(),
            }),
        }
    }

    /// Registers and starts a job for a completed write when the item
    /// qualifies. Supersedes any job still in flight for the same key.
    pub fn submit(&self, path: &PathSegments) -> Option<JobId> {
        let inner = &self.inner;
        if !inner.enabled || inner.shutdown.is_cancelled() {
            return None;
        }
        let plan = inner.policy.plan(path, inner.store.as_ref())?;
        let key = path.to_string();
        let output_key = plan.output.to_string();
        let cancel = inner.shutdown.child_token();

        let id = {
            let mut jobs = inner.jobs();
            // sibling items that differ only in extension share one artifact
            for (other, entry) in jobs.iter_mut() {
                if other != &key && entry.snapshot.output_key == output_key {
                    inner.supersede(entry, "artifact claimed by newer write");
                }
            }
            let attempt = match jobs.get_mut(&key) {
                Some(previous) => {
                    inner.supersede(previous, "newer write");
                    previous.attempt + 1
                }
                None => 1,
            };
            let id = JobId::new(&key, attempt);
            jobs.insert(
                key.clone(),
                JobEntry {
                    attempt,
                    snapshot: JobSnapshot {
                        id: id.clone(),
                        key: key.clone(),
                        output_key,
                        input_path: plan.input_path.clone(),
                        output_path: plan.output_path.clone(),
                        state: JobState::Pending,
                        exit_code: None,
                        stdout: None,
                        stderr: None,
                        created_at: Utc::now().timestamp_millis(),
                        started_at: None,
                        finished_at: None,
                    },
                    cancel: cancel.clone(),
                },
            );
            id
        };

        info!(job = %id, input = %plan.input_path.display(), "conversion scheduled");
        let task_inner = inner.clone();
        let task_id = id.clone();
        inner.tasks.spawn(async move {
            task_inner.run_job(task_id, plan, cancel).await;
        });
        Some(id)
    }

    /// Cancels the in-flight job of a removed item, if any.
    pub fn cancel(&self, path: &PathSegments) {
        let inner = &self.inner;
        let mut jobs = inner.jobs();
        if let Some(entry) = jobs.get_mut(&path.to_string()) {
            inner.supersede(entry, "item removed");
        }
    }

    /// Latest job registered for the item `key` maps to.
    pub fn status(&self, key: &str) -> Result<Option<JobSnapshot>, InvalidKey> {
        let path = map_key_to_path(key)?;
        Ok(self
            .inner
            .jobs()
            .get(&path.to_string())
            .map(|entry| entry.snapshot.clone()))
    }

    /// Snapshots of every tracked key, ordered by key.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .inner
            .jobs()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Stops accepting jobs, kills every running converter and waits for the
    /// job tasks to wind down.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut jobs = inner.jobs();
            for entry in jobs.values_mut() {
                inner.supersede(entry, "shutdown");
            }
        }
        inner.shutdown.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;
        info!("conversion orchestrator stopped");
    }
}

impl WriteHook for ConversionOrchestrator {
    fn on_write(&self, path: &PathSegments, result: &PutResult) -> Option<JobId> {
        debug!(key = %path, size = result.size_bytes, "evaluating write for conversion");
        self.submit(path)
    }

    fn on_remove(&self, path: &PathSegments) {
        self.cancel(path);
    }
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supersede(&self, entry: &mut JobEntry, reason: &str) {
        if entry.snapshot.state.is_terminal() {
            return;
        }
        entry.cancel.cancel();
        entry.snapshot.state = JobState::Superseded;
        entry.snapshot.finished_at = Some(Utc::now().timestamp_millis());
        self.metrics
            .jobs
            .increment(&[KeyValue::new("outcome", "superseded")]);
        info!(job = %entry.snapshot.id, reason, "conversion superseded");
    }

    /// Applies `update` if `id` is still the key's current, unfinished job.
    fn update(&self, id: &JobId, key: &str, update: impl FnOnce(&mut JobSnapshot)) -> bool {
        let mut jobs = self.jobs();
        match jobs.get_mut(key) {
            Some(entry) if &entry.snapshot.id == id && !entry.snapshot.state.is_terminal() => {
                update(&mut entry.snapshot);
                true
            }
            _ => false,
        }
    }

    async fn run_job(self: Arc<Self>, id: JobId, plan: ConversionPlan, cancel: CancellationToken) {
        let key = id_key(&id);
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job = %id, "conversion cancelled before start");
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        if !self.update(&id, key, |s| s.state = JobState::Spawning) {
            return;
        }
        let converter = match self.supervisor.spawn(&plan.input_path, &plan.output_path) {
            Ok(converter) => converter,
            Err(failure) => {
                self.finish(&id, key, JobState::Failed(failure), None, None);
                return;
            }
        };
        let started_at = Utc::now().timestamp_millis();
        self.update(&id, key, |s| {
            s.state = JobState::Running;
            s.started_at = Some(started_at);
        });

        debug!(job = %id, pid = converter.pid(), "conversion running");

        self.metrics.in_flight.add(1, &[]);
        let Finished {
            end,
            stdout,
            stderr,
        } = create_timed_future(
            converter.wait(self.supervisor.timeout(), &cancel),
            |elapsed| self.metrics.duration.record(elapsed.as_secs_f64(), &[]),
        )
        .await;
        self.metrics.in_flight.add(-1, &[]);

        let (state, exit_code) = match end {
            ProcessEnd::Exited {
                code: Some(0), ..
            } => {
                if self.verify_artifact && !artifact_present(&plan.output_path).await {
                    let failure = ConversionFailure::MissingArtifact {
                        output: plan.output.to_string(),
                    };
                    (JobState::Failed(failure), Some(0))
                } else {
                    (JobState::Succeeded, Some(0))
                }
            }
            ProcessEnd::Exited { code, signal } => {
                let failure = ConversionFailure::ExitError {
                    code,
                    signal,
                    stderr: stderr.text.clone(),
                };
                (JobState::Failed(failure), code)
            }
            ProcessEnd::TimedOut => {
                let failure = ConversionFailure::Timeout {
                    timeout_secs: self.supervisor.timeout().as_secs(),
                };
                (JobState::Failed(failure), None)
            }
            ProcessEnd::Lost(message) => {
                let failure = ConversionFailure::ExitError {
                    code: None,
                    signal: None,
                    stderr: message,
                };
                (JobState::Failed(failure), None)
            }
            ProcessEnd::Cancelled => {
                debug!(job = %id, "conversion cancelled while running");
                return;
            }
        };
        self.finish(&id, key, state, exit_code, Some((stdout, stderr)));
    }

    fn finish(
        &self,
        id: &JobId,
        key: &str,
        state: JobState,
        exit_code: Option<i32>,
        output: Option<(CapturedOutput, CapturedOutput)>,
    ) {
        let outcome = state.outcome();
        let recorded = self.update(id, key, |s| {
            match &state {
                JobState::Succeeded => info!(job = %id, "conversion succeeded"),
                JobState::Failed(failure) => {
                    warn!(job = %id, error = %failure, "conversion failed")
                }
                _ => {}
            }
            s.state = state;
            s.exit_code = exit_code;
            if let Some((stdout, stderr)) = output {
                s.stdout = Some(stdout);
                s.stderr = Some(stderr);
            }
            s.finished_at = Some(Utc::now().timestamp_millis());
        });
        if !recorded {
            debug!(job = %id, outcome, "discarding outcome of superseded conversion");
            return;
        }
        self.metrics
            .jobs
            .increment(&[KeyValue::new("outcome", outcome)]);
        self.evict_finished();
    }

    /// Drops the oldest finished outcomes beyond the retention limit.
    fn evict_finished(&self) {
        let mut jobs = self.jobs();
        let mut finished: Vec<(i64, String)> = jobs
            .iter()
            .filter(|(_, entry)| entry.snapshot.state.is_terminal())
            .map(|(key, entry)| (entry.snapshot.finished_at.unwrap_or_default(), key.clone()))
            .collect();
        if finished.len() <= self.max_retained_outcomes {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_retained_outcomes;
        for (_, key) in finished.into_iter().take(excess) {
            jobs.remove(&key);
        }
    }
}

/// The mapped key a job id was derived from.
fn id_key(id: &JobId) -> &str {
    let raw = id.get();
    raw.rsplit_once('#').map(|(key, _)| key).unwrap_or(raw)
}

async fn artifact_present(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
}

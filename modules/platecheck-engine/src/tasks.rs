// In-process task queue for interactive analysis requests.
//
// Submissions for the same (place, mode) coalesce onto one live task, so a
// user double-tapping a link burns one scrape, not two. Finished tasks stick
// around for result pickup until the reaper expires them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use platecheck_common::resolve;

use crate::analyze::{AnalysisOutcome, AnalyzeOptions, Analyzer};
use crate::error::{EngineError, Result};
use crate::heartbeat::Heartbeat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub input: String,
    pub identity_key: String,
    pub mode: String,
    pub state: TaskState,
    pub message: String,
    pub error: Option<String>,
    pub result: Option<AnalysisOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, TaskRecord>,
    // (identity_key, mode) -> live task id
    live: HashMap<(String, String), String>,
}

pub struct TaskQueue {
    analyzer: Arc<Analyzer>,
    state: Arc<Mutex<QueueState>>,
    workers: Arc<Semaphore>,
    task_ttl: Duration,
    heartbeat_interval: Duration,
}

impl TaskQueue {
    pub fn new(
        analyzer: Arc<Analyzer>,
        workers: usize,
        task_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            analyzer,
            state: Arc::new(Mutex::new(QueueState::default())),
            workers: Arc::new(Semaphore::new(workers)),
            task_ttl,
            heartbeat_interval,
        }
    }

    /// Submit an analysis request. Returns the task id; when an identical
    /// request is already in flight, returns that task's id instead of
    /// spawning a duplicate.
    pub fn submit(&self, input: &str, options: AnalyzeOptions) -> Result<String> {
        let input = input.trim().to_string();
        if input.is_empty() {
            return Err(EngineError::InvalidInput("empty place reference".into()));
        }

        let reference = resolve(&input);
        let dedupe_key = (reference.identity_key.clone(), options.mode.to_string());
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = state.live.get(&dedupe_key) {
                info!(task = %existing, identity = %dedupe_key.0, "Coalescing duplicate submission");
                return Ok(existing.clone());
            }
            state.tasks.insert(
                id.clone(),
                TaskRecord {
                    id: id.clone(),
                    input: input.clone(),
                    identity_key: reference.identity_key.clone(),
                    mode: options.mode.to_string(),
                    state: TaskState::Pending,
                    message: "queued".to_string(),
                    error: None,
                    result: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            state.live.insert(dedupe_key.clone(), id.clone());
        }

        let analyzer = Arc::clone(&self.analyzer);
        let state = Arc::clone(&self.state);
        let workers = Arc::clone(&self.workers);
        let heartbeat_interval = self.heartbeat_interval;
        let task_id = id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                return;
            };

            set_state(&state, &task_id, TaskState::Running);

            let hb_state = Arc::clone(&state);
            let hb_id = task_id.clone();
            let heartbeat = Heartbeat::start(heartbeat_interval, move || {
                let state = Arc::clone(&hb_state);
                let id = hb_id.clone();
                async move { touch(&state, &id) }
            });

            let outcome = analyzer.analyze_place(&input, &options).await;
            heartbeat.stop().await;

            let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
            guard.live.remove(&dedupe_key);
            if let Some(record) = guard.tasks.get_mut(&task_id) {
                record.updated_at = Utc::now();
                match outcome {
                    Ok(result) => {
                        record.state = TaskState::Done;
                        record.message = "report ready".to_string();
                        record.result = Some(result);
                    }
                    Err(err) => {
                        warn!(task = %task_id, error = %err, "Analysis task failed");
                        record.state = TaskState::Error;
                        record.message = err.to_string();
                        record.error = Some(err.to_string());
                    }
                }
            }
        });

        Ok(id)
    }

    /// Snapshot of a task, terminal or not.
    pub fn status(&self, id: &str) -> Result<TaskRecord> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// Terminal result of a task. A finished task is cross-checked against
    /// the cache row it should have written; a missing row means the stores
    /// disagree and the caller should resubmit.
    pub async fn result(&self, id: &str) -> Result<AnalysisOutcome> {
        let record = self.status(id)?;
        match record.state {
            TaskState::Done => {
                let Some(outcome) = record.result else {
                    return Err(EngineError::Inconsistent(format!(
                        "task {id} finished without a result"
                    )));
                };
                let backing = self
                    .analyzer
                    .store()
                    .cached_analysis(
                        &outcome.reference.identity_key,
                        outcome.mode.as_str(),
                        Duration::ZERO,
                        true,
                    )
                    .await?;
                if backing.is_none() {
                    return Err(EngineError::Inconsistent(format!(
                        "no cached report behind finished task {id}"
                    )));
                }
                Ok(outcome)
            }
            TaskState::Error => Err(EngineError::TaskFailed(
                record.error.unwrap_or_else(|| "unknown failure".to_string()),
            )),
            TaskState::Pending | TaskState::Running => {
                Err(EngineError::TaskPending(id.to_string()))
            }
        }
    }

    /// Drop expired tasks: terminal ones past the TTL, and running ones whose
    /// heartbeat went silent for the same window.
    pub fn reap(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.task_ttl).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.updated_at < cutoff)
            .map(|t| t.id.clone())
            .collect();

        for id in &expired {
            if let Some(task) = state.tasks.remove(id) {
                state.live.retain(|_, live_id| live_id.as_str() != id.as_str());
                info!(task = %task.id, state = ?task.state, "Reaped expired task");
            }
        }
        expired.len()
    }

    /// Background reaper loop, one sweep every quarter TTL.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = self.task_ttl / 4;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                queue.reap();
            }
        })
    }
}

fn set_state(state: &Arc<Mutex<QueueState>>, id: &str, next: TaskState) {
    let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(record) = guard.tasks.get_mut(id) {
        record.state = next;
        if next == TaskState::Running {
            record.message = "scraping and analyzing".to_string();
        }
        record.updated_at = Utc::now();
    }
}

fn touch(state: &Arc<Mutex<QueueState>>, id: &str) {
    let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(record) = guard.tasks.get_mut(id) {
        record.updated_at = Utc::now();
    }
}

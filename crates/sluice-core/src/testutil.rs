//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::collector::{CollectorEvent, CollectorReporter};
use crate::error::AppError;
use crate::models::{CollectorState, NewStagingRow, RunCommit, StagingRow};
use crate::request::{ApiRequest, ApiResponse};
use crate::runner::{TaskEvent, TaskReporter};
use crate::traits::{RemoteRepo, RepoLookup, StagingStore, Transport};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, AppError> + Send + Sync;

/// Mock transport answering every request through a handler closure.
#[derive(Clone)]
pub struct MockTransport {
    handler: Arc<Handler>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, AppError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            requests: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    /// Always answer 200 with the given JSON body.
    pub fn json(body: serde_json::Value) -> Self {
        Self::new(move |req| Ok(ApiResponse::json(200, req.url.clone(), &body)))
    }

    /// Always answer with the given status and an empty JSON object.
    pub fn status(status: u16) -> Self {
        Self::new(move |req| Ok(ApiResponse::new(status, req.url.clone(), "{}")))
    }

    /// Always fail with a network error.
    pub fn with_error(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(AppError::NetworkError(message.clone())))
    }

    /// Sleep before answering, to observe concurrency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of concurrent `send` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = (self.handler)(request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// MemoryStagingStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRow {
    row: StagingRow,
    request_key: String,
    committed: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: Vec<StoredRow>,
    states: HashMap<String, CollectorState>,
}

/// In-memory staging store with the same run visibility rules as the
/// database repository.
#[derive(Clone, Default)]
pub struct MemoryStagingStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of a partition, in insertion order.
    pub fn load(&self, partition_key: &str) -> Vec<StagingRow> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|r| r.committed && r.row.partition_key == partition_key)
            .map(|r| r.row.clone())
            .collect()
    }

    pub fn uncommitted_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|r| !r.committed)
            .count()
    }

    pub fn state(&self, partition_key: &str) -> Option<CollectorState> {
        self.inner.lock().unwrap().states.get(partition_key).cloned()
    }
}

impl StagingStore for MemoryStagingStore {
    async fn collector_state(&self, partition_key: &str) -> Result<Option<CollectorState>, AppError> {
        Ok(self.state(partition_key))
    }

    async fn upsert_page(&self, row: &NewStagingRow) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.rows.iter_mut().find(|r| {
            r.row.partition_key == row.partition_key
                && r.row.run_id == row.run_id
                && r.request_key == row.request_key
        }) {
            existing.row.params = row.params.clone();
            existing.row.input = row.input.clone();
            existing.row.data = row.data.clone();
            return Ok(());
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(StoredRow {
            row: StagingRow {
                id,
                partition_key: row.partition_key.clone(),
                run_id: row.run_id,
                params: row.params.clone(),
                input: row.input.clone(),
                data: row.data.clone(),
                created_at: Utc::now(),
            },
            request_key: row.request_key.clone(),
            committed: false,
        });
        Ok(())
    }

    async fn commit_run(&self, commit: &RunCommit) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.rows.len();
        if commit.replace {
            // Uncommitted rows of other runs still in flight are left alone.
            inner.rows.retain(|r| {
                r.row.partition_key != commit.partition_key
                    || r.row.run_id == commit.run_id
                    || !r.committed
            });
        }
        let superseded = (before - inner.rows.len()) as u64;

        for r in inner.rows.iter_mut() {
            if r.row.partition_key == commit.partition_key && r.row.run_id == commit.run_id {
                r.committed = true;
            }
        }
        inner.states.insert(
            commit.partition_key.clone(),
            CollectorState {
                partition_key: commit.partition_key.clone(),
                cursor: commit.cursor,
                time_after: commit.time_after,
                latest_run_id: Some(commit.run_id),
                updated_at: Utc::now(),
            },
        );
        Ok(superseded)
    }

    async fn abort_run(&self, partition_key: &str, run_id: Uuid) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.rows.len();
        inner.rows.retain(|r| {
            r.committed || r.row.partition_key != partition_key || r.row.run_id != run_id
        });
        Ok((before - inner.rows.len()) as u64)
    }

    async fn load_partition(&self, partition_key: &str) -> Result<Vec<StagingRow>, AppError> {
        Ok(self.load(partition_key))
    }
}

// ---------------------------------------------------------------------------
// MockRepoLookup
// ---------------------------------------------------------------------------

/// Mock repository lookup. Unknown ids answer like a remote 404.
#[derive(Clone, Default)]
pub struct MockRepoLookup {
    repos: Arc<Mutex<HashMap<String, RemoteRepo>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockRepoLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(self, scope_id: &str, clone_url: &str) -> Self {
        self.with_resolved(scope_id, scope_id, clone_url)
    }

    /// A scope id (e.g. a `group/project` path) that resolves to another remote id.
    pub fn with_resolved(self, scope_id: &str, id: &str, clone_url: &str) -> Self {
        self.repos.lock().unwrap().insert(
            scope_id.to_string(),
            RemoteRepo {
                id: id.to_string(),
                clone_url: clone_url.to_string(),
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl RepoLookup for MockRepoLookup {
    async fn lookup(&self, scope_id: &str) -> Result<RemoteRepo, AppError> {
        self.calls.lock().unwrap().push(scope_id.to_string());
        let repo = self.repos.lock().unwrap().get(scope_id).cloned();
        match repo {
            Some(repo) => Ok(repo),
            None => Err(AppError::HttpStatus {
                status: 404,
                url: format!("projects/{scope_id}"),
                body: "404 Project Not Found".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock reporter that records collector and task events as short labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, label: String) {
        self.events.lock().unwrap().push(label);
    }
}

impl CollectorReporter for MockReporter {
    fn report(&self, event: CollectorEvent<'_>) {
        let label = match event {
            CollectorEvent::Started { resource, .. } => format!("started:{resource}"),
            CollectorEvent::PageCollected { page, items, .. } => {
                format!("page_collected:{page}:{items}")
            }
            CollectorEvent::PageSkipped { page, .. } => format!("page_skipped:{page}"),
            CollectorEvent::Committed { pages, .. } => format!("committed:{pages}"),
            CollectorEvent::Aborted { discarded, .. } => format!("aborted:{discarded}"),
        };
        self.push(label);
    }
}

impl TaskReporter for MockReporter {
    fn report(&self, event: TaskEvent<'_>) {
        let label = match event {
            TaskEvent::TaskStarted { plugin, .. } => format!("task_started:{plugin}"),
            TaskEvent::SubtaskStarted { subtask, .. } => format!("subtask_started:{subtask}"),
            TaskEvent::SubtaskFinished { subtask, .. } => format!("subtask_finished:{subtask}"),
            TaskEvent::SubtaskFailed { subtask, .. } => format!("subtask_failed:{subtask}"),
            TaskEvent::TaskFinished { plugin } => format!("task_finished:{plugin}"),
        };
        self.push(label);
    }
}

use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CollectorState, NewStagingRow, RunCommit, StagingRow};
use crate::request::{ApiRequest, ApiResponse};

/// Sends one fully built request and buffers the response.
///
/// Implementations report transport failures (connect, timeout, TLS) as
/// errors and return every HTTP status, including non-2xx, as a response.
pub trait Transport: Send + Sync + Clone + 'static {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, AppError>> + Send;
}

/// Mutates a request before it is sent (auth headers, signing).
///
/// An error aborts the call before it reaches the rate limiter.
pub trait RequestHook: Send + Sync {
    fn before_request(&self, request: &mut ApiRequest) -> Result<(), AppError>;
}

/// Outcome of [`ResponseHook::after_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// Fall through to the default status classification.
    Continue,
    /// Treat as an empty, successful page.
    Ignore,
    /// Credentials rejected: fail this call and every later one.
    Unauthorized,
    /// Fail this call with a message.
    Fail(String),
}

/// Classifies a response before the client's default status handling.
pub trait ResponseHook: Send + Sync {
    fn after_response(&self, response: &ApiResponse) -> ResponseAction;
}

/// Durable storage for staged pages and per-partition collector state.
///
/// Pages are written tagged with a run id and stay invisible to
/// [`load_partition`](StagingStore::load_partition) until the run is
/// committed.
pub trait StagingStore: Send + Sync + Clone + 'static {
    /// State left by the last committed run of a partition.
    fn collector_state(
        &self,
        partition_key: &str,
    ) -> impl Future<Output = Result<Option<CollectorState>, AppError>> + Send;

    /// Insert or overwrite one page. Repeating the same request within a
    /// run overwrites the earlier row.
    fn upsert_page(&self, row: &NewStagingRow) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Publish a run atomically. With `replace`, every row of the partition
    /// not written by this run is deleted in the same transaction.
    /// Returns the number of rows superseded.
    fn commit_run(&self, commit: &RunCommit) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Discard the uncommitted rows of a failed or cancelled run.
    fn abort_run(
        &self,
        partition_key: &str,
        run_id: Uuid,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Committed rows of a partition in insertion order.
    fn load_partition(
        &self,
        partition_key: &str,
    ) -> impl Future<Output = Result<Vec<StagingRow>, AppError>> + Send;
}

/// A remote repository resolved from a scope id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepo {
    pub id: String,
    pub clone_url: String,
}

/// Just-in-time lookup of a repository's clone URL during plan compilation.
pub trait RepoLookup: Send + Sync {
    fn lookup(&self, scope_id: &str) -> impl Future<Output = Result<RemoteRepo, AppError>> + Send;
}

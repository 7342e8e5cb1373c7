//! Paginated collection of one remote resource into a staging partition.
//!
//! ```text
//! INIT -> FETCH_PAGE -> PERSIST_PAGE -> (more pages?) -> FETCH_PAGE | DONE
//!                                                           DONE -> commit_run
//! any error / cancellation ----------------------------------------> abort_run
//! ```
//!
//! Pages of a run are written under a fresh run id and only become visible
//! once the run commits, so readers never observe a partition mixing two
//! runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::AsyncClient;
use crate::error::AppError;
use crate::models::{NewStagingRow, Partition, RunCommit, SyncDecision, SyncPolicy, compute_hash};
use crate::request::{ApiRequest, ApiResponse, Method, Pager, RequestData, UrlTemplate};
use crate::traits::{StagingStore, Transport};

/// Splits a response body into the items of one page.
pub type ResponseParser = Arc<dyn Fn(&ApiResponse) -> Result<Vec<serde_json::Value>, AppError> + Send + Sync>;
/// Total number of pages, read from the first response.
pub type TotalPagesFn = Arc<dyn Fn(&ApiResponse, &Pager) -> Result<usize, AppError> + Send + Sync>;
/// Cursor of the next page, `None` when the last page was reached.
pub type NextCursorFn = Arc<dyn Fn(&ApiResponse) -> Result<Option<String>, AppError> + Send + Sync>;
/// Request body of a POST resource (GraphQL query and variables).
pub type BodyFn = Arc<dyn Fn(&RequestData) -> Result<serde_json::Value, AppError> + Send + Sync>;

/// How the collector walks the pages of a resource.
#[derive(Clone)]
pub enum Pagination {
    /// One request, no paging.
    Single,
    /// Page count known from the first response; the remaining pages are
    /// fetched concurrently.
    TotalPages(TotalPagesFn),
    /// Sequential until a short or empty page.
    UntilEmpty,
    /// Sequential, each response names the next cursor.
    Cursor(NextCursorFn),
}

impl Pagination {
    /// Page count read from a response header such as `X-Total-Pages`.
    pub fn total_pages_header(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        Pagination::TotalPages(Arc::new(move |response, _| {
            let raw = response
                .header(&name)
                .ok_or_else(|| AppError::MissingField(name.clone()))?;
            raw.trim()
                .parse()
                .map_err(|_| AppError::InvalidInput(format!("Header {name} is not a page count: '{raw}'")))
        }))
    }

    /// Page count derived from a total item count header such as `X-Total`.
    pub fn total_items_header(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        Pagination::TotalPages(Arc::new(move |response, pager| {
            let raw = response
                .header(&name)
                .ok_or_else(|| AppError::MissingField(name.clone()))?;
            let total: usize = raw
                .trim()
                .parse()
                .map_err(|_| AppError::InvalidInput(format!("Header {name} is not a count: '{raw}'")))?;
            Ok(total.div_ceil(pager.size.max(1)))
        }))
    }
}

impl std::fmt::Debug for Pagination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pagination::Single => write!(f, "Single"),
            Pagination::TotalPages(_) => write!(f, "TotalPages"),
            Pagination::UntilEmpty => write!(f, "UntilEmpty"),
            Pagination::Cursor(_) => write!(f, "Cursor"),
        }
    }
}

/// Where an item's update time lives and how the server filters by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    /// JSON pointer into each item, e.g. `/updated_at`.
    pub pointer: String,
    /// Query parameter receiving the watermark, e.g. `updated_after`.
    pub query_param: Option<String>,
}

impl Watermark {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            query_param: None,
        }
    }

    pub fn with_query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = Some(name.into());
        self
    }

    fn read(&self, item: &serde_json::Value) -> Option<DateTime<Utc>> {
        item.pointer(&self.pointer)
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Items of a JSON array found at `pointer` (`""` for the body itself).
pub fn items_at(pointer: impl Into<String>) -> ResponseParser {
    let pointer = pointer.into();
    Arc::new(move |response| {
        let body: serde_json::Value = response.json_body()?;
        match body.pointer(&pointer) {
            Some(serde_json::Value::Array(items)) => Ok(items.clone()),
            Some(serde_json::Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(AppError::InvalidInput(format!(
                "Expected a JSON array at '{pointer}' in response from {}",
                response.url
            ))),
        }
    })
}

/// Description of a remote resource: how to request and parse its pages.
#[derive(Clone)]
pub struct Resource {
    pub name: String,
    method: Method,
    url: UrlTemplate,
    query: Vec<(String, UrlTemplate)>,
    body: Option<BodyFn>,
    parser: ResponseParser,
    pagination: Pagination,
    watermark: Option<Watermark>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("pagination", &self.pagination)
            .field("watermark", &self.watermark)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// A GET resource whose body is a JSON array, fetched in one request.
    pub fn get(name: impl Into<String>, url: &str) -> Result<Self, AppError> {
        Ok(Self {
            name: name.into(),
            method: Method::Get,
            url: UrlTemplate::parse(url)?,
            query: Vec::new(),
            body: None,
            parser: items_at(""),
            pagination: Pagination::Single,
            watermark: None,
        })
    }

    /// A POST resource with a body rendered per page.
    pub fn post(name: impl Into<String>, url: &str, body: BodyFn) -> Result<Self, AppError> {
        Ok(Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(name, url)?
        })
    }

    /// Add a query parameter rendered per page.
    ///
    /// Parameters referencing `{cursor}` or `{since}` are omitted while
    /// that value is unknown.
    pub fn with_query(mut self, key: impl Into<String>, template: &str) -> Result<Self, AppError> {
        self.query.push((key.into(), UrlTemplate::parse(template)?));
        Ok(self)
    }

    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    pub fn build_request(&self, data: &RequestData) -> Result<ApiRequest, AppError> {
        let url = self.url.render(data)?;
        let mut request = match self.method {
            Method::Get => ApiRequest::get(url),
            Method::Post => {
                let body = match &self.body {
                    Some(body) => body(data)?,
                    None => serde_json::Value::Null,
                };
                ApiRequest::post(url, body)
            }
        };

        for (key, template) in &self.query {
            if (template.uses_cursor() && data.cursor.is_none())
                || (template.uses_since() && data.since.is_none())
            {
                continue;
            }
            request.query.push((key.clone(), template.render(data)?));
        }
        if let Some(param) = self.watermark.as_ref().and_then(|w| w.query_param.as_ref())
            && let Some(since) = data.since
        {
            request.query.push((
                param.clone(),
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        Ok(request)
    }
}

/// Configuration for [`ApiCollector`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub page_size: usize,
    /// Parent inputs, and pages of a counted resource, processed at once.
    pub concurrency: usize,
    /// Keep prior rows and only fetch items newer than the stored cursor.
    pub incremental: bool,
    /// Retries of a retryable failure per page. The default of 0 leaves
    /// retry decisions to the caller.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub sync_policy: Option<SyncPolicy>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 4,
            incremental: false,
            max_retries: 0,
            retry_backoff: Duration::from_secs(1),
            sync_policy: None,
        }
    }
}

impl CollectorConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = Some(policy);
        self
    }
}

/// Events emitted by the collector for progress observation.
#[derive(Debug, Clone)]
pub enum CollectorEvent<'a> {
    Started {
        partition_key: &'a str,
        resource: &'a str,
        run_id: Uuid,
        incremental: bool,
        since: Option<DateTime<Utc>>,
    },
    PageCollected {
        resource: &'a str,
        page: usize,
        items: usize,
    },
    PageSkipped {
        resource: &'a str,
        page: usize,
        status: Option<u16>,
    },
    Committed {
        partition_key: &'a str,
        run_id: Uuid,
        pages: usize,
        items: usize,
        superseded: u64,
    },
    Aborted {
        partition_key: &'a str,
        run_id: Uuid,
        error: &'a str,
        discarded: u64,
    },
}

/// Trait for receiving collector events (decoupled logging).
pub trait CollectorReporter: Send + Sync {
    fn report(&self, event: CollectorEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCollectorReporter;

impl CollectorReporter for TracingCollectorReporter {
    fn report(&self, event: CollectorEvent<'_>) {
        match event {
            CollectorEvent::Started {
                partition_key,
                resource,
                run_id,
                incremental,
                since,
            } => {
                tracing::info!(partition = %partition_key, %resource, %run_id, incremental, ?since, "Collection started");
            }
            CollectorEvent::PageCollected {
                resource,
                page,
                items,
            } => {
                tracing::debug!(%resource, page, items, "Page collected");
            }
            CollectorEvent::PageSkipped {
                resource,
                page,
                status,
            } => {
                tracing::info!(%resource, page, ?status, "Page skipped");
            }
            CollectorEvent::Committed {
                partition_key,
                run_id,
                pages,
                items,
                superseded,
            } => {
                tracing::info!(partition = %partition_key, %run_id, pages, items, superseded, "Collection committed");
            }
            CollectorEvent::Aborted {
                partition_key,
                run_id,
                error,
                discarded,
            } => {
                tracing::warn!(partition = %partition_key, %run_id, %error, discarded, "Collection aborted");
            }
        }
    }
}

/// Outcome of a committed collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSummary {
    pub run_id: Uuid,
    pub partition_key: String,
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
    /// Pages persisted.
    pub pages: usize,
    /// Items persisted across all pages.
    pub items: usize,
    /// Calls degraded to a soft-skip.
    pub skipped: usize,
    /// Cursor stored with the commit.
    pub cursor: Option<DateTime<Utc>>,
    /// Rows of earlier runs removed by the commit.
    pub superseded: u64,
}

/// Per-run state shared by every page future of one collection.
struct Run<'a, R> {
    partition: &'a Partition,
    partition_key: String,
    run_id: Uuid,
    resource: &'a Resource,
    since: Option<DateTime<Utc>>,
    cancel: &'a CancellationToken,
    reporter: &'a R,
    pages: AtomicUsize,
    items: AtomicUsize,
    skipped: AtomicUsize,
    max_watermark: Mutex<Option<DateTime<Utc>>>,
}

impl<R> Run<'_, R> {
    fn observe(&self, watermark: DateTime<Utc>) {
        let mut max = self
            .max_watermark
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if max.is_none_or(|m| watermark > m) {
            *max = Some(watermark);
        }
    }

    fn observed(&self) -> Option<DateTime<Utc>> {
        *self
            .max_watermark
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of fetching one page.
struct Page {
    response: Option<ApiResponse>,
    /// Items the server returned.
    fetched: usize,
    /// Every returned item was older than the watermark.
    stale: bool,
    skipped: bool,
}

impl Page {
    fn skipped() -> Self {
        Self {
            response: None,
            fetched: 0,
            stale: false,
            skipped: true,
        }
    }
}

/// Drives an [`AsyncClient`] across all pages of a resource and stages them.
pub struct ApiCollector<T, S> {
    client: AsyncClient<T>,
    store: S,
    config: CollectorConfig,
}

impl<T: Transport, S: StagingStore> ApiCollector<T, S> {
    pub fn new(client: AsyncClient<T>, store: S, config: CollectorConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Collect every page of `resource` into `partition`.
    ///
    /// With `inputs`, the page loop runs once per parent record and each
    /// row echoes the input that produced it. An empty input list commits
    /// an empty run.
    pub async fn collect<R: CollectorReporter>(
        &self,
        partition: &Partition,
        resource: &Resource,
        inputs: Option<Vec<serde_json::Value>>,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<CollectionSummary, AppError> {
        let partition_key = partition.key();
        let state = self.store.collector_state(&partition_key).await?;
        let decision = SyncDecision::resolve(
            self.config.incremental,
            self.config.sync_policy.as_ref(),
            state.as_ref(),
        );

        let run = Run {
            partition,
            partition_key,
            run_id: Uuid::new_v4(),
            resource,
            since: decision.since,
            cancel,
            reporter,
            pages: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            max_watermark: Mutex::new(None),
        };
        reporter.report(CollectorEvent::Started {
            partition_key: &run.partition_key,
            resource: &resource.name,
            run_id: run.run_id,
            incremental: decision.incremental,
            since: decision.since,
        });

        let inputs: Vec<Option<serde_json::Value>> = match inputs {
            Some(inputs) => inputs.into_iter().map(Some).collect(),
            None => vec![None],
        };
        let result = stream::iter(inputs)
            .map(Ok)
            .try_for_each_concurrent(self.config.concurrency.max(1), |input| {
                let run = &run;
                async move { self.collect_input(run, input.as_ref()).await }
            })
            .await;
        let result = match result {
            Ok(()) if cancel.is_cancelled() => Err(AppError::Cancelled),
            other => other,
        };

        let cursor = [state.and_then(|s| s.cursor), run.observed()]
            .into_iter()
            .flatten()
            .max();
        let commit = RunCommit {
            partition_key: run.partition_key.clone(),
            run_id: run.run_id,
            replace: !decision.incremental,
            cursor,
            time_after: self.config.sync_policy.as_ref().and_then(|p| p.time_after),
        };
        let committed = match result {
            Ok(()) => self.store.commit_run(&commit).await,
            Err(e) => Err(e),
        };

        match committed {
            Ok(superseded) => {
                let summary = CollectionSummary {
                    run_id: run.run_id,
                    partition_key: run.partition_key.clone(),
                    incremental: decision.incremental,
                    since: decision.since,
                    pages: run.pages.load(Ordering::Acquire),
                    items: run.items.load(Ordering::Acquire),
                    skipped: run.skipped.load(Ordering::Acquire),
                    cursor,
                    superseded,
                };
                reporter.report(CollectorEvent::Committed {
                    partition_key: &summary.partition_key,
                    run_id: summary.run_id,
                    pages: summary.pages,
                    items: summary.items,
                    superseded,
                });
                Ok(summary)
            }
            Err(e) => {
                let discarded = self
                    .store
                    .abort_run(&run.partition_key, run.run_id)
                    .await
                    .unwrap_or_else(|abort_err| {
                        tracing::error!(
                            partition = %run.partition_key,
                            run_id = %run.run_id,
                            error = %abort_err,
                            "Failed to discard rows of aborted run"
                        );
                        0
                    });
                reporter.report(CollectorEvent::Aborted {
                    partition_key: &run.partition_key,
                    run_id: run.run_id,
                    error: &e.to_string(),
                    discarded,
                });
                Err(e)
            }
        }
    }

    async fn collect_input<R: CollectorReporter>(
        &self,
        run: &Run<'_, R>,
        input: Option<&serde_json::Value>,
    ) -> Result<(), AppError> {
        let size = self.config.page_size.max(1);
        match &run.resource.pagination {
            Pagination::Single => {
                self.fetch_page(run, input, Pager::new(1, size), None).await?;
            }
            Pagination::TotalPages(total_pages) => {
                let first = self.fetch_page(run, input, Pager::new(1, size), None).await?;
                let Some(response) = first.response else {
                    return Ok(());
                };
                let total = total_pages(&response, &Pager::new(1, size))?;
                stream::iter(2..=total)
                    .map(Ok)
                    .try_for_each_concurrent(self.config.concurrency.max(1), |page| async move {
                        self.fetch_page(run, input, Pager::new(page, size), None)
                            .await
                            .map(|_| ())
                    })
                    .await?;
            }
            Pagination::UntilEmpty => {
                let mut page = 1;
                loop {
                    let fetched = self.fetch_page(run, input, Pager::new(page, size), None).await?;
                    if fetched.skipped || fetched.stale || fetched.fetched < size {
                        break;
                    }
                    page += 1;
                }
            }
            Pagination::Cursor(next_cursor) => {
                let mut page = 1;
                let mut cursor: Option<String> = None;
                loop {
                    let fetched = self
                        .fetch_page(run, input, Pager::new(page, size), cursor.clone())
                        .await?;
                    let Some(response) = fetched.response else {
                        break;
                    };
                    if fetched.stale {
                        break;
                    }
                    match next_cursor(&response)? {
                        Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                            cursor = Some(next);
                            page += 1;
                        }
                        _ => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_page<R: CollectorReporter>(
        &self,
        run: &Run<'_, R>,
        input: Option<&serde_json::Value>,
        pager: Pager,
        cursor: Option<String>,
    ) -> Result<Page, AppError> {
        if run.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let data = RequestData {
            pager,
            params: run.partition.params.clone(),
            input: input.cloned(),
            cursor,
            since: run.since,
        };
        let request = run.resource.build_request(&data)?;
        let echo = serde_json::json!({
            "url": request.url,
            "query": request.query,
            "page": pager.page,
            "size": pager.size,
            "cursor": data.cursor,
            "input": data.input,
        });

        let response = match self.execute_with_retry(&request, run.cancel).await {
            Ok(response) => response,
            Err(e) if e.is_soft_skip() => {
                run.skipped.fetch_add(1, Ordering::AcqRel);
                run.reporter.report(CollectorEvent::PageSkipped {
                    resource: &run.resource.name,
                    page: pager.page,
                    status: e.status_code(),
                });
                return Ok(Page::skipped());
            }
            Err(e) => return Err(e),
        };

        let items = (run.resource.parser)(&response)?;
        let fetched = items.len();
        let kept: Vec<serde_json::Value> = items
            .into_iter()
            .filter(|item| {
                let watermark = run.resource.watermark.as_ref().and_then(|w| w.read(item));
                if let Some(watermark) = watermark {
                    if run.since.is_some_and(|since| watermark < since) {
                        return false;
                    }
                    run.observe(watermark);
                }
                true
            })
            .collect();

        if !kept.is_empty() {
            let row = NewStagingRow {
                partition_key: run.partition_key.clone(),
                run_id: run.run_id,
                request_key: compute_hash(&echo.to_string()),
                params: run.partition.params.clone(),
                input: echo,
                data: serde_json::to_vec(&kept)?,
            };
            self.store.upsert_page(&row).await?;
            run.pages.fetch_add(1, Ordering::AcqRel);
            run.items.fetch_add(kept.len(), Ordering::AcqRel);
            run.reporter.report(CollectorEvent::PageCollected {
                resource: &run.resource.name,
                page: pager.page,
                items: kept.len(),
            });
        }

        Ok(Page {
            stale: fetched > 0 && kept.is_empty(),
            fetched,
            response: Some(response),
            skipped: false,
        })
    }

    async fn execute_with_retry(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse, AppError> {
        let mut attempt = 0;
        loop {
            match self.client.execute(request.clone(), cancel).await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        url = %request.url,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Retrying page request"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(AppError::Cancelled),
                        () = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

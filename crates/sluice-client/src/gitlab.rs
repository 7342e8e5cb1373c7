//! GitLab connector: plugin descriptor, project lookup and collection
//! subtasks over the v4 REST API.

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use sluice_core::client::{AsyncClient, ClientConfig};
use sluice_core::collector::{
    ApiCollector, CollectionSummary, CollectorConfig, Pagination, Resource, TracingCollectorReporter,
    Watermark,
};
use sluice_core::error::AppError;
use sluice_core::models::{Partition, SyncPolicy};
use sluice_core::plan::Options;
use sluice_core::rate_limit::RateLimitHeaders;
use sluice_core::registry::PluginDescriptor;
use sluice_core::request::ApiRequest;
use sluice_core::runner::{Plugin, TaskContext};
use sluice_core::subtask::{DomainType, SubTaskMeta};
use sluice_core::traits::{RemoteRepo, RepoLookup, StagingStore, Transport};
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "gitlab";

pub const MILESTONES_TABLE: &str = "gitlab_api_milestones";
pub const ISSUES_TABLE: &str = "gitlab_api_issues";
pub const MERGE_REQUESTS_TABLE: &str = "gitlab_api_merge_requests";
pub const MR_NOTES_TABLE: &str = "gitlab_api_mr_notes";
pub const PIPELINES_TABLE: &str = "gitlab_api_pipelines";

/// Registry entry for GitLab projects.
pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_NAME, "GitlabProject", "projectId")
}

/// Client configuration reading GitLab's `RateLimit-*` headers.
pub fn client_config(endpoint: impl Into<String>) -> ClientConfig {
    ClientConfig::new(endpoint).with_rate_limit_headers(RateLimitHeaders::gitlab())
}

/// GitLab accepts a numeric id or an url-encoded `group/project` path.
fn project_path(scope_id: &str) -> String {
    format!("projects/{}", scope_id.replace('/', "%2F"))
}

/// Resolves a project's HTTP clone URL through `GET /projects/:id`.
#[derive(Clone)]
pub struct GitlabProjectLookup<T> {
    client: AsyncClient<T>,
    cancel: CancellationToken,
}

impl<T: Transport> GitlabProjectLookup<T> {
    pub fn new(client: AsyncClient<T>) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(serde::Deserialize)]
struct ProjectResponse {
    id: u64,
    http_url_to_repo: String,
}

impl<T: Transport> RepoLookup for GitlabProjectLookup<T> {
    async fn lookup(&self, scope_id: &str) -> Result<RemoteRepo, AppError> {
        let response = self
            .client
            .execute(ApiRequest::get(project_path(scope_id)), &self.cancel)
            .await?;
        let project: ProjectResponse = response.json_body()?;
        tracing::debug!(project = project.id, url = %project.http_url_to_repo, "Resolved GitLab project");
        Ok(RemoteRepo {
            id: project.id.to_string(),
            clone_url: project.http_url_to_repo,
        })
    }
}

fn paged(name: &str, url: &str) -> Result<Resource, AppError> {
    Resource::get(name, url)?
        .with_query("page", "{page}")?
        .with_query("per_page", "{size}")
}

fn updated_since(resource: Resource) -> Result<Resource, AppError> {
    Ok(resource
        .with_query("order_by", "updated_at")?
        .with_query("sort", "asc")?
        .with_watermark(Watermark::new("/updated_at").with_query_param("updated_after")))
}

pub fn milestones_resource() -> Result<Resource, AppError> {
    Ok(paged("milestones", "projects/{params.projectId}/milestones")?
        .with_pagination(Pagination::total_pages_header("X-Total-Pages")))
}

pub fn issues_resource() -> Result<Resource, AppError> {
    Ok(updated_since(paged("issues", "projects/{params.projectId}/issues")?)?
        .with_pagination(Pagination::total_pages_header("X-Total-Pages")))
}

pub fn merge_requests_resource() -> Result<Resource, AppError> {
    Ok(updated_since(paged("merge_requests", "projects/{params.projectId}/merge_requests")?)?
        .with_pagination(Pagination::total_pages_header("X-Total-Pages")))
}

/// Notes of one merge request; driven by `{"iid": ..}` inputs.
pub fn mr_notes_resource() -> Result<Resource, AppError> {
    Ok(paged(
        "mr_notes",
        "projects/{params.projectId}/merge_requests/{input.iid}/notes",
    )?
    .with_query("system", "false")?
    .with_pagination(Pagination::UntilEmpty))
}

pub fn pipelines_resource() -> Result<Resource, AppError> {
    Ok(updated_since(paged("pipelines", "projects/{params.projectId}/pipelines")?)?
        .with_pagination(Pagination::total_pages_header("X-Total-Pages")))
}

/// Per-task state handed to every GitLab subtask.
pub struct GitlabTaskData<T, S> {
    pub collector: ApiCollector<T, S>,
    pub store: S,
    pub connection_id: u64,
    pub project_id: u64,
}

impl<T: Transport, S: StagingStore> GitlabTaskData<T, S> {
    pub fn partition(&self, table: &str) -> Partition {
        Partition::new(
            self.connection_id,
            serde_json::json!({ "projectId": self.project_id }),
            table,
        )
    }

    async fn collect(
        &self,
        table: &str,
        resource: Resource,
        inputs: Option<Vec<serde_json::Value>>,
        cancel: &CancellationToken,
    ) -> Result<CollectionSummary, AppError> {
        self.collector
            .collect(&self.partition(table), &resource, inputs, cancel, &TracingCollectorReporter)
            .await
    }

    /// `{"iid": n}` for every merge request staged by the last committed run.
    async fn merge_request_inputs(&self) -> Result<Vec<serde_json::Value>, AppError> {
        let rows = self
            .store
            .load_partition(&self.partition(MERGE_REQUESTS_TABLE).key())
            .await?;
        let mut iids = BTreeSet::new();
        for row in rows {
            if let serde_json::Value::Array(items) = row.payload()? {
                iids.extend(items.iter().filter_map(|mr| mr.get("iid").and_then(serde_json::Value::as_u64)));
            }
        }
        Ok(iids.into_iter().map(|iid| serde_json::json!({ "iid": iid })).collect())
    }
}

type Ctx<T, S> = TaskContext<GitlabTaskData<T, S>>;
type SubtaskFuture<'a> = BoxFuture<'a, Result<(), AppError>>;

fn collect_milestones<T: Transport, S: StagingStore>(ctx: &Ctx<T, S>) -> SubtaskFuture<'_> {
    Box::pin(async move {
        ctx.data()
            .collect(MILESTONES_TABLE, milestones_resource()?, None, ctx.cancel_token())
            .await
            .map(|_| ())
    })
}

fn collect_issues<T: Transport, S: StagingStore>(ctx: &Ctx<T, S>) -> SubtaskFuture<'_> {
    Box::pin(async move {
        ctx.data()
            .collect(ISSUES_TABLE, issues_resource()?, None, ctx.cancel_token())
            .await
            .map(|_| ())
    })
}

fn collect_merge_requests<T: Transport, S: StagingStore>(ctx: &Ctx<T, S>) -> SubtaskFuture<'_> {
    Box::pin(async move {
        ctx.data()
            .collect(MERGE_REQUESTS_TABLE, merge_requests_resource()?, None, ctx.cancel_token())
            .await
            .map(|_| ())
    })
}

fn collect_mr_notes<T: Transport, S: StagingStore>(ctx: &Ctx<T, S>) -> SubtaskFuture<'_> {
    Box::pin(async move {
        let data = ctx.data();
        let inputs = data.merge_request_inputs().await?;
        data.collect(MR_NOTES_TABLE, mr_notes_resource()?, Some(inputs), ctx.cancel_token())
            .await
            .map(|_| ())
    })
}

fn collect_pipelines<T: Transport, S: StagingStore>(ctx: &Ctx<T, S>) -> SubtaskFuture<'_> {
    Box::pin(async move {
        ctx.data()
            .collect(PIPELINES_TABLE, pipelines_resource()?, None, ctx.cancel_token())
            .await
            .map(|_| ())
    })
}

/// Subtasks of the GitLab plugin, in dependency order.
pub fn subtasks<T: Transport, S: StagingStore>() -> Vec<SubTaskMeta<GitlabTaskData<T, S>>> {
    vec![
        SubTaskMeta::new("collectMilestones", collect_milestones::<T, S>)
            .with_description("Collect milestone data from GitLab API")
            .with_domain_types(&[DomainType::Ticket]),
        SubTaskMeta::new("collectIssues", collect_issues::<T, S>)
            .with_description("Collect issues data from GitLab API")
            .with_domain_types(&[DomainType::Ticket])
            .with_dependencies(&["collectMilestones"]),
        SubTaskMeta::new("collectMergeRequests", collect_merge_requests::<T, S>)
            .with_description("Collect merge requests data from GitLab API")
            .with_domain_types(&[DomainType::CodeReview, DomainType::Code]),
        SubTaskMeta::new("collectMrNotes", collect_mr_notes::<T, S>)
            .with_description("Collect merge request notes from GitLab API")
            .with_domain_types(&[DomainType::CodeReview])
            .with_dependencies(&["collectMergeRequests"]),
        SubTaskMeta::new("collectPipelines", collect_pipelines::<T, S>)
            .with_description("Collect pipeline data from GitLab API")
            .with_domain_types(&[DomainType::Cicd]),
    ]
}

/// The GitLab plugin over a shared client and staging store.
pub struct GitlabPlugin<T, S> {
    client: AsyncClient<T>,
    store: S,
    config: CollectorConfig,
}

impl<T: Transport, S: StagingStore> GitlabPlugin<T, S> {
    pub fn new(client: AsyncClient<T>, store: S, config: CollectorConfig) -> Self {
        Self {
            client,
            store,
            config,
        }
    }
}

fn required_u64(options: &Options, field: &str) -> Result<u64, AppError> {
    match options.get(field) {
        None | Some(serde_json::Value::Null) => Err(AppError::MissingField(field.into())),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| AppError::InvalidInput(format!("{field} must be a positive integer, got {value}"))),
    }
}

impl<T: Transport, S: StagingStore> Plugin for GitlabPlugin<T, S> {
    type Data = GitlabTaskData<T, S>;

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn subtasks(&self) -> Vec<SubTaskMeta<Self::Data>> {
        subtasks::<T, S>()
    }

    async fn prepare_task_data(&self, options: &Options) -> Result<Self::Data, AppError> {
        let connection_id = required_u64(options, "connectionId")?;
        let project_id = required_u64(options, "projectId")?;

        let mut config = self.config.clone();
        if let Some(policy) = options.get("syncPolicy").filter(|v| !v.is_null()) {
            let policy: SyncPolicy = serde_json::from_value(policy.clone())?;
            config = config.with_sync_policy(policy);
        }

        Ok(GitlabTaskData {
            collector: ApiCollector::new(self.client.clone(), self.store.clone(), config),
            store: self.store.clone(),
            connection_id,
            project_id,
        })
    }
}

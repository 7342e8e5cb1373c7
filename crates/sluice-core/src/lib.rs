pub mod client;
pub mod collector;
pub mod compiler;
pub mod error;
pub mod models;
pub mod plan;
pub mod rate_limit;
pub mod registry;
pub mod request;
pub mod runner;
pub mod subtask;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use client::{AsyncClient, ClientConfig};
pub use collector::{
    ApiCollector, CollectionSummary, CollectorConfig, CollectorEvent, CollectorReporter,
    Pagination, Resource, TracingCollectorReporter, Watermark,
};
pub use compiler::{CompiledPlan, ConnectionInfo, PlanCompiler};
pub use error::AppError;
pub use models::{Partition, StagingRow, SyncPolicy, compute_hash};
pub use plan::{PipelinePlan, PipelineStage, PipelineTask, ScopeConfig};
pub use rate_limit::{RateLimitHeaders, RateLimitState, RateLimiter};
pub use registry::{DomainIdGenerator, PluginDescriptor, PluginRegistry};
pub use request::{ApiRequest, ApiResponse, Method};
pub use runner::{Plugin, TaskContext, TaskReporter, TracingTaskReporter, run_task};
pub use subtask::{DomainType, SubTaskMeta};
pub use traits::{RemoteRepo, RepoLookup, RequestHook, ResponseAction, ResponseHook, StagingStore, Transport};

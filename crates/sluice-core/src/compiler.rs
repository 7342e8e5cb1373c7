//! Compiles blueprint scopes into a staged [`PipelinePlan`].
//!
//! Each scope yields its own stage list:
//!
//! ```text
//! stage 0      primary task [+ gitextractor when CODE is requested]
//! stage 1..n   synthetic stages (refdiff, then the deprecated dora task)
//! ```
//!
//! Synthetic stages are collected as pending insertions while the primary
//! stage is built and placed in one pass afterwards. The final plan is the
//! concatenation of every scope's stage list, so scopes never share a
//! synthetic stage. A scope that fails to compile is reported and left out
//! without affecting the others.

use std::collections::HashMap;
use std::fmt;

use url::Url;

use crate::error::AppError;
use crate::plan::{Options, PipelinePlan, PipelineStage, PipelineTask, ScopeConfig};
use crate::registry::{DomainIdGenerator, PluginDescriptor, PluginRegistry};
use crate::subtask::{DomainType, SubTaskMeta, select_subtasks, validate_subtasks};
use crate::traits::{RemoteRepo, RepoLookup};

const REFDIFF_PLUGIN: &str = "refdiff";
const REFDIFF_KEY: &str = "refdiff";
const GITEXTRACTOR_PLUGIN: &str = "gitextractor";
const DORA_PLUGIN: &str = "dora";
const PRODUCTION_PATTERN_KEY: &str = "productionPattern";

/// Connection the plan is compiled for.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub token: String,
    pub proxy: Option<String>,
}

impl ConnectionInfo {
    pub fn new(id: u64, token: impl Into<String>) -> Self {
        Self {
            id,
            token: token.into(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// A scope that could not be compiled.
#[derive(Debug)]
pub struct ScopeFailure {
    pub index: usize,
    pub error: AppError,
}

/// Plan built from the scopes that compiled, plus the failures.
#[derive(Debug)]
pub struct CompiledPlan {
    pub plan: PipelinePlan,
    pub failures: Vec<ScopeFailure>,
}

impl CompiledPlan {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The plan, or the first scope failure.
    pub fn into_result(self) -> Result<PipelinePlan, AppError> {
        match self.failures.into_iter().next() {
            None => Ok(self.plan),
            Some(ScopeFailure { index, error }) => Err(AppError::ScopeCompile {
                index,
                source: Box::new(error),
            }),
        }
    }
}

/// Which rule produced a synthetic stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyntheticRule {
    Diff,
    /// Deprecated: kept so old blueprints with `productionPattern` still run.
    Enrichment,
}

/// A synthetic stage waiting to be placed after `anchor`.
#[derive(Debug)]
struct PendingStage {
    rule: SyntheticRule,
    anchor: usize,
    task: PipelineTask,
}

/// Place pending stages: each goes to the first free slot after its anchor,
/// in the order the stages were queued. Slots are never shared.
fn place_pending(primary: PipelineStage, pending: Vec<PendingStage>) -> Vec<PipelineStage> {
    let mut slots: Vec<Option<PipelineStage>> = vec![Some(primary)];
    for p in pending {
        let mut slot = p.anchor + 1;
        while slots.get(slot).is_some_and(Option::is_some) {
            slot += 1;
        }
        if slot >= slots.len() {
            slots.resize_with(slot + 1, || None);
        }
        tracing::debug!(rule = ?p.rule, slot, plugin = %p.task.plugin, "Placed synthetic stage");
        slots[slot] = Some(PipelineStage::new(vec![p.task]));
    }
    slots.into_iter().flatten().collect()
}

/// Turns scopes of one plugin into a plan.
pub struct PlanCompiler<'r, L> {
    registry: &'r PluginRegistry,
    lookup: L,
}

impl<'r, L: RepoLookup> PlanCompiler<'r, L> {
    pub fn new(registry: &'r PluginRegistry, lookup: L) -> Self {
        Self { registry, lookup }
    }

    /// Compile every scope.
    ///
    /// Fails as a whole only when the plugin is unknown or its subtask list
    /// is invalid; per-scope problems end up in [`CompiledPlan::failures`].
    pub async fn compile<D>(
        &self,
        plugin: &str,
        subtasks: &[SubTaskMeta<D>],
        connection: &ConnectionInfo,
        scopes: &[ScopeConfig],
    ) -> Result<CompiledPlan, AppError> {
        let descriptor = self.registry.require(plugin)?;
        validate_subtasks(subtasks)?;
        let ids = DomainIdGenerator::for_scope(self.registry, plugin)?;

        let mut repos: HashMap<String, RemoteRepo> = HashMap::new();
        let mut stages = Vec::new();
        let mut failures = Vec::new();

        for (index, scope) in scopes.iter().enumerate() {
            match self
                .compile_scope(descriptor, &ids, subtasks, connection, scope, &mut repos)
                .await
            {
                Ok(scope_stages) => {
                    tracing::debug!(%plugin, index, stages = scope_stages.len(), "Compiled scope");
                    stages.extend(scope_stages);
                }
                Err(error) => {
                    tracing::warn!(%plugin, index, error = %error, "Scope failed to compile");
                    failures.push(ScopeFailure { index, error });
                }
            }
        }

        Ok(CompiledPlan {
            plan: PipelinePlan::new(stages),
            failures,
        })
    }

    async fn compile_scope<D>(
        &self,
        descriptor: &PluginDescriptor,
        ids: &DomainIdGenerator,
        subtasks: &[SubTaskMeta<D>],
        connection: &ConnectionInfo,
        scope: &ScopeConfig,
        repos: &mut HashMap<String, RemoteRepo>,
    ) -> Result<Vec<PipelineStage>, AppError> {
        let mut rules = scope.transformation_rules()?;
        let mut options = scope.options_map()?;
        let scope_id = scope_id(&options, &descriptor.scope_id_field)?;
        let entities = scope.domain_types()?;
        let selected = select_subtasks(subtasks, &entities)?;

        // A lookup resolves path ids to the remote numeric id; without one the
        // scope id must already be numeric.
        let repo = if scope.requests(DomainType::Code) {
            let repo = match repos.get(&scope_id) {
                Some(repo) => repo.clone(),
                None => {
                    let repo = self.lookup.lookup(&scope_id).await?;
                    repos.insert(scope_id.clone(), repo.clone());
                    repo
                }
            };
            options.insert(descriptor.scope_id_field.clone(), id_value(&repo.id));
            Some(repo)
        } else if scope_id.parse::<u64>().is_ok() {
            None
        } else {
            return Err(AppError::InvalidInput(format!(
                "Scope option '{}' must be numeric unless CODE is requested, got '{scope_id}'",
                descriptor.scope_id_field
            )));
        };
        let remote_id = repo.as_ref().map_or(scope_id.as_str(), |r| r.id.as_str());
        let repo_id = ids.generate(connection.id, remote_id);

        let mut pending = Vec::new();

        match rules.remove(REFDIFF_KEY) {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Object(mut refdiff)) => {
                refdiff.insert("repoId".into(), repo_id.clone().into());
                pending.push(PendingStage {
                    rule: SyntheticRule::Diff,
                    anchor: 0,
                    task: PipelineTask::new(REFDIFF_PLUGIN, Vec::new(), refdiff),
                });
            }
            Some(_) => {
                return Err(AppError::InvalidInput(
                    "Transformation 'refdiff' must be an object".into(),
                ));
            }
        }

        if rules
            .get(PRODUCTION_PATTERN_KEY)
            .is_some_and(|p| !p.is_null())
        {
            tracing::warn!(
                plugin = %descriptor.name,
                "'productionPattern' in transformation rules is deprecated"
            );
            pending.push(PendingStage {
                rule: SyntheticRule::Enrichment,
                anchor: 0,
                task: PipelineTask::new(DORA_PLUGIN, vec!["EnrichTaskEnv".into()], Options::new()),
            });
        }

        options.insert("connectionId".into(), connection.id.into());
        options.insert("transformationRules".into(), rules.into());
        let mut primary = PipelineStage::new(vec![PipelineTask::new(
            &descriptor.name,
            selected,
            options,
        )]);

        if let Some(repo) = repo {
            let url = clone_url(&repo.clone_url, &descriptor.clone_user, &connection.token)?;

            let mut extractor = Options::new();
            extractor.insert("url".into(), url.into());
            extractor.insert("repoId".into(), repo_id.into());
            extractor.insert("proxy".into(), connection.proxy.clone().into());
            primary.push(PipelineTask::new(GITEXTRACTOR_PLUGIN, Vec::new(), extractor));
        }

        Ok(place_pending(primary, pending))
    }
}

/// The remote identifier of a scope as a string.
fn scope_id(options: &Options, field: &str) -> Result<String, AppError> {
    match options.get(field) {
        None | Some(serde_json::Value::Null) => Err(AppError::MissingField(field.to_string())),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(other) => Err(AppError::InvalidInput(format!(
            "Scope option '{field}' must be a number or a non-empty string, got {other}"
        ))),
    }
}

/// Resolved remote ids stay numbers in task options when they are numeric.
fn id_value(id: &str) -> serde_json::Value {
    match id.parse::<u64>() {
        Ok(n) => n.into(),
        Err(_) => id.into(),
    }
}

/// Clone URL with credentials in the user-info part.
fn clone_url(raw: &str, user: &str, token: &str) -> Result<String, AppError> {
    let invalid = || AppError::InvalidInput(format!("Invalid clone URL '{raw}'"));
    let mut url = Url::parse(raw).map_err(|_| invalid())?;
    url.set_username(user).map_err(|()| invalid())?;
    url.set_password(Some(token)).map_err(|()| invalid())?;
    Ok(url.to_string())
}

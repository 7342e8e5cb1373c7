//! Pipeline plan types and blueprint scope input.
//!
//! The JSON form of a plan is an array of stages, each stage an array of
//! `{plugin, subtasks, options}` task objects. Stages run sequentially,
//! tasks within a stage run concurrently.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::subtask::DomainType;

pub type Options = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub plugin: String,
    /// Subtasks to run in order. Empty means the plugin's defaults.
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub options: Options,
}

impl PipelineTask {
    pub fn new(plugin: impl Into<String>, subtasks: Vec<String>, options: Options) -> Self {
        Self {
            plugin: plugin.into(),
            subtasks,
            options,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineStage(pub Vec<PipelineTask>);

impl PipelineStage {
    pub fn new(tasks: Vec<PipelineTask>) -> Self {
        Self(tasks)
    }

    pub fn tasks(&self) -> &[PipelineTask] {
        &self.0
    }

    pub fn push(&mut self, task: PipelineTask) {
        self.0.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelinePlan(pub Vec<PipelineStage>);

impl PipelinePlan {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self(stages)
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of tasks across all stages.
    pub fn task_count(&self) -> usize {
        self.0.iter().map(|s| s.0.len()).sum()
    }

    /// Merge plans stage by stage: stage `i` of the result holds the tasks of
    /// stage `i` of every input plan.
    pub fn parallelize(plans: impl IntoIterator<Item = PipelinePlan>) -> Self {
        let mut merged: Vec<PipelineStage> = Vec::new();
        for plan in plans {
            for (i, stage) in plan.0.into_iter().enumerate() {
                if i == merged.len() {
                    merged.push(PipelineStage::default());
                }
                merged[i].0.extend(stage.0);
            }
        }
        Self(merged)
    }

    /// Run plans one after the other.
    pub fn sequentialize(plans: impl IntoIterator<Item = PipelinePlan>) -> Self {
        Self(plans.into_iter().flat_map(|p| p.0).collect())
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// One blueprint scope: which entities to collect and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub options: serde_json::Value,
    /// Object, JSON-encoded object string, or absent.
    #[serde(default)]
    pub transformation: Option<serde_json::Value>,
}

impl ScopeConfig {
    pub fn new(entities: &[&str], options: serde_json::Value) -> Self {
        Self {
            entities: entities.iter().map(|e| e.to_string()).collect(),
            options,
            transformation: None,
        }
    }

    pub fn with_transformation(mut self, transformation: serde_json::Value) -> Self {
        self.transformation = Some(transformation);
        self
    }

    pub fn domain_types(&self) -> Result<Vec<DomainType>, AppError> {
        DomainType::parse_entities(&self.entities)
    }

    /// True if `entity` was named explicitly.
    pub fn requests(&self, entity: DomainType) -> bool {
        self.entities
            .iter()
            .any(|e| e.parse::<DomainType>().is_ok_and(|d| d == entity))
    }

    pub fn options_map(&self) -> Result<Options, AppError> {
        match &self.options {
            serde_json::Value::Object(map) => Ok(map.clone()),
            serde_json::Value::Null => Ok(Options::new()),
            other => Err(AppError::InvalidInput(format!(
                "Scope options must be a JSON object, got {other}"
            ))),
        }
    }

    /// The transformation rules as an object.
    pub fn transformation_rules(&self) -> Result<Options, AppError> {
        match &self.transformation {
            None | Some(serde_json::Value::Null) => Ok(Options::new()),
            Some(serde_json::Value::Object(map)) => Ok(map.clone()),
            Some(serde_json::Value::String(raw)) if raw.trim().is_empty() => Ok(Options::new()),
            Some(serde_json::Value::String(raw)) => match serde_json::from_str(raw) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                Ok(_) => Err(AppError::InvalidInput(
                    "Transformation must be a JSON object".into(),
                )),
                Err(e) => Err(AppError::InvalidInput(format!(
                    "Malformed transformation JSON: {e}"
                ))),
            },
            Some(_) => Err(AppError::InvalidInput(
                "Transformation must be a JSON object".into(),
            )),
        }
    }
}

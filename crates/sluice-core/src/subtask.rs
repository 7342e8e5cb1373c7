//! Subtask metadata and entity-driven subtask selection.

use std::fmt;
use std::str::FromStr;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::runner::TaskContext;

/// Domain entity families a subtask contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DomainType {
    Code,
    Ticket,
    CodeReview,
    Cross,
    Cicd,
    CodeQuality,
}

impl DomainType {
    pub const ALL: [DomainType; 6] = [
        DomainType::Code,
        DomainType::Ticket,
        DomainType::CodeReview,
        DomainType::Cross,
        DomainType::Cicd,
        DomainType::CodeQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Code => "CODE",
            DomainType::Ticket => "TICKET",
            DomainType::CodeReview => "CODEREVIEW",
            DomainType::Cross => "CROSS",
            DomainType::Cicd => "CICD",
            DomainType::CodeQuality => "CODEQUALITY",
        }
    }

    /// Parse requested entity names. An empty list requests everything.
    pub fn parse_entities<S: AsRef<str>>(entities: &[S]) -> Result<Vec<DomainType>, AppError> {
        if entities.is_empty() {
            return Ok(Self::ALL.to_vec());
        }
        entities.iter().map(|e| e.as_ref().parse()).collect()
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DomainType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown entity type '{s}'")))
    }
}

/// Entry point of a subtask, receiving the plugin's typed task context.
pub type SubTaskEntryPoint<D> = for<'a> fn(&'a TaskContext<D>) -> BoxFuture<'a, Result<(), AppError>>;

/// Static description of one subtask of a plugin.
pub struct SubTaskMeta<D> {
    name: String,
    entry_point: SubTaskEntryPoint<D>,
    enabled_by_default: bool,
    description: String,
    domain_types: Vec<DomainType>,
    dependencies: Vec<String>,
}

impl<D> SubTaskMeta<D> {
    pub fn new(name: impl Into<String>, entry_point: SubTaskEntryPoint<D>) -> Self {
        Self {
            name: name.into(),
            entry_point,
            enabled_by_default: true,
            description: String::new(),
            domain_types: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain_types(mut self, domain_types: &[DomainType]) -> Self {
        self.domain_types = domain_types.to_vec();
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> SubTaskEntryPoint<D> {
        self.entry_point
    }

    pub fn enabled_by_default(&self) -> bool {
        self.enabled_by_default
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn domain_types(&self) -> &[DomainType] {
        &self.domain_types
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl<D> Clone for SubTaskMeta<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            entry_point: self.entry_point,
            enabled_by_default: self.enabled_by_default,
            description: self.description.clone(),
            domain_types: self.domain_types.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

impl<D> fmt::Debug for SubTaskMeta<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("domain_types", &self.domain_types)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Check that names are unique and every dependency is declared earlier.
pub fn validate_subtasks<D>(metas: &[SubTaskMeta<D>]) -> Result<(), AppError> {
    for (i, meta) in metas.iter().enumerate() {
        if meta.name.is_empty() {
            return Err(AppError::InvalidInput(format!("Subtask #{i} has no name")));
        }
        let earlier = &metas[..i];
        if earlier.iter().any(|m| m.name == meta.name) {
            return Err(AppError::InvalidInput(format!(
                "Subtask '{}' is declared twice",
                meta.name
            )));
        }
        for dep in &meta.dependencies {
            if !earlier.iter().any(|m| &m.name == dep) {
                return Err(AppError::InvalidInput(format!(
                    "Subtask '{}' depends on '{dep}', which is not declared before it",
                    meta.name
                )));
            }
        }
    }
    Ok(())
}

/// Names of the subtasks to run for the requested entity types.
///
/// Picks the subtasks enabled by default whose domain types intersect
/// `entities`, adds everything they transitively depend on, and keeps
/// declaration order.
pub fn select_subtasks<D>(
    metas: &[SubTaskMeta<D>],
    entities: &[DomainType],
) -> Result<Vec<String>, AppError> {
    validate_subtasks(metas)?;

    let mut selected: Vec<bool> = metas
        .iter()
        .map(|m| m.enabled_by_default && m.domain_types.iter().any(|d| entities.contains(d)))
        .collect();

    // Dependencies precede their dependants, so one backward pass closes the set.
    for i in (0..metas.len()).rev() {
        if !selected[i] {
            continue;
        }
        for dep in &metas[i].dependencies {
            if let Some(j) = metas[..i].iter().position(|m| &m.name == dep) {
                selected[j] = true;
            }
        }
    }

    Ok(metas
        .iter()
        .zip(selected)
        .filter(|(_, keep)| *keep)
        .map(|(m, _)| m.name.clone())
        .collect())
}

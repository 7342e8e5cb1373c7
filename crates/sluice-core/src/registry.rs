//! Explicit plugin registry and cross-plugin domain id generation.
//!
//! Compilers and generators receive a [`PluginRegistry`] by reference, so
//! tests can build isolated registries instead of sharing process state.

use std::collections::HashMap;
use std::fmt::Display;

use crate::error::AppError;

/// What the engine needs to know about a plugin to plan work for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Plugin name, e.g. `gitlab`.
    pub name: String,
    /// Tool-layer entity a scope id refers to, e.g. `GitlabProject`.
    pub scope_entity: String,
    /// Scope option holding the remote identifier, e.g. `projectId`.
    pub scope_id_field: String,
    /// User name placed in clone URLs next to the token.
    pub clone_user: String,
}

impl PluginDescriptor {
    pub fn new(
        name: impl Into<String>,
        scope_entity: impl Into<String>,
        scope_id_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scope_entity: scope_entity.into(),
            scope_id_field: scope_id_field.into(),
            clone_user: "git".into(),
        }
    }

    pub fn with_clone_user(mut self, user: impl Into<String>) -> Self {
        self.clone_user = user.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Names are unique.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), AppError> {
        if self.plugins.contains_key(&descriptor.name) {
            return Err(AppError::ConfigError(format!(
                "Plugin '{}' is already registered",
                descriptor.name
            )));
        }
        self.plugins.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: PluginDescriptor) -> Result<Self, AppError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&PluginDescriptor, AppError> {
        self.get(name)
            .ok_or_else(|| AppError::ConfigError(format!("Plugin '{name}' is not registered")))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Produces domain-layer ids of the form `<plugin>:<Entity>:<connectionId>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// Generator for a plugin's scope entity.
    pub fn for_scope(registry: &PluginRegistry, plugin: &str) -> Result<Self, AppError> {
        let descriptor = registry.require(plugin)?;
        Ok(Self::new(&descriptor.name, &descriptor.scope_entity))
    }

    pub fn new(plugin: &str, entity: &str) -> Self {
        Self {
            prefix: format!("{plugin}:{entity}"),
        }
    }

    pub fn generate(&self, connection_id: u64, id: impl Display) -> String {
        format!("{}:{connection_id}:{id}", self.prefix)
    }
}

//! Executes the subtasks of one [`PipelineTask`] against a plugin.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::plan::{Options, PipelineTask};
use crate::subtask::{SubTaskMeta, validate_subtasks};

/// Everything a subtask entry point can see, typed by the plugin's data.
pub struct TaskContext<D> {
    plugin: String,
    data: D,
    options: Options,
    cancel: CancellationToken,
}

impl<D> TaskContext<D> {
    pub fn new(plugin: impl Into<String>, data: D, options: Options, cancel: CancellationToken) -> Self {
        Self {
            plugin: plugin.into(),
            data,
            options,
            cancel,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A plugin: its subtasks and how to turn task options into task data.
pub trait Plugin: Send + Sync {
    type Data: Send + Sync;

    fn name(&self) -> &str;

    /// Subtasks in dependency order.
    fn subtasks(&self) -> Vec<SubTaskMeta<Self::Data>>;

    fn prepare_task_data(
        &self,
        options: &Options,
    ) -> impl Future<Output = Result<Self::Data, AppError>> + Send;
}

/// Events emitted while running a task.
#[derive(Debug, Clone)]
pub enum TaskEvent<'a> {
    TaskStarted {
        plugin: &'a str,
        subtasks: usize,
    },
    SubtaskStarted {
        plugin: &'a str,
        subtask: &'a str,
        index: usize,
        total: usize,
    },
    SubtaskFinished {
        plugin: &'a str,
        subtask: &'a str,
    },
    SubtaskFailed {
        plugin: &'a str,
        subtask: &'a str,
        error: &'a str,
    },
    TaskFinished {
        plugin: &'a str,
    },
}

/// Trait for receiving task events (decoupled logging).
pub trait TaskReporter: Send + Sync {
    fn report(&self, event: TaskEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTaskReporter;

impl TaskReporter for TracingTaskReporter {
    fn report(&self, event: TaskEvent<'_>) {
        match event {
            TaskEvent::TaskStarted { plugin, subtasks } => {
                tracing::info!(%plugin, subtasks, "Task started");
            }
            TaskEvent::SubtaskStarted {
                plugin,
                subtask,
                index,
                total,
            } => {
                tracing::info!(%plugin, %subtask, "Executing subtask {}/{}", index + 1, total);
            }
            TaskEvent::SubtaskFinished { plugin, subtask } => {
                tracing::debug!(%plugin, %subtask, "Subtask finished");
            }
            TaskEvent::SubtaskFailed {
                plugin,
                subtask,
                error,
            } => {
                tracing::error!(%plugin, %subtask, %error, "Subtask failed");
            }
            TaskEvent::TaskFinished { plugin } => {
                tracing::info!(%plugin, "Task finished");
            }
        }
    }
}

/// Subtasks a task asks for, in declaration order.
///
/// An empty request means every subtask enabled by default. Unknown names
/// are rejected before anything runs.
fn resolve_subtasks<'m, D>(
    metas: &'m [SubTaskMeta<D>],
    task: &PipelineTask,
) -> Result<Vec<&'m SubTaskMeta<D>>, AppError> {
    if task.subtasks.is_empty() {
        return Ok(metas.iter().filter(|m| m.enabled_by_default()).collect());
    }
    if let Some(unknown) = task
        .subtasks
        .iter()
        .find(|name| !metas.iter().any(|m| m.name() == name.as_str()))
    {
        return Err(AppError::InvalidInput(format!(
            "Unknown subtask '{unknown}' for plugin '{}'",
            task.plugin
        )));
    }
    Ok(metas
        .iter()
        .filter(|m| task.subtasks.iter().any(|name| name == m.name()))
        .collect())
}

/// Run a task's subtasks sequentially. Returns the names that ran.
pub async fn run_task<P: Plugin, R: TaskReporter>(
    plugin: &P,
    task: &PipelineTask,
    cancel: &CancellationToken,
    reporter: &R,
) -> Result<Vec<String>, AppError> {
    if task.plugin != plugin.name() {
        return Err(AppError::InvalidInput(format!(
            "Task for plugin '{}' cannot run on plugin '{}'",
            task.plugin,
            plugin.name()
        )));
    }
    let metas = plugin.subtasks();
    validate_subtasks(&metas)?;
    let selected = resolve_subtasks(&metas, task)?;

    let data = plugin.prepare_task_data(&task.options).await?;
    let ctx = TaskContext::new(plugin.name(), data, task.options.clone(), cancel.clone());

    reporter.report(TaskEvent::TaskStarted {
        plugin: plugin.name(),
        subtasks: selected.len(),
    });

    let total = selected.len();
    let mut ran = Vec::with_capacity(total);
    for (index, meta) in selected.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        reporter.report(TaskEvent::SubtaskStarted {
            plugin: plugin.name(),
            subtask: meta.name(),
            index,
            total,
        });

        if let Err(e) = (meta.entry_point())(&ctx).await {
            reporter.report(TaskEvent::SubtaskFailed {
                plugin: plugin.name(),
                subtask: meta.name(),
                error: &e.to_string(),
            });
            return Err(AppError::SubtaskFailed {
                plugin: plugin.name().to_string(),
                subtask: meta.name().to_string(),
                source: Box::new(e),
            });
        }

        reporter.report(TaskEvent::SubtaskFinished {
            plugin: plugin.name(),
            subtask: meta.name(),
        });
        ran.push(meta.name().to_string());
    }

    reporter.report(TaskEvent::TaskFinished {
        plugin: plugin.name(),
    });
    Ok(ran)
}

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    approval::HdmLevel,
    state::CycleKind,
};

/// A named unit of work within a cycle, guarded by an approval level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier; also the handler registry key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Approval level required to run.
    pub hdm_level: HdmLevel,
}

impl Task {
    /// Creates a task definition.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, hdm_level: HdmLevel) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            hdm_level,
        }
    }
}

/// The fixed task battery for a cycle kind.
///
/// Batteries are compile-time constants in this version of the engine;
/// Manual runs execute the daily battery.
#[must_use]
pub fn battery(kind: CycleKind) -> Vec<Task> {
    match kind {
        CycleKind::Daily | CycleKind::Manual => vec![
            Task::new("health-probe", "Health probe", HdmLevel::Informational),
            Task::new("log-compaction", "Log compaction", HdmLevel::Routine),
            Task::new("security-sweep", "Security sweep", HdmLevel::Routine),
            Task::new(
                "backup-verification",
                "Backup verification",
                HdmLevel::Elevated,
            ),
        ],
        CycleKind::Weekly => vec![
            Task::new("dependency-audit", "Dependency audit", HdmLevel::Routine),
            Task::new("performance-review", "Performance review", HdmLevel::Elevated),
            Task::new("compliance-scan", "Compliance scan", HdmLevel::Elevated),
        ],
        CycleKind::Monthly => vec![
            Task::new("security-audit", "Security audit", HdmLevel::Elevated),
            Task::new("cost-review", "Cost review", HdmLevel::Elevated),
            Task::new("capacity-forecast", "Capacity forecast", HdmLevel::Elevated),
        ],
    }
}

/// Invocation context handed to a task handler.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// Report id of the surrounding cycle (or a trigger marker).
    pub cycle_id: String,
    /// Cycle kind.
    pub kind: CycleKind,
    /// Task being executed.
    pub task: Task,
}

/// Opaque task behavior behind a uniform interface.
///
/// Concrete production bodies live outside the engine; the registry ships
/// reporting stand-ins so a default engine runs clean cycles end to end.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the task, returning its structured output.
    async fn run(&self, invocation: &TaskInvocation) -> anyhow::Result<Value>;
}

/// Built-in stand-in handler recording the invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportingHandler;

#[async_trait]
impl TaskHandler for ReportingHandler {
    async fn run(&self, invocation: &TaskInvocation) -> anyhow::Result<Value> {
        Ok(json!({
            "task": invocation.task.id,
            "cycle": invocation.cycle_id,
            "kind": invocation.kind.as_str(),
            "ok": true,
        }))
    }
}

/// Handler lookup table keyed by task id.
#[derive(Clone, Default)]
pub struct TaskHandlerRegistry {
    inner: Arc<RwLock<IndexMap<String, Arc<dyn TaskHandler>>>>,
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("handlers", &self.inner.read().len())
            .finish()
    }
}

impl TaskHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with a stand-in handler for every battery task
    /// and for the trigger-driven scan.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for kind in [CycleKind::Daily, CycleKind::Weekly, CycleKind::Monthly] {
            for task in battery(kind) {
                registry.register(task.id, Arc::new(ReportingHandler));
            }
        }
        registry.register("security-scan", Arc::new(ReportingHandler));
        registry
    }

    /// Registers or replaces the handler for a task id.
    pub fn register(&self, id: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.inner.write().insert(id.into(), handler);
    }

    /// Looks up the handler for a task id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.inner.read().get(id).cloned()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_battery_is_uniformly_elevated() {
        for task in battery(CycleKind::Monthly) {
            assert_eq!(task.hdm_level, HdmLevel::Elevated, "{}", task.id);
        }
    }

    #[test]
    fn manual_runs_the_daily_battery() {
        assert_eq!(battery(CycleKind::Manual), battery(CycleKind::Daily));
    }

    #[test]
    fn default_registry_covers_every_battery_task() {
        let registry = TaskHandlerRegistry::with_defaults();
        for kind in CycleKind::SCHEDULED {
            for task in battery(kind) {
                assert!(registry.get(&task.id).is_some(), "{}", task.id);
            }
        }
        assert!(registry.get("security-scan").is_some());
    }

    #[tokio::test]
    async fn reporting_handler_echoes_invocation() {
        let invocation = TaskInvocation {
            cycle_id: "c1".into(),
            kind: CycleKind::Daily,
            task: Task::new("health-probe", "Health probe", HdmLevel::Informational),
        };
        let output = ReportingHandler.run(&invocation).await.unwrap();
        assert_eq!(output["task"], "health-probe");
        assert_eq!(output["ok"], true);
    }
}

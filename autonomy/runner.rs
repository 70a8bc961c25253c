use std::{sync::Arc, time::Duration};

use eaos_plugins::{HookContext, HookKind};
use serde_json::json;

use crate::{
    engine::EngineInner,
    state::{CycleKind, CycleReport, CycleStatus, EngineError, RuntimeState, TaskResult, TaskStatus},
    tasks::{battery, TaskHandler, TaskInvocation},
};

/// Reason recorded on tasks gated out by the approval level.
pub const APPROVAL_SKIP_REASON: &str = "requires higher approval level";

/// Options for one cycle run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleRunOptions {
    /// Run even when the engine is not in the Running state.
    pub force: bool,
}

impl CycleRunOptions {
    /// Options that force execution regardless of engine state.
    #[must_use]
    pub const fn forced() -> Self {
        Self { force: true }
    }
}

/// Failure of the task execution envelope.
#[derive(Debug, Clone)]
pub(crate) enum TaskAttemptError {
    /// Every attempt exceeded the deadline.
    Timeout {
        /// Deadline in seconds.
        seconds: u64,
    },
    /// The handler itself failed; not retried.
    Failed(String),
}

/// Runs a handler under the per-task deadline with timeout-only retries.
pub(crate) async fn execute_task(
    handler: Arc<dyn TaskHandler>,
    invocation: &TaskInvocation,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
) -> Result<serde_json::Value, TaskAttemptError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, handler.run(invocation)).await {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(err)) => return Err(TaskAttemptError::Failed(format!("{err:#}"))),
            Err(_) => {
                if attempt < attempts {
                    tracing::warn!(
                        task = %invocation.task.id,
                        attempt,
                        "task attempt timed out; retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    Err(TaskAttemptError::Timeout {
        seconds: timeout.as_secs(),
    })
}

impl EngineInner {
    /// Executes one cycle of the fixed battery for `kind`.
    ///
    /// Returns `Ok(None)` when the engine is not Running and the run was
    /// not forced. Cycles of the same kind never overlap; the second caller
    /// waits for the first to finish.
    pub(crate) async fn run_cycle(
        &self,
        kind: CycleKind,
        options: CycleRunOptions,
    ) -> Result<Option<CycleReport>, EngineError> {
        let ceiling = {
            let runtime = self.runtime.read();
            if runtime.state != RuntimeState::Running && !options.force {
                return Ok(None);
            }
            runtime.hdm_level
        };

        let serial = self.cycle_lock(kind);
        let _running = serial.lock().await;

        let started = self.clock.now();
        let cycle_id = self.report_id(started);
        let tasks = battery(kind);
        let mut report = CycleReport::begin(&cycle_id, kind, started);

        self.bus
            .emit(
                "autonomy:cycle:start",
                json!({
                    "cycleId": cycle_id,
                    "kind": kind.as_str(),
                    "tasks": tasks.len(),
                }),
            )
            .await;

        let ctx = HookContext::new()
            .with_value("kind", json!(kind.as_str()))
            .with_value("tasks", serde_json::to_value(&tasks)?);
        let ctx = match self.plugins.execute_hooks(HookKind::BeforeCycle, ctx).await {
            Ok(ctx) => ctx,
            Err(err) => {
                report
                    .errors
                    .push(format!("beforeCycle hooks failed: {err}"));
                HookContext::new()
            }
        };
        if ctx.cancelled {
            report.cancel(self.clock.now());
            self.bus
                .emit(
                    "autonomy:cycle:skip",
                    json!({ "cycleId": cycle_id, "kind": kind.as_str() }),
                )
                .await;
            self.push_history(&report);
            self.persist_cycle(&report);
            return Ok(Some(report));
        }

        for task in tasks {
            if !ceiling.permits(task.hdm_level) {
                let stamp = self.clock.now();
                report.tasks.push(TaskResult {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    start_time: stamp,
                    end_time: stamp,
                    status: TaskStatus::Skipped,
                    output: None,
                    error: None,
                    reason: Some(APPROVAL_SKIP_REASON.to_owned()),
                });
                self.emit_approval_required(&task.id, task.hdm_level, ceiling)
                    .await;
                continue;
            }

            self.bus
                .emit(
                    "autonomy:task:start",
                    json!({ "cycleId": cycle_id, "taskId": task.id }),
                )
                .await;

            let before_ctx = HookContext::new()
                .with_value("kind", json!(kind.as_str()))
                .with_value("task", serde_json::to_value(&task)?);
            if let Err(err) = self.plugins.execute_hooks(HookKind::BeforeTask, before_ctx).await {
                let stamp = self.clock.now();
                let message = format!("beforeTask hooks failed: {err}");
                report.errors.push(message.clone());
                report.tasks.push(TaskResult {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    start_time: stamp,
                    end_time: stamp,
                    status: TaskStatus::Error,
                    output: None,
                    error: Some(message.clone()),
                    reason: None,
                });
                self.bus
                    .emit(
                        "autonomy:task:end",
                        json!({ "cycleId": cycle_id, "taskId": task.id, "status": "error" }),
                    )
                    .await;
                self.bus
                    .emit(
                        "autonomy:task:error",
                        json!({ "cycleId": cycle_id, "taskId": task.id, "error": message }),
                    )
                    .await;
                continue;
            }

            let task_started = self.clock.now();
            let invocation = TaskInvocation {
                cycle_id: cycle_id.clone(),
                kind,
                task: task.clone(),
            };
            let outcome = match self.handlers.get(&task.id) {
                Some(handler) => {
                    execute_task(
                        handler,
                        &invocation,
                        self.options.task_timeout,
                        self.options.task_retry_attempts,
                        self.options.task_retry_delay,
                    )
                    .await
                }
                None => Err(TaskAttemptError::Failed(format!(
                    "no handler registered for `{}`",
                    task.id
                ))),
            };
            let task_finished = self.clock.now().max(task_started);

            let result = match outcome {
                Ok(output) => TaskResult {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    start_time: task_started,
                    end_time: task_finished,
                    status: TaskStatus::Completed,
                    output: Some(output),
                    error: None,
                    reason: None,
                },
                Err(TaskAttemptError::Timeout { seconds }) => {
                    let message =
                        format!("task `{}` timed out after {seconds}s", task.id);
                    report.errors.push(message.clone());
                    TaskResult {
                        id: task.id.clone(),
                        name: task.name.clone(),
                        start_time: task_started,
                        end_time: task_finished,
                        status: TaskStatus::Error,
                        output: None,
                        error: Some(message),
                        reason: None,
                    }
                }
                Err(TaskAttemptError::Failed(message)) => {
                    report.errors.push(format!("task `{}`: {message}", task.id));
                    TaskResult {
                        id: task.id.clone(),
                        name: task.name.clone(),
                        start_time: task_started,
                        end_time: task_finished,
                        status: TaskStatus::Error,
                        output: None,
                        error: Some(message),
                        reason: None,
                    }
                }
            };

            let after_ctx = HookContext::new()
                .with_value("kind", json!(kind.as_str()))
                .with_value("task", serde_json::to_value(&task)?)
                .with_value("result", serde_json::to_value(&result)?);
            if let Err(err) = self.plugins.execute_hooks(HookKind::AfterTask, after_ctx).await {
                report.errors.push(format!("afterTask hooks failed: {err}"));
            }

            let errored = result.status == TaskStatus::Error;
            let error_message = result.error.clone();
            report.tasks.push(result);

            self.bus
                .emit(
                    "autonomy:task:end",
                    json!({
                        "cycleId": cycle_id,
                        "taskId": task.id,
                        "status": if errored { "error" } else { "completed" },
                    }),
                )
                .await;
            if errored {
                self.bus
                    .emit(
                        "autonomy:task:error",
                        json!({ "cycleId": cycle_id, "taskId": task.id, "error": error_message }),
                    )
                    .await;
                let error_ctx = HookContext::new()
                    .with_value("taskId", json!(task.id))
                    .with_value("error", json!(error_message));
                if let Err(err) = self.plugins.execute_hooks(HookKind::OnError, error_ctx).await {
                    report.errors.push(format!("onError hooks failed: {err}"));
                }
            }
        }

        let after_ctx = HookContext::new()
            .with_value("kind", json!(kind.as_str()))
            .with_value("errors", json!(report.errors.len()));
        if let Err(err) = self.plugins.execute_hooks(HookKind::AfterCycle, after_ctx).await {
            report.errors.push(format!("afterCycle hooks failed: {err}"));
        }

        report.finish(self.clock.now());
        {
            let mut runtime = self.runtime.write();
            if let Some(end_time) = report.end_time {
                runtime.last_cycle_run.set(kind, end_time);
            }
        }
        self.push_history(&report);

        self.bus
            .emit(
                "autonomy:cycle:end",
                json!({
                    "cycleId": cycle_id,
                    "kind": kind.as_str(),
                    "status": serde_json::to_value(report.status)?,
                }),
            )
            .await;
        if report.status == CycleStatus::CompletedWithErrors {
            self.bus
                .emit(
                    "autonomy:cycle:error",
                    json!({ "cycleId": cycle_id, "errors": report.errors }),
                )
                .await;
        }

        self.persist_cycle(&report);
        self.note_cycle_completed(&report);
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        approval::HdmLevel,
        tasks::Task,
    };
    use async_trait::async_trait;
    use serde_json::Value;

    struct SleepyHandler {
        sleep: Duration,
    }

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        async fn run(&self, _invocation: &TaskInvocation) -> anyhow::Result<Value> {
            tokio::time::sleep(self.sleep).await;
            Ok(json!({ "ok": true }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn run(&self, _invocation: &TaskInvocation) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("disk unavailable"))
        }
    }

    fn invocation() -> TaskInvocation {
        TaskInvocation {
            cycle_id: "c1".into(),
            kind: CycleKind::Daily,
            task: Task::new("probe", "Probe", HdmLevel::Routine),
        }
    }

    #[tokio::test]
    async fn fast_handler_completes_first_attempt() {
        let handler = Arc::new(SleepyHandler {
            sleep: Duration::from_millis(1),
        });
        let output = execute_task(
            handler,
            &invocation(),
            Duration::from_millis(200),
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(output["ok"], true);
    }

    #[tokio::test]
    async fn timeout_retries_then_reports_timeout() {
        let handler = Arc::new(SleepyHandler {
            sleep: Duration::from_millis(200),
        });
        let started = std::time::Instant::now();
        let err = execute_task(
            handler,
            &invocation(),
            Duration::from_millis(20),
            2,
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskAttemptError::Timeout { .. }));
        // Two attempts plus one retry delay.
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn handler_failure_is_not_retried() {
        let started = std::time::Instant::now();
        let err = execute_task(
            Arc::new(FailingHandler),
            &invocation(),
            Duration::from_millis(100),
            2,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        match err {
            TaskAttemptError::Failed(message) => assert!(message.contains("disk unavailable")),
            TaskAttemptError::Timeout { .. } => panic!("expected handler failure"),
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}

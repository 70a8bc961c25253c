use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use eaos_plugins::{HookContext, HookKind, PluginManager};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::Serialize;
use serde_json::{json, Value};
use shared_event_bus::{Event, EventBus, SubscriberId};
use shared_logging::LogLevel;
use tokio::task::JoinHandle;

use crate::{
    approval::HdmLevel,
    clock::{Clock, SystemClock},
    config::EngineOptions,
    persistence::StateStore,
    runner::{CycleRunOptions, TaskAttemptError},
    schedule::next_fire,
    state::{
        CycleKind, CycleReport, CycleStatus, EngineError, LastCycleRun, RuntimeState,
        StateSnapshot, TriggerSnapshot,
    },
    tasks::{Task, TaskHandlerRegistry, TaskInvocation},
    telemetry::EngineTelemetry,
    triggers::{TriggerRegistry, TriggerSpec},
};

/// Fixed registry of trigger action identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    /// Run the security sweep task out of band.
    RunSecuritySweep,
    /// Run the targeted security scan task.
    RunSecurityScan,
    /// Raise a health alert and capture diagnostics context.
    AlertAndDiagnose,
    /// Raise a budget alert.
    FinancialAlert,
}

impl TriggerAction {
    /// Parses an action identifier from the fixed registry.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "runSecuritySweep" => Some(Self::RunSecuritySweep),
            "runSecurityScan" => Some(Self::RunSecurityScan),
            "alertAndDiagnose" => Some(Self::AlertAndDiagnose),
            "financialAlert" => Some(Self::FinancialAlert),
            _ => None,
        }
    }

    /// The registry identifier.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RunSecuritySweep => "runSecuritySweep",
            Self::RunSecurityScan => "runSecurityScan",
            Self::AlertAndDiagnose => "alertAndDiagnose",
            Self::FinancialAlert => "financialAlert",
        }
    }
}

/// Filter for [`AutonomyEngine::get_logs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFilter {
    /// Restrict to one cycle kind.
    pub kind: Option<CycleKind>,
    /// Restrict to one cycle status.
    pub status: Option<CycleStatus>,
    /// Maximum number of reports returned.
    pub limit: Option<usize>,
}

/// Live engine status projection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Runtime state.
    pub state: RuntimeState,
    /// Approval ceiling.
    pub hdm_level: HdmLevel,
    /// Most recent completion per scheduled kind.
    pub last_cycle_run: LastCycleRun,
    /// Cycle reports retained in memory.
    pub cycle_count: usize,
    /// Registered triggers.
    pub trigger_count: usize,
    /// Registered plugins.
    pub plugin_count: usize,
}

pub(crate) struct RuntimeFields {
    pub(crate) state: RuntimeState,
    pub(crate) hdm_level: HdmLevel,
    pub(crate) last_cycle_run: LastCycleRun,
    pub(crate) cycle_history: Vec<CycleReport>,
}

/// Shared engine internals; the public [`AutonomyEngine`] is a thin handle.
pub(crate) struct EngineInner {
    pub(crate) options: EngineOptions,
    pub(crate) bus: EventBus,
    pub(crate) plugins: PluginManager,
    pub(crate) triggers: TriggerRegistry,
    pub(crate) handlers: TaskHandlerRegistry,
    pub(crate) store: StateStore,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) telemetry: Option<EngineTelemetry>,
    pub(crate) runtime: RwLock<RuntimeFields>,
    cycle_locks: IndexMap<CycleKind, Arc<tokio::sync::Mutex<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriberId>>,
}

impl EngineInner {
    pub(crate) fn cycle_lock(&self, kind: CycleKind) -> Arc<tokio::sync::Mutex<()>> {
        // Locks for every kind are created at construction.
        self.cycle_locks
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(tokio::sync::Mutex::new(())))
    }

    pub(crate) fn report_id(&self, now: DateTime<Utc>) -> String {
        let token: String = thread_rng()
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), token.to_lowercase())
    }

    pub(crate) async fn emit_approval_required(
        &self,
        subject: &str,
        required: HdmLevel,
        ceiling: HdmLevel,
    ) {
        self.bus
            .emit(
                "autonomy:approval:required",
                json!({
                    "subject": subject,
                    "requiredLevel": required,
                    "engineLevel": ceiling,
                }),
            )
            .await;
    }

    pub(crate) fn push_history(&self, report: &CycleReport) {
        let mut runtime = self.runtime.write();
        runtime.cycle_history.push(report.clone());
        let cap = self.options.max_history;
        if runtime.cycle_history.len() > cap {
            let skip = runtime.cycle_history.len() - cap;
            runtime.cycle_history.drain(..skip);
        }
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        let runtime = self.runtime.read();
        StateSnapshot {
            state: runtime.state,
            hdm_level: runtime.hdm_level,
            last_cycle_run: runtime.last_cycle_run.clone(),
            cycle_history: runtime.cycle_history.clone(),
            triggers: self.triggers.all(),
            updated_at: self.clock.now(),
        }
    }

    pub(crate) fn persist_state(&self) {
        if let Err(err) = self.store.save_state(&self.snapshot()) {
            tracing::warn!(error = %err, "state persistence failed");
        }
    }

    pub(crate) fn persist_cycle(&self, report: &CycleReport) {
        if let Err(err) = self.store.write_cycle_report(report) {
            tracing::warn!(cycle = %report.id, error = %err, "cycle report persistence failed");
        }
        self.persist_state();
    }

    pub(crate) fn note_cycle_completed(&self, report: &CycleReport) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(
                LogLevel::Info,
                "autonomy.cycle.completed",
                json!({
                    "cycleId": report.id,
                    "kind": report.kind.as_str(),
                    "tasks": report.tasks.len(),
                    "errors": report.errors.len(),
                }),
            );
            let _ = telemetry.change(
                "cycle-completed",
                report.kind.as_str(),
                json!({ "cycleId": report.id, "status": report.status }),
            );
        }
    }

    fn set_state(&self, next: RuntimeState) -> RuntimeState {
        let mut runtime = self.runtime.write();
        let previous = runtime.state;
        runtime.state = next;
        previous
    }

    fn note_transition(&self, from: RuntimeState, to: RuntimeState) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.change(
                "state-transition",
                &to.to_string(),
                json!({ "from": from.to_string() }),
            );
        }
    }

    fn register_default_triggers(&self) {
        self.triggers.register(
            TriggerSpec::event("Code change scan", "code:change:*", "runSecurityScan")
                .with_id("code-change")
                .with_level(HdmLevel::Routine),
        );
        self.triggers.register(
            TriggerSpec::condition(
                "Error rate alert",
                "errorRate > 0.05",
                |event| {
                    event
                        .field("errorRate")
                        .and_then(Value::as_f64)
                        .is_some_and(|rate| rate > 0.05)
                },
                "alertAndDiagnose",
            )
            .with_id("error-rate")
            .with_level(HdmLevel::Routine),
        );
        self.triggers.register(
            TriggerSpec::condition(
                "Burn rate alert",
                "burnRate > 1.5",
                |event| {
                    event
                        .field("burnRate")
                        .and_then(Value::as_f64)
                        .is_some_and(|rate| rate > 1.5)
                },
                "financialAlert",
            )
            .with_id("burn-rate")
            .with_level(HdmLevel::Routine),
        );
    }

    pub(crate) async fn initialize(&self) -> Result<(), EngineError> {
        self.options.validate()?;
        self.store.ensure_dirs()?;

        let snapshot = self.store.load_state();
        {
            let mut runtime = self.runtime.write();
            runtime.last_cycle_run = snapshot.last_cycle_run.clone();
            runtime.cycle_history = snapshot.cycle_history.clone();
        }

        self.register_default_triggers();
        self.triggers.restore(&snapshot.triggers);

        let loaded = self.plugins.load_all().await?;
        for id in loaded {
            if let Err(err) = self.plugins.enable(&id).await {
                tracing::warn!(plugin = %id, error = %err, "plugin failed to enable");
            }
        }

        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.change(
                "initialized",
                "engine",
                json!({ "triggers": self.triggers.len() }),
            );
        }
        self.persist_state();
        Ok(())
    }

    pub(crate) async fn start(self: Arc<Self>) -> Result<(), EngineError> {
        {
            let runtime = self.runtime.read();
            match runtime.state {
                RuntimeState::Running | RuntimeState::Paused => return Ok(()),
                RuntimeState::Stopped | RuntimeState::Error => {}
            }
        }

        let weak = Arc::downgrade(&self);
        let subscription = self.bus.on(
            "*",
            shared_event_bus::handler(move |event: Event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.process_event(&event).await;
                    }
                    Ok(())
                }
            }),
        );
        *self.subscription.lock() = Some(subscription);

        {
            let mut timers = self.timers.lock();
            for kind in CycleKind::SCHEDULED {
                timers.push(tokio::spawn(schedule_loop(Arc::downgrade(&self), kind)));
            }
        }

        let previous = self.set_state(RuntimeState::Running);
        self.bus.emit("autonomy:engine:start", json!({})).await;
        self.note_transition(previous, RuntimeState::Running);
        self.persist_state();
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<(), EngineError> {
        if self.runtime.read().state == RuntimeState::Stopped {
            return Ok(());
        }

        let handles: Vec<JoinHandle<()>> = self.timers.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.bus.off(subscription);
        }

        let previous = self.set_state(RuntimeState::Stopped);
        self.bus.emit("autonomy:engine:stop", json!({})).await;
        self.note_transition(previous, RuntimeState::Stopped);
        self.persist_state();
        Ok(())
    }

    pub(crate) async fn pause(&self) -> Result<(), EngineError> {
        if self.runtime.read().state != RuntimeState::Running {
            return Ok(());
        }
        let previous = self.set_state(RuntimeState::Paused);
        self.bus.emit("autonomy:engine:pause", json!({})).await;
        self.note_transition(previous, RuntimeState::Paused);
        self.persist_state();
        Ok(())
    }

    pub(crate) async fn resume(&self) -> Result<(), EngineError> {
        if self.runtime.read().state != RuntimeState::Paused {
            return Ok(());
        }
        let previous = self.set_state(RuntimeState::Running);
        self.bus.emit("autonomy:engine:resume", json!({})).await;
        self.note_transition(previous, RuntimeState::Running);
        self.persist_state();
        Ok(())
    }

    /// Evaluates every registered trigger against one event.
    ///
    /// Events in the engine's own `autonomy:` namespace are not evaluated;
    /// the trigger surface is external signals, and evaluating our own
    /// lifecycle emissions would let a broad pattern feed back into itself.
    pub(crate) async fn process_event(&self, event: &Event) {
        if event.name.starts_with("autonomy:") {
            return;
        }
        let ceiling = {
            let runtime = self.runtime.read();
            if runtime.state != RuntimeState::Running {
                return;
            }
            runtime.hdm_level
        };

        let matches = self.triggers.matching(event);
        if matches.is_empty() {
            return;
        }

        let mut fired = false;
        for matched in matches {
            if !ceiling.permits(matched.hdm_level) {
                self.emit_approval_required(&matched.id, matched.hdm_level, ceiling)
                    .await;
                continue;
            }
            let Some(snapshot) = self.triggers.mark_fired(&matched.id, self.clock.now()) else {
                continue;
            };
            fired = true;
            self.bus
                .emit("autonomy:trigger:fire", json!({ "trigger": snapshot }))
                .await;

            let ctx = HookContext::new()
                .with_value("trigger", json!(matched.id))
                .with_value("event", json!(event.name));
            if let Err(err) = self.plugins.execute_hooks(HookKind::OnTrigger, ctx).await {
                tracing::warn!(trigger = %matched.id, error = %err, "onTrigger hooks failed");
            }

            match TriggerAction::parse(&matched.action) {
                Some(action) => {
                    if let Err(err) = self.run_action(action, event).await {
                        tracing::warn!(
                            trigger = %matched.id,
                            action = %matched.action,
                            error = %err,
                            "trigger action failed"
                        );
                        if let Some(telemetry) = &self.telemetry {
                            let _ = telemetry.log(
                                LogLevel::Warn,
                                "autonomy.trigger.action_failed",
                                json!({ "trigger": matched.id, "error": err.to_string() }),
                            );
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        trigger = %matched.id,
                        action = %matched.action,
                        "unknown trigger action; ignoring"
                    );
                }
            }
        }
        if fired {
            self.persist_state();
        }
    }

    async fn run_action(&self, action: TriggerAction, source: &Event) -> Result<(), EngineError> {
        match action {
            TriggerAction::RunSecuritySweep => {
                self.run_triggered_scan("security-sweep", "Security sweep", source)
                    .await
            }
            TriggerAction::RunSecurityScan => {
                self.run_triggered_scan("security-scan", "Security scan", source)
                    .await
            }
            TriggerAction::AlertAndDiagnose => {
                self.bus
                    .emit(
                        "autonomy:health:degraded",
                        json!({
                            "reason": "alert",
                            "source": source.name,
                            "data": source.data,
                        }),
                    )
                    .await;
                if let Some(telemetry) = &self.telemetry {
                    let _ = telemetry.log(
                        LogLevel::Warn,
                        "autonomy.health.degraded",
                        json!({ "source": source.name }),
                    );
                }
                Ok(())
            }
            TriggerAction::FinancialAlert => {
                self.bus
                    .emit(
                        "autonomy:health:degraded",
                        json!({
                            "reason": "budget",
                            "source": source.name,
                            "data": source.data,
                        }),
                    )
                    .await;
                Ok(())
            }
        }
    }

    async fn run_triggered_scan(
        &self,
        task_id: &str,
        task_name: &str,
        source: &Event,
    ) -> Result<(), EngineError> {
        let handler = self.handlers.get(task_id).ok_or_else(|| {
            EngineError::Handler(format!("no handler registered for `{task_id}`"))
        })?;
        let invocation = TaskInvocation {
            cycle_id: format!("trigger-{}", source.id),
            kind: CycleKind::Manual,
            task: Task::new(task_id, task_name, HdmLevel::Routine),
        };
        match crate::runner::execute_task(
            handler,
            &invocation,
            self.options.task_timeout,
            self.options.task_retry_attempts,
            self.options.task_retry_delay,
        )
        .await
        {
            Ok(output) => {
                self.bus
                    .emit(
                        "autonomy:health:check",
                        json!({ "task": task_id, "output": output }),
                    )
                    .await;
                Ok(())
            }
            Err(TaskAttemptError::Timeout { seconds }) => Err(EngineError::Timeout {
                task: task_id.to_owned(),
                seconds,
            }),
            Err(TaskAttemptError::Failed(message)) => Err(EngineError::Handler(message)),
        }
    }
}

async fn schedule_loop(weak: Weak<EngineInner>, kind: CycleKind) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let spec = inner.options.schedules.get(kind);
        let now = inner.clock.now();
        let next = match next_fire(kind, &spec, now) {
            Ok(next) => next,
            Err(err) => {
                tracing::error!(kind = %kind, error = %err, "cannot compute next fire; timer disarmed");
                return;
            }
        };
        let delay = (next - now).to_std().unwrap_or_default();
        drop(inner);
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        if let Err(err) = inner.run_cycle(kind, CycleRunOptions::default()).await {
            tracing::warn!(kind = %kind, error = %err, "scheduled cycle failed");
        }
    }
}

/// Builder wiring collaborators into an engine.
pub struct EngineBuilder {
    options: EngineOptions,
    bus: Option<EventBus>,
    plugins: Option<PluginManager>,
    clock: Option<Arc<dyn Clock>>,
    handlers: Option<TaskHandlerRegistry>,
    telemetry: Option<EngineTelemetry>,
}

impl EngineBuilder {
    /// Creates a builder over the given options.
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            bus: None,
            plugins: None,
            clock: None,
            handlers: None,
            telemetry: None,
        }
    }

    /// Injects an event bus.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Injects a plugin manager.
    #[must_use]
    pub fn plugin_manager(mut self, plugins: PluginManager) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Injects a clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Injects a task handler registry.
    #[must_use]
    pub fn handlers(mut self, handlers: TaskHandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Injects a telemetry handle.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> AutonomyEngine {
        let options = self.options;
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::with_capacity(options.max_event_history));
        let store = StateStore::new(&options.root_dir);
        let plugins = self
            .plugins
            .unwrap_or_else(|| PluginManager::new(options.root_dir.join("plugins"), bus.clone()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let handlers = self.handlers.unwrap_or_else(TaskHandlerRegistry::with_defaults);
        let telemetry = self.telemetry.or_else(|| {
            EngineTelemetry::builder("autonomy-engine")
                .log_path(store.engine_log_path())
                .journal_path(store.changes_path())
                .build()
                .map_err(|err| {
                    tracing::warn!(error = %err, "engine telemetry unavailable");
                    err
                })
                .ok()
        });

        let cycle_locks = [
            CycleKind::Daily,
            CycleKind::Weekly,
            CycleKind::Monthly,
            CycleKind::Manual,
        ]
        .into_iter()
        .map(|kind| (kind, Arc::new(tokio::sync::Mutex::new(()))))
        .collect();

        let hdm_level = options.hdm_level;
        AutonomyEngine {
            inner: Arc::new(EngineInner {
                options,
                bus,
                plugins,
                triggers: TriggerRegistry::new(),
                handlers,
                store,
                clock,
                telemetry,
                runtime: RwLock::new(RuntimeFields {
                    state: RuntimeState::Stopped,
                    hdm_level,
                    last_cycle_run: LastCycleRun::default(),
                    cycle_history: Vec::new(),
                }),
                cycle_locks,
                timers: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
            }),
        }
    }
}

/// The autonomous operations engine.
///
/// Composes the event bus, plugin manager, trigger registry, scheduler,
/// cycle runner, and persistence behind one handle. Clones share state.
#[derive(Clone)]
pub struct AutonomyEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AutonomyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runtime = self.inner.runtime.read();
        f.debug_struct("AutonomyEngine")
            .field("state", &runtime.state)
            .field("hdm_level", &runtime.hdm_level)
            .finish()
    }
}

impl AutonomyEngine {
    /// Creates an engine with default collaborators.
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        Self::builder(options).build()
    }

    /// Returns a builder for injecting collaborators.
    #[must_use]
    pub fn builder(options: EngineOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    /// The engine's event bus.
    #[must_use]
    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }

    /// The engine's plugin manager.
    #[must_use]
    pub fn plugin_manager(&self) -> PluginManager {
        self.inner.plugins.clone()
    }

    /// The engine's task handler registry.
    #[must_use]
    pub fn handlers(&self) -> TaskHandlerRegistry {
        self.inner.handlers.clone()
    }

    /// Ensures directories, restores persisted state, registers default
    /// triggers, and brings discovered plugins up.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.inner.initialize().await
    }

    /// Starts event processing and arms the schedulers. Idempotent.
    pub async fn start(&self) -> Result<(), EngineError> {
        Arc::clone(&self.inner).start().await
    }

    /// Cancels timers and stops event processing. Idempotent. An in-flight
    /// cycle runs to completion.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.inner.stop().await
    }

    /// Suspends event processing and scheduled fires; timers stay armed.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.inner.pause().await
    }

    /// Resumes from a paused state.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.inner.resume().await
    }

    /// Runs one cycle of the fixed battery for `kind`.
    pub async fn run_cycle(
        &self,
        kind: CycleKind,
        options: CycleRunOptions,
    ) -> Result<Option<CycleReport>, EngineError> {
        self.inner.run_cycle(kind, options).await
    }

    /// Evaluates triggers against one event, as the `*` subscription does.
    pub async fn process_event(&self, event: &Event) {
        self.inner.process_event(event).await;
    }

    /// Registers a trigger and persists the updated projection.
    pub async fn register_trigger(&self, spec: TriggerSpec) -> TriggerSnapshot {
        let snapshot = self.inner.triggers.register(spec);
        self.inner
            .bus
            .emit("autonomy:trigger:register", json!({ "trigger": snapshot }))
            .await;
        if let Some(telemetry) = &self.inner.telemetry {
            let _ = telemetry.change(
                "trigger-registered",
                &snapshot.id,
                json!({ "action": snapshot.action }),
            );
        }
        self.inner.persist_state();
        snapshot
    }

    /// Removes a trigger. Returns true when it was registered.
    pub async fn unregister_trigger(&self, id: &str) -> bool {
        let removed = self.inner.triggers.unregister(id);
        if removed {
            self.inner
                .bus
                .emit("autonomy:trigger:unregister", json!({ "triggerId": id }))
                .await;
            if let Some(telemetry) = &self.inner.telemetry {
                let _ = telemetry.change("trigger-unregistered", id, Value::Null);
            }
            self.inner.persist_state();
        }
        removed
    }

    /// Projections of all registered triggers.
    #[must_use]
    pub fn triggers(&self) -> Vec<TriggerSnapshot> {
        self.inner.triggers.all()
    }

    /// Projection of one trigger.
    #[must_use]
    pub fn trigger(&self, id: &str) -> Option<TriggerSnapshot> {
        self.inner.triggers.get(id)
    }

    /// Cycle reports, newest first, optionally filtered.
    #[must_use]
    pub fn get_logs(&self, filter: LogFilter) -> Vec<CycleReport> {
        let runtime = self.inner.runtime.read();
        let reports = runtime
            .cycle_history
            .iter()
            .rev()
            .filter(|report| filter.kind.is_none_or(|kind| report.kind == kind))
            .filter(|report| filter.status.is_none_or(|status| report.status == status))
            .cloned();
        match filter.limit {
            Some(limit) => reports.take(limit).collect(),
            None => reports.collect(),
        }
    }

    /// Live status projection.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let runtime = self.inner.runtime.read();
        EngineStatus {
            state: runtime.state,
            hdm_level: runtime.hdm_level,
            last_cycle_run: runtime.last_cycle_run.clone(),
            cycle_count: runtime.cycle_history.len(),
            trigger_count: self.inner.triggers.len(),
            plugin_count: self.inner.plugins.plugins().len(),
        }
    }

    /// Current runtime state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        self.inner.runtime.read().state
    }

    /// Current approval ceiling.
    #[must_use]
    pub fn hdm_level(&self) -> HdmLevel {
        self.inner.runtime.read().hdm_level
    }

    /// Adjusts the approval ceiling and persists it.
    pub fn set_hdm_level(&self, level: HdmLevel) {
        let previous = {
            let mut runtime = self.inner.runtime.write();
            let previous = runtime.hdm_level;
            runtime.hdm_level = level;
            previous
        };
        if let Some(telemetry) = &self.inner.telemetry {
            let _ = telemetry.change(
                "approval-level-changed",
                level.label(),
                json!({ "from": previous.label() }),
            );
        }
        self.inner.persist_state();
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::approval::HdmLevel;

/// Errors surfaced by the autonomy engine at its public boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine options or schedule definitions.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Invalid input to a public operation.
    #[error("validation error: {0}")]
    Validation(String),
    /// Filesystem failure in the persistence layer.
    #[error("filesystem error: {0}")]
    FileSystem(#[from] std::io::Error),
    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A task handler exceeded its deadline on every attempt.
    #[error("task `{task}` timed out after {seconds}s")]
    Timeout {
        /// Task identifier.
        task: String,
        /// Deadline in seconds.
        seconds: u64,
    },
    /// A trigger referenced an action outside the fixed registry.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// An opaque task handler returned an error.
    #[error("handler failure: {0}")]
    Handler(String),
    /// Failure propagated from the plugin subsystem.
    #[error(transparent)]
    Plugin(#[from] eaos_plugins::PluginError),
}

/// Engine runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Not processing events or schedules.
    Stopped,
    /// Processing events and scheduled cycles.
    Running,
    /// Timers armed but events and fires ignored.
    Paused,
    /// Unrecoverable fault; behaves as Stopped for scheduling.
    Error,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Cycle battery kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    /// Daily maintenance battery.
    Daily,
    /// Weekly maintenance battery.
    Weekly,
    /// Monthly maintenance battery.
    Monthly,
    /// Operator-initiated run of the daily battery.
    Manual,
}

impl CycleKind {
    /// Kinds driven by the scheduler.
    pub const SCHEDULED: [Self; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// Lowercase identifier used in file names and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single task within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Handler ran to completion.
    Completed,
    /// Gated out or otherwise not attempted.
    Skipped,
    /// Handler failed or timed out.
    Error,
}

/// Outcome of a whole cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CycleStatus {
    /// Cycle in flight; `end_time` absent exactly while this holds.
    Running,
    /// All attempted tasks succeeded.
    Completed,
    /// Cycle finished but recorded at least one error.
    CompletedWithErrors,
    /// A before-cycle hook cancelled the run.
    Cancelled,
}

/// Durable record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Task identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// When the envelope opened.
    pub start_time: DateTime<Utc>,
    /// When the envelope closed.
    pub end_time: DateTime<Utc>,
    /// Outcome.
    pub status: TaskStatus,
    /// Handler output, when it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure description, when it errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the task was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Durable record of one cycle execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Report identifier; unique per run.
    pub id: String,
    /// Battery kind.
    pub kind: CycleKind,
    /// When the cycle began.
    pub start_time: DateTime<Utc>,
    /// When the cycle ended; absent exactly while status is Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Per-task outcomes in execution order.
    pub tasks: Vec<TaskResult>,
    /// Cycle-level error descriptions.
    pub errors: Vec<String>,
    /// Outcome.
    pub status: CycleStatus,
}

impl CycleReport {
    /// Opens a report in the Running state.
    #[must_use]
    pub fn begin(id: impl Into<String>, kind: CycleKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            start_time: now,
            end_time: None,
            tasks: Vec::new(),
            errors: Vec::new(),
            status: CycleStatus::Running,
        }
    }

    /// Closes the report, deriving the final status from recorded errors.
    ///
    /// The end time never precedes the start time, even when the clock was
    /// adjusted mid-cycle.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now.max(self.start_time));
        self.status = if self.errors.is_empty() {
            CycleStatus::Completed
        } else {
            CycleStatus::CompletedWithErrors
        };
    }

    /// Closes the report as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.end_time = Some(now.max(self.start_time));
        self.status = CycleStatus::Cancelled;
    }
}

/// Completion times of the most recent cycle per scheduled kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCycleRun {
    /// Last completed daily cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<DateTime<Utc>>,
    /// Last completed weekly cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<DateTime<Utc>>,
    /// Last completed monthly cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<DateTime<Utc>>,
}

impl LastCycleRun {
    /// Completion time for a kind; Manual runs are not tracked.
    #[must_use]
    pub const fn get(&self, kind: CycleKind) -> Option<DateTime<Utc>> {
        match kind {
            CycleKind::Daily => self.daily,
            CycleKind::Weekly => self.weekly,
            CycleKind::Monthly => self.monthly,
            CycleKind::Manual => None,
        }
    }

    /// Records a completion time; Manual runs are ignored.
    pub fn set(&mut self, kind: CycleKind, at: DateTime<Utc>) {
        match kind {
            CycleKind::Daily => self.daily = Some(at),
            CycleKind::Weekly => self.weekly = Some(at),
            CycleKind::Monthly => self.monthly = Some(at),
            CycleKind::Manual => {}
        }
    }
}

/// Trigger classification persisted in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Matches on the event name.
    Event,
    /// Evaluates a predicate over the event payload.
    Condition,
}

/// Serializable projection of a registered trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSnapshot {
    /// Trigger identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Classification.
    pub kind: TriggerKind,
    /// Pattern string, or a description of the predicate.
    pub pattern: String,
    /// Action dispatched on fire.
    pub action: String,
    /// Approval level required to fire.
    pub hdm_level: HdmLevel,
    /// Whether the trigger participates in matching.
    pub enabled: bool,
    /// Number of completed fires.
    pub fire_count: u64,
    /// Most recent fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
}

/// Canonical persisted projection of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Runtime state at save time.
    pub state: RuntimeState,
    /// Approval ceiling.
    pub hdm_level: HdmLevel,
    /// Most recent completion per scheduled kind.
    #[serde(default)]
    pub last_cycle_run: LastCycleRun,
    /// Most recent cycle reports, oldest first.
    #[serde(default)]
    pub cycle_history: Vec<CycleReport>,
    /// Registered trigger projections.
    #[serde(default)]
    pub triggers: Vec<TriggerSnapshot>,
    /// Save timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: RuntimeState::Stopped,
            hdm_level: HdmLevel::default(),
            last_cycle_run: LastCycleRun::default(),
            cycle_history: Vec::new(),
            triggers: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn report_status_tracks_end_time() {
        let now = Utc::now();
        let mut report = CycleReport::begin("r1", CycleKind::Daily, now);
        assert_eq!(report.status, CycleStatus::Running);
        assert!(report.end_time.is_none());

        report.finish(now + Duration::seconds(5));
        assert_eq!(report.status, CycleStatus::Completed);
        assert!(report.end_time.unwrap() >= report.start_time);
    }

    #[test]
    fn finish_clamps_regressed_clock() {
        let now = Utc::now();
        let mut report = CycleReport::begin("r1", CycleKind::Weekly, now);
        report.finish(now - Duration::seconds(30));
        assert_eq!(report.end_time.unwrap(), report.start_time);
    }

    #[test]
    fn errors_drive_completed_with_errors() {
        let now = Utc::now();
        let mut report = CycleReport::begin("r2", CycleKind::Daily, now);
        report.errors.push("task failed".into());
        report.finish(now);
        assert_eq!(report.status, CycleStatus::CompletedWithErrors);
    }

    #[test]
    fn manual_runs_are_not_tracked() {
        let mut last = LastCycleRun::default();
        last.set(CycleKind::Manual, Utc::now());
        assert_eq!(last.get(CycleKind::Manual), None);
        let at = Utc::now();
        last.set(CycleKind::Monthly, at);
        assert_eq!(last.get(CycleKind::Monthly), Some(at));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = StateSnapshot::default();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("hdmLevel").is_some());
        assert!(value.get("lastCycleRun").is_some());
        assert!(value.get("updatedAt").is_some());
    }
}

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Autonomous operations engine: scheduled task batteries, event-driven
//! triggers, a tiered approval gate, plugin hook interleaving, and durable
//! cycle history.

/// Approval level model (the human decision matrix).
#[path = "../approval.rs"]
pub mod approval;

/// Wall-clock abstraction.
#[path = "../clock.rs"]
pub mod clock;

/// Engine options and schedule configuration.
#[path = "../config.rs"]
pub mod config;

/// Engine composition and lifecycle.
#[path = "../engine.rs"]
pub mod engine;

/// Durable state, report, and journal storage.
#[path = "../persistence.rs"]
pub mod persistence;

/// Cycle execution envelope: gating, hooks, timeout, retry.
#[path = "../runner.rs"]
pub mod runner;

/// Next-fire computation per cycle kind.
#[path = "../schedule.rs"]
pub mod schedule;

/// Core data model and error taxonomy.
#[path = "../state.rs"]
pub mod state;

/// Task batteries and the opaque handler interface.
#[path = "../tasks.rs"]
pub mod tasks;

/// Telemetry sinks (diagnostics log + change journal).
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Trigger registry and matching.
#[path = "../triggers.rs"]
pub mod triggers;

pub use approval::HdmLevel;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineOptions, ScheduleSpec, Schedules};
pub use engine::{AutonomyEngine, EngineBuilder, EngineStatus, LogFilter, TriggerAction};
pub use persistence::{StateStore, PERSISTED_HISTORY_LIMIT};
pub use runner::{CycleRunOptions, APPROVAL_SKIP_REASON};
pub use schedule::next_fire;
pub use state::{
    CycleKind, CycleReport, CycleStatus, EngineError, LastCycleRun, RuntimeState, StateSnapshot,
    TaskResult, TaskStatus, TriggerKind, TriggerSnapshot,
};
pub use tasks::{battery, Task, TaskHandler, TaskHandlerRegistry, TaskInvocation};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use triggers::{Trigger, TriggerCondition, TriggerRegistry, TriggerSpec};

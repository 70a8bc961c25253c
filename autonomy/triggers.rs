use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use shared_event_bus::{Event, Pattern};
use uuid::Uuid;

use crate::{
    approval::HdmLevel,
    state::{TriggerKind, TriggerSnapshot},
};

/// Predicate evaluated against an event for condition triggers.
pub type TriggerPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// What makes a trigger match an event.
#[derive(Clone)]
pub enum TriggerCondition {
    /// Event-name match, exact or wildcard.
    Pattern(Pattern),
    /// Predicate over the event payload.
    Predicate {
        /// Human-readable description persisted in the snapshot.
        description: String,
        /// The predicate itself. Must be total; a panicking predicate is
        /// treated as non-matching.
        predicate: TriggerPredicate,
    },
}

impl fmt::Debug for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(pattern) => f.debug_tuple("Pattern").field(&pattern.as_str()).finish(),
            Self::Predicate { description, .. } => {
                f.debug_tuple("Predicate").field(description).finish()
            }
        }
    }
}

impl TriggerCondition {
    /// Builds an event-name condition.
    #[must_use]
    pub fn pattern(raw: impl Into<String>) -> Self {
        Self::Pattern(Pattern::new(raw))
    }

    /// Builds a predicate condition with a description for persistence.
    pub fn predicate<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self::Predicate {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Trigger classification for snapshots.
    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        match self {
            Self::Pattern(_) => TriggerKind::Event,
            Self::Predicate { .. } => TriggerKind::Condition,
        }
    }

    /// Pattern string or predicate description.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Pattern(pattern) => pattern.as_str().to_owned(),
            Self::Predicate { description, .. } => description.clone(),
        }
    }

    /// Evaluates the condition against an event.
    ///
    /// A panicking predicate is recorded as non-matching; matching must
    /// never take the engine down.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Pattern(pattern) => pattern.matches(&event.name),
            Self::Predicate {
                description,
                predicate,
            } => {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| predicate(event)));
                match outcome {
                    Ok(matched) => matched,
                    Err(_) => {
                        tracing::warn!(
                            predicate = %description,
                            event = %event.name,
                            "trigger predicate panicked; treating as non-matching"
                        );
                        false
                    }
                }
            }
        }
    }
}

/// A registered trigger with its fire counters.
#[derive(Debug, Clone)]
pub struct Trigger {
    /// Identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Matching rule.
    pub condition: TriggerCondition,
    /// Action dispatched when the trigger fires.
    pub action: String,
    /// Approval level required to fire.
    pub hdm_level: HdmLevel,
    /// Whether the trigger participates in matching.
    pub enabled: bool,
    /// Completed fires.
    pub fire_count: u64,
    /// Most recent fire.
    pub last_fired: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Serializable projection.
    #[must_use]
    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.condition.kind(),
            pattern: self.condition.describe(),
            action: self.action.clone(),
            hdm_level: self.hdm_level,
            enabled: self.enabled,
            fire_count: self.fire_count,
            last_fired: self.last_fired,
        }
    }
}

/// Registration input for a trigger.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    /// Identifier; generated when absent.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Matching rule.
    pub condition: TriggerCondition,
    /// Action name from the fixed action registry.
    pub action: String,
    /// Approval level required to fire.
    pub hdm_level: HdmLevel,
    /// Whether the trigger starts enabled.
    pub enabled: bool,
}

impl TriggerSpec {
    /// Event trigger matching an event-name pattern.
    #[must_use]
    pub fn event(
        name: impl Into<String>,
        pattern: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            condition: TriggerCondition::pattern(pattern),
            action: action.into(),
            hdm_level: HdmLevel::Routine,
            enabled: true,
        }
    }

    /// Condition trigger evaluating a predicate.
    pub fn condition<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        predicate: F,
        action: impl Into<String>,
    ) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self {
            id: None,
            name: name.into(),
            condition: TriggerCondition::predicate(description, predicate),
            action: action.into(),
            hdm_level: HdmLevel::Routine,
            enabled: true,
        }
    }

    /// Pins the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the approval level.
    #[must_use]
    pub fn with_level(mut self, level: HdmLevel) -> Self {
        self.hdm_level = level;
        self
    }

    /// Sets the initial enabled flag.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A matched trigger ready for gating and dispatch.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    /// Trigger identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Action to dispatch.
    pub action: String,
    /// Approval level required to fire.
    pub hdm_level: HdmLevel,
}

/// Registry of triggers keyed by id.
#[derive(Debug, Default, Clone)]
pub struct TriggerRegistry {
    inner: Arc<RwLock<IndexMap<String, Trigger>>>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a trigger, returning its projection.
    pub fn register(&self, spec: TriggerSpec) -> TriggerSnapshot {
        let id = spec
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let trigger = Trigger {
            id: id.clone(),
            name: spec.name,
            condition: spec.condition,
            action: spec.action,
            hdm_level: spec.hdm_level,
            enabled: spec.enabled,
            fire_count: 0,
            last_fired: None,
        };
        let snapshot = trigger.snapshot();
        self.inner.write().insert(id, trigger);
        snapshot
    }

    /// Removes a trigger. Returns true when it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        self.inner.write().shift_remove(id).is_some()
    }

    /// Projection of one trigger.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TriggerSnapshot> {
        self.inner.read().get(id).map(Trigger::snapshot)
    }

    /// Projections of all triggers, in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<TriggerSnapshot> {
        self.inner.read().values().map(Trigger::snapshot).collect()
    }

    /// Number of registered triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Enabled triggers matching the event, from a consistent snapshot.
    #[must_use]
    pub fn matching(&self, event: &Event) -> Vec<TriggerMatch> {
        let registry = self.inner.read();
        registry
            .values()
            .filter(|trigger| trigger.enabled && trigger.condition.matches(event))
            .map(|trigger| TriggerMatch {
                id: trigger.id.clone(),
                name: trigger.name.clone(),
                action: trigger.action.clone(),
                hdm_level: trigger.hdm_level,
            })
            .collect()
    }

    /// Stamps a fire: increments the counter and records the time.
    pub fn mark_fired(&self, id: &str, at: DateTime<Utc>) -> Option<TriggerSnapshot> {
        let mut registry = self.inner.write();
        let trigger = registry.get_mut(id)?;
        trigger.fire_count += 1;
        trigger.last_fired = Some(at);
        Some(trigger.snapshot())
    }

    /// Applies persisted counters onto already-registered triggers by id.
    ///
    /// Condition predicates cannot be reconstructed from a snapshot, so
    /// restore only touches triggers that are registered in this process.
    pub fn restore(&self, snapshots: &[TriggerSnapshot]) {
        let mut registry = self.inner.write();
        for snapshot in snapshots {
            if let Some(trigger) = registry.get_mut(&snapshot.id) {
                trigger.fire_count = snapshot.fire_count;
                trigger.last_fired = snapshot.last_fired;
                trigger.enabled = snapshot.enabled;
            } else {
                tracing::debug!(
                    trigger = %snapshot.id,
                    "persisted trigger has no registered counterpart; counters not restored"
                );
            }
        }
    }

    /// Toggles a trigger. Returns false when it is not registered.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut registry = self.inner.write();
        match registry.get_mut(id) {
            Some(trigger) => {
                trigger.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

use std::{future::Future, sync::Arc};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of plugin hook boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// Runs before a cycle's first task; may cancel the cycle.
    BeforeCycle,
    /// Runs after a cycle's last task.
    AfterCycle,
    /// Runs before each task handler.
    BeforeTask,
    /// Runs after each task handler.
    AfterTask,
    /// Runs when a trigger fires.
    OnTrigger,
    /// Runs when a task or cycle records an error.
    OnError,
}

impl HookKind {
    /// Every hook kind, in dispatch-boundary order.
    pub const ALL: [Self; 6] = [
        Self::BeforeCycle,
        Self::AfterCycle,
        Self::BeforeTask,
        Self::AfterTask,
        Self::OnTrigger,
        Self::OnError,
    ];

    /// Parses the camelCase manifest spelling.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "beforeCycle" => Some(Self::BeforeCycle),
            "afterCycle" => Some(Self::AfterCycle),
            "beforeTask" => Some(Self::BeforeTask),
            "afterTask" => Some(Self::AfterTask),
            "onTrigger" => Some(Self::OnTrigger),
            "onError" => Some(Self::OnError),
            _ => None,
        }
    }

    /// The camelCase manifest spelling.
    #[must_use]
    pub const fn manifest_name(self) -> &'static str {
        match self {
            Self::BeforeCycle => "beforeCycle",
            Self::AfterCycle => "afterCycle",
            Self::BeforeTask => "beforeTask",
            Self::AfterTask => "afterTask",
            Self::OnTrigger => "onTrigger",
            Self::OnError => "onError",
        }
    }

    /// Bus event announcing dispatch at this boundary, when one exists.
    #[must_use]
    pub const fn dispatch_event(self) -> Option<&'static str> {
        match self {
            Self::BeforeCycle => Some("plugin:hook:before:cycle"),
            Self::AfterCycle => Some("plugin:hook:after:cycle"),
            Self::BeforeTask => Some("plugin:hook:before:task"),
            Self::AfterTask => Some("plugin:hook:after:task"),
            Self::OnTrigger | Self::OnError => None,
        }
    }
}

/// Context threaded through a hook slot.
///
/// Handlers receive a value copy and contribute by returning a JSON object;
/// the dispatcher folds returns back in. The runner observes exactly two
/// reserved keys: `cancelled` (before-cycle hooks may cancel the cycle) and
/// `stopOnError` (a failing later hook aborts dispatch). Everything else
/// lands in `values` and overrides earlier entries key-by-key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    /// Set by a hook to cancel the surrounding cycle.
    pub cancelled: bool,
    /// Set by a hook to turn subsequent hook failures into dispatch errors.
    pub stop_on_error: bool,
    /// Open extension map shared down the slot.
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,
}

impl HookContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Looks up an extension value.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Folds a handler's returned object into the context.
    ///
    /// Reserved keys update the flags; all other keys shallow-merge into
    /// `values`, later writers overriding earlier ones.
    pub fn absorb(&mut self, returned: &Value) {
        let Some(map) = returned.as_object() else {
            return;
        };
        for (key, value) in map {
            match key.as_str() {
                "cancelled" => self.cancelled = value.as_bool().unwrap_or(self.cancelled),
                "stopOnError" => {
                    self.stop_on_error = value.as_bool().unwrap_or(self.stop_on_error);
                }
                _ => {
                    self.values.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Boxed future produced by a hook handler.
pub type HookFuture = BoxFuture<'static, anyhow::Result<Option<Value>>>;

/// Shared async hook handler. A handler may return a JSON object to merge
/// into the context, or `None` to leave it untouched.
pub type HookHandler = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Adapts an async closure into a [`HookHandler`].
pub fn hook_handler<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// One registered handler in a hook slot.
#[derive(Clone)]
pub struct HookEntry {
    /// Owning plugin.
    pub plugin_id: String,
    /// Boundary this entry fires at.
    pub kind: HookKind,
    /// Dispatch priority; higher first, ties by registration order.
    pub priority: i32,
    /// Bound handler.
    pub handler: HookHandler,
}

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEntry")
            .field("plugin_id", &self.plugin_id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_the_closed_set_only() {
        for kind in HookKind::ALL {
            assert_eq!(HookKind::parse(kind.manifest_name()), Some(kind));
        }
        assert_eq!(HookKind::parse("beforeEverything"), None);
        assert_eq!(HookKind::parse("BeforeCycle"), None);
    }

    #[test]
    fn absorb_merges_and_overrides() {
        let mut ctx = HookContext::new().with_value("a", json!(1));
        ctx.absorb(&json!({ "a": 2, "b": 3 }));
        assert_eq!(ctx.value("a"), Some(&json!(2)));
        assert_eq!(ctx.value("b"), Some(&json!(3)));
    }

    #[test]
    fn absorb_handles_reserved_keys() {
        let mut ctx = HookContext::new();
        ctx.absorb(&json!({ "cancelled": true, "stopOnError": true, "note": "x" }));
        assert!(ctx.cancelled);
        assert!(ctx.stop_on_error);
        assert_eq!(ctx.value("note"), Some(&json!("x")));
        assert!(ctx.value("cancelled").is_none());
    }

    #[test]
    fn absorb_ignores_non_objects() {
        let mut ctx = HookContext::new().with_value("a", json!(1));
        ctx.absorb(&json!("scalar"));
        assert_eq!(ctx.value("a"), Some(&json!(1)));
    }
}

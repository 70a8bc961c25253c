#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! In-process publish/subscribe router for engine lifecycle notifications
//! and trigger inputs.
//!
//! Subscriptions match event names exactly or through `*` wildcards, where
//! `*` spans any run of characters including `:` separators. Delivery is
//! fan-out with per-subscriber fault isolation: a failing handler never
//! prevents the remaining handlers from receiving the event, and `emit`
//! itself never fails.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Default number of events retained in the bounded history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// `wait_for` expired before a matching event arrived.
    #[error("no event matching `{pattern}` within {timeout:?}")]
    WaitTimeout {
        /// Pattern that was awaited.
        pattern: String,
        /// Configured deadline.
        timeout: Duration,
    },
    /// The bus was dropped before the awaited event was delivered.
    #[error("wait for `{0}` cancelled before delivery")]
    WaitCancelled(String),
}

/// Immutable event value observed by subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: Uuid,
    /// Colon-delimited segment name (e.g. `autonomy:cycle:start`).
    pub name: String,
    /// Opaque JSON payload.
    #[serde(default)]
    pub data: Value,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Convenience lookup of a payload field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|map| map.get(key))
    }
}

/// Compiled subscription pattern.
///
/// A pattern without `*` matches only the identical name. With `*`, each
/// wildcard matches any run of characters (including colons); every other
/// character is taken literally.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Wildcard(Regex),
}

impl Pattern {
    /// Compiles a pattern string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let matcher = if raw.contains('*') {
            let mut source = String::with_capacity(raw.len() + 8);
            source.push('^');
            for (idx, segment) in raw.split('*').enumerate() {
                if idx > 0 {
                    source.push_str(".*");
                }
                source.push_str(&regex::escape(segment));
            }
            source.push('$');
            // The source is fully escaped apart from `.*` runs, so
            // compilation cannot fail on user input.
            match Regex::new(&source) {
                Ok(regex) => Matcher::Wildcard(regex),
                Err(_) => Matcher::Exact,
            }
        } else {
            Matcher::Exact
        };
        Self { raw, matcher }
    }

    /// Returns true when the event name satisfies this pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => self.raw == name,
            Matcher::Wildcard(regex) => regex.is_match(name),
        }
    }

    /// Returns true when the pattern contains a wildcard.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Wildcard(_))
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Identifier handed back by `on`/`once`; pass to `off` to detach.
pub type SubscriberId = u64;

/// Boxed future produced by an event handler.
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Shared async event handler.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Adapts an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Delivery failure captured during fan-out.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Subscriber whose handler failed.
    pub subscriber: SubscriberId,
    /// Pattern the subscriber was registered under.
    pub pattern: String,
    /// Rendered error message.
    pub message: String,
}

/// Result of a completed `emit`, returned once every handler has finished.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    /// The event as delivered.
    pub event: Event,
    /// Number of handlers invoked.
    pub delivered: usize,
    /// Failures recorded during fan-out (delivery continued past each).
    pub failures: Vec<HandlerFailure>,
}

struct Subscription {
    id: SubscriberId,
    pattern: Pattern,
    handler: EventHandler,
    once: bool,
}

struct BusState {
    subscriptions: Vec<Subscription>,
    history: VecDeque<Event>,
}

struct BusInner {
    state: Mutex<BusState>,
    capacity: usize,
    next_id: AtomicU64,
}

/// In-process publish/subscribe router with bounded history.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventBus")
            .field("subscriptions", &state.subscriptions.len())
            .field("history", &state.history.len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default history capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Creates a bus retaining at most `capacity` events in history.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    subscriptions: Vec::new(),
                    history: VecDeque::with_capacity(capacity.min(1024)),
                }),
                capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a persistent subscription. Returns its detach id.
    pub fn on(&self, pattern: impl Into<String>, handler: EventHandler) -> SubscriberId {
        self.subscribe(pattern, handler, false)
    }

    /// Registers a subscription that fires at most once.
    pub fn once(&self, pattern: impl Into<String>, handler: EventHandler) -> SubscriberId {
        self.subscribe(pattern, handler, true)
    }

    fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: EventHandler,
        once: bool,
    ) -> SubscriberId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        state.subscriptions.push(Subscription {
            id,
            pattern: Pattern::new(pattern),
            handler,
            once,
        });
        id
    }

    /// Removes a subscription. Returns true when it was still attached.
    pub fn off(&self, id: SubscriberId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.id != id);
        state.subscriptions.len() != before
    }

    /// Number of attached subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Emits an event and waits for every matched handler to complete.
    ///
    /// Collection order is exact-pattern subscriptions first, wildcard
    /// subscriptions second (each group in registration order), then
    /// one-shot subscriptions, which are detached before any handler runs.
    /// Handler failures are recorded in the outcome and never propagate.
    pub async fn emit(&self, name: &str, data: Value) -> EmitOutcome {
        let event = Event::new(name, data);

        let matched: Vec<(SubscriberId, String, EventHandler)> = {
            let mut state = self.inner.state.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.inner.capacity {
                state.history.pop_front();
            }

            let mut exact = Vec::new();
            let mut wildcard = Vec::new();
            let mut one_shot = Vec::new();
            for sub in &state.subscriptions {
                if !sub.pattern.matches(&event.name) {
                    continue;
                }
                let entry = (
                    sub.id,
                    sub.pattern.as_str().to_owned(),
                    Arc::clone(&sub.handler),
                );
                if sub.once {
                    one_shot.push(entry);
                } else if sub.pattern.is_wildcard() {
                    wildcard.push(entry);
                } else {
                    exact.push(entry);
                }
            }
            let fired: Vec<SubscriberId> = one_shot.iter().map(|(id, _, _)| *id).collect();
            state
                .subscriptions
                .retain(|sub| !(sub.once && fired.contains(&sub.id)));

            exact.into_iter().chain(wildcard).chain(one_shot).collect()
        };

        let delivered = matched.len();
        let futures: Vec<_> = matched
            .iter()
            .map(|(_, _, handler)| handler(event.clone()))
            .collect();
        let results = join_all(futures).await;

        let mut failures = Vec::new();
        for ((id, pattern, _), result) in matched.into_iter().zip(results) {
            if let Err(err) = result {
                failures.push(HandlerFailure {
                    subscriber: id,
                    pattern,
                    message: format!("{err:#}"),
                });
            }
        }

        EmitOutcome {
            event,
            delivered,
            failures,
        }
    }

    /// Completes with the next event matching `pattern`, or fails after
    /// `timeout`.
    pub async fn wait_for(
        &self,
        pattern: impl Into<String>,
        timeout: Duration,
    ) -> Result<Event, BusError> {
        let pattern = pattern.into();
        let (tx, rx) = oneshot::channel::<Event>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let waiter = {
            let slot = Arc::clone(&slot);
            handler(move |event: Event| {
                let slot = Arc::clone(&slot);
                async move {
                    if let Some(sender) = slot.lock().take() {
                        let _ = sender.send(event);
                    }
                    Ok(())
                }
            })
        };
        let id = self.once(pattern.clone(), waiter);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::WaitCancelled(pattern)),
            Err(_) => {
                self.off(id);
                Err(BusError::WaitTimeout { pattern, timeout })
            }
        }
    }

    /// Snapshot of retained history, newest last, optionally filtered.
    #[must_use]
    pub fn history(&self, filter: Option<&str>) -> Vec<Event> {
        let state = self.inner.state.lock();
        match filter {
            None => state.history.iter().cloned().collect(),
            Some(raw) => {
                let pattern = Pattern::new(raw);
                state
                    .history
                    .iter()
                    .filter(|event| pattern.matches(&event.name))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Drops all retained history.
    pub fn clear_history(&self) {
        self.inner.state.lock().history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        handler(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn wildcard_spans_colon_segments() {
        let pattern = Pattern::new("foo:*:bar");
        assert!(pattern.matches("foo:x:bar"));
        assert!(pattern.matches("foo:x:y:bar"));
        assert!(!pattern.matches("foo:bar"));
    }

    #[test]
    fn lone_star_matches_everything() {
        let pattern = Pattern::new("*");
        assert!(pattern.matches("autonomy:cycle:start"));
        assert!(pattern.matches(""));
        assert!(pattern.matches("a"));
    }

    #[test]
    fn exact_pattern_requires_identity() {
        let pattern = Pattern::new("autonomy:cycle:start");
        assert!(pattern.matches("autonomy:cycle:start"));
        assert!(!pattern.matches("autonomy:cycle:start:extra"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = Pattern::new("metrics.sample:*");
        assert!(pattern.matches("metrics.sample:cpu"));
        assert!(!pattern.matches("metricsXsample:cpu"));
    }

    #[tokio::test]
    async fn emit_delivers_to_matching_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on("autonomy:*", counter_handler(Arc::clone(&hits)));
        bus.on("plugin:*", counter_handler(Arc::clone(&hits)));

        let outcome = bus.emit("autonomy:cycle:start", json!({})).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.once("tick", counter_handler(Arc::clone(&hits)));

        bus.emit("tick", json!({})).await;
        bus.emit("tick", json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn off_detaches_subscription() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = bus.on("tick", counter_handler(Arc::clone(&hits)));
        assert!(bus.off(id));
        assert!(!bus.off(id));

        bus.emit("tick", json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on(
            "tick",
            handler(|_event| async { Err(anyhow::anyhow!("boom")) }),
        );
        bus.on("tick", counter_handler(Arc::clone(&hits)));

        let outcome = bus.emit("tick", json!({})).await;
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].message.contains("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exact_subscribers_run_before_wildcards() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            handler(move |_event| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(label);
                    Ok(())
                }
            })
        };
        bus.on("*", record("wildcard", Arc::clone(&order)));
        bus.on("tick", record("exact", Arc::clone(&order)));

        bus.emit("tick", json!({})).await;
        assert_eq!(*order.lock(), vec!["exact", "wildcard"]);
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        let bus = EventBus::with_capacity(3);
        for idx in 0..5 {
            bus.emit(&format!("tick:{idx}"), json!({})).await;
        }
        let history = bus.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].name, "tick:2");
        assert_eq!(history[2].name, "tick:4");
    }

    #[tokio::test]
    async fn history_filter_applies_pattern() {
        let bus = EventBus::new();
        bus.emit("autonomy:cycle:start", json!({})).await;
        bus.emit("plugin:load", json!({})).await;
        bus.emit("autonomy:cycle:end", json!({})).await;

        let filtered = bus.history(Some("autonomy:*"));
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[1].name, "autonomy:cycle:end");
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_event() {
        let bus = EventBus::new();
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_for("job:*", Duration::from_secs(5)).await })
        };
        while bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.emit("job:done", json!({ "ok": true })).await;

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.name, "job:done");
    }

    #[tokio::test]
    async fn wait_for_times_out_and_detaches() {
        let bus = EventBus::new();
        let err = bus
            .wait_for("never", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::WaitTimeout { .. }));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn emit_reports_payload_fields() {
        let bus = EventBus::new();
        let outcome = bus.emit("metrics:sample", json!({ "errorRate": 0.06 })).await;
        assert_eq!(
            outcome.event.field("errorRate").and_then(Value::as_f64),
            Some(0.06)
        );
    }
}

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::EventBus;

use crate::{
    hooks::{HookContext, HookEntry, HookHandler, HookKind},
    manifest::{PluginError, PluginManifest},
};

/// Lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Known but not loaded.
    Unloaded,
    /// Manifest validated and module bound.
    Loaded,
    /// Participating in hook dispatch.
    Enabled,
    /// Loaded but excluded from dispatch.
    Disabled,
    /// Load or lifecycle failure; see `last_error`.
    Error,
}

/// Compiled plugin behavior bound at load time.
///
/// This registration interface stands in for dynamic module loading: a
/// plugin that declares a `main` entry ships a compiled object registered
/// under its id before `load` runs. Manifest hook bindings are resolved
/// against [`PluginInstance::hook`] at load time, so unknown handler names
/// fail the load rather than a later dispatch.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// Invoked when the plugin transitions to Enabled.
    async fn on_enable(&self, _config: Option<&Value>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when the plugin transitions to Disabled. Best-effort.
    async fn on_disable(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked before the plugin is removed from the registry. Best-effort.
    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Resolves an exported handler by the name used in the manifest.
    fn hook(&self, _name: &str) -> Option<HookHandler> {
        None
    }
}

/// Stateful record owned by the manager.
#[derive(Clone)]
pub struct Plugin {
    /// Validated manifest.
    pub manifest: PluginManifest,
    /// Directory the plugin was discovered in.
    pub base_path: PathBuf,
    /// Current lifecycle state.
    pub state: PluginState,
    /// When the plugin was loaded.
    pub loaded_at: Option<DateTime<Utc>>,
    /// Reason for the most recent failure, if any.
    pub last_error: Option<String>,
    instance: Option<Arc<dyn PluginInstance>>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.manifest.id)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Serializable projection of a plugin record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Plugin identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Lifecycle state.
    pub state: PluginState,
    /// Load timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    /// Most recent failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Plugin> for PluginDescriptor {
    fn from(plugin: &Plugin) -> Self {
        Self {
            id: plugin.manifest.id.clone(),
            name: plugin.manifest.name.clone(),
            version: plugin.manifest.version.clone(),
            state: plugin.state,
            loaded_at: plugin.loaded_at,
            last_error: plugin.last_error.clone(),
        }
    }
}

struct ManagerInner {
    base_dir: PathBuf,
    bus: EventBus,
    plugins: RwLock<IndexMap<String, Plugin>>,
    hooks: RwLock<IndexMap<HookKind, Vec<HookEntry>>>,
    registrar: RwLock<IndexMap<String, Arc<dyn PluginInstance>>>,
}

/// Discovery, lifecycle, and hook dispatch for plugins under one directory.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("base_dir", &self.inner.base_dir)
            .field("plugins", &self.inner.plugins.read().len())
            .finish()
    }
}

impl PluginManager {
    /// Creates a manager rooted at the plugin directory.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                base_dir: base_dir.into(),
                bus,
                plugins: RwLock::new(IndexMap::new()),
                hooks: RwLock::new(IndexMap::new()),
                registrar: RwLock::new(IndexMap::new()),
            }),
        }
    }

    /// Plugin directory this manager scans.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Registers the compiled instance backing a plugin id.
    ///
    /// Must happen before `load` for manifests that declare a `main` entry.
    pub fn register_instance(&self, id: impl Into<String>, instance: Arc<dyn PluginInstance>) {
        self.inner.registrar.write().insert(id.into(), instance);
    }

    /// Enumerates plugin subdirectories and returns the valid manifests.
    ///
    /// Entries that fail validation or whose directory name does not match
    /// the manifest id are skipped with a warning; `load` remains the
    /// boundary that surfaces validation errors for a specific id.
    pub fn discover(&self) -> Result<Vec<PluginManifest>, PluginError> {
        let mut manifests = Vec::new();
        let read_dir = match std::fs::read_dir(&self.inner.base_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join("plugin.json");
            if !manifest_path.is_file() {
                continue;
            }
            match PluginManifest::load(&manifest_path) {
                Ok(manifest) => {
                    let dir_name = entry.file_name().to_string_lossy().into_owned();
                    if dir_name == manifest.id {
                        manifests.push(manifest);
                    } else {
                        tracing::warn!(
                            directory = %dir_name,
                            id = %manifest.id,
                            "plugin directory name does not match manifest id; skipping"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %manifest_path.display(), error = %err, "skipping invalid plugin manifest");
                }
            }
        }
        Ok(manifests)
    }

    /// Loads a plugin by id from `<base_dir>/<id>/plugin.json`.
    pub async fn load(&self, id: &str) -> Result<(), PluginError> {
        let base_path = self.inner.base_dir.join(id);
        let manifest = PluginManifest::load(base_path.join("plugin.json"))?;
        if manifest.id != id {
            return Err(PluginError::Validation(format!(
                "directory `{id}` does not match manifest id `{}`",
                manifest.id
            )));
        }
        self.load_manifest(manifest, base_path).await
    }

    /// Loads a validated manifest: dependency check, instance binding, hook
    /// registration. Failures leave an Error-state record behind.
    pub async fn load_manifest(
        &self,
        manifest: PluginManifest,
        base_path: PathBuf,
    ) -> Result<(), PluginError> {
        manifest.validate()?;
        let id = manifest.id.clone();

        let result = self.bind(&manifest);
        match result {
            Ok((instance, entries)) => {
                {
                    let mut plugins = self.inner.plugins.write();
                    plugins.insert(
                        id.clone(),
                        Plugin {
                            manifest,
                            base_path,
                            state: PluginState::Loaded,
                            loaded_at: Some(Utc::now()),
                            last_error: None,
                            instance,
                        },
                    );
                }
                self.register_entries(entries);
                self.inner
                    .bus
                    .emit("plugin:load", json!({ "pluginId": id }))
                    .await;
                Ok(())
            }
            Err(err) => {
                let mut plugins = self.inner.plugins.write();
                plugins.insert(
                    id,
                    Plugin {
                        manifest,
                        base_path,
                        state: PluginState::Error,
                        loaded_at: None,
                        last_error: Some(err.to_string()),
                        instance: None,
                    },
                );
                Err(err)
            }
        }
    }

    /// Discovers and loads every valid plugin, returning the loaded ids.
    pub async fn load_all(&self) -> Result<Vec<String>, PluginError> {
        let mut manifests = self.discover()?;
        // Dependencies must be loaded before their dependents; iterate until
        // a pass makes no progress, then report the first blocked manifest.
        let mut loaded = Vec::new();
        loop {
            let mut progressed = false;
            let mut remaining = Vec::new();
            for manifest in manifests {
                let deps_ready = {
                    let plugins = self.inner.plugins.read();
                    manifest.dependencies.iter().all(|dep| {
                        plugins.get(dep).is_some_and(|p| {
                            matches!(p.state, PluginState::Loaded | PluginState::Enabled)
                        })
                    })
                };
                if deps_ready {
                    let id = manifest.id.clone();
                    let base_path = self.inner.base_dir.join(&id);
                    if let Err(err) = self.load_manifest(manifest, base_path).await {
                        tracing::warn!(plugin = %id, error = %err, "plugin failed to load");
                    } else {
                        loaded.push(id);
                    }
                    progressed = true;
                } else {
                    remaining.push(manifest);
                }
            }
            if remaining.is_empty() {
                return Ok(loaded);
            }
            if !progressed {
                for manifest in &remaining {
                    tracing::warn!(
                        plugin = %manifest.id,
                        "plugin skipped: dependencies unresolved"
                    );
                }
                return Ok(loaded);
            }
            manifests = remaining;
        }
    }

    fn bind(
        &self,
        manifest: &PluginManifest,
    ) -> Result<(Option<Arc<dyn PluginInstance>>, Vec<HookEntry>), PluginError> {
        {
            let plugins = self.inner.plugins.read();
            for dep in &manifest.dependencies {
                let ready = plugins
                    .get(dep)
                    .is_some_and(|p| matches!(p.state, PluginState::Loaded | PluginState::Enabled));
                if !ready {
                    return Err(PluginError::MissingDependency {
                        plugin: manifest.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let instance = if manifest.main.is_some() {
            let instance = self.inner.registrar.read().get(&manifest.id).cloned();
            Some(instance.ok_or_else(|| PluginError::Load {
                plugin: manifest.id.clone(),
                reason: "no instance registered for declared main entry".into(),
            })?)
        } else {
            if !manifest.hooks.is_empty() {
                return Err(PluginError::Load {
                    plugin: manifest.id.clone(),
                    reason: "hooks declared without a main entry".into(),
                });
            }
            None
        };

        let mut entries = Vec::new();
        if let Some(instance) = &instance {
            for (hook_name, handler_ref) in &manifest.hooks {
                // Validated upstream; parse cannot miss here.
                let Some(kind) = HookKind::parse(hook_name) else {
                    continue;
                };
                let handler = instance.hook(handler_ref).ok_or_else(|| PluginError::Load {
                    plugin: manifest.id.clone(),
                    reason: format!("manifest binds `{hook_name}` to unknown export `{handler_ref}`"),
                })?;
                entries.push(HookEntry {
                    plugin_id: manifest.id.clone(),
                    kind,
                    priority: manifest.priority_of(hook_name),
                    handler,
                });
            }
        }
        Ok((instance, entries))
    }

    fn register_entries(&self, entries: Vec<HookEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut hooks = self.inner.hooks.write();
        for entry in entries {
            let slot = hooks.entry(entry.kind).or_default();
            slot.push(entry);
            // Stable sort keeps insertion order among equal priorities.
            slot.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }

    /// Enables a plugin and, recursively, its dependencies.
    pub async fn enable(&self, id: &str) -> Result<(), PluginError> {
        let order = {
            let plugins = self.inner.plugins.read();
            let mut visiting = Vec::new();
            let mut order = Vec::new();
            collect_enable_order(&plugins, id, &mut visiting, &mut order)?;
            order
        };

        for plugin_id in order {
            let (needs_enable, instance, config) = {
                let plugins = self.inner.plugins.read();
                let plugin = plugins
                    .get(&plugin_id)
                    .ok_or_else(|| PluginError::NotFound(plugin_id.clone()))?;
                match plugin.state {
                    PluginState::Enabled => (false, None, None),
                    PluginState::Loaded | PluginState::Disabled => (
                        true,
                        plugin.instance.clone(),
                        plugin.manifest.config.clone(),
                    ),
                    PluginState::Unloaded | PluginState::Error => {
                        return Err(PluginError::Validation(format!(
                            "cannot enable `{plugin_id}` from state {:?}",
                            plugin.state
                        )));
                    }
                }
            };
            if !needs_enable {
                continue;
            }

            if let Some(instance) = instance {
                if let Err(err) = instance.on_enable(config.as_ref()).await {
                    let mut plugins = self.inner.plugins.write();
                    if let Some(plugin) = plugins.get_mut(&plugin_id) {
                        plugin.state = PluginState::Error;
                        plugin.last_error = Some(err.to_string());
                    }
                    return Err(PluginError::Load {
                        plugin: plugin_id,
                        reason: format!("onEnable failed: {err:#}"),
                    });
                }
            }
            {
                let mut plugins = self.inner.plugins.write();
                if let Some(plugin) = plugins.get_mut(&plugin_id) {
                    plugin.state = PluginState::Enabled;
                    plugin.last_error = None;
                }
            }
            self.inner
                .bus
                .emit("plugin:enable", json!({ "pluginId": plugin_id }))
                .await;
        }
        Ok(())
    }

    /// Disables a plugin. Enabled dependents are disabled first so every
    /// Enabled plugin keeps all of its dependencies Enabled.
    pub async fn disable(&self, id: &str) -> Result<(), PluginError> {
        let mut order = {
            let plugins = self.inner.plugins.read();
            if !plugins.contains_key(id) {
                return Err(PluginError::NotFound(id.to_owned()));
            }
            enabled_dependents(&plugins, id)
        };
        order.push(id.to_owned());

        for plugin_id in order {
            let instance = {
                let plugins = self.inner.plugins.read();
                match plugins.get(&plugin_id) {
                    Some(plugin) if plugin.state == PluginState::Enabled => {
                        plugin.instance.clone()
                    }
                    _ => continue,
                }
            };
            if let Some(instance) = instance {
                if let Err(err) = instance.on_disable().await {
                    tracing::warn!(plugin = %plugin_id, error = %format!("{err:#}"), "onDisable failed");
                }
            }
            {
                let mut plugins = self.inner.plugins.write();
                if let Some(plugin) = plugins.get_mut(&plugin_id) {
                    plugin.state = PluginState::Disabled;
                }
            }
            self.inner
                .bus
                .emit("plugin:disable", json!({ "pluginId": plugin_id }))
                .await;
        }
        Ok(())
    }

    /// Unloads a plugin, removing it and its hooks from the registry.
    pub async fn unload(&self, id: &str) -> Result<(), PluginError> {
        let instance = {
            let plugins = self.inner.plugins.read();
            let plugin = plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_owned()))?;
            for (other_id, other) in plugins.iter() {
                if other_id != id && other.manifest.dependencies.iter().any(|dep| dep == id) {
                    return Err(PluginError::DependencyInUse {
                        plugin: id.to_owned(),
                        dependent: other_id.clone(),
                    });
                }
            }
            plugin.instance.clone()
        };

        if let Some(instance) = instance {
            if let Err(err) = instance.on_unload().await {
                tracing::warn!(plugin = %id, error = %format!("{err:#}"), "onUnload failed");
            }
        }
        {
            let mut hooks = self.inner.hooks.write();
            for slot in hooks.values_mut() {
                slot.retain(|entry| entry.plugin_id != id);
            }
        }
        self.inner.plugins.write().shift_remove(id);
        self.inner
            .bus
            .emit("plugin:unload", json!({ "pluginId": id }))
            .await;
        Ok(())
    }

    /// Dispatches a hook slot over the given context.
    ///
    /// The slot is snapshotted up front; handlers of non-Enabled plugins are
    /// skipped; returned objects fold into the context in dispatch order. A
    /// failing handler emits `plugin:error` and dispatch continues, unless
    /// the context has `stop_on_error` set, in which case the failure is
    /// returned to the caller.
    pub async fn execute_hooks(
        &self,
        kind: HookKind,
        ctx: HookContext,
    ) -> Result<HookContext, PluginError> {
        let entries: Vec<HookEntry> = {
            let hooks = self.inner.hooks.read();
            hooks.get(&kind).cloned().unwrap_or_default()
        };
        let mut ctx = ctx;
        if entries.is_empty() {
            return Ok(ctx);
        }
        if let Some(event_name) = kind.dispatch_event() {
            self.inner
                .bus
                .emit(event_name, json!({ "handlers": entries.len() }))
                .await;
        }

        for entry in entries {
            let enabled = {
                let plugins = self.inner.plugins.read();
                plugins
                    .get(&entry.plugin_id)
                    .is_some_and(|p| p.state == PluginState::Enabled)
            };
            if !enabled {
                continue;
            }
            match (entry.handler)(ctx.clone()).await {
                Ok(Some(returned)) => ctx.absorb(&returned),
                Ok(None) => {}
                Err(err) => {
                    self.inner
                        .bus
                        .emit(
                            "plugin:error",
                            json!({
                                "pluginId": entry.plugin_id,
                                "hook": kind.manifest_name(),
                                "error": format!("{err:#}"),
                            }),
                        )
                        .await;
                    if ctx.stop_on_error {
                        return Err(PluginError::Hook {
                            plugin: entry.plugin_id,
                            hook: kind.manifest_name().to_owned(),
                            message: format!("{err:#}"),
                        });
                    }
                }
            }
        }
        Ok(ctx)
    }

    /// Projection of one plugin.
    #[must_use]
    pub fn plugin(&self, id: &str) -> Option<PluginDescriptor> {
        self.inner.plugins.read().get(id).map(PluginDescriptor::from)
    }

    /// Projections of every registered plugin, in registration order.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.inner
            .plugins
            .read()
            .values()
            .map(PluginDescriptor::from)
            .collect()
    }

    /// Current state of a plugin, if registered.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.inner.plugins.read().get(id).map(|p| p.state)
    }

    /// Snapshot of a hook slot, in dispatch order.
    #[must_use]
    pub fn hook_entries(&self, kind: HookKind) -> Vec<HookEntry> {
        self.inner
            .hooks
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, plugin: Plugin) {
        self.inner
            .plugins
            .write()
            .insert(plugin.manifest.id.clone(), plugin);
    }
}

fn collect_enable_order(
    plugins: &IndexMap<String, Plugin>,
    id: &str,
    visiting: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), PluginError> {
    if order.iter().any(|entry| entry == id) {
        return Ok(());
    }
    if visiting.iter().any(|entry| entry == id) {
        return Err(PluginError::DependencyCycle(id.to_owned()));
    }
    let plugin = plugins
        .get(id)
        .ok_or_else(|| PluginError::NotFound(id.to_owned()))?;
    visiting.push(id.to_owned());
    for dep in &plugin.manifest.dependencies {
        collect_enable_order(plugins, dep, visiting, order)?;
    }
    visiting.pop();
    order.push(id.to_owned());
    Ok(())
}

/// Enabled plugins that transitively depend on `id`, leaf-most first.
fn enabled_dependents(plugins: &IndexMap<String, Plugin>, id: &str) -> Vec<String> {
    let mut order = Vec::new();
    let mut visited = vec![id.to_owned()];
    let mut stack = vec![id.to_owned()];
    while let Some(current) = stack.pop() {
        for (other_id, other) in plugins {
            if other.state == PluginState::Enabled
                && other.manifest.dependencies.iter().any(|dep| dep == &current)
                && !visited.contains(other_id)
            {
                visited.push(other_id.clone());
                stack.push(other_id.clone());
                order.push(other_id.clone());
            }
        }
    }
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::hook_handler;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    struct ScriptedInstance {
        calls: Arc<Mutex<Vec<String>>>,
        handlers: IndexMap<String, HookHandler>,
    }

    impl ScriptedInstance {
        fn new(calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                calls,
                handlers: IndexMap::new(),
            }
        }

        fn with_handler(mut self, export: &str, handler: HookHandler) -> Self {
            self.handlers.insert(export.to_owned(), handler);
            self
        }
    }

    #[async_trait]
    impl PluginInstance for ScriptedInstance {
        async fn on_enable(&self, _config: Option<&Value>) -> anyhow::Result<()> {
            self.calls.lock().push("enable".into());
            Ok(())
        }

        async fn on_disable(&self) -> anyhow::Result<()> {
            self.calls.lock().push("disable".into());
            Ok(())
        }

        async fn on_unload(&self) -> anyhow::Result<()> {
            self.calls.lock().push("unload".into());
            Ok(())
        }

        fn hook(&self, name: &str) -> Option<HookHandler> {
            self.handlers.get(name).cloned()
        }
    }

    fn write_manifest(dir: &Path, id: &str, body: &Value) {
        let plugin_dir = dir.join(id);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin.json"),
            serde_json::to_vec_pretty(body).unwrap(),
        )
        .unwrap();
    }

    fn manifest_body(id: &str) -> Value {
        json!({ "id": id, "name": id, "version": "1.0.0" })
    }

    #[tokio::test]
    async fn lifecycle_happy_path_emits_events() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let manager = PluginManager::new(dir.path(), bus.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut body = manifest_body("auditor");
        body["main"] = json!("entry.rs");
        body["hooks"] = json!({ "beforeCycle": "before" });
        write_manifest(dir.path(), "auditor", &body);
        manager.register_instance(
            "auditor",
            Arc::new(
                ScriptedInstance::new(Arc::clone(&calls))
                    .with_handler("before", hook_handler(|_ctx| async { Ok(None) })),
            ),
        );

        manager.load("auditor").await.unwrap();
        assert_eq!(manager.state("auditor"), Some(PluginState::Loaded));
        manager.enable("auditor").await.unwrap();
        assert_eq!(manager.state("auditor"), Some(PluginState::Enabled));
        manager.disable("auditor").await.unwrap();
        assert_eq!(manager.state("auditor"), Some(PluginState::Disabled));
        manager.unload("auditor").await.unwrap();
        assert!(manager.plugin("auditor").is_none());

        let names: Vec<String> = bus
            .history(Some("plugin:*"))
            .into_iter()
            .map(|event| event.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "plugin:load",
                "plugin:enable",
                "plugin:disable",
                "plugin:unload"
            ]
        );
        assert_eq!(*calls.lock(), vec!["enable", "disable", "unload"]);
    }

    #[tokio::test]
    async fn load_requires_dependencies_loaded() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        let mut body = manifest_body("dependent");
        body["dependencies"] = json!(["base"]);
        write_manifest(dir.path(), "dependent", &body);

        let err = manager.load("dependent").await.unwrap_err();
        assert!(matches!(err, PluginError::MissingDependency { .. }));
        assert_eq!(manager.state("dependent"), Some(PluginState::Error));
    }

    #[tokio::test]
    async fn load_all_orders_dependencies() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        let mut dependent = manifest_body("dependent");
        dependent["dependencies"] = json!(["base"]);
        write_manifest(dir.path(), "dependent", &dependent);
        write_manifest(dir.path(), "base", &manifest_body("base"));

        let loaded = manager.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(manager.state("base"), Some(PluginState::Loaded));
        assert_eq!(manager.state("dependent"), Some(PluginState::Loaded));
    }

    #[tokio::test]
    async fn enable_cascades_to_dependencies() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        write_manifest(dir.path(), "base", &manifest_body("base"));
        let mut dependent = manifest_body("dependent");
        dependent["dependencies"] = json!(["base"]);
        write_manifest(dir.path(), "dependent", &dependent);

        manager.load_all().await.unwrap();
        manager.enable("dependent").await.unwrap();
        assert_eq!(manager.state("base"), Some(PluginState::Enabled));
        assert_eq!(manager.state("dependent"), Some(PluginState::Enabled));
    }

    #[tokio::test]
    async fn disable_cascades_to_dependents() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        write_manifest(dir.path(), "base", &manifest_body("base"));
        let mut dependent = manifest_body("dependent");
        dependent["dependencies"] = json!(["base"]);
        write_manifest(dir.path(), "dependent", &dependent);

        manager.load_all().await.unwrap();
        manager.enable("dependent").await.unwrap();
        manager.disable("base").await.unwrap();
        assert_eq!(manager.state("dependent"), Some(PluginState::Disabled));
        assert_eq!(manager.state("base"), Some(PluginState::Disabled));
    }

    #[tokio::test]
    async fn unload_rejects_while_depended_upon() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        write_manifest(dir.path(), "base", &manifest_body("base"));
        let mut dependent = manifest_body("dependent");
        dependent["dependencies"] = json!(["base"]);
        write_manifest(dir.path(), "dependent", &dependent);
        manager.load_all().await.unwrap();

        let err = manager.unload("base").await.unwrap_err();
        assert!(matches!(err, PluginError::DependencyInUse { .. }));
        manager.unload("dependent").await.unwrap();
        manager.unload("base").await.unwrap();
    }

    #[tokio::test]
    async fn enable_detects_dependency_cycles() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        let first = PluginManifest {
            id: "first".into(),
            name: "first".into(),
            version: "1".into(),
            description: None,
            author: None,
            dependencies: vec!["second".into()],
            main: None,
            hooks: IndexMap::new(),
            hooks_priority: IndexMap::new(),
            config: None,
        };
        let mut second = first.clone();
        second.id = "second".into();
        second.dependencies = vec!["first".into()];
        for manifest in [first, second] {
            manager.insert_for_tests(Plugin {
                manifest,
                base_path: dir.path().to_path_buf(),
                state: PluginState::Loaded,
                loaded_at: Some(Utc::now()),
                last_error: None,
                instance: None,
            });
        }

        let err = manager.enable("first").await.unwrap_err();
        assert!(matches!(err, PluginError::DependencyCycle(_)));
    }

    #[tokio::test]
    async fn hooks_dispatch_by_priority_and_merge() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let manager = PluginManager::new(dir.path(), bus.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (id, priority, ret) in [
            ("high", 10, json!({ "a": 1 })),
            ("low", 0, json!({ "a": 2, "b": 3 })),
        ] {
            let mut body = manifest_body(id);
            body["main"] = json!("entry.rs");
            body["hooks"] = json!({ "beforeCycle": "before" });
            body["hooksPriority"] = json!({ "beforeCycle": priority });
            write_manifest(dir.path(), id, &body);
            let calls = Arc::clone(&calls);
            let label = id.to_owned();
            manager.register_instance(
                id,
                Arc::new(ScriptedInstance::new(Arc::new(Mutex::new(Vec::new()))).with_handler(
                    "before",
                    hook_handler(move |_ctx| {
                        let calls = Arc::clone(&calls);
                        let label = label.clone();
                        let ret = ret.clone();
                        async move {
                            calls.lock().push(label);
                            Ok(Some(ret))
                        }
                    }),
                )),
            );
        }

        manager.load_all().await.unwrap();
        manager.enable("high").await.unwrap();
        manager.enable("low").await.unwrap();

        let ctx = manager
            .execute_hooks(HookKind::BeforeCycle, HookContext::new())
            .await
            .unwrap();
        assert_eq!(*calls.lock(), vec!["high", "low"]);
        assert_eq!(ctx.value("a"), Some(&json!(2)));
        assert_eq!(ctx.value("b"), Some(&json!(3)));
        assert_eq!(bus.history(Some("plugin:hook:before:cycle")).len(), 1);
    }

    #[tokio::test]
    async fn hooks_skip_plugins_that_are_not_enabled() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        let mut body = manifest_body("sleeper");
        body["main"] = json!("entry.rs");
        body["hooks"] = json!({ "afterTask": "after" });
        write_manifest(dir.path(), "sleeper", &body);
        let hits = Arc::new(Mutex::new(0_u32));
        let probe = Arc::clone(&hits);
        manager.register_instance(
            "sleeper",
            Arc::new(
                ScriptedInstance::new(Arc::new(Mutex::new(Vec::new()))).with_handler(
                    "after",
                    hook_handler(move |_ctx| {
                        let probe = Arc::clone(&probe);
                        async move {
                            *probe.lock() += 1;
                            Ok(None)
                        }
                    }),
                ),
            ),
        );
        manager.load("sleeper").await.unwrap();

        manager
            .execute_hooks(HookKind::AfterTask, HookContext::new())
            .await
            .unwrap();
        assert_eq!(*hits.lock(), 0);
    }

    #[tokio::test]
    async fn hook_failure_is_isolated_unless_stop_on_error() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let manager = PluginManager::new(dir.path(), bus.clone());
        let mut body = manifest_body("flaky");
        body["main"] = json!("entry.rs");
        body["hooks"] = json!({ "onError": "boom" });
        write_manifest(dir.path(), "flaky", &body);
        manager.register_instance(
            "flaky",
            Arc::new(
                ScriptedInstance::new(Arc::new(Mutex::new(Vec::new()))).with_handler(
                    "boom",
                    hook_handler(|_ctx| async { Err(anyhow::anyhow!("hook exploded")) }),
                ),
            ),
        );
        manager.load("flaky").await.unwrap();
        manager.enable("flaky").await.unwrap();

        let ctx = manager
            .execute_hooks(HookKind::OnError, HookContext::new())
            .await
            .unwrap();
        assert!(!ctx.cancelled);
        assert_eq!(bus.history(Some("plugin:error")).len(), 1);

        let mut strict = HookContext::new();
        strict.stop_on_error = true;
        let err = manager
            .execute_hooks(HookKind::OnError, strict)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Hook { .. }));
    }

    #[tokio::test]
    async fn unknown_export_fails_at_load_time() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        let mut body = manifest_body("mismatch");
        body["main"] = json!("entry.rs");
        body["hooks"] = json!({ "beforeTask": "does_not_exist" });
        write_manifest(dir.path(), "mismatch", &body);
        manager.register_instance(
            "mismatch",
            Arc::new(ScriptedInstance::new(Arc::new(Mutex::new(Vec::new())))),
        );

        let err = manager.load("mismatch").await.unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
        assert_eq!(manager.state("mismatch"), Some(PluginState::Error));
    }

    #[test]
    fn discover_skips_invalid_manifests() {
        let dir = tempdir().unwrap();
        let manager = PluginManager::new(dir.path(), EventBus::new());
        write_manifest(dir.path(), "good", &manifest_body("good"));
        write_manifest(dir.path(), "bad", &json!({ "id": "bad!", "name": "x", "version": "1" }));
        std::fs::create_dir_all(dir.path().join("renamed")).unwrap();
        std::fs::write(
            dir.path().join("renamed/plugin.json"),
            serde_json::to_vec(&manifest_body("other")).unwrap(),
        )
        .unwrap();

        let manifests = manager.discover().unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].id, "good");
    }
}

use std::{fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hooks::HookKind;

/// Maximum accepted length of a plugin identifier.
pub const MAX_PLUGIN_ID_LEN: usize = 100;

/// Errors surfaced by the plugin subsystem.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Manifest or lifecycle input failed validation.
    #[error("invalid plugin manifest: {0}")]
    Validation(String),
    /// The requested plugin is not in the registry.
    #[error("plugin not found: {0}")]
    NotFound(String),
    /// A declared dependency is not loaded.
    #[error("plugin `{plugin}` requires `{dependency}` to be loaded")]
    MissingDependency {
        /// Plugin being loaded.
        plugin: String,
        /// Dependency that is absent.
        dependency: String,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected at `{0}`")]
    DependencyCycle(String),
    /// Another registered plugin still depends on this one.
    #[error("plugin `{plugin}` is still required by `{dependent}`")]
    DependencyInUse {
        /// Plugin being unloaded.
        plugin: String,
        /// Plugin that still lists it as a dependency.
        dependent: String,
    },
    /// The plugin module could not be resolved or bound.
    #[error("failed to load plugin `{plugin}`: {reason}")]
    Load {
        /// Plugin being loaded.
        plugin: String,
        /// Captured reason.
        reason: String,
    },
    /// A hook handler failed and the context demanded propagation.
    #[error("hook `{hook}` of plugin `{plugin}` failed: {message}")]
    Hook {
        /// Owning plugin.
        plugin: String,
        /// Hook name.
        hook: String,
        /// Rendered handler error.
        message: String,
    },
    /// Filesystem failure while reading plugin material.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Manifest is not valid JSON.
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Declarative plugin description read from `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Identifier; must match `[A-Za-z0-9_-]+` and be at most 100 chars.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Optional short description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Ids of plugins that must be loaded first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Relative path of the plugin entry module, when it ships code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Hook name to exported-handler-name bindings.
    #[serde(default)]
    pub hooks: IndexMap<String, String>,
    /// Dispatch priority per hook name; higher runs first, default 0.
    #[serde(default)]
    pub hooks_priority: IndexMap<String, i32>,
    /// Opaque configuration forwarded to `on_enable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl PluginManifest {
    /// Reads and validates a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let raw = fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Applies the manifest validation rules.
    pub fn validate(&self) -> Result<(), PluginError> {
        if !is_valid_plugin_id(&self.id) {
            return Err(PluginError::Validation(format!(
                "id `{}` must match [A-Za-z0-9_-]+ and be at most {MAX_PLUGIN_ID_LEN} chars",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PluginError::Validation("name must not be empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::Validation("version must not be empty".into()));
        }
        if let Some(main) = &self.main {
            if !is_safe_relative_path(main) {
                return Err(PluginError::Validation(format!(
                    "main `{main}` is not a safe relative path"
                )));
            }
        }
        for hook_name in self.hooks.keys() {
            if HookKind::parse(hook_name).is_none() {
                return Err(PluginError::Validation(format!(
                    "unknown hook `{hook_name}`"
                )));
            }
        }
        Ok(())
    }

    /// Dispatch priority declared for a hook, defaulting to 0.
    #[must_use]
    pub fn priority_of(&self, hook_name: &str) -> i32 {
        self.hooks_priority.get(hook_name).copied().unwrap_or(0)
    }
}

/// Returns true for a syntactically valid plugin identifier:
/// `[A-Za-z0-9_-]+`, at most [`MAX_PLUGIN_ID_LEN`] characters.
#[must_use]
pub fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PLUGIN_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Safe relative path rule for manifest `main` entries.
///
/// Rejects absolute paths, `..` segments, NUL bytes, and any character
/// outside `[A-Za-z0-9_\-./]`.
#[must_use]
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\0') {
        return false;
    }
    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        return false;
    }
    path.split('/').all(|segment| segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal(id: &str) -> PluginManifest {
        PluginManifest {
            id: id.into(),
            name: "Test Plugin".into(),
            version: "1.0.0".into(),
            description: None,
            author: None,
            dependencies: Vec::new(),
            main: None,
            hooks: IndexMap::new(),
            hooks_priority: IndexMap::new(),
            config: None,
        }
    }

    #[test]
    fn single_character_id_is_valid() {
        assert!(minimal("a").validate().is_ok());
    }

    #[test]
    fn oversized_id_is_rejected() {
        let id = "x".repeat(MAX_PLUGIN_ID_LEN + 1);
        assert!(matches!(
            minimal(&id).validate(),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn id_with_shell_characters_is_rejected() {
        assert!(!is_valid_plugin_id("rm -rf"));
        assert!(!is_valid_plugin_id("a;b"));
        assert!(is_valid_plugin_id("audit_helper-2"));
    }

    #[test]
    fn safe_path_rules() {
        assert!(is_safe_relative_path("a/b.json"));
        assert!(is_safe_relative_path("lib/entry.rs"));
        assert!(!is_safe_relative_path("../a"));
        assert!(!is_safe_relative_path("/a/b"));
        assert!(!is_safe_relative_path("a\0b"));
        assert!(!is_safe_relative_path("a|b"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn unknown_hook_name_is_rejected() {
        let mut manifest = minimal("p");
        manifest.hooks.insert("onTeardown".into(), "teardown".into());
        assert!(matches!(
            manifest.validate(),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn manifest_round_trips_camel_case() {
        let raw = json!({
            "id": "auditor",
            "name": "Auditor",
            "version": "0.2.0",
            "dependencies": ["base"],
            "main": "entry.rs",
            "hooks": { "beforeCycle": "on_before_cycle" },
            "hooksPriority": { "beforeCycle": 10 }
        });
        let manifest: PluginManifest = serde_json::from_value(raw).unwrap();
        assert_eq!(manifest.dependencies, vec!["base".to_owned()]);
        assert_eq!(manifest.priority_of("beforeCycle"), 10);
        assert_eq!(manifest.priority_of("afterCycle"), 0);
        manifest.validate().unwrap();
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PluginManifest::load(&path),
            Err(PluginError::Parse(_))
        ));
    }
}

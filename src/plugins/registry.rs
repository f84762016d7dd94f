//! Plugin registry
//!
//! The single store of loaded plugins. Owns enabled/disabled state, the
//! dependency graph (derived from descriptors) and per-plugin configuration.
//! All state sits behind one async `RwLock`; lifecycle hooks are always
//! invoked after the lock has been released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{Mutex, RwLock};

use crate::core::error::{PluginError, PluginResult};
use crate::plugins::capability::Permissions;
use crate::plugins::descriptor::{PluginDescriptor, validate_name};
use crate::plugins::events::{self, EventSender, PluginEvent};
use crate::plugins::instance::PluginInstance;

pub type ConfigMap = Map<String, JsonValue>;

/// A registered plugin
pub struct RegistryEntry {
    pub descriptor: PluginDescriptor,
    pub instance: Arc<PluginInstance>,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("enabled", &self.enabled)
            .field("sandboxed", &self.instance.is_sandboxed())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Read-only view of a registry entry
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub dependencies: Vec<String>,
    pub permissions: Permissions,
    pub path: PathBuf,
    pub enabled: bool,
    pub sandboxed: bool,
    pub loaded_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl From<&RegistryEntry> for PluginInfo {
    fn from(entry: &RegistryEntry) -> Self {
        let d = &entry.descriptor;
        Self {
            name: d.name.clone(),
            version: d.version.clone(),
            description: d.description.clone(),
            author: d.author.clone(),
            dependencies: d.dependencies.clone(),
            permissions: d.permissions.clone(),
            path: d.path.clone(),
            enabled: entry.enabled,
            sandboxed: entry.instance.is_sandboxed(),
            loaded_at: d.loaded_at,
            registered_at: entry.registered_at,
        }
    }
}

/// Outcome of a dependency check for one plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub satisfied: bool,
    /// Dependencies not registered at all
    pub missing: Vec<String>,
    /// Dependencies registered but disabled
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedPlugin {
    pub name: String,
    pub enabled: bool,
    pub path: PathBuf,
    pub descriptor: PluginDescriptor,
}

/// Serializable registry state, see [`PluginRegistry::export`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub plugins: Vec<ExportedPlugin>,
    #[serde(default)]
    pub configs: BTreeMap<String, ConfigMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub configs: usize,
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    /// Snapshot plugins that are not currently registered
    pub skipped: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    /// Registration order
    order: Vec<String>,
    /// Stored overrides; defaults live on the instances
    configs: BTreeMap<String, ConfigMap>,
}

impl RegistryState {
    fn entry(&self, name: &str) -> PluginResult<&RegistryEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))
    }

    fn dependents_of(&self, name: &str, enabled_only: bool) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|other| self.entries.get(other))
            .filter(|entry| entry.descriptor.name != name)
            .filter(|entry| !enabled_only || entry.enabled)
            .filter(|entry| entry.descriptor.dependencies.iter().any(|d| d == name))
            .map(|entry| entry.descriptor.name.clone())
            .collect()
    }

    fn dependency_report(&self, name: &str) -> PluginResult<DependencyReport> {
        let entry = self.entry(name)?;
        let mut report = DependencyReport::default();
        for dep in &entry.descriptor.dependencies {
            match self.entries.get(dep) {
                None => report.missing.push(dep.clone()),
                Some(dep_entry) if !dep_entry.enabled => report.disabled.push(dep.clone()),
                Some(_) => {}
            }
        }
        report.satisfied = report.missing.is_empty() && report.disabled.is_empty();
        Ok(report)
    }

    fn remove(&mut self, name: &str) -> Option<RegistryEntry> {
        self.order.retain(|n| n != name);
        self.entries.remove(name)
    }

    fn effective_config(&self, name: &str) -> ConfigMap {
        let mut config = self
            .entries
            .get(name)
            .map(|entry| entry.instance.default_config().clone())
            .unwrap_or_default();
        if let Some(stored) = self.configs.get(name) {
            for (key, value) in stored {
                config.insert(key.clone(), value.clone());
            }
        }
        config
    }

    /// Depth-first topological sort in registration order
    ///
    /// Dependencies that are not registered are skipped; a back-edge is an error.
    fn resolve_order(&self) -> PluginResult<Vec<String>> {
        self.resolve_order_with(None)
    }

    /// Dependency order with `candidate` standing in for the entry of the same name
    fn resolve_order_with(&self, candidate: Option<&PluginDescriptor>) -> PluginResult<Vec<String>> {
        let mut order = Vec::with_capacity(self.order.len() + 1);
        let mut done = HashSet::new();
        let mut stack = Vec::new();
        let names = self
            .order
            .iter()
            .map(String::as_str)
            .chain(candidate.map(|d| d.name.as_str()));
        for name in names {
            self.visit(name, candidate, &mut stack, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn dependencies_of<'a>(
        &'a self,
        name: &str,
        candidate: Option<&'a PluginDescriptor>,
    ) -> Option<&'a [String]> {
        match candidate {
            Some(d) if d.name == name => Some(&d.dependencies),
            _ => self.entries.get(name).map(|e| e.descriptor.dependencies.as_slice()),
        }
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        candidate: Option<&'a PluginDescriptor>,
        stack: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) -> PluginResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| *n == name) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(name.to_string());
            return Err(PluginError::CyclicDependency(cycle));
        }
        let Some(dependencies) = self.dependencies_of(name, candidate) else {
            return Ok(());
        };

        stack.push(name);
        for dep in dependencies {
            self.visit(dep, candidate, stack, done, order)?;
        }
        stack.pop();

        done.insert(name);
        order.push(name.to_string());
        Ok(())
    }
}

pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    config_file: Option<PathBuf>,
    /// Held from snapshot to rename so writes land in mutation order
    persist_lock: Mutex<()>,
    events: EventSender,
}

impl PluginRegistry {
    /// In-memory registry; configuration is not persisted
    pub fn new(events: EventSender) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config_file: None,
            persist_lock: Mutex::new(()),
            events,
        }
    }

    /// Registry backed by a persisted configuration document
    ///
    /// A missing document starts empty. An unreadable one is logged and
    /// replaced on the next write.
    pub fn open(config_file: impl Into<PathBuf>, events: EventSender) -> PluginResult<Self> {
        let config_file = config_file.into();
        let configs = read_config_file(&config_file)?;

        if !configs.is_empty() {
            crate::log_info!(
                "Loaded stored configuration for {} plugin(s) from {}",
                configs.len(),
                config_file.display()
            );
        }

        Ok(Self {
            state: RwLock::new(RegistryState {
                configs,
                ..RegistryState::default()
            }),
            config_file: Some(config_file),
            persist_lock: Mutex::new(()),
            events,
        })
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Register a plugin, initially disabled
    ///
    /// # Errors
    /// Returns an error if a plugin with the same name is already registered
    pub async fn register(
        &self,
        descriptor: PluginDescriptor,
        instance: Arc<PluginInstance>,
    ) -> PluginResult<()> {
        let mut state = self.state.write().await;
        let name = descriptor.name.clone();

        if state.entries.contains_key(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }

        crate::log_info!("Registered plugin '{}' v{}", name, descriptor.version);
        state.order.push(name.clone());
        state.entries.insert(
            name,
            RegistryEntry {
                descriptor,
                instance,
                enabled: false,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a plugin
    ///
    /// Fails while any other registered plugin, enabled or not, depends on it.
    pub async fn unregister(&self, name: &str) -> PluginResult<RegistryEntry> {
        let mut state = self.state.write().await;
        state.entry(name)?;

        let dependents = state.dependents_of(name, false);
        if !dependents.is_empty() {
            return Err(PluginError::HasDependents {
                plugin: name.to_string(),
                dependents,
            });
        }

        let entry = state
            .remove(name)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
        crate::log_info!("Unregistered plugin '{}'", name);
        Ok(entry)
    }

    /// Remove a plugin without the dependents check, used when a plugin is
    /// replaced under the same name
    pub(crate) async fn remove_for_replace(&self, name: &str) -> Option<RegistryEntry> {
        self.state.write().await.remove(name)
    }

    /// Enable a plugin; `Ok(false)` if it already was
    pub async fn enable(&self, name: &str) -> PluginResult<bool> {
        let instance = {
            let mut state = self.state.write().await;
            if state.entry(name)?.enabled {
                return Ok(false);
            }

            let report = state.dependency_report(name)?;
            if !report.satisfied {
                return Err(PluginError::UnmetDependencies {
                    plugin: name.to_string(),
                    missing: report.missing,
                    disabled: report.disabled,
                });
            }

            let entry = state
                .entries
                .get_mut(name)
                .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
            entry.enabled = true;
            Arc::clone(&entry.instance)
        };

        if let Err(e) = instance.on_enable().await {
            self.hook_failed(name, "onEnable", &e);
        }
        self.persist_quietly().await;

        crate::log_info!("Enabled plugin '{}'", name);
        events::emit(&self.events, PluginEvent::PluginEnabled { name: name.to_string() });
        Ok(true)
    }

    /// Disable a plugin; `Ok(false)` if it already was
    ///
    /// Fails while an enabled plugin depends on it.
    pub async fn disable(&self, name: &str) -> PluginResult<bool> {
        let instance = {
            let mut state = self.state.write().await;
            if !state.entry(name)?.enabled {
                return Ok(false);
            }

            let dependents = state.dependents_of(name, true);
            if !dependents.is_empty() {
                return Err(PluginError::HasDependents {
                    plugin: name.to_string(),
                    dependents,
                });
            }

            let entry = state
                .entries
                .get_mut(name)
                .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
            entry.enabled = false;
            Arc::clone(&entry.instance)
        };

        if let Err(e) = instance.on_disable().await {
            self.hook_failed(name, "onDisable", &e);
        }
        self.persist_quietly().await;

        crate::log_info!("Disabled plugin '{}'", name);
        events::emit(&self.events, PluginEvent::PluginDisabled { name: name.to_string() });
        Ok(true)
    }

    /// Replace the stored configuration; returns the effective config
    pub async fn set_config(&self, name: &str, config: ConfigMap) -> PluginResult<ConfigMap> {
        validate_name(name)?;
        self.state
            .write()
            .await
            .configs
            .insert(name.to_string(), config);
        self.config_changed(name).await
    }

    /// Shallow-merge `partial` into the stored configuration
    pub async fn update_config(&self, name: &str, partial: ConfigMap) -> PluginResult<ConfigMap> {
        validate_name(name)?;
        {
            let mut state = self.state.write().await;
            let stored = state.configs.entry(name.to_string()).or_default();
            for (key, value) in partial {
                stored.insert(key, value);
            }
        }
        self.config_changed(name).await
    }

    /// Drop the stored configuration; `Ok(false)` if there was none
    pub async fn delete_config(&self, name: &str) -> PluginResult<bool> {
        let removed = self.state.write().await.configs.remove(name).is_some();
        if removed {
            self.config_changed(name).await?;
        }
        Ok(removed)
    }

    /// `defaultConfig` with the stored override merged on top
    pub async fn get_config(&self, name: &str) -> ConfigMap {
        self.state.read().await.effective_config(name)
    }

    /// The stored override alone
    pub async fn stored_config(&self, name: &str) -> Option<ConfigMap> {
        self.state.read().await.configs.get(name).cloned()
    }

    async fn config_changed(&self, name: &str) -> PluginResult<ConfigMap> {
        self.persist().await?;

        let (config, instance) = {
            let state = self.state.read().await;
            let instance = state.entries.get(name).map(|e| Arc::clone(&e.instance));
            (state.effective_config(name), instance)
        };

        if let Some(instance) = instance {
            if let Err(e) = instance.on_config_change(&config).await {
                self.hook_failed(name, "onConfigChange", &e);
            }
        }

        crate::log_debug!("Configuration of '{}' changed", name);
        events::emit(
            &self.events,
            PluginEvent::PluginConfigChanged {
                name: name.to_string(),
                config: JsonValue::Object(config.clone()),
            },
        );
        Ok(config)
    }

    fn hook_failed(&self, name: &str, hook: &str, error: &PluginError) {
        crate::log_warn!("Plugin '{}' {} hook failed: {}", name, hook, error);
        events::emit(
            &self.events,
            PluginEvent::PluginError {
                name: name.to_string(),
                error: format!("{} hook failed: {}", hook, error),
            },
        );
    }

    /// Rewrite the persisted configuration document in full
    ///
    /// The document is written beside the target and renamed over it, so a
    /// reader never sees a partial write.
    pub async fn persist(&self) -> PluginResult<()> {
        let Some(path) = &self.config_file else {
            return Ok(());
        };
        let _writing = self.persist_lock.lock().await;
        let document = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&state.configs)?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let staging = staging_path(path);
        tokio::fs::write(&staging, document).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    async fn persist_quietly(&self) {
        if let Err(e) = self.persist().await {
            crate::log_warn!("Failed to persist plugin configuration: {}", e);
        }
    }

    /// All plugin names such that every dependency precedes its dependents
    pub async fn resolve_dependency_order(&self) -> PluginResult<Vec<String>> {
        self.state.read().await.resolve_order()
    }

    /// Fail with `CyclicDependency` if registering `descriptor` (in place of
    /// any entry with the same name) would close a dependency cycle
    pub async fn check_acyclic(&self, descriptor: &PluginDescriptor) -> PluginResult<()> {
        self.state
            .read()
            .await
            .resolve_order_with(Some(descriptor))
            .map(|_| ())
    }

    pub async fn check_dependencies(&self, name: &str) -> PluginResult<DependencyReport> {
        self.state.read().await.dependency_report(name)
    }

    /// Every registered plugin that declares `name` as a dependency
    pub async fn find_dependents(&self, name: &str) -> Vec<String> {
        self.state.read().await.dependents_of(name, false)
    }

    pub async fn find_enabled_dependents(&self, name: &str) -> Vec<String> {
        self.state.read().await.dependents_of(name, true)
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.state.read().await.entries.contains_key(name)
    }

    pub async fn is_enabled(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .is_some_and(|e| e.enabled)
    }

    pub async fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .map(|e| Arc::clone(&e.instance))
    }

    pub async fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .map(|e| e.descriptor.clone())
    }

    pub async fn info(&self, name: &str) -> Option<PluginInfo> {
        self.state.read().await.entries.get(name).map(PluginInfo::from)
    }

    /// All plugins in registration order
    pub async fn list(&self) -> Vec<PluginInfo> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.entries.get(name))
            .map(PluginInfo::from)
            .collect()
    }

    /// Plugin names in registration order
    pub async fn names(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn export(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        let plugins = state
            .order
            .iter()
            .filter_map(|name| state.entries.get(name))
            .map(|entry| ExportedPlugin {
                name: entry.descriptor.name.clone(),
                enabled: entry.enabled,
                path: entry.descriptor.path.clone(),
                descriptor: entry.descriptor.clone(),
            })
            .collect();

        RegistrySnapshot {
            plugins,
            configs: state.configs.clone(),
            exported_at: Some(Utc::now()),
        }
    }

    /// Replay a snapshot through the normal operations
    ///
    /// Configs are applied first, then enables in dependency order, then
    /// disables in reverse order. Dependency preconditions still apply; a
    /// failing plugin is recorded and the import continues.
    pub async fn import(&self, snapshot: RegistrySnapshot) -> PluginResult<ImportReport> {
        let mut report = ImportReport::default();

        for (name, config) in snapshot.configs {
            match self.set_config(&name, config).await {
                Ok(_) => report.configs += 1,
                Err(e) => report.failed.push(ImportFailure {
                    name,
                    error: e.to_string(),
                }),
            }
        }

        let mut wanted = HashMap::new();
        for plugin in &snapshot.plugins {
            if self.is_registered(&plugin.name).await {
                wanted.insert(plugin.name.clone(), plugin.enabled);
            } else {
                report.skipped.push(plugin.name.clone());
            }
        }

        let order = self.resolve_dependency_order().await?;

        for name in &order {
            if wanted.get(name) != Some(&true) {
                continue;
            }
            match self.enable(name).await {
                Ok(true) => report.enabled.push(name.clone()),
                Ok(false) => {}
                Err(e) => report.failed.push(ImportFailure {
                    name: name.clone(),
                    error: e.to_string(),
                }),
            }
        }

        for name in order.iter().rev() {
            if wanted.get(name) != Some(&false) {
                continue;
            }
            match self.disable(name).await {
                Ok(true) => report.disabled.push(name.clone()),
                Ok(false) => {}
                Err(e) => report.failed.push(ImportFailure {
                    name: name.clone(),
                    error: e.to_string(),
                }),
            }
        }

        crate::log_info!(
            "Imported registry state: {} config(s), {} enabled, {} disabled, {} failed",
            report.configs,
            report.enabled.len(),
            report.disabled.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Drop every entry, most recently registered first
    ///
    /// Stored configuration is kept. The caller owns releasing the instances.
    pub async fn clear(&self) -> Vec<RegistryEntry> {
        let mut state = self.state.write().await;
        let names: Vec<String> = state.order.drain(..).rev().collect();
        names
            .iter()
            .filter_map(|name| state.entries.remove(name))
            .collect()
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_config_file(path: &Path) -> PluginResult<BTreeMap<String, ConfigMap>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&content) {
        Ok(configs) => Ok(configs),
        Err(e) => {
            crate::log_warn!(
                "Ignoring unreadable plugin configuration {}: {}",
                path.display(),
                e
            );
            Ok(BTreeMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{Lua, Table};
    use serde_json::json;
    use tempfile::TempDir;

    fn plugin(code: &str) -> (PluginDescriptor, Arc<PluginInstance>) {
        let lua = Lua::new();
        let exports: Table = lua.load(code).eval().unwrap();
        let descriptor = PluginDescriptor::from_exports(&exports, Path::new("test.lua")).unwrap();
        let instance = PluginInstance::direct(lua, exports).unwrap();
        (descriptor, Arc::new(instance))
    }

    fn module(name: &str, deps: &[&str]) -> String {
        let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
        format!(
            r#"return {{ name = "{}", version = "1.0.0", dependencies = {{ {} }} }}"#,
            name,
            deps.join(", ")
        )
    }

    async fn register(registry: &PluginRegistry, name: &str, deps: &[&str]) {
        let (descriptor, instance) = plugin(&module(name, deps));
        registry.register(descriptor, instance).await.unwrap();
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new(events::channel())
    }

    fn config(value: JsonValue) -> ConfigMap {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = registry();
        register(&registry, "a", &[]).await;
        let (descriptor, instance) = plugin(&module("a", &[]));
        let err = registry.register(descriptor, instance).await.unwrap_err();
        assert!(matches!(err, PluginError::AlreadyLoaded(ref n) if n == "a"));
    }

    #[tokio::test]
    async fn test_enable_requires_enabled_dependencies() {
        let registry = registry();
        register(&registry, "d", &[]).await;
        register(&registry, "p", &["d"]).await;

        let err = registry.enable("p").await.unwrap_err();
        match err {
            PluginError::UnmetDependencies { disabled, missing, .. } => {
                assert_eq!(disabled, vec!["d".to_string()]);
                assert!(missing.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(registry.enable("d").await.unwrap());
        assert!(registry.enable("p").await.unwrap());
        assert!(registry.is_enabled("p").await);
        // Idempotent
        assert!(!registry.enable("p").await.unwrap());
    }

    #[tokio::test]
    async fn test_enable_reports_missing_dependency() {
        let registry = registry();
        register(&registry, "p", &["absent"]).await;

        let report = registry.check_dependencies("p").await.unwrap();
        assert!(!report.satisfied);
        assert_eq!(report.missing, vec!["absent".to_string()]);
        assert!(registry.enable("p").await.is_err());
    }

    #[tokio::test]
    async fn test_disable_blocked_by_enabled_dependent() {
        let registry = registry();
        register(&registry, "d", &[]).await;
        register(&registry, "p", &["d"]).await;
        registry.enable("d").await.unwrap();
        registry.enable("p").await.unwrap();

        assert_eq!(registry.find_enabled_dependents("d").await, vec!["p"]);
        let err = registry.disable("d").await.unwrap_err();
        assert!(matches!(err, PluginError::HasDependents { ref dependents, .. } if dependents == &["p"]));

        assert!(registry.disable("p").await.unwrap());
        assert!(registry.disable("d").await.unwrap());
        assert!(!registry.disable("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_unregister_blocked_by_any_dependent() {
        let registry = registry();
        register(&registry, "d", &[]).await;
        register(&registry, "p", &["d"]).await;

        // p is disabled, yet removal of d is still refused
        assert!(!registry.is_enabled("p").await);
        assert!(registry.find_enabled_dependents("d").await.is_empty());
        let err = registry.unregister("d").await.unwrap_err();
        assert!(matches!(err, PluginError::HasDependents { .. }));

        let removed = registry.unregister("p").await.unwrap();
        let shown = format!("{:?}", removed);
        assert!(shown.contains("name: \"p\""));
        assert!(shown.contains("enabled: false"));
        registry.unregister("d").await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_resolve_order_puts_dependencies_first() {
        let registry = registry();
        register(&registry, "app", &["db", "log"]).await;
        register(&registry, "db", &["log"]).await;
        register(&registry, "log", &[]).await;

        let order = registry.resolve_dependency_order().await.unwrap();
        assert_eq!(order, vec!["log", "db", "app"]);
    }

    #[tokio::test]
    async fn test_cycle_is_an_error() {
        let registry = registry();
        register(&registry, "a", &["b"]).await;
        register(&registry, "b", &["a"]).await;

        let err = registry.resolve_dependency_order().await.unwrap_err();
        match err {
            PluginError::CyclicDependency(cycle) => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_replacement_closing_a_cycle_is_detected() {
        let registry = registry();
        register(&registry, "a", &[]).await;
        register(&registry, "b", &["a"]).await;

        let (harmless, _) = plugin(&module("a", &[]));
        registry.check_acyclic(&harmless).await.unwrap();

        let (looping, _) = plugin(&module("a", &["b"]));
        match registry.check_acyclic(&looping).await {
            Err(PluginError::CyclicDependency(cycle)) => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("expected a cycle, got {:?}", other),
        }
        // Nothing was registered by the check
        assert_eq!(registry.resolve_dependency_order().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_config_merges_over_defaults() {
        let registry = registry();
        let (descriptor, instance) = plugin(
            r#"return { name = "c", version = "1.0.0", defaultConfig = { a = 0, mode = "slow" } }"#,
        );
        registry.register(descriptor, instance).await.unwrap();

        registry.set_config("c", config(json!({ "a": 1 }))).await.unwrap();
        assert_eq!(
            JsonValue::Object(registry.get_config("c").await),
            json!({ "a": 1, "mode": "slow" })
        );

        registry.update_config("c", config(json!({ "b": 2 }))).await.unwrap();
        assert_eq!(
            JsonValue::Object(registry.get_config("c").await),
            json!({ "a": 1, "b": 2, "mode": "slow" })
        );

        assert!(registry.delete_config("c").await.unwrap());
        assert_eq!(
            JsonValue::Object(registry.get_config("c").await),
            json!({ "a": 0, "mode": "slow" })
        );
        assert!(!registry.delete_config("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_config_change_hook_sees_effective_config() {
        let registry = registry();
        let (descriptor, instance) = plugin(
            r#"
seen = nil
return {
    name = "h", version = "1.0.0",
    defaultConfig = { level = "info" },
    onConfigChange = function(cfg) seen = cfg.level .. "/" .. tostring(cfg.extra) end,
}"#,
        );
        registry.register(descriptor, Arc::clone(&instance)).await.unwrap();
        registry.set_config("h", config(json!({ "extra": 5 }))).await.unwrap();

        let seen: String = instance.lua().globals().get("seen").unwrap();
        assert_eq!(seen, "info/5");
    }

    #[tokio::test]
    async fn test_config_document_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("plugin-config.json");

        let registry = PluginRegistry::open(&path, events::channel()).unwrap();
        registry.set_config("one", config(json!({ "x": 1 }))).await.unwrap();
        registry.set_config("two", config(json!({ "y": 2 }))).await.unwrap();
        registry.delete_config("one").await.unwrap();

        let stored: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored, json!({ "two": { "y": 2 } }));

        let reopened = PluginRegistry::open(&path, events::channel()).unwrap();
        assert_eq!(
            reopened.stored_config("two").await.map(JsonValue::Object),
            Some(json!({ "y": 2 }))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_leave_latest_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugin-config.json");
        let registry = Arc::new(PluginRegistry::open(&path, events::channel()).unwrap());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let name = format!("p{}", i % 4);
                registry.set_config(&name, config(json!({ "n": i }))).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let in_memory = serde_json::to_value(registry.export().await.configs).unwrap();
        let on_disk: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, in_memory);
        assert!(!staging_path(&path).exists());
    }

    #[tokio::test]
    async fn test_hooks_and_events_on_enable_disable() {
        let sender = events::channel();
        let mut rx = sender.subscribe();
        let registry = PluginRegistry::new(sender);
        let (descriptor, instance) = plugin(
            r#"
state = "new"
return {
    name = "e", version = "1.0.0",
    onEnable = function() state = "on" end,
    onDisable = function() error("disable hook exploded") end,
}"#,
        );
        registry.register(descriptor, Arc::clone(&instance)).await.unwrap();

        registry.enable("e").await.unwrap();
        let state: String = instance.lua().globals().get("state").unwrap();
        assert_eq!(state, "on");
        assert_eq!(rx.recv().await.unwrap().kind(), "plugin-enabled");

        // A failing onDisable is swallowed
        assert!(registry.disable("e").await.unwrap());
        assert!(!registry.is_enabled("e").await);
        assert_eq!(rx.recv().await.unwrap().kind(), "plugin-error");
        assert_eq!(rx.recv().await.unwrap().kind(), "plugin-disabled");
    }

    #[tokio::test]
    async fn test_export_import_replays_state() {
        let source = registry();
        register(&source, "base", &[]).await;
        register(&source, "top", &["base"]).await;
        source.enable("base").await.unwrap();
        source.enable("top").await.unwrap();
        source.set_config("top", config(json!({ "k": "v" }))).await.unwrap();

        let snapshot = source.export().await;
        assert_eq!(snapshot.plugins.len(), 2);
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: RegistrySnapshot = serde_json::from_str(&encoded).unwrap();

        let target = registry();
        register(&target, "top", &["base"]).await;
        register(&target, "base", &[]).await;

        let report = target.import(decoded).await.unwrap();
        assert_eq!(report.configs, 1);
        assert_eq!(report.enabled, vec!["base", "top"]);
        assert!(report.failed.is_empty());
        assert!(target.is_enabled("top").await);
        assert_eq!(target.get_config("top").await.get("k"), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_import_enforces_dependencies() {
        let target = registry();
        register(&target, "base", &[]).await;
        register(&target, "top", &["base"]).await;

        let snapshot = RegistrySnapshot {
            plugins: vec![
                ExportedPlugin {
                    name: "base".into(),
                    enabled: false,
                    path: "base.lua".into(),
                    descriptor: target.descriptor("base").await.unwrap(),
                },
                ExportedPlugin {
                    name: "top".into(),
                    enabled: true,
                    path: "top.lua".into(),
                    descriptor: target.descriptor("top").await.unwrap(),
                },
                ExportedPlugin {
                    name: "ghost".into(),
                    enabled: true,
                    path: "ghost.lua".into(),
                    descriptor: target.descriptor("base").await.unwrap(),
                },
            ],
            ..RegistrySnapshot::default()
        };

        let report = target.import(snapshot).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "top");
        assert_eq!(report.skipped, vec!["ghost"]);
        assert!(!target.is_enabled("top").await);
    }

    #[tokio::test]
    async fn test_clear_drains_in_reverse_registration_order() {
        let registry = registry();
        register(&registry, "first", &[]).await;
        register(&registry, "second", &["first"]).await;
        registry.set_config("first", config(json!({ "keep": true }))).await.unwrap();

        let drained: Vec<String> = registry
            .clear()
            .await
            .into_iter()
            .map(|e| e.descriptor.name)
            .collect();
        assert_eq!(drained, vec!["second", "first"]);
        assert!(registry.is_empty().await);
        assert!(registry.stored_config("first").await.is_some());
    }
}

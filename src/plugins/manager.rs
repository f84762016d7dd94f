//! Plugin manager
//!
//! The single entry point for the host. Wires the sandbox, loader, registry
//! and capability bus together and sequences cross-cutting operations:
//! capability contexts follow a plugin's load and unload, shutdown unloads
//! in reverse load order.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use crate::config::RuntimeConfig;
use crate::core::error::{PluginError, PluginResult};
use crate::core::logger::{log_task_complete_with_details, log_task_start};
use crate::plugins::capability::CapabilityBus;
use crate::plugins::events::{self, EventSender, PluginEvent};
use crate::plugins::loader::{
    DirectoryLoadReport, FailedLoad, LoadOptions, LoadedPlugin, PluginLoader, TrustMode,
};
use crate::plugins::registry::{
    ConfigMap, ImportReport, PluginInfo, PluginRegistry, RegistrySnapshot,
};
use crate::plugins::sandbox::{Sandbox, SandboxStats};

pub struct PluginManager {
    config: RuntimeConfig,
    sandbox: Option<Arc<Sandbox>>,
    registry: Arc<PluginRegistry>,
    loader: PluginLoader,
    bus: Arc<dyn CapabilityBus>,
    events: EventSender,
    initialized: AtomicBool,
}

impl PluginManager {
    pub fn new(config: RuntimeConfig, bus: Arc<dyn CapabilityBus>) -> PluginResult<Self> {
        let events = events::channel();
        let registry = Arc::new(PluginRegistry::open(&config.config_file, events.clone())?);

        let sandbox = config
            .use_sandbox
            .then(|| Arc::new(Sandbox::new(config.limits.clone())));
        let mode = match &sandbox {
            Some(sandbox) => TrustMode::Sandboxed(Arc::clone(sandbox)),
            None => {
                crate::log_warn!("Sandbox disabled: plugins run with direct Lua access");
                TrustMode::Direct
            }
        };

        let loader = PluginLoader::new(mode, Arc::clone(&registry), Arc::clone(&bus), events.clone());

        Ok(Self {
            config,
            sandbox,
            registry,
            loader,
            bus,
            events,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// One-shot autoload of the configured plugins directory
    ///
    /// Returns `None` if autoload is off or the manager was already initialized.
    pub async fn initialize(&self) -> PluginResult<Option<DirectoryLoadReport>> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        if !self.config.autoload {
            return Ok(None);
        }

        let dir = &self.config.plugins_dir;
        if !dir.exists() {
            crate::log_info!("Creating plugins directory {}", dir.display());
            std::fs::create_dir_all(dir)?;
        }
        self.load_plugins_from_directory(dir).await.map(Some)
    }

    /// Load a plugin and grant it its declared capabilities
    pub async fn load_plugin(&self, path: &Path) -> PluginResult<LoadedPlugin> {
        let loaded = self.loader.load_plugin(path, LoadOptions::default()).await?;
        self.bind_capabilities(&loaded.name).await?;
        Ok(loaded)
    }

    pub async fn load_plugins_from_directory(&self, dir: &Path) -> PluginResult<DirectoryLoadReport> {
        let mut report = self.loader.load_plugins_from_directory(dir).await?;

        let mut bound = Vec::with_capacity(report.loaded.len());
        for name in std::mem::take(&mut report.loaded) {
            let path = self
                .registry
                .descriptor(&name)
                .await
                .map(|d| d.path)
                .unwrap_or_else(|| dir.join(&name));
            match self.bind_capabilities(&name).await {
                Ok(()) => bound.push(name),
                Err(e) => report.failed.push(FailedLoad {
                    path,
                    error: e.to_string(),
                }),
            }
        }
        report.loaded = bound;
        Ok(report)
    }

    /// Create the capability context for a freshly loaded plugin
    ///
    /// On failure the plugin is unloaded again.
    async fn bind_capabilities(&self, name: &str) -> PluginResult<()> {
        let permissions = self
            .registry
            .descriptor(name)
            .await
            .map(|d| d.permissions)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;

        if let Err(e) = self.bus.create_context(name, &permissions).await {
            crate::log_error!("Capability context for '{}' failed: {}", name, e);
            if let Err(unload_err) = self.loader.unload_plugin(name).await {
                crate::log_warn!("Could not roll back '{}': {}", name, unload_err);
            }
            events::emit(
                &self.events,
                PluginEvent::PluginError {
                    name: name.to_string(),
                    error: e.to_string(),
                },
            );
            return Err(e);
        }
        Ok(())
    }

    /// Unload a plugin
    ///
    /// Dependents are checked before the capability context is released, so
    /// a refused unload leaves the plugin fully functional.
    pub async fn unload_plugin(&self, name: &str) -> PluginResult<String> {
        if !self.registry.is_registered(name).await {
            return Err(PluginError::PluginNotFound(name.to_string()));
        }
        let dependents = self.registry.find_dependents(name).await;
        if !dependents.is_empty() {
            return Err(PluginError::HasDependents {
                plugin: name.to_string(),
                dependents,
            });
        }

        self.bus.destroy_context(name).await;
        self.loader.unload_plugin(name).await
    }

    /// Reload a plugin from its original path, re-reading its permissions
    pub async fn reload_plugin(&self, name: &str) -> PluginResult<LoadedPlugin> {
        if !self.registry.is_registered(name).await {
            return Err(PluginError::PluginNotFound(name.to_string()));
        }

        self.bus.destroy_context(name).await;
        let result = self.loader.reload_plugin(name).await;

        // Whichever version is registered now gets its context back
        if self.registry.is_registered(name).await {
            self.bind_capabilities(name).await?;
        }
        result
    }

    pub async fn enable_plugin(&self, name: &str) -> PluginResult<bool> {
        self.registry.enable(name).await
    }

    pub async fn disable_plugin(&self, name: &str) -> PluginResult<bool> {
        self.registry.disable(name).await
    }

    /// Enable every registered plugin in dependency order
    ///
    /// Returns the plugins that changed state; failures are logged.
    pub async fn enable_all(&self) -> PluginResult<Vec<String>> {
        let order = self.registry.resolve_dependency_order().await?;
        let mut enabled = Vec::new();
        for name in order {
            match self.registry.enable(&name).await {
                Ok(true) => enabled.push(name),
                Ok(false) => {}
                Err(e) => crate::log_warn!("Could not enable '{}': {}", name, e),
            }
        }
        Ok(enabled)
    }

    pub async fn set_config(&self, name: &str, config: ConfigMap) -> PluginResult<ConfigMap> {
        self.registry.set_config(name, config).await
    }

    pub async fn update_config(&self, name: &str, partial: ConfigMap) -> PluginResult<ConfigMap> {
        self.registry.update_config(name, partial).await
    }

    pub async fn delete_config(&self, name: &str) -> PluginResult<bool> {
        self.registry.delete_config(name).await
    }

    pub async fn get_config(&self, name: &str) -> ConfigMap {
        self.registry.get_config(name).await
    }

    pub async fn get_plugin(&self, name: &str) -> Option<PluginInfo> {
        self.registry.info(name).await
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        self.registry.list().await
    }

    pub async fn resolve_dependency_order(&self) -> PluginResult<Vec<String>> {
        self.registry.resolve_dependency_order().await
    }

    /// `None` when running without a sandbox
    pub fn sandbox_stats(&self) -> Option<SandboxStats> {
        self.sandbox.as_ref().map(|s| s.stats())
    }

    pub async fn export(&self) -> RegistrySnapshot {
        self.registry.export().await
    }

    pub async fn import(&self, snapshot: RegistrySnapshot) -> PluginResult<ImportReport> {
        self.registry.import(snapshot).await
    }

    /// Shut the runtime down
    ///
    /// Plugins are unloaded most recently loaded first, then the capability
    /// bus is torn down, the registry persisted and cleared, and every
    /// remaining sandbox context disposed of.
    pub async fn cleanup(&self) {
        log_task_start("Plugin runtime shutdown");

        let mut names = self.registry.names().await;
        names.reverse();

        let mut unloaded = 0;
        for name in names {
            self.bus.destroy_context(&name).await;
            match self.loader.unload_plugin(&name).await {
                Ok(_) => unloaded += 1,
                Err(e) => crate::log_warn!("Could not unload '{}' during shutdown: {}", name, e),
            }
        }

        self.bus.shutdown().await;

        if let Err(e) = self.registry.persist().await {
            crate::log_warn!("Failed to persist plugin configuration: {}", e);
        }
        for entry in self.registry.clear().await {
            if let Err(e) = entry.instance.cleanup().await {
                crate::log_warn!("Plugin '{}' cleanup failed: {}", entry.descriptor.name, e);
            }
            entry.instance.release();
        }

        if let Some(sandbox) = &self.sandbox {
            sandbox.cleanup();
        }

        log_task_complete_with_details(
            "Plugin runtime shutdown",
            &format!("{} plugin(s) unloaded", unloaded),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::plugins::capability::{LocalBus, PermissionLevel};
    use futures::FutureExt;
    use mlua::Value;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        bus: Arc<LocalBus>,
        manager: PluginManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = RuntimeConfig {
            plugins_dir: dir.path().join("plugins"),
            config_file: dir.path().join("cache").join("plugin-config.json"),
            autoload: true,
            use_sandbox: true,
            limits: ResourceLimits {
                timeout_ms: 500,
                ..ResourceLimits::default()
            },
        };

        let bus = Arc::new(LocalBus::new());
        bus.register_command("browser.title", PermissionLevel::Read, |_| {
            async { Ok(json!("Example Domain")) }.boxed()
        });

        let manager = PluginManager::new(config, bus.clone()).unwrap();
        Fixture { dir, bus, manager }
    }

    impl Fixture {
        fn write(&self, file: &str, code: &str) -> PathBuf {
            let path = self.manager.config().plugins_dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, code).unwrap();
            path
        }

        fn module(&self, name: &str, deps: &[&str]) -> PathBuf {
            let deps: Vec<String> = deps.iter().map(|d| format!("\"{}\"", d)).collect();
            self.write(
                &format!("{}.lua", name),
                &format!(
                    r#"return {{ name = "{}", version = "1.0.0", dependencies = {{ {} }} }}"#,
                    name,
                    deps.join(", ")
                ),
            )
        }
    }

    #[tokio::test]
    async fn test_dependent_blocks_unload_until_removed() {
        let fx = fixture();
        let x = fx.module("x", &[]);
        let y = fx.module("y", &["x"]);

        fx.manager.load_plugin(&x).await.unwrap();
        assert!(fx.manager.enable_plugin("x").await.unwrap());
        fx.manager.load_plugin(&y).await.unwrap();

        let err = fx.manager.unload_plugin("x").await.unwrap_err();
        match &err {
            PluginError::HasDependents { plugin, dependents } => {
                assert_eq!(plugin, "x");
                assert_eq!(dependents, &["y"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Refused unload keeps the capability context
        assert!(fx.bus.has_context("x"));

        fx.manager.unload_plugin("y").await.unwrap();
        fx.manager.unload_plugin("x").await.unwrap();
        assert!(fx.manager.list_plugins().await.is_empty());
        assert_eq!(fx.bus.context_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_reports_loaded_failed_skipped() {
        let fx = fixture();
        fx.write("valid.lua", r#"return { name = "valid", version = "1.0.0" }"#);
        fx.write("broken.lua", r#"return { name = "broken", version = "#);
        fx.write("style.css", "body {}");

        let report = fx.manager.initialize().await.unwrap().unwrap();
        assert_eq!(report.loaded, vec!["valid"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(fx.bus.has_context("valid"));

        // One-shot
        assert!(fx.manager.initialize().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_creates_missing_plugins_dir() {
        let fx = fixture();
        let report = fx.manager.initialize().await.unwrap().unwrap();
        assert!(report.loaded.is_empty());
        assert!(fx.manager.config().plugins_dir.is_dir());
    }

    #[tokio::test]
    async fn test_load_unload_round_trip_restores_state() {
        let fx = fixture();
        let before = fx.manager.export().await;

        let path = fx.module("temp", &[]);
        fx.manager.load_plugin(&path).await.unwrap();
        assert!(fx.bus.has_context("temp"));
        fx.manager.unload_plugin("temp").await.unwrap();

        let after = fx.manager.export().await;
        assert_eq!(before.plugins.len(), after.plugins.len());
        assert_eq!(before.configs, after.configs);
        assert!(!fx.bus.has_context("temp"));
        assert_eq!(fx.manager.sandbox_stats().unwrap().active_contexts, 0);
    }

    #[tokio::test]
    async fn test_capabilities_follow_declared_permissions() {
        let fx = fixture();
        let code = |name: &str, perms: &str| {
            format!(
                r#"
local M = {{ name = "{}", version = "1.0.0", permissions = {{ {} }} }}
function M.onEnable()
    M.can_read = api.has_permission("browser", "read")
    M.title = api.call("browser.title")
end
return M
"#,
                name, perms
            )
        };
        let granted = fx.write("granted.lua", &code("granted", r#"browser = "read""#));
        let denied = fx.write("denied.lua", &code("denied", ""));

        fx.manager.load_plugin(&granted).await.unwrap();
        fx.manager.load_plugin(&denied).await.unwrap();
        fx.manager.enable_all().await.unwrap();

        let granted = fx.manager.registry().instance("granted").await.unwrap();
        let title: String = granted.exports().get("title").unwrap();
        assert_eq!(title, "Example Domain");

        let denied = fx.manager.registry().instance("denied").await.unwrap();
        assert!(!denied.exports().get::<bool>("can_read").unwrap());
        assert!(denied.exports().get::<Value>("title").unwrap().is_nil());
        // The failing onEnable is swallowed
        assert!(fx.manager.registry().is_enabled("denied").await);
    }

    #[tokio::test]
    async fn test_capability_calls_during_init_have_no_context() {
        let fx = fixture();
        let path = fx.write(
            "eager.lua",
            r#"
local M = { name = "eager", version = "1.0.0", permissions = { browser = "read" } }
function M.init(api)
    api.call("browser.title")
end
return M
"#,
        );
        let err = fx.manager.load_plugin(&path).await.unwrap_err();
        assert!(matches!(err, PluginError::InitFailed { .. }));
        assert!(err.to_string().contains("No capability context"));
        assert!(!fx.bus.has_context("eager"));
        assert!(fx.manager.get_plugin("eager").await.is_none());
    }

    #[tokio::test]
    async fn test_enable_all_and_cleanup_order() {
        let fx = fixture();
        fx.manager.load_plugin(&fx.module("base", &[])).await.unwrap();
        fx.manager.load_plugin(&fx.module("mid", &["base"])).await.unwrap();
        fx.manager.load_plugin(&fx.module("top", &["mid"])).await.unwrap();

        assert_eq!(fx.manager.enable_all().await.unwrap(), vec!["base", "mid", "top"]);

        let mut rx = fx.manager.subscribe();
        fx.manager.cleanup().await;

        let mut unloaded = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PluginEvent::PluginUnloaded { name } = event {
                unloaded.push(name);
            }
        }
        assert_eq!(unloaded, vec!["top", "mid", "base"]);
        assert!(fx.manager.list_plugins().await.is_empty());
        assert_eq!(fx.bus.context_count(), 0);
        assert_eq!(fx.manager.sandbox_stats().unwrap().active_contexts, 0);
    }

    #[tokio::test]
    async fn test_reload_refreshes_permissions() {
        let fx = fixture();
        let path = fx.write("perm.lua", r#"return { name = "perm", version = "1.0.0" }"#);
        fx.manager.load_plugin(&path).await.unwrap();
        assert!(!fx.bus.has_permission("perm", "browser", PermissionLevel::Read));

        fx.write(
            "perm.lua",
            r#"return { name = "perm", version = "1.0.1", permissions = { browser = "write" } }"#,
        );
        let reloaded = fx.manager.reload_plugin("perm").await.unwrap();
        assert_eq!(reloaded.version, "1.0.1");
        assert!(fx.bus.has_permission("perm", "browser", PermissionLevel::Write));
    }

    #[tokio::test]
    async fn test_config_persists_across_managers() {
        let fx = fixture();
        let path = fx.write(
            "cfg.lua",
            r#"return { name = "cfg", version = "1.0.0", defaultConfig = { retries = 3 } }"#,
        );
        fx.manager.load_plugin(&path).await.unwrap();

        let mut partial = ConfigMap::new();
        partial.insert("retries".into(), json!(5));
        let effective = fx.manager.update_config("cfg", partial).await.unwrap();
        assert_eq!(effective.get("retries"), Some(&json!(5)));

        let second = PluginManager::new(fx.manager.config().clone(), fx.bus.clone()).unwrap();
        second.load_plugin(&path).await.unwrap();
        assert_eq!(second.get_config("cfg").await.get("retries"), Some(&json!(5)));
        assert!(fx.dir.path().join("cache").join("plugin-config.json").is_file());
    }

    #[tokio::test]
    async fn test_timeout_in_plugin_body_is_contained() {
        let fx = fixture();
        let path = fx.write(
            "spin.lua",
            r#"while true do end
return { name = "spin", version = "1.0.0" }"#,
        );
        let err = fx.manager.load_plugin(&path).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }));

        let stats = fx.manager.sandbox_stats().unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.active_contexts, 0);
    }
}

//! Plugin loading logic
//!
//! Turns a source location into a live, registered plugin and reverses the
//! process on unload. Loaded plugins are stored in the [`PluginRegistry`];
//! the loader itself only remembers per-name load state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{Lua, Value};
use serde::Serialize;

use crate::config::{ALLOWED_EXTENSIONS, INDEX_FILE};
use crate::core::error::{PluginError, PluginResult};
use crate::plugins::capability::{CapabilityBus, CapabilityHandle};
use crate::plugins::descriptor::PluginDescriptor;
use crate::plugins::events::{self, EventSender, PluginEvent};
use crate::plugins::instance::PluginInstance;
use crate::plugins::registry::PluginRegistry;
use crate::plugins::sandbox::bindings::{bind_api, register_logging_api};
use crate::plugins::sandbox::{ExecuteOptions, Sandbox};

/// How plugin code is executed
#[derive(Clone)]
pub enum TrustMode {
    /// Static validation, isolated context, timeout
    Sandboxed(Arc<Sandbox>),
    /// Plain Lua state with the standard library; for trusted plugins only
    Direct,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Replace an already loaded plugin of the same name
    pub replace: bool,
}

/// Summary returned by a successful load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedPlugin {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl From<&PluginDescriptor> for LoadedPlugin {
    fn from(d: &PluginDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            version: d.version.clone(),
            description: d.description.clone(),
            author: d.author.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum PluginState {
    Loaded,
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedLoad {
    pub path: PathBuf,
    pub error: String,
}

/// Result of [`PluginLoader::load_plugins_from_directory`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryLoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<FailedLoad>,
    pub skipped: Vec<PathBuf>,
}

pub struct PluginLoader {
    mode: TrustMode,
    registry: Arc<PluginRegistry>,
    bus: Arc<dyn CapabilityBus>,
    events: EventSender,
    states: Mutex<HashMap<String, PluginState>>,
    /// Serializes loads and unloads
    ops: tokio::sync::Mutex<()>,
}

/// Executed but not yet registered
struct Prepared {
    descriptor: PluginDescriptor,
    instance: Arc<PluginInstance>,
}

impl PluginLoader {
    pub fn new(
        mode: TrustMode,
        registry: Arc<PluginRegistry>,
        bus: Arc<dyn CapabilityBus>,
        events: EventSender,
    ) -> Self {
        Self {
            mode,
            registry,
            bus,
            events,
            states: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mode(&self) -> &TrustMode {
        &self.mode
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, PluginState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load a plugin file, or a plugin directory through its index file
    pub async fn load_plugin(&self, path: &Path, options: LoadOptions) -> PluginResult<LoadedPlugin> {
        let _guard = self.ops.lock().await;
        self.load_locked(path, options).await
    }

    async fn load_locked(&self, path: &Path, options: LoadOptions) -> PluginResult<LoadedPlugin> {
        let file = resolve_source(path)?;
        let code = fs::read_to_string(&file)?;

        let handle = CapabilityHandle::new(Arc::clone(&self.bus));
        let prepared = self.prepare(&file, &code, &handle).await?;
        let name = prepared.descriptor.name.clone();

        let mut restore_enabled = false;
        if self.registry.is_registered(&name).await {
            if !options.replace {
                prepared.instance.release();
                return Err(PluginError::AlreadyLoaded(name));
            }
            // The old version stays in place if the new one would close a cycle
            if let Err(e) = self.registry.check_acyclic(&prepared.descriptor).await {
                prepared.instance.release();
                return Err(e);
            }
            restore_enabled = self.registry.is_enabled(&name).await;
            self.teardown_for_replace(&name).await;
        }

        let mut missing = Vec::new();
        for dep in &prepared.descriptor.dependencies {
            if !self.registry.is_registered(dep).await {
                missing.push(dep.clone());
            }
        }
        if !missing.is_empty() {
            prepared.instance.release();
            return Err(PluginError::UnmetDependencies {
                plugin: name,
                missing,
                disabled: Vec::new(),
            });
        }

        handle.bind(&name);
        if let Err(e) = prepared.instance.init().await {
            prepared.instance.release();
            let reason = e.to_string();
            crate::log_error!("Plugin '{}' init failed: {}", name, reason);
            self.states().insert(name.clone(), PluginState::Error(reason.clone()));
            events::emit(
                &self.events,
                PluginEvent::PluginError {
                    name: name.clone(),
                    error: reason.clone(),
                },
            );
            return Err(PluginError::InitFailed { plugin: name, reason });
        }

        let summary = LoadedPlugin::from(&prepared.descriptor);
        let version = prepared.descriptor.version.clone();
        if let Err(e) = self
            .registry
            .register(prepared.descriptor, Arc::clone(&prepared.instance))
            .await
        {
            prepared.instance.release();
            return Err(e);
        }
        self.states().insert(name.clone(), PluginState::Loaded);

        if restore_enabled {
            if let Err(e) = self.registry.enable(&name).await {
                crate::log_warn!("Replaced plugin '{}' could not be re-enabled: {}", name, e);
            }
        }

        crate::log_info!("Loaded plugin '{}' v{} from {}", name, version, file.display());
        events::emit(&self.events, PluginEvent::PluginLoaded { name, version });
        Ok(summary)
    }

    /// Validate, execute and build the instance for one plugin source
    async fn prepare(&self, file: &Path, code: &str, handle: &CapabilityHandle) -> PluginResult<Prepared> {
        let label = file_label(file);
        let filename = file.display().to_string();

        let (descriptor, instance) = match &self.mode {
            TrustMode::Sandboxed(sandbox) => {
                let report = sandbox.validate_code(code);
                for issue in report.warnings() {
                    crate::log_warn!("[{}] line {}: {} ({})", label, issue.line, issue.message, issue.rule);
                }
                if !report.valid {
                    let violations = report
                        .fatal()
                        .map(|i| format!("line {}: {}", i.line, i.message))
                        .collect();
                    return Err(PluginError::PolicyViolation(violations));
                }

                let execution = sandbox
                    .execute(
                        code,
                        ExecuteOptions {
                            filename: Some(filename),
                            api: Some(handle.clone()),
                            timeout: None,
                            plugin_name: Some(label),
                        },
                    )
                    .await?;
                let context = execution.context;

                // Extraction reads the module table, so it runs under the
                // deadline like any other plugin code
                let extracted = context
                    .state()
                    .run_bounded(sandbox.limits().timeout(), async {
                        let built = match execution.exports {
                            Value::Table(exports) => PluginInstance::sandboxed(
                                Arc::clone(sandbox),
                                Arc::clone(&context),
                                exports,
                            )
                            .and_then(|instance| {
                                let descriptor =
                                    PluginDescriptor::from_exports(instance.exports(), file)?;
                                Ok((descriptor, instance))
                            }),
                            other => Err(not_a_module(file, &other)),
                        };
                        Ok::<_, mlua::Error>(built)
                    })
                    .await;
                match extracted.and_then(|built| built) {
                    Ok(built) => built,
                    Err(e) => {
                        sandbox.cleanup_context(context.id());
                        return Err(e);
                    }
                }
            }
            TrustMode::Direct => {
                let lua = Lua::new();
                register_logging_api(&lua, &label)?;
                bind_api(&lua, handle)?;
                let value = lua
                    .load(code)
                    .set_name(format!("={}", filename))
                    .eval_async::<Value>()
                    .await?;
                let instance = match value {
                    Value::Table(exports) => PluginInstance::direct(lua, exports)?,
                    other => return Err(not_a_module(file, &other)),
                };
                let descriptor = PluginDescriptor::from_exports(instance.exports(), file)?;
                (descriptor, instance)
            }
        };

        Ok(Prepared {
            descriptor,
            instance: Arc::new(instance),
        })
    }

    /// Unload a plugin
    ///
    /// Fails while any other loaded plugin depends on it, enabled or not. A
    /// failing `cleanup` hook is logged and does not block removal.
    pub async fn unload_plugin(&self, name: &str) -> PluginResult<String> {
        let _guard = self.ops.lock().await;

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

        if let Some(instance) = self.registry.instance(name).await {
            run_cleanup(name, &instance).await;
        }
        let entry = self.registry.unregister(name).await?;
        entry.instance.release();
        self.states().remove(name);

        crate::log_info!("Unloaded plugin '{}'", name);
        events::emit(&self.events, PluginEvent::PluginUnloaded { name: name.to_string() });
        Ok(name.to_string())
    }

    /// Tear down the current holder of `name` ahead of a replacement
    ///
    /// Dependents are left in place; the replacement keeps them satisfied.
    async fn teardown_for_replace(&self, name: &str) {
        if let Some(instance) = self.registry.instance(name).await {
            run_cleanup(name, &instance).await;
        }
        if let Some(entry) = self.registry.remove_for_replace(name).await {
            entry.instance.release();
        }
        crate::log_info!("Replacing plugin '{}'", name);
        events::emit(&self.events, PluginEvent::PluginUnloaded { name: name.to_string() });
    }

    /// Unload and load again from the original path
    pub async fn reload_plugin(&self, name: &str) -> PluginResult<LoadedPlugin> {
        let _guard = self.ops.lock().await;
        let path = self
            .registry
            .descriptor(name)
            .await
            .map(|d| d.path)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;

        let loaded = self.load_locked(&path, LoadOptions { replace: true }).await?;
        if loaded.name != name {
            crate::log_warn!(
                "Reloading '{}' from {} produced plugin '{}'",
                name,
                path.display(),
                loaded.name
            );
        }
        Ok(loaded)
    }

    /// Load every plugin in a directory
    ///
    /// Entries are visited in name order. Subdirectories count only if they
    /// contain an index file, files only with an allowed extension; anything
    /// else is skipped. Plugins whose dependencies are not loaded yet are
    /// retried after the rest of the batch while that makes progress.
    pub async fn load_plugins_from_directory(&self, dir: &Path) -> PluginResult<DirectoryLoadReport> {
        if !dir.is_dir() {
            return Err(PluginError::FileNotFound(dir.to_path_buf()));
        }

        let mut report = DirectoryLoadReport::default();
        let mut pending = Vec::new();

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            if path.is_dir() {
                if path.join(INDEX_FILE).is_file() {
                    pending.push(path);
                } else {
                    crate::log_debug!("Skipping {}: no {}", path.display(), INDEX_FILE);
                    report.skipped.push(path);
                }
            } else if has_allowed_extension(&path) {
                pending.push(path);
            } else {
                crate::log_debug!("Skipping {}: unsupported extension", path.display());
                report.skipped.push(path);
            }
        }

        loop {
            let mut waiting = Vec::new();
            let mut progress = false;

            for path in pending {
                match self.load_plugin(&path, LoadOptions::default()).await {
                    Ok(loaded) => {
                        progress = true;
                        report.loaded.push(loaded.name);
                    }
                    Err(e @ PluginError::UnmetDependencies { .. }) => waiting.push((path, e)),
                    Err(e) => {
                        crate::log_warn!("Failed to load plugin from {}: {}", path.display(), e);
                        report.failed.push(FailedLoad {
                            path,
                            error: e.to_string(),
                        });
                    }
                }
            }

            if waiting.is_empty() {
                break;
            }
            if !progress {
                for (path, e) in waiting {
                    crate::log_warn!("Failed to load plugin from {}: {}", path.display(), e);
                    report.failed.push(FailedLoad {
                        path,
                        error: e.to_string(),
                    });
                }
                break;
            }
            pending = waiting.into_iter().map(|(path, _)| path).collect();
        }

        crate::log_info!(
            "Loaded {} plugin(s) from {}, {} failed, {} skipped",
            report.loaded.len(),
            dir.display(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    pub async fn find_dependents(&self, name: &str) -> Vec<String> {
        self.registry.find_dependents(name).await
    }

    /// Names from `names` that are not loaded (existence only)
    pub async fn check_dependencies(&self, names: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        for name in names {
            if !self.registry.is_registered(name).await {
                missing.push(name.clone());
            }
        }
        missing
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.registry.is_registered(name).await
    }

    pub async fn get_plugin_count(&self) -> usize {
        self.registry.len().await
    }

    /// Last load outcome for `name`; init failures stay visible here
    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.states().get(name).cloned()
    }
}

async fn run_cleanup(name: &str, instance: &PluginInstance) {
    if let Err(e) = instance.cleanup().await {
        crate::log_warn!("Plugin '{}' cleanup failed: {}", name, e);
    }
}

/// Map a plugin location to the source file that gets executed
fn resolve_source(path: &Path) -> PluginResult<PathBuf> {
    if !path.exists() {
        return Err(PluginError::FileNotFound(path.to_path_buf()));
    }
    let file = if path.is_dir() {
        let index = path.join(INDEX_FILE);
        if !index.is_file() {
            return Err(PluginError::FileNotFound(index));
        }
        index
    } else {
        path.to_path_buf()
    };

    if !has_allowed_extension(&file) {
        return Err(PluginError::InvalidExtension {
            path: file,
            allowed: ALLOWED_EXTENSIONS.iter().map(|e| format!(".{}", e)).collect(),
        });
    }
    Ok(file)
}

fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// Name used for log prefixes before the descriptor is known
fn file_label(file: &Path) -> String {
    let target = if file.file_name().and_then(|n| n.to_str()) == Some(INDEX_FILE) {
        file.parent().unwrap_or(file)
    } else {
        file
    };
    target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("plugin")
        .to_string()
}

fn not_a_module(file: &Path, value: &Value) -> PluginError {
    PluginError::Validation(format!(
        "{} must return a module table, got {}",
        file.file_name().and_then(|n| n.to_str()).unwrap_or("plugin"),
        value.type_name()
    ))
}

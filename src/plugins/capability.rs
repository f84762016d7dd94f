//! Capability bus boundary
//!
//! Plugins never touch host functionality directly. Each plugin gets a
//! [`CapabilityHandle`] (bound into Lua as `api`) whose calls are routed
//! through a [`CapabilityBus`] that checks the plugin's declared permissions.
//! The bus itself is a host concern; [`LocalBus`] is an in-process
//! implementation that hosts can register commands on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use mlua::{Lua, LuaSerdeExt, Table, Value};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::error::{PluginError, PluginResult};

/// Access level a plugin holds for a capability category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    None,
    Read,
    Write,
}

impl Default for PermissionLevel {
    fn default() -> Self {
        PermissionLevel::None
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionLevel::None => "none",
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
        };
        f.write_str(name)
    }
}

impl FromStr for PermissionLevel {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(PermissionLevel::None),
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            other => Err(PluginError::Validation(format!(
                "Unknown permission level '{}' (expected none, read or write)",
                other
            ))),
        }
    }
}

/// Capability category -> granted level, as declared by a plugin
pub type Permissions = BTreeMap<String, PermissionLevel>;

/// Permission-gated command surface provided by the host
#[async_trait]
pub trait CapabilityBus: Send + Sync {
    /// Create the capability context for a plugin from its declared permissions
    async fn create_context(&self, plugin: &str, permissions: &Permissions) -> PluginResult<()>;

    /// Release a plugin's capability context; unknown plugins are ignored
    async fn destroy_context(&self, plugin: &str);

    /// Invoke a host command on behalf of a plugin
    async fn invoke(&self, plugin: &str, command: &str, params: JsonValue)
    -> PluginResult<JsonValue>;

    fn has_permission(&self, plugin: &str, category: &str, level: PermissionLevel) -> bool;

    /// Tear down every context, used at runtime shutdown
    async fn shutdown(&self);
}

pub type CommandHandler =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, PluginResult<JsonValue>> + Send + Sync>;

struct RegisteredCommand {
    category: String,
    required: PermissionLevel,
    handler: CommandHandler,
}

/// In-process capability bus
///
/// Commands are named `<category>.<action>`; the category is matched against
/// the plugin's declared permissions.
#[derive(Default)]
pub struct LocalBus {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
    contexts: RwLock<HashMap<String, Permissions>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host command requiring `required` access to its category
    pub fn register_command<F>(&self, command: &str, required: PermissionLevel, handler: F)
    where
        F: Fn(JsonValue) -> BoxFuture<'static, PluginResult<JsonValue>> + Send + Sync + 'static,
    {
        let category = command_category(command).to_string();
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        commands.insert(
            command.to_string(),
            RegisteredCommand {
                category,
                required,
                handler: Arc::new(handler),
            },
        );
    }

    pub fn has_context(&self, plugin: &str) -> bool {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(plugin)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn command_category(command: &str) -> &str {
    command.split('.').next().unwrap_or(command)
}

#[async_trait]
impl CapabilityBus for LocalBus {
    async fn create_context(&self, plugin: &str, permissions: &Permissions) -> PluginResult<()> {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        contexts.insert(plugin.to_string(), permissions.clone());
        crate::log_debug!(
            "Created capability context for '{}' ({} categories)",
            plugin,
            permissions.len()
        );
        Ok(())
    }

    async fn destroy_context(&self, plugin: &str) {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        if contexts.remove(plugin).is_some() {
            crate::log_debug!("Destroyed capability context for '{}'", plugin);
        }
    }

    async fn invoke(
        &self,
        plugin: &str,
        command: &str,
        params: JsonValue,
    ) -> PluginResult<JsonValue> {
        let granted = {
            let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
            contexts
                .get(plugin)
                .cloned()
                .ok_or_else(|| PluginError::NoCapabilityContext(plugin.to_string()))?
        };

        let (category, required, handler) = {
            let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
            let registered = commands
                .get(command)
                .ok_or_else(|| PluginError::UnknownCommand(command.to_string()))?;
            (
                registered.category.clone(),
                registered.required,
                Arc::clone(&registered.handler),
            )
        };

        let level = granted.get(&category).copied().unwrap_or_default();
        if level < required || level == PermissionLevel::None {
            return Err(PluginError::PermissionDenied {
                plugin: plugin.to_string(),
                category,
                required,
            });
        }

        handler(params).await
    }

    fn has_permission(&self, plugin: &str, category: &str, level: PermissionLevel) -> bool {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        contexts
            .get(plugin)
            .and_then(|perms| perms.get(category))
            .is_some_and(|granted| *granted >= level)
    }

    async fn shutdown(&self) {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        let count = contexts.len();
        contexts.clear();
        crate::log_debug!("Capability bus shut down ({} contexts released)", count);
    }
}

/// Per-plugin handle onto the capability bus
///
/// The handle is created before the plugin code runs and bound to the
/// plugin's declared name once its descriptor validates.
#[derive(Clone)]
pub struct CapabilityHandle {
    bus: Arc<dyn CapabilityBus>,
    plugin: Arc<OnceCell<String>>,
}

impl CapabilityHandle {
    pub fn new(bus: Arc<dyn CapabilityBus>) -> Self {
        Self {
            bus,
            plugin: Arc::new(OnceCell::new()),
        }
    }

    /// Bind the handle to a plugin name; later binds are ignored
    pub fn bind(&self, plugin: &str) {
        let _ = self.plugin.set(plugin.to_string());
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin.get().map(String::as_str)
    }

    pub async fn invoke(&self, command: &str, params: JsonValue) -> PluginResult<JsonValue> {
        let plugin = self
            .plugin_name()
            .ok_or_else(|| PluginError::NoCapabilityContext("<unbound>".to_string()))?;
        self.bus.invoke(plugin, command, params).await
    }

    pub fn has_permission(&self, category: &str, level: PermissionLevel) -> bool {
        self.plugin_name()
            .is_some_and(|plugin| self.bus.has_permission(plugin, category, level))
    }

    /// Build the `api` table exposed to plugin code
    pub fn create_lua_table(&self, lua: &Lua) -> mlua::Result<Table> {
        let api = lua.create_table()?;

        let handle = self.clone();
        let call = lua.create_async_function(
            move |lua, (command, params): (String, Option<Value>)| {
                let handle = handle.clone();
                async move {
                    let params = match params {
                        Some(value) => lua.from_value::<JsonValue>(value)?,
                        None => JsonValue::Null,
                    };
                    let result = handle
                        .invoke(&command, params)
                        .await
                        .map_err(mlua::Error::external)?;
                    lua.to_value(&result)
                }
            },
        )?;
        api.set("call", call)?;

        let handle = self.clone();
        let has_permission =
            lua.create_function(move |_lua, (category, level): (String, Option<String>)| {
                let level = match level {
                    Some(level) => level.parse().map_err(mlua::Error::external)?,
                    None => PermissionLevel::Read,
                };
                Ok(handle.has_permission(&category, level))
            })?;
        api.set("has_permission", has_permission)?;

        let handle = self.clone();
        let name = lua.create_function(move |_lua, ()| {
            Ok(handle.plugin_name().map(str::to_string))
        })?;
        api.set("name", name)?;

        Ok(api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn bus_with_commands() -> Arc<LocalBus> {
        let bus = Arc::new(LocalBus::new());
        bus.register_command("browser.title", PermissionLevel::Read, |_| {
            async { Ok(json!("Example Domain")) }.boxed()
        });
        bus.register_command("cookies.set", PermissionLevel::Write, |params| {
            async move { Ok(json!({ "stored": params })) }.boxed()
        });
        bus
    }

    #[test]
    fn test_permission_level_parsing_and_order() {
        assert_eq!("READ".parse::<PermissionLevel>().unwrap(), PermissionLevel::Read);
        assert!("admin".parse::<PermissionLevel>().is_err());
        assert!(PermissionLevel::Write > PermissionLevel::Read);
        assert!(PermissionLevel::Read > PermissionLevel::None);
    }

    #[tokio::test]
    async fn test_invoke_requires_context() {
        let bus = bus_with_commands();
        let err = bus.invoke("ghost", "browser.title", JsonValue::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::NoCapabilityContext(_)));
    }

    #[tokio::test]
    async fn test_invoke_enforces_declared_level() {
        let bus = bus_with_commands();
        let mut perms = Permissions::new();
        perms.insert("browser".into(), PermissionLevel::Read);
        perms.insert("cookies".into(), PermissionLevel::Read);
        bus.create_context("reader", &perms).await.unwrap();

        let title = bus.invoke("reader", "browser.title", JsonValue::Null).await.unwrap();
        assert_eq!(title, json!("Example Domain"));

        let err = bus.invoke("reader", "cookies.set", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));

        let err = bus.invoke("reader", "storage.get", JsonValue::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn test_destroy_context_revokes_access() {
        let bus = bus_with_commands();
        let mut perms = Permissions::new();
        perms.insert("browser".into(), PermissionLevel::Write);
        bus.create_context("p", &perms).await.unwrap();
        assert!(bus.has_permission("p", "browser", PermissionLevel::Read));

        bus.destroy_context("p").await;
        assert!(!bus.has_context("p"));
        assert!(!bus.has_permission("p", "browser", PermissionLevel::Read));
    }

    #[tokio::test]
    async fn test_handle_unbound_until_bind() {
        let bus = bus_with_commands();
        let handle = CapabilityHandle::new(bus.clone());
        assert!(handle.invoke("browser.title", JsonValue::Null).await.is_err());

        let mut perms = Permissions::new();
        perms.insert("browser".into(), PermissionLevel::Read);
        bus.create_context("p", &perms).await.unwrap();
        handle.bind("p");
        handle.bind("other");

        assert_eq!(handle.plugin_name(), Some("p"));
        assert_eq!(
            handle.invoke("browser.title", JsonValue::Null).await.unwrap(),
            json!("Example Domain")
        );
    }
}

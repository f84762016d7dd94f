//! Live plugin instances
//!
//! A [`PluginInstance`] is the executable half of a loaded plugin: the module
//! table returned by the plugin chunk plus the Lua state it lives in. Lifecycle
//! hooks are looked up on the module table and awaited as async calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, Table, Value};
use serde_json::{Map, Value as JsonValue};

use crate::core::error::{PluginError, PluginResult};
use crate::plugins::descriptor::{default_config, hook_function};
use crate::plugins::sandbox::bindings::API_KEY;
use crate::plugins::sandbox::{Sandbox, SandboxContext};

/// Optional lifecycle hooks a plugin module may export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleHook {
    Init,
    Cleanup,
    Enable,
    Disable,
    ConfigChange,
}

impl LifecycleHook {
    pub const ALL: [LifecycleHook; 5] = [
        LifecycleHook::Init,
        LifecycleHook::Cleanup,
        LifecycleHook::Enable,
        LifecycleHook::Disable,
        LifecycleHook::ConfigChange,
    ];

    /// Export names, canonical first
    pub fn export_names(&self) -> &'static [&'static str] {
        match self {
            LifecycleHook::Init => &["init"],
            LifecycleHook::Cleanup => &["cleanup"],
            LifecycleHook::Enable => &["onEnable", "on_enable"],
            LifecycleHook::Disable => &["onDisable", "on_disable"],
            LifecycleHook::ConfigChange => &["onConfigChange", "on_config_change"],
        }
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_names()[0])
    }
}

/// Where a plugin's Lua state lives
enum Runtime {
    /// Owned by a sandbox context; hooks run under the sandbox deadline
    Sandboxed {
        sandbox: Arc<Sandbox>,
        context: Arc<SandboxContext>,
    },
    /// Trusted plugin in a plain Lua state; hooks are unbounded
    Direct(Lua),
}

pub struct PluginInstance {
    runtime: Runtime,
    exports: Table,
    default_config: Map<String, JsonValue>,
}

impl PluginInstance {
    pub(crate) fn sandboxed(
        sandbox: Arc<Sandbox>,
        context: Arc<SandboxContext>,
        exports: Table,
    ) -> PluginResult<Self> {
        Self::build(Runtime::Sandboxed { sandbox, context }, exports)
    }

    pub(crate) fn direct(lua: Lua, exports: Table) -> PluginResult<Self> {
        Self::build(Runtime::Direct(lua), exports)
    }

    fn build(runtime: Runtime, exports: Table) -> PluginResult<Self> {
        for hook in LifecycleHook::ALL {
            hook_function(&exports, hook.export_names())?;
        }
        let default_config = {
            let lua = match &runtime {
                Runtime::Sandboxed { context, .. } => context.lua(),
                Runtime::Direct(lua) => lua,
            };
            default_config(lua, &exports)?
        };

        Ok(Self {
            runtime,
            exports,
            default_config,
        })
    }

    pub fn lua(&self) -> &Lua {
        match &self.runtime {
            Runtime::Sandboxed { context, .. } => context.lua(),
            Runtime::Direct(lua) => lua,
        }
    }

    pub fn exports(&self) -> &Table {
        &self.exports
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self.runtime, Runtime::Sandboxed { .. })
    }

    /// Id of the owning sandbox context, if any
    pub fn context_id(&self) -> Option<&str> {
        match &self.runtime {
            Runtime::Sandboxed { context, .. } => Some(context.id()),
            Runtime::Direct(_) => None,
        }
    }

    /// The module's declared `defaultConfig`
    pub fn default_config(&self) -> &Map<String, JsonValue> {
        &self.default_config
    }

    pub fn has_hook(&self, hook: LifecycleHook) -> bool {
        matches!(hook_function(&self.exports, hook.export_names()), Ok(Some(_)))
    }

    /// `init(api)`; the argument is the capability table bound at load time
    pub async fn init(&self) -> PluginResult<bool> {
        let api: Value = self.lua().named_registry_value(API_KEY)?;
        self.call_hook(LifecycleHook::Init, Some(api)).await
    }

    pub async fn cleanup(&self) -> PluginResult<bool> {
        self.call_hook(LifecycleHook::Cleanup, None).await
    }

    pub async fn on_enable(&self) -> PluginResult<bool> {
        self.call_hook(LifecycleHook::Enable, None).await
    }

    pub async fn on_disable(&self) -> PluginResult<bool> {
        self.call_hook(LifecycleHook::Disable, None).await
    }

    pub async fn on_config_change(&self, config: &Map<String, JsonValue>) -> PluginResult<bool> {
        let value = self.lua().to_value(config)?;
        self.call_hook(LifecycleHook::ConfigChange, Some(value)).await
    }

    /// Invoke a hook if the module exports it; `Ok(false)` when absent
    async fn call_hook(&self, hook: LifecycleHook, arg: Option<Value>) -> PluginResult<bool> {
        let Some(func) = hook_function(&self.exports, hook.export_names())? else {
            return Ok(false);
        };
        let args = match arg {
            Some(value) => MultiValue::from_vec(vec![value]),
            None => MultiValue::new(),
        };

        match &self.runtime {
            Runtime::Sandboxed { sandbox, context } => {
                let timeout: Duration = sandbox.limits().timeout();
                context
                    .state()
                    .run_bounded(timeout, call(func, args))
                    .await?;
            }
            Runtime::Direct(_) => {
                call(func, args).await.map_err(PluginError::from)?;
            }
        }
        Ok(true)
    }

    /// Release the instance's execution resources
    ///
    /// For sandboxed plugins this disposes of the context, cancelling any
    /// timers the plugin still has scheduled. Hooks fail afterwards.
    pub(crate) fn release(&self) {
        if let Runtime::Sandboxed { sandbox, context } = &self.runtime {
            sandbox.cleanup_context(context.id());
        }
    }
}

async fn call(func: Function, args: MultiValue) -> mlua::Result<()> {
    func.call_async::<()>(args).await
}

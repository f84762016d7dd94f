//! Lua plugin system
//!
//! Loads untrusted Lua plugins into the host process, runs them inside a
//! sandbox and manages their lifecycle with dependency-aware enable/disable.
//!
//! # Plugin Structure
//!
//! A plugin is either a single `.lua` file or a directory containing
//! `init.lua`. The chunk returns a module table:
//!
//! ```lua
//! local M = {
//!     name = "greeter",
//!     version = "1.0.0",
//!     dependencies = { "storage" },
//!     permissions = { browser = "read" },
//!     defaultConfig = { greeting = "hello" },
//! }
//!
//! function M.init(api) log.info("ready as " .. api.name()) end
//! function M.onEnable() end
//! function M.onConfigChange(config) end
//!
//! return M
//! ```
//!
//! # Security
//!
//! Plugins run in a sandbox with:
//! - No file, process or network access (`io`, `os`, `package`, `debug` are absent)
//! - No code loading from strings or bytecode
//! - `require` restricted to an allow-list of helper modules
//! - Host functionality only through the permission-checked `api` handle
//! - Execution timeout and memory limit

pub mod capability;
pub mod descriptor;
pub mod events;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod sandbox;

pub use capability::{CapabilityBus, CapabilityHandle, LocalBus, PermissionLevel, Permissions};
pub use descriptor::PluginDescriptor;
pub use events::PluginEvent;
pub use instance::{LifecycleHook, PluginInstance};
pub use loader::{
    DirectoryLoadReport, LoadOptions, LoadedPlugin, PluginLoader, PluginState, TrustMode,
};
pub use manager::PluginManager;
pub use registry::{
    ConfigMap, DependencyReport, ImportReport, PluginInfo, PluginRegistry, RegistrySnapshot,
};
pub use sandbox::{ExecuteOptions, Sandbox, SandboxStats, ValidationReport};

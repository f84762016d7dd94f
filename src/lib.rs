//! # Plugin Runtime Library
//!
//! A runtime for loading untrusted Lua plugins into a long-lived host process:
//! - Sandboxed execution with timeouts, a memory limit and a curated global set
//! - Dependency-aware enable/disable with cycle detection
//! - Per-plugin configuration persisted to a JSON document
//! - Permission-gated access to host functionality through a capability bus
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugin_runtime::config::RuntimeConfig;
//! use plugin_runtime::plugins::{LocalBus, PluginManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = PluginManager::new(RuntimeConfig::default(), Arc::new(LocalBus::new()))?;
//!     manager.initialize().await?;
//!     manager.enable_all().await?;
//!
//!     for plugin in manager.list_plugins().await {
//!         println!("{} v{} enabled={}", plugin.name, plugin.version, plugin.enabled);
//!     }
//!
//!     manager.cleanup().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod plugins;

// Re-export commonly used types for convenience
pub use core::{ErrorKind, PluginError, PluginResult};
pub use plugins::{LocalBus, PluginEvent, PluginManager};

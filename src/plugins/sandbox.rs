//! Security sandbox for plugin execution
//!
//! Every execution gets a fresh Lua state (a [`SandboxContext`]) with the
//! curated global set from [`bindings`]. Execution is bounded by the sandbox
//! timeout; a timed-out context is revoked and its timers are cancelled.
//!
//! Enforced limits: `timeout_ms` (deadline hook + timer race) and
//! `memory_limit` (Lua allocator limit). The loop, recursion, array and
//! object-count limits in [`ResourceLimits`] are declared policy only.

pub mod bindings;
pub mod context;
pub mod validate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mlua::Value;
use serde::Serialize;

use crate::config::ResourceLimits;
use crate::core::error::{PluginError, PluginResult};
use crate::plugins::capability::CapabilityHandle;

pub use bindings::ALLOWED_MODULES;
pub use context::SandboxContext;
pub use validate::{Severity, ValidationIssue, ValidationReport};

/// Options for a single [`Sandbox::execute`] call
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Chunk name used in Lua error messages
    pub filename: Option<String>,
    /// Capability handle bound as the global `api`
    pub api: Option<CapabilityHandle>,
    /// Overrides the sandbox timeout for this execution
    pub timeout: Option<Duration>,
    /// Prefix for plugin log output
    pub plugin_name: Option<String>,
}

/// Result of a successful execution
pub struct Execution {
    /// Value returned by the chunk (the plugin module table)
    pub exports: Value,
    /// The context the code ran in; owns any timers the code scheduled
    pub context: Arc<SandboxContext>,
}

/// Snapshot of sandbox counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SandboxStats {
    pub executions: u64,
    pub successes: u64,
    /// Failed executions, timeouts included
    pub failures: u64,
    pub timeouts: u64,
    pub total_time_ms: u64,
    pub active_contexts: usize,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    total_time_ms: AtomicU64,
}

pub struct Sandbox {
    limits: ResourceLimits,
    contexts: Mutex<HashMap<String, Arc<SandboxContext>>>,
    counters: Counters,
}

impl Sandbox {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            contexts: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, Arc<SandboxContext>>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Static policy pass over plugin source, see [`validate::validate_code`]
    pub fn validate_code(&self, code: &str) -> ValidationReport {
        validate::validate_code(code)
    }

    /// Create a new isolated context and add it to the active set
    ///
    /// Dispose of it with [`Sandbox::cleanup_context`] using the returned id.
    pub fn create_context(
        &self,
        plugin_name: &str,
        api: Option<&CapabilityHandle>,
        timeout: Duration,
    ) -> PluginResult<Arc<SandboxContext>> {
        let lua = bindings::create_sandbox_lua(plugin_name, &self.limits, api)?;
        let context = Arc::new(SandboxContext::new(lua, plugin_name, timeout)?);

        self.contexts()
            .insert(context.id().to_string(), Arc::clone(&context));
        crate::log_debug!("Created sandbox context {} for '{}'", context.id(), plugin_name);

        Ok(context)
    }

    /// Dispose of a context: cancel its timers and drop it from the active set
    pub fn cleanup_context(&self, id: &str) -> bool {
        let removed = self.contexts().remove(id);
        match removed {
            Some(context) => {
                context.dispose();
                true
            }
            None => false,
        }
    }

    /// Tear down every active context
    pub fn cleanup(&self) {
        let drained: Vec<_> = self.contexts().drain().map(|(_, ctx)| ctx).collect();
        let count = drained.len();
        for context in drained {
            context.dispose();
        }
        if count > 0 {
            crate::log_info!("Cleaned up {} sandbox context(s)", count);
        }
    }

    pub fn active_contexts(&self) -> usize {
        self.contexts().len()
    }

    /// Execute plugin source in a fresh context
    ///
    /// Thrown errors, async failures and timeouts all come back as
    /// `Err`; on any failure the context is disposed.
    pub async fn execute(&self, code: &str, options: ExecuteOptions) -> PluginResult<Execution> {
        let plugin_name = options.plugin_name.as_deref().unwrap_or("anonymous");
        let filename = options.filename.as_deref().unwrap_or("plugin.lua");
        let timeout = options.timeout.unwrap_or_else(|| self.limits.timeout());

        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = match self.create_context(plugin_name, options.api.as_ref(), timeout) {
            Ok(context) => {
                let chunk = context.lua().load(code).set_name(format!("={}", filename));
                let outcome = context
                    .state()
                    .run_bounded(timeout, chunk.eval_async::<Value>())
                    .await;
                match outcome {
                    Ok(exports) => Ok(Execution { exports, context }),
                    Err(e) => {
                        self.cleanup_context(context.id());
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed().as_millis() as u64;
        self.counters.total_time_ms.fetch_add(elapsed, Ordering::Relaxed);

        match &result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(PluginError::Timeout { .. }) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                crate::log_warn!("[{}] execution timed out after {}ms", plugin_name, elapsed);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                crate::log_debug!("[{}] execution failed: {}", plugin_name, e);
            }
        }

        result
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            executions: self.counters.executions.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            total_time_ms: self.counters.total_time_ms.load(Ordering::Relaxed),
            active_contexts: self.active_contexts(),
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Table;

    fn fast_sandbox() -> Sandbox {
        Sandbox::new(ResourceLimits {
            timeout_ms: 200,
            ..ResourceLimits::default()
        })
    }

    #[tokio::test]
    async fn test_execute_returns_module_table() {
        let sandbox = fast_sandbox();
        let execution = sandbox
            .execute(
                r#"return { name = "demo", version = "1.0.0" }"#,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let exports = match execution.exports {
            Value::Table(t) => t,
            other => panic!("expected table, got {:?}", other),
        };
        assert_eq!(exports.get::<String>("name").unwrap(), "demo");
        assert_eq!(sandbox.active_contexts(), 1);

        let stats = sandbox.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn test_busy_loop_times_out() {
        let sandbox = fast_sandbox();
        let started = Instant::now();
        let err = sandbox
            .execute("while true do end", ExecuteOptions::default())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, PluginError::Timeout { timeout_ms: 200 }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sandbox.active_contexts(), 0);

        let stats = sandbox.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_pcall_cannot_swallow_timeout() {
        let sandbox = fast_sandbox();
        let err = sandbox
            .execute(
                "while true do pcall(function() while true do end end) end",
                ExecuteOptions::default(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported() {
        let sandbox = fast_sandbox();
        let err = sandbox
            .execute(r#"error("boom")"#, ExecuteOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Execution(ref msg) if msg.contains("boom")));
        assert_eq!(sandbox.stats().failures, 1);
        assert_eq!(sandbox.stats().timeouts, 0);
    }

    #[tokio::test]
    async fn test_blocked_require_fails_execution() {
        let sandbox = fast_sandbox();
        let err = sandbox
            .execute(r#"local io = require("io")"#, ExecuteOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Module 'io' is not allowed in sandbox"));
    }

    #[tokio::test]
    async fn test_cleanup_context_cancels_intervals() {
        let sandbox = fast_sandbox();
        let execution = sandbox
            .execute(
                r#"
ticks = 0
local id = setInterval(function() ticks = ticks + 1 end, 10)
return { interval = id }
"#,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let context = Arc::clone(&execution.context);
        assert_eq!(context.active_timers(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let ticks_before: i64 = context.lua().globals().get("ticks").unwrap();
        assert!(ticks_before > 0);

        assert!(sandbox.cleanup_context(context.id()));
        assert!(context.is_revoked());
        assert_eq!(context.active_timers(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let ticks_after: i64 = context.lua().globals().get("ticks").unwrap();
        assert_eq!(ticks_before, ticks_after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_stops_pending_intervals() {
        const SPINNER: &str = r#"
ticks = 0
setInterval(function() ticks = ticks + 1 end, 10)
while true do end
"#;
        let sandbox = fast_sandbox();
        let context = sandbox
            .create_context("spinner", None, Duration::from_millis(200))
            .unwrap();
        let err = context
            .state()
            .run_bounded(
                Duration::from_millis(200),
                context.lua().load(SPINNER).exec_async(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }));
        assert!(context.is_revoked());
        assert_eq!(context.active_timers(), 0);

        let ticks_before: i64 = context.lua().globals().get("ticks").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let ticks_after: i64 = context.lua().globals().get("ticks").unwrap();
        assert_eq!(ticks_before, ticks_after);
        assert!(sandbox.cleanup_context(context.id()));

        let err = sandbox
            .execute(SPINNER, ExecuteOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Timeout { .. }));
        assert_eq!(sandbox.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_clear_timeout_prevents_callback() {
        let sandbox = fast_sandbox();
        let execution = sandbox
            .execute(
                r#"
fired = false
local id = setTimeout(function() fired = true end, 20)
clearTimeout(id)
return {}
"#,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fired: bool = execution.context.lua().globals().get("fired").unwrap();
        assert!(!fired);
    }

    #[tokio::test]
    async fn test_cleanup_tears_down_all_contexts() {
        let sandbox = fast_sandbox();
        for _ in 0..3 {
            sandbox
                .execute("return {}", ExecuteOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(sandbox.active_contexts(), 3);
        sandbox.cleanup();
        assert_eq!(sandbox.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_logging_facade_is_prefixed_per_plugin() {
        let sandbox = fast_sandbox();
        let execution = sandbox
            .execute(
                r#"log.info("hello"); print("also fine"); return { ok = true }"#,
                ExecuteOptions {
                    plugin_name: Some("greeter".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(execution.context.plugin_name(), "greeter");
        let exports: Table = match execution.exports {
            Value::Table(t) => t,
            _ => panic!("expected table"),
        };
        assert!(exports.get::<bool>("ok").unwrap());
    }
}

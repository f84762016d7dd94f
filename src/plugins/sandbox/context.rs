//! Sandbox execution contexts
//!
//! A context owns one Lua state plus everything plugin code scheduled through
//! it: timer tasks, the execution deadline checked by the VM hook, and the
//! cancellation token that revokes the context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mlua::{Function, HookTriggers, Lua, MultiValue, VmState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{HOOK_INSTRUCTION_INTERVAL, MIN_INTERVAL_MS};
use crate::core::error::{PluginError, PluginResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared state of a context, reachable from the VM hook and timer tasks
///
/// Holds no reference to the Lua state itself, so closures registered in Lua
/// can keep it alive without a reference cycle.
pub(crate) struct ContextState {
    plugin_name: String,
    timeout: Duration,
    deadline: Mutex<Option<Instant>>,
    timed_out: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_timer_id: AtomicU64,
}

impl ContextState {
    fn new(plugin_name: &str, timeout: Duration) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            timeout,
            deadline: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Called by the VM hook every few instructions
    fn check(&self) -> mlua::Result<VmState> {
        if self.is_revoked() {
            return Err(mlua::Error::runtime("sandbox context has been revoked"));
        }
        let expired = lock(&self.deadline).is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            self.timed_out.store(true, Ordering::SeqCst);
            return Err(mlua::Error::runtime("execution timed out"));
        }
        Ok(VmState::Continue)
    }

    fn arm(&self, timeout: Duration) {
        self.timed_out.store(false, Ordering::SeqCst);
        *lock(&self.deadline) = Some(Instant::now() + timeout);
    }

    fn disarm(&self) {
        *lock(&self.deadline) = None;
    }

    /// Run a Lua future under the context deadline
    ///
    /// The future is raced against a timer while the VM hook interrupts code
    /// that never yields. Either way the losing side is dropped. Runs on one
    /// context are serialized, so each one owns the deadline while it is
    /// armed. A timeout revokes the context.
    pub(crate) async fn run_bounded<T, F>(&self, timeout: Duration, fut: F) -> PluginResult<T>
    where
        F: Future<Output = mlua::Result<T>>,
    {
        let _running = self.run_lock.lock().await;
        if self.is_revoked() {
            return Err(PluginError::Execution(
                "sandbox context has been revoked".to_string(),
            ));
        }

        self.arm(timeout);
        let outcome = tokio::time::timeout(timeout, fut).await;
        self.disarm();

        let timeout_ms = timeout.as_millis() as u64;
        // A tripped hook counts even if the error was converted on the way out
        let timed_out = match &outcome {
            Ok(_) => self.timed_out.swap(false, Ordering::SeqCst),
            Err(_) => true,
        };
        if timed_out {
            let cancelled = self.revoke();
            crate::log_warn!(
                "[{}] execution exceeded {}ms, context revoked ({} timer(s) cancelled)",
                self.plugin_name,
                timeout_ms,
                cancelled
            );
            return Err(PluginError::Timeout { timeout_ms });
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PluginError::Execution(e.to_string())),
            Err(_) => Err(PluginError::Timeout { timeout_ms }),
        }
    }

    fn schedule(self: &Arc<Self>, callback: Function, delay: Duration, repeat: bool) -> mlua::Result<u64> {
        if self.is_revoked() {
            return Err(mlua::Error::runtime("sandbox context has been revoked"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| mlua::Error::runtime("timers require an async runtime"))?;

        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(self);
        let token = self.cancel.child_token();

        // Held across the spawn so a task finishing early cannot run its
        // removal before the insert below
        let mut timers = lock(&self.timers);
        let task = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let result = state
                    .run_bounded(state.timeout, callback.call_async::<()>(()))
                    .await;
                if let Err(e) = result {
                    crate::log_warn!("[{}] timer {} callback failed: {}", state.plugin_name, id, e);
                }

                if !repeat || state.is_revoked() {
                    break;
                }
            }
            lock(&state.timers).remove(&id);
        });

        timers.insert(id, task);
        Ok(id)
    }

    fn clear_timer(&self, id: u64) -> bool {
        match lock(&self.timers).remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn active_timers(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Revoke the context and abort every outstanding timer
    pub(crate) fn revoke(&self) -> usize {
        self.cancel.cancel();
        let mut timers = lock(&self.timers);
        let count = timers.len();
        for (_, task) in timers.drain() {
            task.abort();
        }
        count
    }
}

/// One isolated execution environment
pub struct SandboxContext {
    id: String,
    lua: Lua,
    state: Arc<ContextState>,
    created_at: DateTime<Utc>,
}

impl SandboxContext {
    pub(crate) fn new(lua: Lua, plugin_name: &str, timeout: Duration) -> mlua::Result<Self> {
        let state = Arc::new(ContextState::new(plugin_name, timeout));

        // Global so that the coroutine threads behind async calls inherit it
        let hook_state = Arc::clone(&state);
        lua.set_global_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| hook_state.check(),
        )?;

        install_pcall_guard(&lua, &state)?;
        register_timers(&lua, &state)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            lua,
            state,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        &self.state.plugin_name
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_revoked(&self) -> bool {
        self.state.is_revoked()
    }

    pub fn active_timers(&self) -> usize {
        self.state.active_timers()
    }

    pub(crate) fn state(&self) -> &Arc<ContextState> {
        &self.state
    }

    /// Dispose of the context: cancels timers and intervals, blocks further
    /// execution. Returns the number of timers that were still pending.
    pub fn dispose(&self) -> usize {
        let cancelled = self.state.revoke();
        if cancelled > 0 {
            crate::log_debug!(
                "[{}] cancelled {} pending timer(s) on context {}",
                self.plugin_name(),
                cancelled,
                self.id
            );
        }
        cancelled
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        self.state.revoke();
    }
}

/// Wrap `pcall`/`xpcall` so a timeout or revocation cannot be swallowed
///
/// The wrappers stay Lua functions, which keeps protected calls yieldable for
/// async capability calls.
fn install_pcall_guard(lua: &Lua, state: &Arc<ContextState>) -> mlua::Result<()> {
    let guard_state = Arc::clone(state);
    let guard = lua.create_function(move |_lua, results: MultiValue| {
        if guard_state.timed_out() {
            return Err(mlua::Error::runtime("execution timed out"));
        }
        if guard_state.is_revoked() {
            return Err(mlua::Error::runtime("sandbox context has been revoked"));
        }
        Ok(results)
    })?;

    let globals = lua.globals();
    let pcall: Function = globals.get("pcall")?;
    let xpcall: Function = globals.get("xpcall")?;

    lua.load(
        r#"
local guard, raw_pcall, raw_xpcall = ...
pcall = function(...) return guard(raw_pcall(...)) end
xpcall = function(...) return guard(raw_xpcall(...)) end
"#,
    )
    .set_name("=sandbox")
    .call::<()>((guard, pcall, xpcall))
}

/// Register `setTimeout`/`setInterval`/`clearTimeout`/`clearInterval`
fn register_timers(lua: &Lua, state: &Arc<ContextState>) -> mlua::Result<()> {
    let globals = lua.globals();
    let max_delay = state.timeout;

    let timer_state = Arc::clone(state);
    let set_timeout = lua.create_function(move |_lua, (callback, delay): (Function, Option<u64>)| {
        let delay = Duration::from_millis(delay.unwrap_or(0)).min(max_delay);
        timer_state.schedule(callback, delay, false)
    })?;
    globals.set("setTimeout", set_timeout)?;

    let timer_state = Arc::clone(state);
    let set_interval = lua.create_function(move |_lua, (callback, delay): (Function, Option<u64>)| {
        let delay = Duration::from_millis(delay.unwrap_or(0).max(MIN_INTERVAL_MS));
        timer_state.schedule(callback, delay, true)
    })?;
    globals.set("setInterval", set_interval)?;

    let timer_state = Arc::clone(state);
    let clear = lua.create_function(move |_lua, id: Option<u64>| {
        Ok(id.is_some_and(|id| timer_state.clear_timer(id)))
    })?;
    globals.set("clearTimeout", clear.clone())?;
    globals.set("clearInterval", clear)?;

    Ok(())
}

//! Global bindings available to sandboxed plugin code
//!
//! Builds a Lua state with a curated global set: the safe standard libraries,
//! a plugin-prefixed logging facade, a restricted `require`, and a handful of
//! host-implemented helper modules (`json`, `base64`, `buffer`, `text`).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value};
use serde_json::Value as JsonValue;

use crate::config::{MAX_BUFFER_SIZE, ResourceLimits};
use crate::core::logger::{LogLevel, log_plugin};
use crate::plugins::capability::CapabilityHandle;

/// Modules `require` is allowed to resolve
pub const ALLOWED_MODULES: &[&str] = &[
    "json",
    "base64",
    "buffer",
    "text",
    "string",
    "table",
    "math",
    "utf8",
    "coroutine",
];

/// Base-library globals that would let plugin code escape the sandbox
const BLOCKED_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "loadstring", "collectgarbage"];

const MODULES_KEY: &str = "sandbox.modules";
pub(crate) const API_KEY: &str = "sandbox.api";

/// Create a Lua state with the sandbox global set installed
pub fn create_sandbox_lua(
    plugin_name: &str,
    limits: &ResourceLimits,
    api: Option<&CapabilityHandle>,
) -> mlua::Result<Lua> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH | StdLib::COROUTINE;
    let lua = Lua::new_with(libs, LuaOptions::default())?;

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }
    // Bytecode dumps can be fed back into a loader elsewhere
    if let Ok(string) = globals.get::<Table>("string") {
        string.set("dump", Value::Nil)?;
    }

    lua.set_memory_limit(limits.memory_limit)?;

    register_logging_api(&lua, plugin_name)?;
    register_modules(&lua)?;
    register_require(&lua)?;

    if let Some(api) = api {
        bind_api(&lua, api)?;
    }

    Ok(lua)
}

/// Expose the capability handle as the global `api`
pub(crate) fn bind_api(lua: &Lua, api: &CapabilityHandle) -> mlua::Result<()> {
    let table = api.create_lua_table(lua)?;
    lua.set_named_registry_value(API_KEY, table.clone())?;
    lua.globals().set("api", table)?;
    Ok(())
}

/// Register the logging facade
///
/// Messages are prefixed with the plugin name and routed to the runtime logger.
/// `print` is an alias of `log.info`.
pub fn register_logging_api(lua: &Lua, plugin_name: &str) -> mlua::Result<()> {
    let log = lua.create_table()?;
    let globals = lua.globals();

    let levels = [
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warning),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ];

    for (name, level) in levels {
        let plugin = plugin_name.to_string();
        let func = lua.create_function(move |_lua, msg: String| {
            log_plugin(level, &plugin, &msg);
            Ok(())
        })?;
        log.set(name, func.clone())?;
        globals.set(format!("log_{}", name), func.clone())?;
        if level == LogLevel::Info {
            globals.set("print", func)?;
        }
    }

    globals.set("log", log)?;
    Ok(())
}

/// Replace `require` with an allow-list lookup
fn register_require(lua: &Lua) -> mlua::Result<()> {
    let require = lua.create_function(|lua, name: String| {
        if !ALLOWED_MODULES.contains(&name.as_str()) {
            return Err(mlua::Error::runtime(format!(
                "Module '{}' is not allowed in sandbox",
                name
            )));
        }
        let modules: Table = lua.named_registry_value(MODULES_KEY)?;
        modules.get::<Value>(name)
    })?;
    lua.globals().set("require", require)?;
    Ok(())
}

fn register_modules(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let modules = lua.create_table()?;

    for name in ["string", "table", "math", "utf8", "coroutine"] {
        modules.set(name, globals.get::<Value>(name)?)?;
    }

    let json = create_json_module(lua)?;
    let base64 = create_base64_module(lua)?;
    let buffer = create_buffer_module(lua)?;
    let text = create_text_module(lua)?;

    for (name, module) in [("json", json), ("base64", base64), ("buffer", buffer), ("text", text)] {
        modules.set(name, module.clone())?;
        globals.set(name, module)?;
    }

    lua.set_named_registry_value(MODULES_KEY, modules)?;
    Ok(())
}

fn create_json_module(lua: &Lua) -> mlua::Result<Table> {
    let json = lua.create_table()?;

    let encode = lua.create_function(|lua, value: Value| {
        let value: JsonValue = lua.from_value(value)?;
        serde_json::to_string(&value).map_err(mlua::Error::external)
    })?;
    json.set("encode", encode)?;

    let decode = lua.create_function(|lua, input: String| {
        let value: JsonValue = serde_json::from_str(&input).map_err(mlua::Error::external)?;
        lua.to_value(&value)
    })?;
    json.set("decode", decode)?;

    Ok(json)
}

fn create_base64_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let encode = lua.create_function(|_lua, input: mlua::String| {
        Ok(BASE64.encode(input.as_bytes().to_vec()))
    })?;
    module.set("encode", encode)?;

    let decode = lua.create_function(|lua, input: String| {
        let bytes = BASE64
            .decode(input.trim())
            .map_err(|e| mlua::Error::runtime(format!("Invalid base64 input: {}", e)))?;
        lua.create_string(&bytes)
    })?;
    module.set("decode", decode)?;

    Ok(module)
}

/// Byte buffers, capped at `MAX_BUFFER_SIZE`
fn create_buffer_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let alloc = lua.create_function(|lua, (size, fill): (i64, Option<u8>)| {
        if size < 0 || size as u64 > MAX_BUFFER_SIZE as u64 {
            return Err(mlua::Error::runtime(format!(
                "Buffer size {} exceeds maximum allowed ({})",
                size, MAX_BUFFER_SIZE
            )));
        }
        lua.create_string(vec![fill.unwrap_or(0); size as usize])
    })?;
    module.set("alloc", alloc)?;

    let length = lua.create_function(|_lua, input: mlua::String| Ok(input.as_bytes().len()))?;
    module.set("length", length)?;

    Ok(module)
}

/// UTF-8 text <-> byte arrays
fn create_text_module(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let encode = lua.create_function(|_lua, input: String| Ok(input.into_bytes()))?;
    module.set("encode", encode)?;

    let decode = lua.create_function(|_lua, bytes: Vec<u8>| {
        String::from_utf8(bytes)
            .map_err(|e| mlua::Error::runtime(format!("Invalid UTF-8 input: {}", e)))
    })?;
    module.set("decode", decode)?;

    Ok(module)
}

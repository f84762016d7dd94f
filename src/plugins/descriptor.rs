//! Plugin descriptors
//!
//! The static facts extracted from a plugin module once, at load time.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mlua::{Lua, LuaSerdeExt, Table, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::config::{MAX_DESCRIPTION_LENGTH, MAX_NAME_LENGTH};
use crate::core::error::{PluginError, PluginResult};
use crate::plugins::capability::{PermissionLevel, Permissions};

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static SEMVER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$").unwrap()
});

/// Identity and static metadata of a loaded plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Permissions,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

/// Check a plugin name against the identifier rules
pub fn validate_name(name: &str) -> PluginResult<()> {
    if name.is_empty() {
        return Err(PluginError::Validation("Plugin must have a name".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(PluginError::Validation(format!(
            "Plugin name '{}' exceeds {} characters",
            name, MAX_NAME_LENGTH
        )));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(PluginError::Validation(format!(
            "Plugin name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

pub fn validate_version(version: &str) -> PluginResult<()> {
    if version.is_empty() {
        return Err(PluginError::Validation("Plugin must have a version".to_string()));
    }
    if !SEMVER_PATTERN.is_match(version) {
        return Err(PluginError::Validation(format!(
            "Plugin version '{}' is not a semantic version (MAJOR.MINOR.PATCH)",
            version
        )));
    }
    Ok(())
}

// Module tables are read with raw access only; metamethods never run here

/// First present field among `names` (camelCase name first, snake_case alias second)
fn field(table: &Table, names: &[&str]) -> mlua::Result<Value> {
    for name in names {
        let value: Value = table.raw_get(*name)?;
        if !value.is_nil() {
            return Ok(value);
        }
    }
    Ok(Value::Nil)
}

fn optional_string(table: &Table, key: &str) -> PluginResult<Option<String>> {
    match table.raw_get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        Value::Integer(i) => Ok(Some(i.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(PluginError::Validation(format!(
            "Field '{}' must be a string, got {}",
            key,
            other.type_name()
        ))),
    }
}

impl PluginDescriptor {
    /// Extract and validate the descriptor from a plugin module table
    pub fn from_exports(exports: &Table, path: &Path) -> PluginResult<Self> {
        let name = optional_string(exports, "name")?.unwrap_or_default();
        validate_name(&name)?;

        let version = optional_string(exports, "version")?.unwrap_or_default();
        validate_version(&version)?;

        let description = optional_string(exports, "description")?.unwrap_or_default();
        if description.chars().count() > MAX_DESCRIPTION_LENGTH {
            return Err(PluginError::Validation(format!(
                "Plugin description exceeds {} characters",
                MAX_DESCRIPTION_LENGTH
            )));
        }

        let author = optional_string(exports, "author")?;

        let dependencies = match exports.raw_get::<Value>("dependencies")? {
            Value::Nil => Vec::new(),
            Value::Table(deps) => (1..=deps.raw_len())
                .map(|i| deps.raw_get::<String>(i))
                .collect::<mlua::Result<Vec<_>>>()
                .map_err(|e| {
                    PluginError::Validation(format!("Invalid dependencies list: {}", e))
                })?,
            other => {
                return Err(PluginError::Validation(format!(
                    "Field 'dependencies' must be a list, got {}",
                    other.type_name()
                )));
            }
        };
        for dep in &dependencies {
            validate_name(dep)?;
            if *dep == name {
                return Err(PluginError::Validation(format!(
                    "Plugin '{}' cannot depend on itself",
                    name
                )));
            }
        }

        let permissions = parse_permissions(exports)?;

        Ok(Self {
            name,
            version,
            description,
            author,
            dependencies,
            permissions,
            path: path.to_path_buf(),
            loaded_at: Utc::now(),
        })
    }
}

fn parse_permissions(exports: &Table) -> PluginResult<Permissions> {
    let mut permissions = Permissions::new();
    match exports.raw_get::<Value>("permissions")? {
        Value::Nil => {}
        Value::Table(table) => {
            for pair in table.pairs::<String, String>() {
                let (category, level) = pair.map_err(|e| {
                    PluginError::Validation(format!("Invalid permissions map: {}", e))
                })?;
                permissions.insert(category, level.parse::<PermissionLevel>()?);
            }
        }
        other => {
            return Err(PluginError::Validation(format!(
                "Field 'permissions' must be a table, got {}",
                other.type_name()
            )));
        }
    }
    Ok(permissions)
}

/// Read a module's `defaultConfig` (or `default_config`) as a JSON object
pub fn default_config(lua: &Lua, exports: &Table) -> PluginResult<Map<String, JsonValue>> {
    let value = field(exports, &["defaultConfig", "default_config"])?;
    if value.is_nil() {
        return Ok(Map::new());
    }
    match lua.from_value::<JsonValue>(value)? {
        JsonValue::Object(map) => Ok(map),
        // An empty Lua table deserializes as an empty array
        JsonValue::Array(items) if items.is_empty() => Ok(Map::new()),
        other => Err(PluginError::Validation(format!(
            "defaultConfig must be a table of settings, got {}",
            other
        ))),
    }
}

pub(crate) fn hook_function(exports: &Table, names: &[&str]) -> PluginResult<Option<mlua::Function>> {
    match field(exports, names)? {
        Value::Nil => Ok(None),
        Value::Function(f) => Ok(Some(f)),
        other => Err(PluginError::Validation(format!(
            "Hook '{}' must be a function, got {}",
            names[0],
            other.type_name()
        ))),
    }
}

// Plugin Runtime - Error Taxonomy
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types shared by the sandbox, loader, registry and manager
//!
//! Every public runtime operation returns [`PluginResult`]. Failures carry the
//! precondition that failed (missing dependency names, blocking dependents,
//! offending validation rules) so callers never need to parse messages.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::plugins::capability::PermissionLevel;

pub type PluginResult<T> = Result<T, PluginError>;

/// Coarse classification of a [`PluginError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Execution,
    Timeout,
    Policy,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Policy => "policy",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Plugin '{0}' is not loaded")]
    PluginNotFound(String),

    #[error("Invalid plugin file extension for {}, allowed: {}", .path.display(), .allowed.join(", "))]
    InvalidExtension {
        path: PathBuf,
        allowed: Vec<String>,
    },

    #[error("Invalid plugin: {0}")]
    Validation(String),

    #[error("Plugin code rejected by security policy: {}", .0.join("; "))]
    PolicyViolation(Vec<String>),

    #[error("Plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("Plugin '{plugin}' has unmet dependencies (missing: [{}], disabled: [{}])", .missing.join(", "), .disabled.join(", "))]
    UnmetDependencies {
        plugin: String,
        missing: Vec<String>,
        disabled: Vec<String>,
    },

    #[error("Plugin '{plugin}' is required by: {}", .dependents.join(", "))]
    HasDependents {
        plugin: String,
        dependents: Vec<String>,
    },

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Plugin execution failed: {0}")]
    Execution(String),

    #[error("Plugin execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Plugin '{plugin}' init failed: {reason}")]
    InitFailed { plugin: String, reason: String },

    #[error("No capability context for plugin '{0}'")]
    NoCapabilityContext(String),

    #[error("Plugin '{plugin}' lacks {required:?} access to '{category}'")]
    PermissionDenied {
        plugin: String,
        category: String,
        required: PermissionLevel,
    },

    #[error("Unknown capability command: {0}")]
    UnknownCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::FileNotFound(_)
            | PluginError::PluginNotFound(_)
            | PluginError::UnknownCommand(_) => ErrorKind::NotFound,
            PluginError::InvalidExtension { .. }
            | PluginError::Validation(_)
            | PluginError::Serialization(_) => ErrorKind::Validation,
            PluginError::AlreadyLoaded(_)
            | PluginError::UnmetDependencies { .. }
            | PluginError::HasDependents { .. }
            | PluginError::CyclicDependency(_) => ErrorKind::Conflict,
            PluginError::Execution(_) | PluginError::InitFailed { .. } => ErrorKind::Execution,
            PluginError::Timeout { .. } => ErrorKind::Timeout,
            PluginError::PolicyViolation(_)
            | PluginError::NoCapabilityContext(_)
            | PluginError::PermissionDenied { .. } => ErrorKind::Policy,
            PluginError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<mlua::Error> for PluginError {
    fn from(err: mlua::Error) -> Self {
        PluginError::Execution(err.to_string())
    }
}

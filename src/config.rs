use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

// Sandbox execution defaults
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024; // 64 MB
pub const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 1_000_000;
pub const DEFAULT_MAX_RECURSION_DEPTH: u32 = 1_000;
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 100_000;
pub const DEFAULT_MAX_OBJECT_PROPERTIES: usize = 10_000;

// Minimum setInterval delay, keeps plugins from busy-looping on timers
pub const MIN_INTERVAL_MS: u64 = 10;
// Largest buffer a plugin may allocate through `buffer.alloc`
pub const MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024; // 10 MB
// VM instructions between deadline checks
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

// Plugin descriptor limits
pub const MAX_NAME_LENGTH: usize = 64;
pub const MAX_DESCRIPTION_LENGTH: usize = 500;

// Plugin files
pub const ALLOWED_EXTENSIONS: &[&str] = &["lua"];
pub const INDEX_FILE: &str = "init.lua";

// Runtime paths
pub const DEFAULT_PLUGINS_DIR: &str = "plugins";
pub const DEFAULT_CONFIG_FILE: &str = "./cache/plugin-config.json";
pub const RUNTIME_CONFIG_FILE: &str = "plugin-runtime.toml";

// Lifecycle event channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resource limits attached to a sandbox
///
/// `timeout_ms` and `memory_limit` are enforced by the VM. The remaining
/// limits are declared policy for host-specific enforcement layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_limit: usize,
    pub max_loop_iterations: u64,
    pub max_recursion_depth: u32,
    pub max_array_length: usize,
    pub max_object_properties: usize,
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
            max_object_properties: DEFAULT_MAX_OBJECT_PROPERTIES,
        }
    }
}

/// Runtime configuration, read from `plugin-runtime.toml` when present
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory scanned by `initialize()`
    pub plugins_dir: PathBuf,
    /// Persisted plugin configuration document
    pub config_file: PathBuf,
    /// Load every plugin in `plugins_dir` on initialize
    pub autoload: bool,
    /// Run plugins inside the sandbox (disable only for trusted plugins)
    pub use_sandbox: bool,
    pub limits: ResourceLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            autoload: true,
            use_sandbox: true,
            limits: ResourceLimits::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(RUNTIME_CONFIG_FILE));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Override settings from `PLUGIN_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("PLUGIN_DIR") {
            self.plugins_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("PLUGIN_CONFIG_FILE") {
            self.config_file = PathBuf::from(file);
        }
        if let Some(timeout) = std::env::var("PLUGIN_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.limits.timeout_ms = timeout;
        }
        self.use_sandbox = std::env::var("PLUGIN_SANDBOX")
            .map(|v| v.parse().unwrap_or(self.use_sandbox))
            .unwrap_or(self.use_sandbox);
    }
}

#[derive(Parser)]
#[command(author, version, about = "A sandboxed Lua plugin runtime")]
pub struct Cli {
    /// Runtime configuration file (default: ./plugin-runtime.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Plugins directory
    #[arg(short, long)]
    pub plugins_dir: Option<PathBuf>,

    /// Persisted plugin configuration document
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Execution timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Run plugins without the sandbox (trusted plugins only)
    #[arg(long)]
    pub no_sandbox: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,

    /// Write log lines in journald format
    #[arg(long)]
    pub journald: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load and enable every plugin, then run until interrupted (default)
    Run,
    /// Statically check plugin sources without executing them
    Validate {
        /// Plugin files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Load the plugins directory and list what was found
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Load the plugins directory and print the registry snapshot
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load the plugins directory and apply a registry snapshot
    Import {
        /// Snapshot produced by `export`
        input: PathBuf,
    },
}

impl Cli {
    /// Command-line flags take precedence over file and environment settings
    pub fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(dir) = &self.plugins_dir {
            config.plugins_dir = dir.clone();
        }
        if let Some(file) = &self.config_file {
            config.config_file = file.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.limits.timeout_ms = timeout;
        }
        if self.no_sandbox {
            config.use_sandbox = false;
        }
    }
}

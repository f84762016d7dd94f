// Plugin Runtime - Systemd-Style Logger
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Systemd-style logging implementation compatible with journald
//!
//! The runtime and every plugin log through this logger. Plugin output is
//! routed here by the sandbox logging facade with a `[plugin-name]` prefix,
//! so a single stream shows host and plugin activity side by side.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log levels following systemd priority conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Error conditions (3)
    Error = 3,
    /// Warning conditions (4)
    Warning = 4,
    /// Normal but significant condition (5)
    Notice = 5,
    /// Informational message (6)
    Info = 6,
    /// Debug-level message (7)
    Debug = 7,
}

impl LogLevel {
    /// Get the priority number for systemd
    pub fn priority(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Get color code for terminal output
    pub fn color_code(self) -> &'static str {
        match self {
            LogLevel::Error => "\x1b[31m",   // Red
            LogLevel::Warning => "\x1b[33m", // Yellow
            LogLevel::Notice => "\x1b[36m",  // Cyan
            LogLevel::Info => "\x1b[32m",    // Green
            LogLevel::Debug => "\x1b[37m",   // White/gray
        }
    }
}

/// One log line, optionally attributed to a plugin
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: LogLevel,
    pub target: &'a str,
    pub plugin: Option<&'a str>,
    pub message: &'a str,
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub min_level: LogLevel,
    /// Whether to use colors in output
    pub use_colors: bool,
    /// Whether to include timestamps
    pub include_timestamp: bool,
    /// Whether to include target/module information
    pub include_target: bool,
    /// Whether to format for journald (structured format)
    pub journald_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            use_colors: atty::is(atty::Stream::Stderr),
            include_timestamp: true,
            include_target: false,
            journald_format: false,
        }
    }
}

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

/// Systemd-style logger implementation
#[derive(Debug)]
pub struct Logger {
    config: LoggerConfig,
    min_level: AtomicU8,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            min_level: AtomicU8::new(config.min_level.priority()),
            config,
        }
    }

    /// Initialize the global logger
    pub fn init(config: LoggerConfig) -> Result<(), LoggerError> {
        let logger = Self::new(config);

        let mut global_logger = LOGGER.lock().map_err(|_| LoggerError::InitError)?;
        if global_logger.is_some() {
            return Err(LoggerError::AlreadyInitialized);
        }
        *global_logger = Some(logger);

        Ok(())
    }

    /// Set the minimum log level at runtime
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level.priority(), Ordering::Relaxed);
    }

    /// Check if a log level should be output
    pub fn should_log(&self, level: LogLevel) -> bool {
        level.priority() <= self.min_level.load(Ordering::Relaxed)
    }

    /// Write a record to stderr if its level passes the filter
    pub fn log(&self, record: &Record<'_>) {
        if !self.should_log(record.level) {
            return;
        }

        let timestamp = if self.config.include_timestamp {
            Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            )
        } else {
            None
        };

        let formatted = if self.config.journald_format {
            self.format_journald(record, timestamp)
        } else {
            self.format_terminal(record, timestamp)
        };

        eprintln!("{}", formatted);
    }

    /// Format for journald structured output
    ///
    /// Plugin records carry a `PLUGIN=` field so `journalctl PLUGIN=<name>`
    /// selects one plugin's output.
    fn format_journald(&self, record: &Record<'_>, timestamp: Option<u64>) -> String {
        let mut output = String::new();

        output.push_str(&format!("PRIORITY={}\n", record.level.priority()));
        output.push_str(&format!("MESSAGE={}\n", record.message));

        if let Some(plugin) = record.plugin {
            output.push_str(&format!("PLUGIN={}\n", plugin));
        }

        if self.config.include_target && !record.target.is_empty() {
            output.push_str(&format!("CODE_FILE={}\n", record.target));
        }

        if let Some(ts) = timestamp {
            output.push_str(&format!("_SOURCE_REALTIME_TIMESTAMP={}\n", ts * 1_000_000));
        }

        output.push_str("SYSLOG_IDENTIFIER=plugin-runtime\n");

        output
    }

    /// Format for terminal output
    fn format_terminal(&self, record: &Record<'_>, timestamp: Option<u64>) -> String {
        let Record {
            level,
            target,
            plugin,
            message,
        } = *record;
        let mut output = String::new();

        if let Some(ts) = timestamp {
            let datetime = chrono::DateTime::from_timestamp(ts as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            output.push_str(&format!("{} ", datetime));
        }

        if self.config.include_target && !target.is_empty() {
            output.push_str(&format!("{} ", target));
        }

        // Status-line messages carry their own bracketed status
        if let Some(status_level) = status_level(message) {
            if self.config.use_colors {
                output.push_str(&format!("{}{}\x1b[0m", status_level.color_code(), message));
            } else {
                output.push_str(message);
            }
            return output;
        }

        if self.config.use_colors {
            output.push_str(&format!("{}[{}]\x1b[0m ", level.color_code(), level.as_str()));
        } else {
            output.push_str(&format!("[{}] ", level.as_str()));
        }
        if let Some(plugin) = plugin {
            output.push_str(&format!("[{}] ", plugin));
        }
        output.push_str(message);

        output
    }
}

/// Detect systemd-style status prefixes produced by the `log_init_*` helpers
fn status_level(message: &str) -> Option<LogLevel> {
    if message.starts_with("[  FAILED ]") {
        Some(LogLevel::Error)
    } else if message.starts_with("[   WARN ]") {
        Some(LogLevel::Warning)
    } else if message.starts_with("[   OK   ]") {
        Some(LogLevel::Info)
    } else if message.starts_with("[*]") {
        Some(LogLevel::Notice)
    } else {
        None
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Warning, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Notice, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

fn dispatch(record: &Record<'_>) {
    if let Ok(logger_guard) = LOGGER.lock() {
        if let Some(ref logger) = *logger_guard {
            logger.log(record);
        }
    }
}

/// Internal function to log with level
pub fn log_with_level(level: LogLevel, target: &str, message: &str) {
    dispatch(&Record {
        level,
        target,
        plugin: None,
        message,
    });
}

/// Log a line emitted by plugin code
pub fn log_plugin(level: LogLevel, plugin: &str, message: &str) {
    dispatch(&Record {
        level,
        target: "plugin",
        plugin: Some(plugin),
        message,
    });
}

/// Systemd-style initialization message with loading indicator
pub fn log_init_start(service_name: &str) {
    let message = format!("[*] Starting {}...", service_name);
    log_with_level(LogLevel::Notice, module_path!(), &message);
}

/// Systemd-style success message with details
pub fn log_init_ok_with_details(service_name: &str, details: &str) {
    let message = format!("[   OK   ] Starting {} ({})", service_name, details);
    log_with_level(LogLevel::Info, module_path!(), &message);
}

/// Systemd-style failure message with FAILED status
pub fn log_init_failed(service_name: &str, error: &str) {
    let message = format!("[  FAILED ] Starting {} - {}", service_name, error);
    log_with_level(LogLevel::Error, module_path!(), &message);
}

/// Systemd-style warning message with WARN status
pub fn log_init_warn(service_name: &str, warning: &str) {
    let message = format!("[   WARN ] Starting {} - {}", service_name, warning);
    log_with_level(LogLevel::Warning, module_path!(), &message);
}

/// Systemd-style task starting message
pub fn log_task_start(task_name: &str) {
    let message = format!("[*] {}... ", task_name);
    log_with_level(LogLevel::Notice, module_path!(), &message);
}

/// Systemd-style task completion with details
pub fn log_task_complete_with_details(task_name: &str, details: &str) {
    let message = format!("[   OK   ] {} ({})", task_name, details);
    log_with_level(LogLevel::Info, module_path!(), &message);
}

/// Logger initialization errors
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Logger already initialized")]
    AlreadyInitialized,
    #[error("Failed to initialize logger")]
    InitError,
}

/// Initialize logger from CLI arguments
pub fn init_from_args(debug: bool, journald: bool) -> Result<(), LoggerError> {
    let min_level = if debug { LogLevel::Debug } else { LogLevel::Info };

    let config = LoggerConfig {
        min_level,
        use_colors: atty::is(atty::Stream::Stderr) && !journald,
        include_timestamp: !journald,
        include_target: debug,
        journald_format: journald,
    };

    Logger::init(config)
}

/*
 * Plugin Runtime
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::FutureExt;
use serde_json::json;

use plugin_runtime::config::{ALLOWED_EXTENSIONS, Cli, Command, INDEX_FILE, RuntimeConfig};
use plugin_runtime::core::logger::{
    init_from_args, log_init_failed, log_init_ok_with_details, log_init_start, log_init_warn,
};
use plugin_runtime::plugins::sandbox::validate::validate_code;
use plugin_runtime::plugins::sandbox::Severity;
use plugin_runtime::plugins::{LocalBus, PermissionLevel, PluginManager, RegistrySnapshot};
use plugin_runtime::{log_info, log_warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = Cli::parse();

    init_from_args(args.debug, args.journald)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    let mut config = RuntimeConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Validate { paths } => validate(&paths),
        Command::List { json } => list(config, json).await,
        Command::Export { output } => export(config, output.as_deref()).await,
        Command::Import { input } => import(config, &input).await,
    }
}

/// Host commands offered to plugins by the standalone binary
fn host_bus() -> Arc<LocalBus> {
    let bus = Arc::new(LocalBus::new());
    bus.register_command("runtime.time", PermissionLevel::Read, |_| {
        async { Ok(json!(chrono::Utc::now().to_rfc3339())) }.boxed()
    });
    bus.register_command("runtime.version", PermissionLevel::Read, |_| {
        async { Ok(json!(env!("CARGO_PKG_VERSION"))) }.boxed()
    });
    bus
}

async fn start(config: RuntimeConfig) -> Result<PluginManager> {
    log_init_start("Plugin runtime");

    let manager = match PluginManager::new(config, host_bus()) {
        Ok(manager) => manager,
        Err(e) => {
            log_init_failed("Plugin runtime", &e.to_string());
            return Err(e.into());
        }
    };

    match manager.initialize().await {
        Ok(Some(report)) => {
            let summary = format!(
                "{} loaded, {} failed, {} skipped",
                report.loaded.len(),
                report.failed.len(),
                report.skipped.len()
            );
            if report.failed.is_empty() {
                log_init_ok_with_details("Plugin runtime", &summary);
            } else {
                log_init_warn("Plugin runtime", &summary);
                for failure in &report.failed {
                    log_warn!("{}: {}", failure.path.display(), failure.error);
                }
            }
        }
        Ok(None) => log_init_ok_with_details("Plugin runtime", "autoload disabled"),
        Err(e) => {
            log_init_failed("Plugin runtime", &e.to_string());
            return Err(e.into());
        }
    }

    Ok(manager)
}

async fn run(config: RuntimeConfig) -> Result<()> {
    let manager = start(config).await?;
    let enabled = manager.enable_all().await?;
    log_info!("Enabled {} plugin(s)", enabled.len());

    let mut events = manager.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let plugin_runtime::PluginEvent::PluginError { name, error } = event {
                log_warn!("Plugin '{}' reported an error: {}", name, error);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log_info!("Shutdown signal received");

    manager.cleanup().await;
    watcher.abort();
    Ok(())
}

/// Static policy check of plugin sources; fails if any file has fatal issues
fn validate(paths: &[PathBuf]) -> Result<()> {
    let mut files = Vec::new();
    for path in paths {
        collect_sources(path, &mut files)?;
    }

    let mut rejected = 0;
    for file in &files {
        let code = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let report = validate_code(&code);

        for issue in &report.issues {
            let severity = match issue.severity {
                Severity::Fatal => "fatal",
                Severity::Warning => "warning",
            };
            println!(
                "{}:{}: [{}] {} ({})",
                file.display(),
                issue.line,
                severity,
                issue.message,
                issue.rule
            );
        }
        if !report.valid {
            rejected += 1;
        }
    }

    println!("{} file(s) checked, {} rejected", files.len(), rejected);
    if rejected > 0 {
        anyhow::bail!("{} plugin file(s) rejected by policy", rejected);
    }
    Ok(())
}

fn collect_sources(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }

    let index = path.join(INDEX_FILE);
    if index.is_file() {
        files.push(index);
        return Ok(());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for entry in entries {
        if entry.is_dir() {
            if entry.join(INDEX_FILE).is_file() {
                files.push(entry.join(INDEX_FILE));
            }
        } else if entry
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext))
        {
            files.push(entry);
        }
    }
    Ok(())
}

async fn list(config: RuntimeConfig, as_json: bool) -> Result<()> {
    let manager = start(config).await?;
    let plugins = manager.list_plugins().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
    } else {
        println!("{:<24} {:<12} {:<8} DEPENDENCIES", "NAME", "VERSION", "SANDBOX");
        for plugin in &plugins {
            println!(
                "{:<24} {:<12} {:<8} {}",
                plugin.name,
                plugin.version,
                if plugin.sandboxed { "yes" } else { "no" },
                plugin.dependencies.join(", ")
            );
        }
    }

    manager.cleanup().await;
    Ok(())
}

async fn export(config: RuntimeConfig, output: Option<&Path>) -> Result<()> {
    let manager = start(config).await?;
    manager.enable_all().await?;

    let snapshot = manager.export().await;
    let document = serde_json::to_string_pretty(&snapshot)?;
    match output {
        Some(path) => {
            std::fs::write(path, document)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            log_info!("Exported {} plugin(s) to {}", snapshot.plugins.len(), path.display());
        }
        None => println!("{}", document),
    }

    manager.cleanup().await;
    Ok(())
}

async fn import(config: RuntimeConfig, input: &Path) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let snapshot: RegistrySnapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", input.display()))?;

    let manager = start(config).await?;
    let report = manager.import(snapshot).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.cleanup().await;
    Ok(())
}

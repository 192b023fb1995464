//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing subscriber setup with per-transport wire filtering."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PLCLINK_LOG";

/// Modules that talk to the controller. `wire_level` applies to these.
pub const TRANSPORT_TARGETS: [&str; 2] =
    ["plclink_net::adapters::cip", "plclink_net::adapters::bridge"];

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directive string for `config`.
///
/// The base level comes from `override_base` (the `PLCLINK_LOG` or `RUST_LOG`
/// value) when set, else from `config.level`. Transport and extra directives
/// are always appended, so frame tracing can be switched on from the config
/// file without touching the environment.
pub fn filter_directives(config: &LoggingConfig, override_base: Option<&str>) -> String {
    let mut directives = vec![override_base.unwrap_or(config.level.as_str()).trim().to_owned()];
    if let Some(level) = &config.wire_level {
        directives.extend(TRANSPORT_TARGETS.iter().map(|target| format!("{target}={level}")));
    }
    directives.extend(config.directives.iter().map(|d| d.trim().to_owned()));
    directives.retain(|d| !d.is_empty());
    directives.join(",")
}

fn env_override() -> Option<String> {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directives:?} ({err}); defaulting to info logging");
        EnvFilter::new("info")
    })
}

/// Initialize the tracing subscriber: stdout in the configured format plus a
/// rolling daily JSON file under `config.directory`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("create log directory {}", config.directory.display()))?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let file_appender = daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set(vec![file_guard, stdout_guard]);

    let directives = filter_directives(config, env_override().as_deref());
    let timer = || fmt::time::UtcTime::rfc_3339();
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(timer())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(timer())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(timer())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(build_filter(&directives))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        format = ?config.format,
        filter = %directives,
        "tracing initialised"
    );
    Ok(())
}

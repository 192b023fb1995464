//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the PLClink daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use plclink_common::config::{AppConfig, TransportKind};
use plclink_common::logging::init_tracing;
use plclink_metrics::{new_registry, spawn_http_server, DaemonMetrics, LinkMetrics};
use plclink_net::{LinkServices, RestApiBuilder};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PLClink controller tag service",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured transport")]
    transport: Option<CliTransport>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Direct,
    Bridge,
    Simulated,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Direct => TransportKind::Direct,
            CliTransport::Bridge => TransportKind::Bridge,
            CliTransport::Simulated => TransportKind::Simulated,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the REST API until interrupted")]
    Run,
    #[command(about = "List the configured tag table")]
    Tags,
    #[command(about = "Read one tag and print its value")]
    Read { tag: String },
    #[command(about = "Write a JSON value to one tag")]
    Write {
        tag: String,
        #[arg(value_name = "JSON")]
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/plclink.toml"));
    candidates.push(PathBuf::from("/etc/plclink/plclink.toml"));
    candidates.push(PathBuf::from("configs/plclink.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();
    if let Some(transport) = cli.transport {
        config.transport = transport.into();
    }
    init_tracing("plclinkd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        transport = %config.transport.as_str(),
        tags = config.tags.len(),
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, load_duration.as_secs_f64()).await?,
        Commands::Tags => list_tags(&config)?,
        Commands::Read { tag } => {
            let services = LinkServices::from_config(&config, None)?;
            let value = services.tags.read(&tag).await?;
            println!("{}", serde_json::to_string_pretty(&value.to_json())?);
        }
        Commands::Write { tag, value } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("value for {tag} is not valid JSON"))?;
            let services = LinkServices::from_config(&config, None)?;
            let ack = services.tags.write_json(&tag, &value).await?;
            println!("{}", serde_json::to_string_pretty(&ack)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), config.transport.as_str());
    let link_metrics = LinkMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let services = LinkServices::from_config(&config, Some(link_metrics))?;
    let status = services.tags.status().await;
    if status.connected {
        info!(endpoint = %services.info.endpoint, "controller reachable");
    } else {
        warn!(
            endpoint = %services.info.endpoint,
            error = status.error.as_deref().unwrap_or("unknown"),
            "controller not reachable at startup; serving anyway"
        );
    }

    let api = RestApiBuilder::new(config.api.listen, services)
        .with_auth_token(config.api.auth_token.clone())
        .with_metrics_registry(registry)
        .spawn()
        .await
        .with_context(|| format!("failed to start rest api on {}", config.api.listen))?;

    info!(address = %api.local_addr(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    api.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn list_tags(config: &AppConfig) -> Result<()> {
    let services = LinkServices::from_config(config, None)?;
    println!("{:<18} {:<8} {:>8}  ADDRESS", "TAG", "TYPE", "ELEMENTS");
    for tag in services.tags.registry().iter() {
        println!(
            "{:<18} {:<8} {:>8}  {}",
            tag.name,
            tag.kind.as_str(),
            tag.elements,
            tag.address
        );
    }
    Ok(())
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the tag service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Element count used for string tags when the table does not specify one.
pub const DEFAULT_STRING_ELEMENTS: usize = 3;

/// Element count of the string tags in the built-in table.
const BUILTIN_STRING_ELEMENTS: usize = 16;

fn default_controller_host() -> String {
    "192.168.1.251".to_owned()
}

fn default_controller_port() -> u16 {
    44818
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_bridge_program() -> String {
    "python".to_owned()
}

fn default_bridge_args() -> Vec<String> {
    vec!["scripts/dde_bridge.py".to_owned()]
}

fn default_bridge_application() -> String {
    "RSLinx".to_owned()
}

fn default_bridge_topic() -> String {
    "ExcelLink".to_owned()
}

fn default_bridge_row() -> String {
    "L1".to_owned()
}

fn default_bridge_column() -> String {
    "C1".to_owned()
}

fn default_bridge_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn default_completion_tag() -> String {
    "completeRequest".to_owned()
}

fn default_quantity_tag() -> String {
    "quantity".to_owned()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_monitor_timeout() -> Duration {
    Duration::from_millis(600_000)
}

fn default_max_in_flight() -> usize {
    4
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Tag table deployed on the reel line controller.
fn default_tags() -> IndexMap<String, TagConfig> {
    let mut tags = IndexMap::new();
    tags.insert("quantity".into(), TagConfig::scalar("Reel.RealData[0]", TagKind::Real));
    tags.insert(
        "backupQuantity".into(),
        TagConfig::scalar("Reel.RealData[10]", TagKind::Real),
    );
    tags.insert(
        "completeRequest".into(),
        TagConfig::scalar("_200_GLB.BoolData[0].0", TagKind::Bool),
    );
    tags.insert(
        "userName".into(),
        TagConfig::string("_200_GLB.StringData[0]", BUILTIN_STRING_ELEMENTS),
    );
    tags.insert(
        "moNumber".into(),
        TagConfig::string("_200_GLB.StringData[1]", BUILTIN_STRING_ELEMENTS),
    );
    tags.insert(
        "itemNumber".into(),
        TagConfig::string("_200_GLB.StringData[2]", BUILTIN_STRING_ELEMENTS),
    );
    tags.insert("completeAck".into(), TagConfig::scalar("CompleteAck", TagKind::Bool));
    tags.insert(
        "stepNumber".into(),
        TagConfig::scalar("_200_GLB.DintData[2]", TagKind::Integer),
    );
    tags.insert("test".into(), TagConfig::scalar("_200_GLB.DintData[10]", TagKind::Integer));
    tags.insert("ddeTest".into(), TagConfig::scalar("DDETest", TagKind::Real));
    tags
}

/// Primary configuration object for the tag service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default = "default_tags")]
    pub tags: IndexMap<String, TagConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "PLCLINK_CONFIG";

    /// Load configuration from disk, respecting the `PLCLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Human readable endpoint of the selected transport, for diagnostics.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::Direct => format!(
                "{}:{} slot {}",
                self.controller.host, self.controller.port, self.controller.slot
            ),
            TransportKind::Bridge => format!(
                "{} via {} {}",
                self.bridge.application,
                self.bridge.program,
                self.bridge.args.join(" ")
            ),
            TransportKind::Simulated => "in-memory".to_owned(),
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.tags.is_empty() {
            return Err(anyhow!("configuration must declare at least one tag"));
        }
        let mut addresses: HashMap<&str, (&str, TagKind)> = HashMap::new();
        for (name, tag) in &self.tags {
            tag.validate(name)?;
            if let Some((other, kind)) =
                addresses.insert(tag.address.as_str(), (name.as_str(), tag.kind))
            {
                if kind != tag.kind {
                    return Err(anyhow!(
                        "tags '{}' and '{}' share address {} with different types",
                        other,
                        name,
                        tag.address
                    ));
                }
            }
        }
        for required in [&self.monitor.completion_tag, &self.monitor.quantity_tag] {
            if !self.tags.contains_key(required.as_str()) {
                return Err(anyhow!("monitor references undeclared tag '{}'", required));
            }
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(anyhow!("monitor poll_interval_ms must be positive"));
        }
        if self.batch.max_in_flight == 0 {
            return Err(anyhow!("batch max_in_flight must be positive"));
        }
        if matches!(self.transport, TransportKind::Bridge) && self.bridge.program.trim().is_empty()
        {
            return Err(anyhow!("bridge transport requires a helper program"));
        }
        self.api.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            controller: ControllerConfig::default(),
            bridge: BridgeConfig::default(),
            tags: default_tags(),
            monitor: MonitorConfig::default(),
            batch: BatchConfig::default(),
            sequence: SequenceConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Strategy used to reach the controller.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// EtherNet/IP explicit messaging, one connection per call.
    #[default]
    Direct,
    /// Legacy DDE exchange through a helper process.
    Bridge,
    /// In-memory controller for development and tests.
    Simulated,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Bridge => "bridge",
            TransportKind::Simulated => "simulated",
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(TransportKind::Direct),
            "bridge" => Ok(TransportKind::Bridge),
            "simulated" => Ok(TransportKind::Simulated),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_controller_host")]
    pub host: String,
    #[serde(default = "default_controller_port")]
    pub port: u16,
    #[serde(default)]
    pub slot: u8,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_io_timeout", rename = "io_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub io_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: default_controller_host(),
            port: default_controller_port(),
            slot: 0,
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
        }
    }
}

/// How the bridge request reaches the helper process.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeChannel {
    #[default]
    Stdin,
    /// Appended as the final command-line argument.
    Argument,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_program")]
    pub program: String,
    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,
    #[serde(default = "default_bridge_application")]
    pub application: String,
    #[serde(default = "default_bridge_topic")]
    pub topic: String,
    #[serde(default = "default_bridge_row")]
    pub row: String,
    #[serde(default = "default_bridge_column")]
    pub column: String,
    #[serde(default)]
    pub channel: BridgeChannel,
    #[serde(default = "default_bridge_timeout", rename = "timeout_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: default_bridge_program(),
            args: default_bridge_args(),
            application: default_bridge_application(),
            topic: default_bridge_topic(),
            row: default_bridge_row(),
            column: default_bridge_column(),
            channel: BridgeChannel::default(),
            timeout: default_bridge_timeout(),
        }
    }
}

/// Semantic type of a tag as declared in the tag table.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagKind {
    Bool,
    #[serde(alias = "DINT")]
    Integer,
    Real,
    String,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Bool => "BOOL",
            TagKind::Integer => "INTEGER",
            TagKind::Real => "REAL",
            TagKind::String => "STRING",
        }
    }
}

impl std::fmt::Display for TagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element layout used when a string is spread over an array of characters.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StringLayout {
    /// Unused trailing elements are overwritten with NUL.
    #[default]
    NulPadded,
    /// Only the characters of the value are written.
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagConfig {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: TagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<usize>,
    #[serde(default)]
    pub layout: StringLayout,
}

impl TagConfig {
    pub fn scalar(address: impl Into<String>, kind: TagKind) -> Self {
        Self {
            address: address.into(),
            kind,
            elements: None,
            layout: StringLayout::default(),
        }
    }

    pub fn string(address: impl Into<String>, elements: usize) -> Self {
        Self {
            address: address.into(),
            kind: TagKind::String,
            elements: Some(elements),
            layout: StringLayout::default(),
        }
    }

    /// Number of character elements backing a string tag.
    pub fn element_count(&self) -> usize {
        self.elements.unwrap_or(DEFAULT_STRING_ELEMENTS)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(anyhow!("tag names must not be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(anyhow!("tag '{}' has an empty address", name));
        }
        match (self.kind, self.elements) {
            (TagKind::String, Some(0)) => Err(anyhow!(
                "string tag '{}' must span at least one element",
                name
            )),
            (TagKind::String, _) | (_, None) => Ok(()),
            (_, Some(_)) => Err(anyhow!(
                "tag '{}' declares elements but is not a string",
                name
            )),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_completion_tag")]
    pub completion_tag: String,
    #[serde(default = "default_quantity_tag")]
    pub quantity_tag: String,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_monitor_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            completion_tag: default_completion_tag(),
            quantity_tag: default_quantity_tag(),
            poll_interval: default_poll_interval(),
            timeout: default_monitor_timeout(),
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    #[default]
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub mode: BatchMode,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Logical tags written by the operator job-start sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub user_tag: String,
    pub mo_number_tag: String,
    pub item_number_tag: String,
    pub ack_tag: String,
    pub step_tag: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            user_tag: "userName".to_owned(),
            mo_number_tag: "moNumber".to_owned(),
            item_number_tag: "itemNumber".to_owned(),
            ack_tag: "completeAck".to_owned(),
            step_tag: "stepNumber".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Base filter level. `PLCLINK_LOG` or `RUST_LOG` replace it when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Level for the controller transports, e.g. `trace` to log every frame.
    #[serde(default)]
    pub wire_level: Option<String>,
    /// Extra `target=level` directives appended to the filter.
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
            wire_level: None,
            directives: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    /// Bearer token required on every request when set.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            auth_token: None,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(token) = &self.auth_token {
            if token.trim().is_empty() {
                return Err(anyhow!("api auth_token must not be blank when set"));
            }
        }
        Ok(())
    }
}

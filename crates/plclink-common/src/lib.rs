//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the tag service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the PLClink workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the core tag layer, the network adapters and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, BatchConfig, BatchMode, BridgeChannel, BridgeConfig, ControllerConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, MonitorConfig, SequenceConfig, StringLayout,
    TagConfig, TagKind, TransportKind,
};
pub use logging::{init_tracing, LogFormat};

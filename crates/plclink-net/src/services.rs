//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Assembly of the tag layer components from configuration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Context;
use plclink_common::AppConfig;
use plclink_core::{
    BatchExecutor, MonitoringSessionManager, SequenceWriter, TagRegistry, TagService,
    TransportAdapter,
};
use plclink_metrics::LinkMetrics;
use serde::Serialize;

use crate::adapters::build_transport;

/// Descriptive information reported by the diagnostics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    /// Selected transport label.
    pub transport: String,
    /// Human readable controller endpoint.
    pub endpoint: String,
}

/// Tag layer components shared by the HTTP surface and the CLI.
#[derive(Clone)]
pub struct LinkServices {
    /// Single-tag reads and writes.
    pub tags: Arc<TagService>,
    /// Multi-tag fan-out.
    pub batch: BatchExecutor,
    /// Live monitoring sessions.
    pub monitor: MonitoringSessionManager,
    /// Operator job-start sequence.
    pub sequence: SequenceWriter,
    /// Transport and endpoint description.
    pub info: ServiceInfo,
}

impl LinkServices {
    /// Build every component using the transport selected in `config`.
    pub fn from_config(config: &AppConfig, metrics: Option<LinkMetrics>) -> anyhow::Result<Self> {
        Self::with_transport(config, build_transport(config), metrics)
    }

    /// Build every component around an explicit transport.
    pub fn with_transport(
        config: &AppConfig,
        transport: Arc<dyn TransportAdapter>,
        metrics: Option<LinkMetrics>,
    ) -> anyhow::Result<Self> {
        let registry =
            TagRegistry::from_config(&config.tags).context("failed to build tag registry")?;
        for required in [&config.monitor.completion_tag, &config.monitor.quantity_tag] {
            registry
                .resolve(required)
                .context("monitor configuration references an undeclared tag")?;
        }

        let info = ServiceInfo {
            transport: transport.name().to_owned(),
            endpoint: config.endpoint(),
        };
        let mut service = TagService::new(Arc::new(registry), transport);
        let mut monitor_metrics = None;
        if let Some(metrics) = metrics {
            service = service.with_metrics(metrics.clone());
            monitor_metrics = Some(metrics);
        }
        let tags = Arc::new(service);

        let mut monitor = MonitoringSessionManager::new(tags.clone(), &config.monitor);
        if let Some(metrics) = monitor_metrics {
            monitor = monitor.with_metrics(metrics);
        }

        Ok(Self {
            batch: BatchExecutor::new(tags.clone(), &config.batch),
            sequence: SequenceWriter::new(tags.clone(), config.sequence.clone()),
            monitor,
            tags,
            info,
        })
    }
}

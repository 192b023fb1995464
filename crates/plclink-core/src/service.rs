//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single-tag read and write pipeline over a transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use plclink_metrics::LinkMetrics;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{LinkError, Result};
use crate::registry::{TagDescriptor, TagRegistry};
use crate::transport::{ConnectionStatus, TransportAdapter};
use crate::value::{TagValue, WireRead, WireValue, WireWrite};

/// Acknowledgement of a completed tag write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteAck {
    pub tag: String,
    pub success: bool,
    /// Element writes performed.
    pub elements: usize,
}

/// A write whose value has already been validated and encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    pub tag: String,
    pub ops: Vec<WireWrite>,
}

/// Outcome of a tag validation probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagCheck {
    pub valid: bool,
    pub error: Option<String>,
}

/// Registry, codec and transport glued together for one tag at a time.
#[derive(Clone)]
pub struct TagService {
    registry: Arc<TagRegistry>,
    transport: Arc<dyn TransportAdapter>,
    metrics: Option<LinkMetrics>,
}

impl TagService {
    pub fn new(registry: Arc<TagRegistry>, transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            registry,
            transport,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<TagRegistry> {
        &self.registry
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn read(&self, name: &str) -> Result<TagValue> {
        let tag = self.registry.resolve(name)?;
        let result = self.read_descriptor(tag).await;
        self.record(name, "read", &result);
        result
    }

    async fn read_descriptor(&self, tag: &TagDescriptor) -> Result<TagValue> {
        let plan = codec::plan_read(tag);
        let mut values = Vec::with_capacity(plan.len());
        for op in &plan {
            values.push(self.wire_read(op).await?);
        }
        let value = codec::decode(tag, &values)?;
        debug!(tag = %tag.name, address = %tag.address, %value, "tag read");
        Ok(value)
    }

    /// Resolve and encode without touching the controller.
    pub fn prepare(&self, name: &str, value: &TagValue) -> Result<PreparedWrite> {
        let tag = self.registry.resolve(name)?;
        Ok(PreparedWrite {
            tag: tag.name.clone(),
            ops: codec::encode(tag, value)?,
        })
    }

    /// Like [`TagService::prepare`] for a JSON request value.
    pub fn prepare_json(&self, name: &str, value: &Value) -> Result<PreparedWrite> {
        let tag = self.registry.resolve(name)?;
        let value = TagValue::from_json(&tag.name, tag.kind, value)?;
        Ok(PreparedWrite {
            tag: tag.name.clone(),
            ops: codec::encode(tag, &value)?,
        })
    }

    /// Perform the element writes of a prepared write in order, stopping at
    /// the first transport failure.
    pub async fn execute(&self, prepared: &PreparedWrite) -> Result<WriteAck> {
        let mut result = Ok(());
        for op in &prepared.ops {
            result = self.wire_write(op).await;
            if result.is_err() {
                break;
            }
        }
        let result = result.map(|()| WriteAck {
            tag: prepared.tag.clone(),
            success: true,
            elements: prepared.ops.len(),
        });
        self.record(&prepared.tag, "write", &result);
        if result.is_ok() {
            debug!(tag = %prepared.tag, elements = prepared.ops.len(), "tag written");
        }
        result
    }

    pub async fn write(&self, name: &str, value: &TagValue) -> Result<WriteAck> {
        let prepared = self.prepare(name, value).inspect_err(|err| {
            self.record(name, "write", &Err::<(), _>(err.clone()));
        })?;
        self.execute(&prepared).await
    }

    pub async fn write_json(&self, name: &str, value: &Value) -> Result<WriteAck> {
        let prepared = self.prepare_json(name, value).inspect_err(|err| {
            self.record(name, "write", &Err::<(), _>(err.clone()));
        })?;
        self.execute(&prepared).await
    }

    /// Attempt a read and report whether the tag is usable.
    pub async fn validate(&self, name: &str) -> TagCheck {
        match self.read(name).await {
            Ok(_) => TagCheck {
                valid: true,
                error: None,
            },
            Err(err) => TagCheck {
                valid: false,
                error: Some(err.to_string()),
            },
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.transport.status().await
    }

    /// Re-establish reachability. Connections are per call, so this is a probe.
    pub async fn reconnect(&self) -> Result<()> {
        self.transport.probe().await
    }

    async fn wire_read(&self, op: &WireRead) -> Result<WireValue> {
        let started = Instant::now();
        let result = self.transport.read(op).await;
        self.observe("read", started);
        if let Err(err) = &result {
            warn!(address = %op.address, error = %err, "wire read failed");
        }
        result
    }

    async fn wire_write(&self, op: &WireWrite) -> Result<()> {
        let started = Instant::now();
        let result = self.transport.write(op).await;
        self.observe("write", started);
        if let Err(err) = &result {
            warn!(address = %op.address, error = %err, "wire write failed");
        }
        result
    }

    fn observe(&self, op: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_wire(self.transport.name(), op, started.elapsed());
        }
    }

    fn record<T>(&self, tag: &str, op: &str, result: &Result<T, LinkError>) {
        if let Some(metrics) = &self.metrics {
            // Unknown names are not recorded as labels to keep cardinality bounded.
            if self.registry.contains(tag) {
                metrics.record_tag_operation(tag, op, result.is_ok());
            }
        }
    }
}

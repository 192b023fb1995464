//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory controller used in development mode and tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::TransportAdapter;
use crate::error::{LinkError, Result};
use crate::value::{WireRead, WireValue, WireWrite};

/// Simulated controller memory keyed by element address.
///
/// Addresses never written read as the zero value of the requested type.
/// Clones share the same memory, so tests can keep a handle for inspection
/// after handing the adapter to a service.
#[derive(Debug, Clone, Default)]
pub struct SimulatedController {
    memory: Arc<Mutex<HashMap<String, WireValue>>>,
    faulted: Arc<Mutex<HashSet<String>>>,
    journal: Arc<Mutex<Vec<WireWrite>>>,
    offline: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation, to exercise concurrency and cancellation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set(&self, address: impl Into<String>, value: WireValue) {
        self.memory.lock().insert(address.into(), value);
    }

    /// Store a string as SINT character codes at `address[0..]`.
    pub fn set_text(&self, address: &str, text: &str) {
        let mut memory = self.memory.lock();
        for (index, byte) in text.bytes().enumerate() {
            memory.insert(format!("{address}[{index}]"), WireValue::Sint(byte as i8));
        }
    }

    pub fn get(&self, address: &str) -> Option<WireValue> {
        self.memory.lock().get(address).copied()
    }

    /// Make every operation on `address` fail with a transport error.
    pub fn fail_address(&self, address: impl Into<String>) {
        self.faulted.lock().insert(address.into());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes applied so far, in order.
    pub fn journal(&self) -> Vec<WireWrite> {
        self.journal.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn gate(&self, address: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(LinkError::transport(address, "controller unreachable"));
        }
        if self.faulted.lock().contains(address) {
            return Err(LinkError::transport(address, "injected fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for SimulatedController {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn read(&self, op: &WireRead) -> Result<WireValue> {
        self.gate(&op.address).await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .memory
            .lock()
            .get(&op.address)
            .copied()
            .unwrap_or_else(|| WireValue::zero(op.wire_type)))
    }

    async fn write(&self, op: &WireWrite) -> Result<()> {
        self.gate(&op.address).await?;
        self.memory.lock().insert(op.address.clone(), op.value);
        self.journal.lock().push(op.clone());
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LinkError::transport("simulated", "controller unreachable"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::WireType;

    #[tokio::test]
    async fn read_write_cycle() {
        let controller = SimulatedController::new();
        let read = WireRead {
            address: "Line.Count".into(),
            wire_type: WireType::Dint,
        };
        assert_eq!(controller.read(&read).await.unwrap(), WireValue::Dint(0));

        controller
            .write(&WireWrite {
                address: "Line.Count".into(),
                value: WireValue::Dint(17),
            })
            .await
            .unwrap();
        assert_eq!(controller.read(&read).await.unwrap(), WireValue::Dint(17));
        assert_eq!(controller.journal().len(), 1);
        assert_eq!(controller.read_count(), 2);
    }

    #[tokio::test]
    async fn faults_and_outages_surface_as_transport_errors() {
        let controller = SimulatedController::new();
        controller.fail_address("Bad");
        let err = controller
            .read(&WireRead {
                address: "Bad".into(),
                wire_type: WireType::Bool,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport { ref address, .. } if address == "Bad"));

        assert!(controller.status().await.connected);
        controller.set_offline(true);
        let status = controller.status().await;
        assert!(!status.connected);
        assert!(status.error.unwrap().contains("unreachable"));
    }
}

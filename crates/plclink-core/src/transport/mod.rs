//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Transport seam between the tag layer and controller protocols."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::value::{WireRead, WireValue, WireWrite};

pub mod memory;

pub use memory::SimulatedController;

/// Reachability of the controller as last probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Unified interface implemented by every controller transport.
///
/// Each call is one element-level operation. Implementations hold no state
/// between calls that a later call depends on.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn read(&self, op: &WireRead) -> Result<WireValue>;

    async fn write(&self, op: &WireWrite) -> Result<()>;

    /// Check the controller answers without touching any tag.
    async fn probe(&self) -> Result<()>;

    async fn status(&self) -> ConnectionStatus {
        match self.probe().await {
            Ok(()) => ConnectionStatus {
                connected: true,
                error: None,
            },
            Err(err) => ConnectionStatus {
                connected: false,
                error: Some(err.to_string()),
            },
        }
    }
}

//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Controller transports and their selection from configuration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use plclink_common::{AppConfig, TransportKind};
use plclink_core::{SimulatedController, TransportAdapter};
use tracing::info;

pub mod bridge;
pub mod cip;

pub use bridge::{parse_link, BridgeTransport, DdeLink};
pub use cip::CipTransport;

/// Instantiate the transport selected by `config.transport`.
pub fn build_transport(config: &AppConfig) -> Arc<dyn TransportAdapter> {
    info!(
        transport = config.transport.as_str(),
        endpoint = %config.endpoint(),
        "selecting controller transport"
    );
    match config.transport {
        TransportKind::Direct => Arc::new(CipTransport::new(&config.controller)),
        TransportKind::Bridge => Arc::new(BridgeTransport::new(&config.bridge)),
        TransportKind::Simulated => Arc::new(SimulatedController::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_configured_transport() {
        let mut config = AppConfig::default();
        assert_eq!(build_transport(&config).name(), "direct");
        config.transport = TransportKind::Bridge;
        assert_eq!(build_transport(&config).name(), "bridge");
        config.transport = TransportKind::Simulated;
        assert_eq!(build_transport(&config).name(), "simulated");
    }
}

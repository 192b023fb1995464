//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Controller transports and the HTTP surface of the tag service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

pub mod adapters;
pub mod rest;
pub mod services;

pub use adapters::{build_transport, parse_link, BridgeTransport, CipTransport, DdeLink};
pub use rest::{status_for, ApiError, RestApiBuilder, RestApiHandle};
pub use services::{LinkServices, ServiceInfo};

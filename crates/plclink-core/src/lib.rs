//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Controller tag layer: registry, codec, transports, sessions."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Uniform read, write and monitor operations over named controller tags.
//!
//! A request names a tag, the [`TagRegistry`] resolves it, the [`codec`]
//! plans element-level wire operations, a [`TransportAdapter`] performs them
//! and the codec decodes the result.

pub mod batch;
pub mod codec;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod sequence;
pub mod service;
pub mod transport;
pub mod value;

pub use batch::{BatchExecutor, BatchResults};
pub use error::{LinkError, Result};
pub use monitor::{
    MonitorParams, MonitoringSessionManager, SessionHandle, SessionInfo, SessionOutcome,
    SessionReport, SessionState,
};
pub use registry::{TagDescriptor, TagRegistry};
pub use sequence::{SequenceFailure, SequenceReport, SequenceRequest, SequenceWriter};
pub use service::{PreparedWrite, TagCheck, TagService, WriteAck};
pub use transport::{ConnectionStatus, SimulatedController, TransportAdapter};
pub use value::{TagValue, WireRead, WireType, WireValue, WireWrite};

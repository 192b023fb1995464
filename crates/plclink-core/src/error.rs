//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Domain error type for tag operations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt::Display;

use thiserror::Error;

/// Result alias used throughout the tag layer.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Every failure a tag operation can report.
///
/// Variants carry owned strings so results can be cloned into batch maps
/// and session reports.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("unknown tag '{0}'")]
    UnknownTag(String),
    #[error("duplicate tag '{0}'")]
    DuplicateTag(String),
    #[error("type mismatch for tag '{tag}': {detail}")]
    TypeMismatch { tag: String, detail: String },
    #[error("value out of range for tag '{tag}': {detail}")]
    OutOfRange { tag: String, detail: String },
    #[error("transport error at {address}: {cause}")]
    Transport { address: String, cause: String },
    #[error("bridge error: {0}")]
    Bridge(String),
    #[error("invalid address format: {0}")]
    InvalidAddressFormat(String),
    #[error("monitoring session '{0}' not found")]
    SessionNotFound(String),
    #[error("monitoring session '{0}' already exists")]
    SessionAlreadyExists(String),
    #[error("tags '{first}' and '{second}' share address {address} with different types")]
    ConflictingAddress {
        address: String,
        first: String,
        second: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LinkError {
    pub fn transport(address: impl Into<String>, cause: impl Display) -> Self {
        LinkError::Transport {
            address: address.into(),
            cause: cause.to_string(),
        }
    }

    pub fn type_mismatch(tag: &str, detail: impl Display) -> Self {
        LinkError::TypeMismatch {
            tag: tag.to_owned(),
            detail: detail.to_string(),
        }
    }

    pub fn out_of_range(tag: &str, detail: impl Display) -> Self {
        LinkError::OutOfRange {
            tag: tag.to_owned(),
            detail: detail.to_string(),
        }
    }

    /// Stable machine-readable label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::UnknownTag(_) => "unknown_tag",
            LinkError::DuplicateTag(_) => "duplicate_tag",
            LinkError::TypeMismatch { .. } => "type_mismatch",
            LinkError::OutOfRange { .. } => "out_of_range",
            LinkError::Transport { .. } => "transport",
            LinkError::Bridge(_) => "bridge",
            LinkError::InvalidAddressFormat(_) => "invalid_address_format",
            LinkError::SessionNotFound(_) => "session_not_found",
            LinkError::SessionAlreadyExists(_) => "session_already_exists",
            LinkError::ConflictingAddress { .. } => "conflicting_address",
            LinkError::InvalidRequest(_) => "invalid_request",
            LinkError::Internal(_) => "internal",
        }
    }

    /// Whether the failure came from the controller side rather than the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LinkError::Transport { .. } | LinkError::Bridge(_) | LinkError::Internal(_)
        )
    }
}

//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Legacy DDE exchange through an external helper process."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Each command spawns the helper once, hands it one JSON request and parses
//! one JSON document from its stdout after it exits.
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use plclink_common::{BridgeChannel, BridgeConfig};
use plclink_core::{LinkError, Result, TransportAdapter, WireRead, WireType, WireValue, WireWrite};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Parsed legacy link `[topic]item,row,column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdeLink {
    pub topic: String,
    pub item: String,
    pub row: String,
    pub column: String,
}

/// Parse a full link. The address must contain a bracketed topic followed by
/// exactly three comma separated, non-empty fields.
pub fn parse_link(link: &str) -> Result<DdeLink> {
    let invalid = || LinkError::InvalidAddressFormat(link.to_owned());
    let rest = link.trim().strip_prefix('[').ok_or_else(invalid)?;
    let (topic, fields) = rest.split_once(']').ok_or_else(invalid)?;
    let parts: Vec<&str> = fields.split(',').map(str::trim).collect();
    if topic.trim().is_empty() || parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(invalid());
    }
    Ok(DdeLink {
        topic: topic.trim().to_owned(),
        item: parts[0].to_owned(),
        row: parts[1].to_owned(),
        column: parts[2].to_owned(),
    })
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum BridgeRequest<'a> {
    Read {
        application: &'a str,
        topic: &'a str,
        item: &'a str,
        row: &'a str,
        column: &'a str,
    },
    Write {
        application: &'a str,
        topic: &'a str,
        item: &'a str,
        value: Value,
    },
    Check {
        application: &'a str,
        topic: &'a str,
    },
}

#[derive(Debug, Default, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// Transport that delegates every operation to the helper program.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    config: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Map a tag address onto a link. Full links carry their own topic, row
    /// and column; an element suffix such as `[2]` after a link applies to
    /// its item.
    fn resolve(&self, address: &str) -> Result<DdeLink> {
        let trimmed = address.trim();
        if trimmed.starts_with('[') {
            let (base, suffix) = split_element_suffix(trimmed);
            let mut link = parse_link(base)?;
            link.item.push_str(suffix);
            return Ok(link);
        }
        Ok(DdeLink {
            topic: self.config.topic.clone(),
            item: trimmed.to_owned(),
            row: self.config.row.clone(),
            column: self.config.column.clone(),
        })
    }

    async fn exchange(&self, request: &BridgeRequest<'_>) -> Result<BridgeResponse> {
        let payload = serde_json::to_string(request)
            .map_err(|err| LinkError::Bridge(format!("encode request: {err}")))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match self.config.channel {
            BridgeChannel::Stdin => {
                command.stdin(Stdio::piped());
            }
            BridgeChannel::Argument => {
                command.arg(&payload).stdin(Stdio::null());
            }
        }

        let mut child = command.spawn().map_err(|err| {
            LinkError::Bridge(format!("failed to start {}: {err}", self.config.program))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A helper that exits without reading its input reports through stdout.
            if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %err, "bridge helper closed stdin early");
            }
            drop(stdin);
        }

        let output = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| timed_out(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(|err| LinkError::Bridge(format!("bridge helper failed: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LinkError::Bridge(format!(
                "helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response: BridgeResponse = serde_json::from_str(stdout.trim()).map_err(|err| {
            LinkError::Bridge(format!("invalid helper output ({err}): {}", stdout.trim()))
        })?;
        if let Some(error) = response.error.as_deref() {
            return Err(LinkError::Bridge(error.to_owned()));
        }
        Ok(response)
    }
}

fn timed_out(limit: Duration) -> LinkError {
    LinkError::Bridge(format!(
        "helper did not answer within {} ms",
        limit.as_millis()
    ))
}

/// Split `[topic]item,row,column[3]` into the link and its `[3]` suffix.
fn split_element_suffix(address: &str) -> (&str, &str) {
    if let (Some(close), true) = (address.find(']'), address.ends_with(']')) {
        if let Some(open) = address.rfind('[') {
            if open > close {
                return (&address[..open], &address[open..]);
            }
        }
    }
    (address, "")
}

/// Interpret a helper value as the requested wire type.
fn parse_value(address: &str, wire_type: WireType, value: &Value) -> Result<WireValue> {
    let unparseable = || {
        LinkError::Bridge(format!(
            "cannot interpret {value} from {address} as {wire_type}"
        ))
    };
    let number = || -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    };
    let integer = || -> Option<i64> {
        number().filter(|n| n.fract() == 0.0).map(|n| n as i64)
    };

    match wire_type {
        WireType::Bool => match value {
            Value::Bool(b) => Ok(WireValue::Bool(*b)),
            Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(WireValue::Bool(true)),
            Value::String(s) if s.trim().eq_ignore_ascii_case("false") => {
                Ok(WireValue::Bool(false))
            }
            _ => match integer() {
                Some(0) => Ok(WireValue::Bool(false)),
                Some(1) => Ok(WireValue::Bool(true)),
                _ => Err(unparseable()),
            },
        },
        // Character codes may arrive unsigned.
        WireType::Sint => integer()
            .and_then(|n| {
                i8::try_from(n)
                    .ok()
                    .or_else(|| u8::try_from(n).ok().map(|b| b as i8))
            })
            .map(WireValue::Sint)
            .ok_or_else(unparseable),
        WireType::Dint => integer()
            .and_then(|n| i32::try_from(n).ok())
            .map(WireValue::Dint)
            .ok_or_else(unparseable),
        WireType::Real => number()
            .filter(|n| n.is_finite())
            .map(|n| WireValue::Real(n as f32))
            .ok_or_else(unparseable),
    }
}

#[async_trait]
impl TransportAdapter for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn read(&self, op: &WireRead) -> Result<WireValue> {
        let link = self.resolve(&op.address)?;
        let response = self
            .exchange(&BridgeRequest::Read {
                application: &self.config.application,
                topic: &link.topic,
                item: &link.item,
                row: &link.row,
                column: &link.column,
            })
            .await?;
        let value = response.value.filter(|v| !v.is_null()).ok_or_else(|| {
            LinkError::Bridge(format!("helper returned no value for {}", op.address))
        })?;
        parse_value(&op.address, op.wire_type, &value)
    }

    async fn write(&self, op: &WireWrite) -> Result<()> {
        let link = self.resolve(&op.address)?;
        let response = self
            .exchange(&BridgeRequest::Write {
                application: &self.config.application,
                topic: &link.topic,
                item: &link.item,
                value: op.value.to_json(),
            })
            .await?;
        if response.success == Some(false) {
            return Err(LinkError::Bridge(format!(
                "helper refused write to {}",
                op.address
            )));
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .exchange(&BridgeRequest::Check {
                application: &self.config.application,
                topic: &self.config.topic,
            })
            .await?;
        if response.available == Some(true) {
            return Ok(());
        }
        let message = response
            .message
            .unwrap_or_else(|| "DDE server unavailable".to_owned());
        warn!(application = %self.config.application, %message, "bridge check failed");
        Err(LinkError::Bridge(message))
    }
}

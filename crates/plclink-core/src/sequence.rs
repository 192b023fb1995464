//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator job-start write sequence with step tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use plclink_common::SequenceConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::LinkError;
use crate::service::{PreparedWrite, TagService};
use crate::value::TagValue;

/// Job-start details entered by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SequenceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "moNumber")]
    pub mo_number: Option<String>,
    #[serde(default, rename = "itemNumber")]
    pub item_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceReport {
    pub success: bool,
    pub message: String,
    #[serde(rename = "finalStep")]
    pub final_step: i64,
}

/// A sequence that stopped early. `step` is the last step counter value the
/// controller acknowledged, 0 when nothing was written.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sequence stopped at step {step}: {source}")]
pub struct SequenceFailure {
    pub step: i64,
    pub source: LinkError,
}

const FINAL_STEP: i64 = 4;

/// Writes user name, MO number, item number and the completion
/// acknowledgement, advancing the step counter after each.
#[derive(Clone)]
pub struct SequenceWriter {
    service: Arc<TagService>,
    config: SequenceConfig,
}

impl SequenceWriter {
    pub fn new(service: Arc<TagService>, config: SequenceConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(&self, request: &SequenceRequest) -> Result<SequenceReport, SequenceFailure> {
        let plan = self.plan(request).map_err(|source| SequenceFailure { step: 0, source })?;

        let mut step = 0;
        for (write, advances_to) in &plan {
            if let Err(source) = self.service.execute(write).await {
                warn!(step, tag = %write.tag, error = %source, "job sequence interrupted");
                return Err(SequenceFailure { step, source });
            }
            if let Some(next) = advances_to {
                step = *next;
            }
        }

        info!(final_step = step, "job sequence completed");
        Ok(SequenceReport {
            success: true,
            message: "Sequence completed successfully".to_owned(),
            final_step: step,
        })
    }

    /// Encode every write up front so codec errors leave the controller untouched.
    fn plan(&self, request: &SequenceRequest) -> Result<Vec<(PreparedWrite, Option<i64>)>, LinkError> {
        let name = required(&request.name, "name")?;
        let mo_number = required(&request.mo_number, "moNumber")?;
        let item_number = required(&request.item_number, "itemNumber")?;

        let values = [
            (&self.config.user_tag, TagValue::Text(name.to_owned())),
            (&self.config.mo_number_tag, TagValue::Text(mo_number.to_owned())),
            (&self.config.item_number_tag, TagValue::Text(item_number.to_owned())),
            (&self.config.ack_tag, TagValue::Bool(true)),
        ];

        let mut plan = Vec::with_capacity(values.len() * 2);
        for (step, (tag, value)) in (1..=FINAL_STEP).zip(values) {
            plan.push((self.service.prepare(tag, &value)?, None));
            let counter = self
                .service
                .prepare(&self.config.step_tag, &TagValue::Integer(step))?;
            plan.push((counter, Some(step)));
        }
        Ok(plan)
    }
}

fn required<'a>(field: &'a Option<String>, label: &str) -> Result<&'a str, LinkError> {
    match field.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(LinkError::InvalidRequest(format!(
            "name, moNumber and itemNumber are required (missing {label})"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TagRegistry;
    use crate::transport::SimulatedController;
    use crate::value::WireValue;
    use plclink_common::AppConfig;

    fn writer(controller: &SimulatedController) -> SequenceWriter {
        let config = AppConfig::default();
        let registry = TagRegistry::from_config(&config.tags).unwrap();
        let service = TagService::new(Arc::new(registry), Arc::new(controller.clone()));
        SequenceWriter::new(Arc::new(service), config.sequence)
    }

    fn request(name: &str, mo: &str, item: &str) -> SequenceRequest {
        SequenceRequest {
            name: Some(name.into()),
            mo_number: Some(mo.into()),
            item_number: Some(item.into()),
        }
    }

    #[tokio::test]
    async fn writes_every_step_in_order() {
        let controller = SimulatedController::new();
        let report = writer(&controller)
            .run(&request("ann", "MO-1", "ITEM-7"))
            .await
            .unwrap();
        assert_eq!(report.final_step, 4);

        let steps: Vec<_> = controller
            .journal()
            .into_iter()
            .filter(|w| w.address == "_200_GLB.DintData[2]")
            .map(|w| w.value)
            .collect();
        assert_eq!(
            steps,
            [
                WireValue::Dint(1),
                WireValue::Dint(2),
                WireValue::Dint(3),
                WireValue::Dint(4)
            ]
        );
        assert_eq!(controller.get("CompleteAck"), Some(WireValue::Bool(true)));
        assert_eq!(
            controller.get("_200_GLB.StringData[1][0]"),
            Some(WireValue::Sint(b'M' as i8))
        );
    }

    #[tokio::test]
    async fn invalid_values_write_nothing() {
        let controller = SimulatedController::new();
        let failure = writer(&controller)
            .run(&request("ann", "MO-1", "an item number that is far too long"))
            .await
            .unwrap_err();
        assert_eq!(failure.step, 0);
        assert!(matches!(failure.source, LinkError::OutOfRange { .. }));
        assert!(controller.journal().is_empty());
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let controller = SimulatedController::new();
        let failure = writer(&controller)
            .run(&SequenceRequest {
                name: Some("ann".into()),
                ..SequenceRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(failure.source, LinkError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn transport_failure_reports_step_reached() {
        let controller = SimulatedController::new();
        controller.fail_address("CompleteAck");
        let failure = writer(&controller)
            .run(&request("ann", "MO-1", "ITEM-7"))
            .await
            .unwrap_err();
        assert_eq!(failure.step, 3);
        assert!(failure.source.is_transport());
    }
}

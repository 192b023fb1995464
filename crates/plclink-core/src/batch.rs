//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fan-out of tag sets into independent single-tag operations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use plclink_common::{BatchConfig, BatchMode};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::service::{TagService, WriteAck};
use crate::value::TagValue;

/// Per-tag outcomes keyed by tag name, in first-seen input order.
pub type BatchResults<T> = IndexMap<String, Result<T>>;

/// Runs single-tag operations over a tag set. One failing entry never
/// affects the others.
#[derive(Clone)]
pub struct BatchExecutor {
    service: Arc<TagService>,
    mode: BatchMode,
    max_in_flight: usize,
}

impl BatchExecutor {
    pub fn new(service: Arc<TagService>, config: &BatchConfig) -> Self {
        Self {
            service,
            mode: config.mode,
            max_in_flight: config.max_in_flight.max(1),
        }
    }

    pub async fn read_many(&self, names: &[String]) -> BatchResults<TagValue> {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(name) {
                unique.push(name.clone());
            }
        }
        debug!(tags = unique.len(), mode = ?self.mode, "batch read");

        let service = &self.service;
        self.run(unique, |name| async move {
            let result = service.read(&name).await;
            (name, result)
        })
        .await
    }

    /// Later duplicates of a key replace earlier ones.
    pub async fn write_many<I>(&self, entries: I) -> BatchResults<WriteAck>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let unique: IndexMap<String, Value> = entries.into_iter().collect();
        debug!(tags = unique.len(), mode = ?self.mode, "batch write");

        let service = &self.service;
        self.run(unique.into_iter().collect(), |(name, value)| async move {
            let result = service.write_json(&name, &value).await;
            (name, result)
        })
        .await
    }

    async fn run<In, T, F, Fut>(&self, inputs: Vec<In>, op: F) -> BatchResults<T>
    where
        F: Fn(In) -> Fut,
        Fut: Future<Output = (String, Result<T>)>,
    {
        let mut results: BatchResults<T> = IndexMap::with_capacity(inputs.len());
        match self.mode {
            BatchMode::Sequential => {
                for input in inputs {
                    let (name, result) = op(input).await;
                    results.insert(name, result);
                }
            }
            BatchMode::Concurrent => {
                let mut done: Vec<(usize, (String, Result<T>))> =
                    stream::iter(inputs.into_iter().enumerate())
                        .map(|(index, input)| {
                            let pending = op(input);
                            async move { (index, pending.await) }
                        })
                        .buffer_unordered(self.max_in_flight)
                        .collect()
                        .await;
                done.sort_by_key(|(index, _)| *index);
                results.extend(done.into_iter().map(|(_, entry)| entry));
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::registry::{TagDescriptor, TagRegistry};
    use crate::transport::SimulatedController;
    use crate::value::WireValue;
    use plclink_common::TagKind;
    use serde_json::json;
    use std::time::Duration;

    fn executor(controller: &SimulatedController, mode: BatchMode) -> BatchExecutor {
        let registry = TagRegistry::new([
            TagDescriptor::scalar("A", "Line.A", TagKind::Integer),
            TagDescriptor::scalar("C", "Line.C", TagKind::Real),
        ])
        .unwrap();
        let service = TagService::new(Arc::new(registry), Arc::new(controller.clone()));
        BatchExecutor::new(
            Arc::new(service),
            &BatchConfig {
                mode,
                max_in_flight: 2,
            },
        )
    }

    #[tokio::test]
    async fn unknown_entries_fail_alone() {
        let controller = SimulatedController::new();
        controller.set("Line.A", WireValue::Dint(9));
        let results = executor(&controller, BatchMode::Sequential)
            .read_many(&["A".to_owned(), "B".to_owned()])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results["A"], Ok(TagValue::Integer(9)));
        assert_eq!(results["B"], Err(LinkError::UnknownTag("B".into())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_mode_keeps_input_order_and_collapses_duplicates() {
        let controller = SimulatedController::new().with_latency(Duration::from_millis(5));
        let names: Vec<String> = ["C", "A", "C", "B", "A"].iter().map(|s| s.to_string()).collect();
        let results = executor(&controller, BatchMode::Concurrent)
            .read_many(&names)
            .await;

        let keys: Vec<_> = results.keys().map(String::as_str).collect();
        assert_eq!(keys, ["C", "A", "B"]);
        assert!(results["C"].is_ok());
        assert!(results["B"].is_err());
    }

    #[tokio::test]
    async fn writes_report_per_entry() {
        let controller = SimulatedController::new();
        let results = executor(&controller, BatchMode::Concurrent)
            .write_many([
                ("A".to_owned(), json!(3)),
                ("C".to_owned(), json!("not a number")),
            ])
            .await;

        assert_eq!(results["A"].as_ref().unwrap().elements, 1);
        assert!(matches!(results["C"], Err(LinkError::TypeMismatch { .. })));
        assert_eq!(controller.get("Line.A"), Some(WireValue::Dint(3)));
    }
}

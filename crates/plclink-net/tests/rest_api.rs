//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end HTTP tests over the simulated controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use plclink_common::{AppConfig, TransportKind};
use plclink_core::{SimulatedController, WireValue};
use plclink_metrics::{new_registry, LinkMetrics};
use plclink_net::{LinkServices, RestApiBuilder, RestApiHandle};
use reqwest::StatusCode;
use serde_json::{json, Value};

struct Harness {
    plc: SimulatedController,
    services: LinkServices,
    api: RestApiHandle,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(None).await
    }

    async fn start_with(token: Option<&str>) -> Self {
        let config = AppConfig {
            transport: TransportKind::Simulated,
            ..AppConfig::default()
        };
        let plc = SimulatedController::new();
        let registry = new_registry();
        let metrics = LinkMetrics::new(registry.clone()).unwrap();
        let services =
            LinkServices::with_transport(&config, Arc::new(plc.clone()), Some(metrics)).unwrap();
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let api = RestApiBuilder::new(listen, services.clone())
            .with_auth_token(token.map(str::to_owned))
            .with_metrics_registry(registry)
            .spawn()
            .await
            .unwrap();
        Self {
            plc,
            services,
            api,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.api.local_addr(), path)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_and_writes_single_tags() {
    let h = Harness::start().await;
    h.plc.set("_200_GLB.DintData[2]", WireValue::Dint(3));

    let (status, body) = h.get("/tags/stepNumber").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tag"], "stepNumber");
    assert_eq!(body["value"], 3);
    assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

    let (status, body) = h.post("/tags/userName", json!({ "value": "OPS" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "tag": "userName", "success": true, "elements": 16 }));
    let (_, body) = h.get("/tags/userName").await;
    assert_eq!(body["value"], "OPS");

    h.api.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_bad_tag_requests() {
    let h = Harness::start().await;

    let (status, body) = h.get("/tags/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = h.post("/tags/quantity", json!({ "value": "lots" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h.post("/tags/quantity", json!({ "amount": 1 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "value is required");

    let response = h
        .client
        .post(h.url("/tags/quantity"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.plc.journal().is_empty());

    h.plc.fail_address("Reel.RealData[0]");
    let (status, _) = h.get("/tags/quantity").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_endpoints_report_per_tag_results() {
    let h = Harness::start().await;
    h.plc.set("Reel.RealData[0]", WireValue::Real(12.5));

    let (status, body) = h
        .post("/batch/read", json!({ "tags": ["quantity", "ghost", "quantity"] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_object().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results["quantity"], 12.5);
    assert!(results["ghost"]["error"].is_string());

    let (status, _) = h.post("/batch/read", json!({ "tags": "quantity" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h
        .post(
            "/batch/write",
            json!({ "tags": { "test": 5, "completeAck": "yes" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"]["test"]["success"], true);
    assert!(body["results"]["completeAck"]["error"].is_string());
    assert_eq!(h.plc.get("_200_GLB.DintData[10]"), Some(WireValue::Dint(5)));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reconnect_validate_and_diagnostics() {
    let h = Harness::start().await;

    let (_, body) = h.get("/status").await;
    assert_eq!(body, json!({ "connected": true }));
    let (status, body) = h.post("/reconnect", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reconnected"], true);

    let (_, body) = h.get("/validate/test").await;
    assert_eq!(body["valid"], true);
    let (_, body) = h.get("/validate/ghost").await;
    assert_eq!(body["valid"], false);

    h.plc.set_offline(true);
    let (_, body) = h.get("/status").await;
    assert_eq!(body["connected"], false);
    let (status, _) = h.post("/reconnect", json!({})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (_, body) = h.get("/diagnostics").await;
    assert_eq!(body["configuration"]["transport"], "simulated");
    assert_eq!(body["connection"]["status"], "disconnected");
    let tags = body["configuration"]["tags"].as_array().unwrap();
    assert_eq!(tags.len(), 10);
    assert_eq!(tags[0]["name"], "quantity");
    assert_eq!(tags[0]["type"], "REAL");
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_completes_on_raised_flag() {
    let h = Harness::start().await;
    h.plc.set("_200_GLB.BoolData[0].0", WireValue::Bool(true));
    h.plc.set("Reel.RealData[0]", WireValue::Real(40.0));

    let (status, body) = h
        .get("/monitor/job-1?pollInterval=20&quantityThreshold=25")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["finalQuantity"], 40.0);
    assert_eq!(body["finalCompleteRequest"], true);
    assert!(!h.services.monitor.is_live("job-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_can_be_stopped_and_ids_are_exclusive() {
    let h = Harness::start().await;
    let url = h.url("/monitor/job-2?pollInterval=20&timeout=10000");
    let client = h.client.clone();
    let pending = tokio::spawn(async move {
        let response = client.get(url).send().await.unwrap();
        (response.status(), response.json::<Value>().await.unwrap())
    });

    for _ in 0..200 {
        if h.services.monitor.is_live("job-2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.services.monitor.is_live("job-2"));

    let (status, _) = h.get("/monitor/job-2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h.post("/monitor/stop", json!({ "sessionId": "job-2" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["aborted"], true);
    assert_eq!(body["success"], false);

    let (status, _) = h.post("/monitor/stop", json!({ "sessionId": "job-2" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = h.post("/monitor/stop", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequence_writes_job_start_fields() {
    let h = Harness::start().await;

    let (status, body) = h
        .post(
            "/sequence",
            json!({ "name": "OPS", "moNumber": "MO-17", "itemNumber": "IT-9" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["finalStep"], 4);
    assert_eq!(h.plc.get("CompleteAck"), Some(WireValue::Bool(true)));
    assert_eq!(h.plc.get("_200_GLB.DintData[2]"), Some(WireValue::Dint(4)));

    let (status, body) = h.post("/sequence", json!({ "name": "OPS" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["step"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_guards_every_route_and_metrics_are_exposed() {
    let h = Harness::start_with(Some("s3cret")).await;

    let response = h.client.get(h.url("/status")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .client
        .get(h.url("/tags/test"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = h
        .client
        .get(h.url("/metrics"))
        .header("x-api-key", "s3cret")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("plclink_tag_operations_total"));
    assert!(body.contains("tag=\"test\""));
}

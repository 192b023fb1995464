//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP surface for tag reads, writes, batches and monitoring."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use plclink_core::{LinkError, SequenceRequest, SessionOutcome, SessionReport, TagValue};
use plclink_metrics::SharedRegistry;
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::services::LinkServices;

/// HTTP status for a tag layer failure.
pub fn status_for(err: &LinkError) -> StatusCode {
    match err {
        LinkError::UnknownTag(_) | LinkError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        LinkError::TypeMismatch { .. }
        | LinkError::OutOfRange { .. }
        | LinkError::InvalidAddressFormat(_)
        | LinkError::SessionAlreadyExists(_)
        | LinkError::ConflictingAddress { .. }
        | LinkError::DuplicateTag(_)
        | LinkError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LinkError::Transport { .. } | LinkError::Bridge(_) | LinkError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Errors rendered as `{"error": "..."}` bodies.
#[derive(Debug)]
pub enum ApiError {
    /// Failure reported by the tag layer.
    Link(LinkError),
    /// Malformed request body or query string.
    BadRequest(String),
    /// Missing or wrong bearer token.
    Unauthorized,
}

impl From<LinkError> for ApiError {
    fn from(err: LinkError) -> Self {
        ApiError::Link(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Link(err) => (status_for(&err), err.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_owned()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Shared state injected into the axum handlers.
struct RestState {
    services: LinkServices,
    metrics: Option<SharedRegistry>,
}

/// Builder used to configure and spawn the REST API server.
#[derive(Clone)]
pub struct RestApiBuilder {
    listen: SocketAddr,
    services: LinkServices,
    auth_token: Option<String>,
    metrics: Option<SharedRegistry>,
}

impl RestApiBuilder {
    /// Construct a new builder serving `services` on `listen`.
    pub fn new(listen: SocketAddr, services: LinkServices) -> Self {
        Self {
            listen,
            services,
            auth_token: None,
            metrics: None,
        }
    }

    /// Require `Authorization: Bearer <token>` (or `x-api-key`) on every request.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Attach a Prometheus registry exposed at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Assemble the router without binding a socket.
    pub fn router(&self) -> Router {
        let state = Arc::new(RestState {
            services: self.services.clone(),
            metrics: self.metrics.clone(),
        });
        let mut router = Router::new()
            .route("/tags/:tag_name", get(read_tag).post(write_tag))
            .route("/batch/read", post(batch_read))
            .route("/batch/write", post(batch_write))
            .route("/status", get(get_status))
            .route("/reconnect", post(reconnect))
            .route("/monitor/stop", post(stop_monitor))
            .route("/monitor/:session_id", get(monitor))
            .route("/validate/:tag_name", get(validate_tag))
            .route("/diagnostics", get(diagnostics))
            .route("/sequence", post(sequence))
            .route("/metrics", get(get_metrics))
            .with_state(state);

        if let Some(token) = &self.auth_token {
            router = router.layer(middleware::from_fn_with_state(
                Arc::<str>::from(token.as_str()),
                require_token,
            ));
        }
        router.layer(TraceLayer::new_for_http())
    }

    /// Spawn the REST API server and return a handle that can be awaited for shutdown.
    pub async fn spawn(self) -> anyhow::Result<RestApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, auth = self.auth_token.is_some(), "rest api listening");

        let router = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "rest api server exited with error");
            }
        });

        Ok(RestApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`RestApiBuilder::spawn`] allowing the caller to await server completion.
pub struct RestApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RestApiHandle {
    /// Retrieve the socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn read_tag(
    State(state): State<Arc<RestState>>,
    Path(tag_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let value = state.services.tags.read(&tag_name).await?;
    Ok(Json(json!({
        "tag": tag_name,
        "value": value,
        "timestamp": timestamp(Utc::now()),
    })))
}

async fn write_tag(
    State(state): State<Arc<RestState>>,
    Path(tag_name): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let value = body
        .get("value")
        .ok_or_else(|| ApiError::BadRequest("value is required".to_owned()))?;
    let ack = state.services.tags.write_json(&tag_name, value).await?;
    Ok(Json(json!({
        "tag": ack.tag,
        "success": ack.success,
        "elements": ack.elements,
    })))
}

fn error_entry(err: &LinkError) -> Value {
    json!({ "error": err.to_string() })
}

async fn batch_read(
    State(state): State<Arc<RestState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let names: Vec<String> = body
        .get("tags")
        .and_then(Value::as_array)
        .and_then(|tags| {
            tags.iter()
                .map(|tag| tag.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| ApiError::BadRequest("tags must be an array of tag names".to_owned()))?;

    let results: Map<String, Value> = state
        .services
        .batch
        .read_many(&names)
        .await
        .into_iter()
        .map(|(name, result)| {
            let entry = match result {
                Ok(value) => value.to_json(),
                Err(err) => error_entry(&err),
            };
            (name, entry)
        })
        .collect();
    Ok(Json(json!({ "results": results, "timestamp": timestamp(Utc::now()) })))
}

async fn batch_write(
    State(state): State<Arc<RestState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let entries: Vec<(String, Value)> = body
        .get("tags")
        .and_then(Value::as_object)
        .map(|tags| tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .ok_or_else(|| {
            ApiError::BadRequest("tags must be an object of tag names to values".to_owned())
        })?;

    let results: Map<String, Value> = state
        .services
        .batch
        .write_many(entries)
        .await
        .into_iter()
        .map(|(name, result)| {
            let entry = match result {
                Ok(ack) => json!({ "success": ack.success, "elements": ack.elements }),
                Err(err) => error_entry(&err),
            };
            (name, entry)
        })
        .collect();
    Ok(Json(json!({ "results": results, "timestamp": timestamp(Utc::now()) })))
}

async fn get_status(State(state): State<Arc<RestState>>) -> Json<Value> {
    let status = state.services.tags.status().await;
    Json(json!(status))
}

async fn reconnect(State(state): State<Arc<RestState>>) -> Result<Json<Value>, ApiError> {
    state.services.tags.reconnect().await?;
    info!("controller reachable after reconnect request");
    Ok(Json(json!({ "reconnected": true, "message": "Reconnected to controller" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorQuery {
    poll_interval: Option<u64>,
    timeout: Option<u64>,
    quantity_threshold: Option<f64>,
}

fn report_json(success: bool, message: &str, report: &SessionReport) -> Value {
    json!({
        "success": success,
        "message": message,
        "finalQuantity": report
            .final_quantity
            .as_ref()
            .map(TagValue::to_json)
            .unwrap_or_else(|| json!(0)),
        "finalCompleteRequest": report
            .final_complete_request
            .as_ref()
            .map(TagValue::to_json)
            .unwrap_or(Value::Bool(false)),
        "timeElapsed": report.elapsed.as_millis() as u64,
        "timestamp": timestamp(report.finished_at),
    })
}

async fn monitor(
    State(state): State<Arc<RestState>>,
    Path(session_id): Path<String>,
    query: Result<Query<MonitorQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let monitor = &state.services.monitor;
    let params = monitor.defaults().with_overrides(
        query.poll_interval,
        query.timeout,
        query.quantity_threshold,
    );
    let outcome = monitor.monitor(&session_id, params).await?;
    let body = match &outcome {
        SessionOutcome::Completed(report) => report_json(true, "Completion detected", report),
        SessionOutcome::TimedOut(report) => report_json(false, "Monitoring timed out", report),
        SessionOutcome::Cancelled => json!({
            "success": false,
            "aborted": true,
            "message": "Monitoring aborted",
        }),
    };
    Ok(Json(body))
}

async fn stop_monitor(
    State(state): State<Arc<RestState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let session_id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("sessionId is required".to_owned()))?;
    state.services.monitor.stop(session_id)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Monitoring session {session_id} stopped"),
    })))
}

async fn validate_tag(
    State(state): State<Arc<RestState>>,
    Path(tag_name): Path<String>,
) -> Json<Value> {
    let check = state.services.tags.validate(&tag_name).await;
    Json(json!({ "tag": tag_name, "valid": check.valid, "error": check.error }))
}

async fn diagnostics(State(state): State<Arc<RestState>>) -> Json<Value> {
    let services = &state.services;
    let status = services.tags.status().await;
    let tags: Vec<Value> = services
        .tags
        .registry()
        .iter()
        .map(|tag| {
            json!({
                "name": tag.name,
                "address": tag.address,
                "type": tag.kind,
                "elements": tag.elements,
            })
        })
        .collect();
    Json(json!({
        "configuration": {
            "transport": services.info.transport,
            "endpoint": services.info.endpoint,
            "tags": tags,
        },
        "connection": {
            "status": if status.connected { "connected" } else { "disconnected" },
            "error": status.error,
        },
        "sessions": services.monitor.live_sessions(),
        "timestamp": timestamp(Utc::now()),
    }))
}

async fn sequence(
    State(state): State<Arc<RestState>>,
    body: Result<Json<SequenceRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    match state.services.sequence.run(&request).await {
        Ok(report) => Json(report).into_response(),
        Err(failure) => (
            status_for(&failure.source),
            Json(json!({
                "success": false,
                "error": failure.source.to_string(),
                "step": failure.step,
            })),
        )
            .into_response(),
    }
}

async fn get_metrics(State(state): State<Arc<RestState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "metrics registry unavailable" })),
        )
            .into_response();
    };

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn require_token(State(token): State<Arc<str>>, request: Request, next: Next) -> Response {
    match extract_api_key(request.headers()) {
        Some(key) if key == *token => next.run(request).await,
        _ => {
            debug!(path = %request.uri().path(), "request rejected without valid token");
            ApiError::Unauthorized.into_response()
        }
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .or_else(|| headers.get(axum::http::header::AUTHORIZATION))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().trim_start_matches("Bearer ").to_owned())
}

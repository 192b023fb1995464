//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cancellable polling sessions waiting on a completion flag."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! A monitoring session polls the completion flag until it rises and the
//! quantity reaches the threshold, the timeout elapses, or `stop` is called.
//! Sessions run as their own tasks and are tracked by id; an id stays live
//! exactly as long as its loop runs.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plclink_common::MonitorConfig;
use plclink_metrics::LinkMetrics;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::service::TagService;
use crate::value::TagValue;

/// Timing and termination parameters of one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorParams {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Zero accepts any quantity once the flag rises.
    pub quantity_threshold: f64,
}

impl MonitorParams {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            timeout: config.timeout,
            quantity_threshold: 0.0,
        }
    }

    /// Apply request overrides. Zero or absent values keep the defaults.
    pub fn with_overrides(
        mut self,
        poll_interval_ms: Option<u64>,
        timeout_ms: Option<u64>,
        quantity_threshold: Option<f64>,
    ) -> Self {
        if let Some(ms) = poll_interval_ms.filter(|ms| *ms > 0) {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = quantity_threshold.filter(|t| t.is_finite() && *t != 0.0) {
            self.quantity_threshold = threshold;
        }
        self
    }
}

/// Last values seen by a session when it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub final_quantity: Option<TagValue>,
    pub final_complete_request: Option<TagValue>,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Running,
    Completed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::TimedOut => "timed_out",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(SessionReport),
    TimedOut(SessionReport),
    Cancelled,
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed(_) => SessionState::Completed,
            SessionOutcome::TimedOut(_) => SessionState::TimedOut,
            SessionOutcome::Cancelled => SessionState::Cancelled,
        }
    }

    pub fn report(&self) -> Option<&SessionReport> {
        match self {
            SessionOutcome::Completed(report) | SessionOutcome::TimedOut(report) => Some(report),
            SessionOutcome::Cancelled => None,
        }
    }
}

/// Summary of a live session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub running_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

struct SessionEntry {
    started: Instant,
    params: MonitorParams,
    cancel: watch::Sender<bool>,
}

type Sessions = Arc<Mutex<HashMap<String, SessionEntry>>>;

/// Removes the session id when the loop exits, whatever the exit path.
struct SessionGuard {
    id: String,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.id);
        debug!(session = %self.id, "monitoring session released");
    }
}

/// Handle to a spawned session.
pub struct SessionHandle {
    id: String,
    task: JoinHandle<Result<SessionOutcome>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<SessionOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(LinkError::Internal(format!(
                "monitoring session '{}' aborted: {join}",
                self.id
            ))),
        }
    }
}

/// Registry of in-flight monitoring sessions.
#[derive(Clone)]
pub struct MonitoringSessionManager {
    service: Arc<TagService>,
    completion_tag: String,
    quantity_tag: String,
    defaults: MonitorParams,
    sessions: Sessions,
    metrics: Option<LinkMetrics>,
}

impl MonitoringSessionManager {
    pub fn new(service: Arc<TagService>, config: &MonitorConfig) -> Self {
        Self {
            service,
            completion_tag: config.completion_tag.clone(),
            quantity_tag: config.quantity_tag.clone(),
            defaults: MonitorParams::from_config(config),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn defaults(&self) -> MonitorParams {
        self.defaults
    }

    /// Register `session_id` and spawn its poll loop.
    pub fn start(&self, session_id: &str, params: MonitorParams) -> Result<SessionHandle> {
        if session_id.trim().is_empty() {
            return Err(LinkError::InvalidRequest("session id must not be empty".into()));
        }
        if params.poll_interval.is_zero() {
            return Err(LinkError::InvalidRequest("poll interval must be positive".into()));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(session_id) {
                return Err(LinkError::SessionAlreadyExists(session_id.to_owned()));
            }
            sessions.insert(
                session_id.to_owned(),
                SessionEntry {
                    started: Instant::now(),
                    params,
                    cancel: cancel_tx,
                },
            );
        }
        let guard = SessionGuard {
            id: session_id.to_owned(),
            sessions: self.sessions.clone(),
        };

        if let Some(metrics) = &self.metrics {
            metrics.session_started();
        }
        info!(
            session = %session_id,
            poll_ms = params.poll_interval.as_millis() as u64,
            timeout_ms = params.timeout.as_millis() as u64,
            threshold = params.quantity_threshold,
            "monitoring session started"
        );

        let poller = Poller {
            service: self.service.clone(),
            completion_tag: self.completion_tag.clone(),
            quantity_tag: self.quantity_tag.clone(),
            params,
        };
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let result = poller.run(cancel_rx).await;
            let id = guard.id.clone();
            drop(guard);
            let label = match &result {
                Ok(outcome) => outcome.state().as_str(),
                Err(_) => "error",
            };
            if let Some(metrics) = metrics {
                metrics.session_finished(label);
            }
            match &result {
                Ok(_) => info!(session = %id, outcome = label, "monitoring session finished"),
                Err(err) => warn!(session = %id, error = %err, "monitoring session failed"),
            }
            result
        });

        Ok(SessionHandle {
            id: session_id.to_owned(),
            task,
        })
    }

    /// Start a session and wait for its terminal result.
    pub async fn monitor(&self, session_id: &str, params: MonitorParams) -> Result<SessionOutcome> {
        self.start(session_id, params)?.wait().await
    }

    /// Request cancellation. Idempotent while the loop winds down.
    pub fn stop(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| LinkError::SessionNotFound(session_id.to_owned()))?;
        entry.cancel.send_replace(true);
        info!(session = %session_id, "monitoring session stop requested");
        Ok(())
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn live_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                state: if *entry.cancel.borrow() {
                    SessionState::Cancelled
                } else {
                    SessionState::Running
                },
                running_ms: entry.started.elapsed().as_millis() as u64,
                poll_interval_ms: entry.params.poll_interval.as_millis() as u64,
                timeout_ms: entry.params.timeout.as_millis() as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }
}

struct Poller {
    service: Arc<TagService>,
    completion_tag: String,
    quantity_tag: String,
    params: MonitorParams,
}

impl Poller {
    async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<SessionOutcome> {
        let started = Instant::now();
        let mut quantity: Option<TagValue> = None;
        let mut flag: Option<TagValue> = None;
        let report = |quantity: &Option<TagValue>, flag: &Option<TagValue>| SessionReport {
            final_quantity: quantity.clone(),
            final_complete_request: flag.clone(),
            elapsed: started.elapsed(),
            finished_at: Utc::now(),
        };

        loop {
            if *cancel.borrow_and_update() {
                return Ok(SessionOutcome::Cancelled);
            }
            if started.elapsed() >= self.params.timeout {
                return Ok(SessionOutcome::TimedOut(report(&quantity, &flag)));
            }

            let observed = self.service.read(&self.completion_tag).await?;
            let raised = observed.as_flag().ok_or_else(|| {
                LinkError::type_mismatch(
                    &self.completion_tag,
                    "completion flag must be BOOL or INTEGER",
                )
            })?;
            flag = Some(observed);

            if raised {
                let current = self.service.read(&self.quantity_tag).await?;
                let amount = current.as_f64().ok_or_else(|| {
                    LinkError::type_mismatch(&self.quantity_tag, "quantity must be INTEGER or REAL")
                })?;
                quantity = Some(current);
                let threshold = self.params.quantity_threshold;
                if threshold == 0.0 || amount >= threshold {
                    return Ok(SessionOutcome::Completed(report(&quantity, &flag)));
                }
            }

            let remaining = self.params.timeout.saturating_sub(started.elapsed());
            let nap = self.params.poll_interval.min(remaining);
            if nap.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.changed() => {}
            }
        }
    }
}

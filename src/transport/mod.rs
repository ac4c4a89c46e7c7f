//! Network boundary for the tracker and the registry.
//!
//! The core only talks to the server through [`TransportAdapter`], which keeps
//! the polling and reconciliation logic independent of HTTP and lets tests
//! script server behaviour.

mod http;
mod sse;

pub use http::{ClientConfig, HttpTransport};
pub use sse::SseDecoder;

use crate::error::TrackerResult;
use crate::model::{GenerationRecord, RegistryEvent, StatusResponse};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Filter for the bulk listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationQuery {
    pub user_id: String,
    pub workflow_types: Vec<String>,
    pub include_completed: bool,
    pub limit: usize,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Transport name for logging.
    fn transport_name(&self) -> &'static str;

    /// POST the (already transformed) input to a consumer-supplied endpoint.
    async fn submit(&self, endpoint: &str, body: Value) -> TrackerResult<Value>;

    /// `GET /workflow/{runId}`
    async fn run_status(&self, run_id: &str) -> TrackerResult<StatusResponse>;

    /// `DELETE /workflow/{runId}`
    async fn cancel_run(&self, run_id: &str) -> TrackerResult<()>;

    /// `GET /generations?...`
    async fn list_generations(&self, query: &GenerationQuery)
        -> TrackerResult<Vec<GenerationRecord>>;

    /// Open the push channel for one user's generation rows.
    async fn subscribe(&self, user_id: &str) -> TrackerResult<Subscription>;
}

/// Inbound push events plus the handle that closes the channel.
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<RegistryEvent>,
    pub handle: SubscriptionHandle,
}

/// Closes a push subscription exactly once, either through
/// [`SubscriptionHandle::unsubscribe`] or on drop.
pub struct SubscriptionHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// Handle for a subscription driven by a reader task; closing aborts the task.
    pub fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    pub fn unsubscribe(mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("open", &self.close.is_some())
            .finish()
    }
}

/// How the submission endpoint answered.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The job finished within the request; carries the output payload.
    Immediate(Value),
    /// The job continues server-side and must be polled.
    Durable { run_id: String },
}

/// Find the run identifier in a submission response.
///
/// Compatibility shim for the response shapes different server versions
/// produce, checked in order: `runId`, `workflowRunId`, `_meta.executionId`.
pub fn extract_run_id(body: &Value) -> Option<String> {
    let candidates = [
        body.get("runId"),
        body.get("workflowRunId"),
        body.get("_meta").and_then(|m| m.get("executionId")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Classify a submission response. Bodies with neither a run id nor an
/// `output` field are treated as immediate results carrying the whole body.
pub fn classify_submission(body: Value) -> SubmitOutcome {
    if let Some(run_id) = extract_run_id(&body) {
        return SubmitOutcome::Durable { run_id };
    }
    match body {
        Value::Object(mut map) => match map.remove("output") {
            Some(output) => SubmitOutcome::Immediate(output),
            None => SubmitOutcome::Immediate(Value::Object(map)),
        },
        other => SubmitOutcome::Immediate(other),
    }
}

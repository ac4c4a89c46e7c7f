//! Scripted transport for unit tests.

use crate::error::{TrackerError, TrackerResult};
use crate::model::{GenerationRecord, RegistryEvent, StatusResponse, WorkflowRunStatus};
use crate::transport::{GenerationQuery, Subscription, SubscriptionHandle, TransportAdapter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn timed_out() -> TrackerError {
    TrackerError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "request timed out",
    ))
}

pub(crate) fn status(s: WorkflowRunStatus, progress: f64) -> StatusResponse {
    StatusResponse {
        status: s,
        progress: Some(progress),
        current_step: None,
        error: None,
        output: None,
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    submit_responses: Mutex<VecDeque<TrackerResult<Value>>>,
    submit_delay: Mutex<Option<Duration>>,
    statuses: Mutex<VecDeque<TrackerResult<StatusResponse>>>,
    /// Answer once the script is exhausted; `None` means every request times out.
    status_fallback: Mutex<Option<StatusResponse>>,
    list_response: Mutex<Option<TrackerResult<Vec<GenerationRecord>>>>,
    list_delay: Mutex<Option<Duration>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<RegistryEvent>>>,
    subscribe_hangs: AtomicBool,

    pub submit_bodies: Mutex<Vec<Value>>,
    pub status_calls: AtomicUsize,
    pub cancel_calls: Mutex<Vec<String>>,
    pub list_calls: Mutex<Vec<GenerationQuery>>,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_submit(&self, res: TrackerResult<Value>) {
        self.submit_responses.lock().push_back(res);
    }

    pub(crate) fn delay_submit(&self, d: Duration) {
        *self.submit_delay.lock() = Some(d);
    }

    pub(crate) fn push_status(&self, res: TrackerResult<StatusResponse>) {
        self.statuses.lock().push_back(res);
    }

    pub(crate) fn fallback_status(&self, resp: StatusResponse) {
        *self.status_fallback.lock() = Some(resp);
    }

    pub(crate) fn set_list(&self, res: TrackerResult<Vec<GenerationRecord>>) {
        *self.list_response.lock() = Some(res);
    }

    pub(crate) fn delay_list(&self, d: Duration) {
        *self.list_delay.lock() = Some(d);
    }

    /// Make `subscribe` never complete.
    pub(crate) fn hang_subscribe(&self) {
        self.subscribe_hangs.store(true, Ordering::SeqCst);
    }

    /// Deliver a push event to the current subscriber.
    pub(crate) fn emit(&self, ev: RegistryEvent) {
        if let Some(tx) = self.event_tx.lock().as_ref() {
            let _ = tx.send(ev);
        }
    }

    pub(crate) fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    fn transport_name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, _endpoint: &str, body: Value) -> TrackerResult<Value> {
        self.submit_bodies.lock().push(body);
        let delay = *self.submit_delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let next = self.submit_responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(serde_json::json!({"success": true, "output": null})))
    }

    async fn run_status(&self, _run_id: &str) -> TrackerResult<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().pop_front();
        if let Some(res) = next {
            return res;
        }
        let fallback = self.status_fallback.lock().clone();
        fallback.ok_or_else(timed_out)
    }

    async fn cancel_run(&self, run_id: &str) -> TrackerResult<()> {
        self.cancel_calls.lock().push(run_id.to_string());
        Ok(())
    }

    async fn list_generations(
        &self,
        query: &GenerationQuery,
    ) -> TrackerResult<Vec<GenerationRecord>> {
        self.list_calls.lock().push(query.clone());
        let delay = *self.list_delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        match self.list_response.lock().as_ref() {
            Some(Ok(rows)) => Ok(rows.clone()),
            Some(Err(e)) => Err(TrackerError::api_error(500, e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe(&self, _user_id: &str) -> TrackerResult<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.subscribe_hangs.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_tx.lock() = Some(tx);
        let counter = self.unsubscribes.clone();
        Ok(Subscription {
            events: rx,
            handle: SubscriptionHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }
}

/// A running record for user `u1` started at 2026-01-01T00:00Z.
pub(crate) fn record(id: &str, workflow_type: &str) -> GenerationRecord {
    GenerationRecord {
        run_id: id.into(),
        user_id: Some("u1".into()),
        workflow_type: workflow_type.into(),
        progress: 0,
        current_step: None,
        error: None,
        output: None,
        started_at: time::macros::datetime!(2026-01-01 00:00 UTC),
        updated_at: None,
        completed_at: None,
        estimated_duration_ms: None,
    }
}

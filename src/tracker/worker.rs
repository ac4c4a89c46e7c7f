use super::{Command, TrackOptions};
use crate::error::{TrackerError, TrackerResult};
use crate::model::{RunSnapshot, StatusResponse, WorkflowRunStatus};
use crate::storage::PersistenceAdapter;
use crate::transport::{classify_submission, SubmitOutcome, TransportAdapter};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, info, warn};

/// The polling loop's single slot: either waiting on the timer or on one
/// status request, never both.
enum PollSlot {
    Idle,
    Sleeping(Pin<Box<Sleep>>),
    Requesting(BoxFuture<'static, TrackerResult<StatusResponse>>),
}

enum PollFired {
    TimerElapsed,
    Response(TrackerResult<StatusResponse>),
}

impl PollSlot {
    /// Cancel-safe: all progress lives in `self`.
    async fn fire(&mut self) -> PollFired {
        match self {
            PollSlot::Idle => futures::future::pending().await,
            PollSlot::Sleeping(sleep) => {
                sleep.await;
                PollFired::TimerElapsed
            }
            PollSlot::Requesting(request) => PollFired::Response(request.await),
        }
    }
}

type SubmitSlot = Option<BoxFuture<'static, TrackerResult<Value>>>;

struct RunState<T> {
    view: RunSnapshot<T>,
    attempt_count: u32,
    last_transport_error: Option<String>,
}

impl<T> Default for RunState<T> {
    fn default() -> Self {
        Self {
            view: RunSnapshot::default(),
            attempt_count: 0,
            last_transport_error: None,
        }
    }
}

pub(super) struct Worker<T> {
    transport: Arc<dyn TransportAdapter>,
    store: Arc<dyn PersistenceAdapter>,
    snapshot_tx: watch::Sender<RunSnapshot<T>>,
    state: RunState<T>,
    options: TrackOptions<T>,
}

impl<T> Worker<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(super) fn new(
        transport: Arc<dyn TransportAdapter>,
        store: Arc<dyn PersistenceAdapter>,
        snapshot_tx: watch::Sender<RunSnapshot<T>>,
    ) -> Self {
        Self {
            transport,
            store,
            snapshot_tx,
            state: RunState::default(),
            options: TrackOptions::default(),
        }
    }

    pub(super) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command<T>>) {
        let mut submission: SubmitSlot = None;
        let mut poll = PollSlot::Idle;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut submission, &mut poll),
                    None => break,
                },
                res = async {
                    match submission.as_mut() {
                        Some(request) => request.await,
                        None => futures::future::pending().await,
                    }
                } => {
                    submission = None;
                    poll = self.on_submitted(res);
                }
                fired = poll.fire() => {
                    poll = match fired {
                        PollFired::TimerElapsed => self.begin_cycle(),
                        PollFired::Response(res) => self.on_status(res),
                    };
                }
            }
        }
        debug!("run tracker worker stopped");
    }

    fn handle_command(&mut self, cmd: Command<T>, submission: &mut SubmitSlot, poll: &mut PollSlot) {
        match cmd {
            Command::Submit {
                endpoint,
                body,
                options,
                ack,
            } => {
                *poll = PollSlot::Idle;
                *submission = None;
                self.clear_persisted();
                self.options = options;
                self.state = RunState::default();
                self.state.view.status = Some(WorkflowRunStatus::Pending);

                let body = match self.options.transform_input.as_ref() {
                    Some(f) => f(body),
                    None => body,
                };
                let transport = self.transport.clone();
                debug!(endpoint = %endpoint, transport = transport.transport_name(), "submitting");
                *submission = Some(Box::pin(async move { transport.submit(&endpoint, body).await }));
                self.publish();
                let _ = ack.send(());
            }
            Command::Resume {
                run_id,
                options,
                ack,
            } => {
                *submission = None;
                if self.options.persistence_key != options.persistence_key {
                    self.clear_persisted();
                }
                self.options = options;
                self.state = RunState::default();
                info!(run_id = %run_id, "resuming run");
                self.start_polling(run_id, poll);
                let _ = ack.send(());
            }
            Command::Cancel { ack } => {
                self.cancel(submission, poll);
                let _ = ack.send(());
            }
            Command::Reset { ack } => {
                *poll = PollSlot::Idle;
                *submission = None;
                self.clear_persisted();
                self.state = RunState::default();
                self.options = TrackOptions::default();
                self.publish();
                let _ = ack.send(());
            }
        }
    }

    fn cancel(&mut self, submission: &mut SubmitSlot, poll: &mut PollSlot) {
        *poll = PollSlot::Idle;
        *submission = None;
        if !self.state.view.is_generating() {
            debug!("cancel ignored, no run in progress");
            return;
        }

        if let Some(run_id) = self.state.view.run_id.clone() {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.cancel_run(&run_id).await {
                    warn!(run_id = %run_id, error = %e, "server-side cancel failed");
                }
            });
        }
        self.clear_persisted();
        self.state.view.status = Some(WorkflowRunStatus::Cancelled);
        info!(run_id = ?self.state.view.run_id, "run cancelled");
        self.publish();
    }

    fn on_submitted(&mut self, res: TrackerResult<Value>) -> PollSlot {
        let body = match res {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "submission failed");
                self.fail(WorkflowRunStatus::Error, e);
                return PollSlot::Idle;
            }
        };
        match classify_submission(body) {
            SubmitOutcome::Immediate(output) => {
                debug!("submission returned an immediate result");
                self.complete(output);
                PollSlot::Idle
            }
            SubmitOutcome::Durable { run_id } => {
                info!(run_id = %run_id, "durable run started");
                let mut poll = PollSlot::Idle;
                self.start_polling(run_id, &mut poll);
                poll
            }
        }
    }

    fn start_polling(&mut self, run_id: String, poll: &mut PollSlot) {
        if let Some(key) = self.options.persistence_key.as_deref() {
            if let Err(e) = self.store.set(key, &run_id) {
                warn!(key, error = %e, "failed to persist run id");
            }
        }
        self.state.view.run_id = Some(run_id);
        self.state.view.status = Some(WorkflowRunStatus::Pending);
        self.state.attempt_count = 0;
        self.publish();
        *poll = self.begin_cycle();
    }

    /// Start one polling cycle, or give up once the attempt ceiling is reached.
    fn begin_cycle(&mut self) -> PollSlot {
        let Some(run_id) = self.state.view.run_id.clone() else {
            return PollSlot::Idle;
        };
        if self.state.attempt_count >= self.options.max_polling_attempts {
            let err = TrackerError::Timeout {
                attempts: self.state.attempt_count,
                last_error: self.state.last_transport_error.take(),
            };
            self.fail(WorkflowRunStatus::Error, err);
            return PollSlot::Idle;
        }
        let transport = self.transport.clone();
        PollSlot::Requesting(Box::pin(async move { transport.run_status(&run_id).await }))
    }

    fn on_status(&mut self, res: TrackerResult<StatusResponse>) -> PollSlot {
        let resp = match res {
            Ok(resp) => resp,
            Err(e) => {
                self.state.attempt_count += 1;
                warn!(
                    run_id = ?self.state.view.run_id,
                    attempt = self.state.attempt_count,
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "status poll failed"
                );
                if self.state.attempt_count >= self.options.max_polling_attempts {
                    let err = TrackerError::Timeout {
                        attempts: self.state.attempt_count,
                        last_error: Some(e.to_string()),
                    };
                    self.fail(WorkflowRunStatus::Error, err);
                    return PollSlot::Idle;
                }
                self.state.last_transport_error = Some(e.to_string());
                return PollSlot::Sleeping(Box::pin(tokio::time::sleep(
                    self.options.polling_interval * 2,
                )));
            }
        };

        self.state.last_transport_error = None;
        self.merge(&resp);
        match resp.status {
            WorkflowRunStatus::Completed => {
                self.complete(resp.output.unwrap_or(Value::Null));
                PollSlot::Idle
            }
            status if status.is_failure() => {
                let message = resp
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("generation {status}"));
                self.fail(
                    status,
                    TrackerError::RunFailed {
                        status: status.to_string(),
                        message,
                    },
                );
                PollSlot::Idle
            }
            _ => {
                self.publish();
                self.state.attempt_count += 1;
                PollSlot::Sleeping(Box::pin(tokio::time::sleep(self.options.polling_interval)))
            }
        }
    }

    fn merge(&mut self, resp: &StatusResponse) {
        let view = &mut self.state.view;
        view.status = Some(resp.status);
        if let Some(p) = resp.progress_pct() {
            if p < view.progress {
                debug!(run_id = ?view.run_id, from = view.progress, to = p, "ignoring progress regression");
            } else {
                view.progress = p;
            }
        }
        if resp.current_step.is_some() {
            view.current_step = resp.current_step.clone();
        }
    }

    fn complete(&mut self, raw: Value) {
        let transformed = match self.options.transform_output.as_ref() {
            Some(f) => f(raw).map_err(TrackerError::Transform),
            None => serde_json::from_value::<T>(raw).map_err(|e| TrackerError::Transform(e.to_string())),
        };
        let output = match transformed {
            Ok(output) => output,
            Err(e) => {
                self.fail(WorkflowRunStatus::Error, e);
                return;
            }
        };

        self.clear_persisted();
        let view = &mut self.state.view;
        view.status = Some(WorkflowRunStatus::Completed);
        view.progress = 100;
        view.error = None;
        view.output = Some(output.clone());
        info!(run_id = ?view.run_id, "generation completed");
        self.publish();
        if let Some(cb) = self.options.callbacks.on_success.as_ref() {
            cb(&output);
        }
    }

    fn fail(&mut self, status: WorkflowRunStatus, err: TrackerError) {
        self.clear_persisted();
        self.state.view.status = Some(status);
        self.state.view.error = Some(err.to_string());
        warn!(run_id = ?self.state.view.run_id, status = %status, error = %err, "generation failed");
        self.publish();
        if let Some(cb) = self.options.callbacks.on_error.as_ref() {
            cb(&err);
        }
    }

    fn clear_persisted(&self) {
        if let Some(key) = self.options.persistence_key.as_deref() {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "failed to clear persisted run id");
            }
        }
    }

    fn publish(&self) {
        let snap = self.state.view.clone();
        self.snapshot_tx.send_replace(snap.clone());
        if let Some(cb) = self.options.callbacks.on_status_change.as_ref() {
            cb(&snap);
        }
    }
}

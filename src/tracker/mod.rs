//! Lifecycle of a single generation run.
//!
//! A [`RunTracker`] is a handle to one worker task that exclusively owns the
//! run state, the polling timer, the in-flight status request and the
//! in-flight submission request. Commands are applied in order; state is
//! published through a `watch` channel and the lifecycle callbacks.

mod worker;

#[cfg(test)]
mod tests;

use crate::error::{TrackerError, TrackerResult};
use crate::model::RunSnapshot;
use crate::storage::PersistenceAdapter;
use crate::transport::TransportAdapter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_POLLING_ATTEMPTS: u32 = 150;

pub type InputTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type OutputTransform<T> = Arc<dyn Fn(Value) -> Result<T, String> + Send + Sync>;

/// Lifecycle callbacks, invoked from the tracker's worker task.
pub struct RunCallbacks<T> {
    pub on_success: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&TrackerError) + Send + Sync>>,
    pub on_status_change: Option<Arc<dyn Fn(&RunSnapshot<T>) + Send + Sync>>,
}

impl<T> Default for RunCallbacks<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_status_change: None,
        }
    }
}

impl<T> Clone for RunCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_status_change: self.on_status_change.clone(),
        }
    }
}

/// Per-run settings for [`RunTracker::submit`] and [`RunTracker::resume`].
pub struct TrackOptions<T> {
    pub polling_interval: Duration,
    pub max_polling_attempts: u32,
    /// Storage key holding the active run id; `None` disables persistence.
    pub persistence_key: Option<String>,
    pub transform_input: Option<InputTransform>,
    /// Converts the raw output payload; defaults to `serde_json::from_value`.
    pub transform_output: Option<OutputTransform<T>>,
    pub callbacks: RunCallbacks<T>,
}

impl<T> Default for TrackOptions<T> {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_polling_attempts: DEFAULT_MAX_POLLING_ATTEMPTS,
            persistence_key: None,
            transform_input: None,
            transform_output: None,
            callbacks: RunCallbacks::default(),
        }
    }
}

impl<T> TrackOptions<T> {
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn max_polling_attempts(mut self, attempts: u32) -> Self {
        self.max_polling_attempts = attempts;
        self
    }

    pub fn persist_as(mut self, key: impl Into<String>) -> Self {
        self.persistence_key = Some(key.into());
        self
    }

    pub fn transform_input(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transform_input = Some(Arc::new(f));
        self
    }

    pub fn transform_output(
        mut self,
        f: impl Fn(Value) -> Result<T, String> + Send + Sync + 'static,
    ) -> Self {
        self.transform_output = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.callbacks.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TrackerError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_status_change(mut self, f: impl Fn(&RunSnapshot<T>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_status_change = Some(Arc::new(f));
        self
    }
}

pub(crate) enum Command<T> {
    Submit {
        endpoint: String,
        body: Value,
        options: TrackOptions<T>,
        ack: oneshot::Sender<()>,
    },
    Resume {
        run_id: String,
        options: TrackOptions<T>,
        ack: oneshot::Sender<()>,
    },
    Cancel {
        ack: oneshot::Sender<()>,
    },
    Reset {
        ack: oneshot::Sender<()>,
    },
}

/// Tracks one durable generation run from submission to a terminal state.
pub struct RunTracker<T> {
    cmd_tx: mpsc::UnboundedSender<Command<T>>,
    snapshot_rx: watch::Receiver<RunSnapshot<T>>,
    task: tokio::task::JoinHandle<()>,
}

impl<T> RunTracker<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Spawn the tracker's worker task. Must be called within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        store: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RunSnapshot::default());
        let worker = worker::Worker::new(transport, store, snapshot_tx);
        let task = tokio::spawn(worker.run(cmd_rx));
        Self {
            cmd_tx,
            snapshot_rx,
            task,
        }
    }

    /// Read the run id a previous process left behind under `key`.
    pub fn persisted_run_id(store: &dyn PersistenceAdapter, key: &str) -> Option<String> {
        match store.get(key) {
            Ok(v) => v.filter(|id| !id.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "failed to read persisted run id");
                None
            }
        }
    }

    /// Submit a new job, superseding whatever run was tracked before.
    ///
    /// Returns once the submission request is in flight; the outcome is
    /// reported through the snapshot channel and the callbacks.
    pub async fn submit<I: Serialize>(
        &self,
        endpoint: impl Into<String>,
        input: I,
        options: TrackOptions<T>,
    ) -> TrackerResult<()> {
        let body = serde_json::to_value(input)?;
        self.send(|ack| Command::Submit {
            endpoint: endpoint.into(),
            body,
            options,
            ack,
        })
        .await;
        Ok(())
    }

    /// Start polling a run that was submitted earlier, e.g. before a reload.
    pub async fn resume(&self, run_id: impl Into<String>, options: TrackOptions<T>) {
        let run_id = run_id.into();
        self.send(|ack| Command::Resume {
            run_id,
            options,
            ack,
        })
        .await;
    }

    /// Stop tracking and ask the server to cancel the run. Idempotent.
    pub async fn cancel(&self) {
        self.send(|ack| Command::Cancel { ack }).await;
    }

    /// Drop all run state and return to idle.
    pub async fn reset(&self) {
        self.send(|ack| Command::Reset { ack }).await;
    }

    pub fn snapshot(&self) -> RunSnapshot<T> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot<T>> {
        self.snapshot_rx.clone()
    }

    /// Wait until the tracked run reaches a terminal status.
    ///
    /// Never resolves while the tracker is idle.
    pub async fn wait_terminal(&self) -> RunSnapshot<T> {
        let mut rx = self.snapshot_rx.clone();
        loop {
            {
                let snap = rx.borrow_and_update();
                if snap.is_terminal() {
                    return snap.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command<T>) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(make(ack)).is_err() {
            warn!("run tracker worker is gone");
            return;
        }
        let _ = done.await;
    }
}

impl<T> Drop for RunTracker<T> {
    fn drop(&mut self) {
        // Dropping a JoinHandle does not stop the task; abort so no timer outlives us.
        self.task.abort();
    }
}

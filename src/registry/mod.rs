//! Live collection of one user's generation records.
//!
//! [`RegistrySync`] owns the push subscription, the bulk fetches and the
//! grace-delay removal timers. Consumers read [`RegistryView`] snapshots and
//! derive statuses, ETAs and per-type stats from them.

mod state;
mod view;

pub use state::{Applied, IgnoreReason, RegistryState, SyncScope};
pub use view::{derive_status, derive_view, estimate_remaining_ms, RegistryView};

use crate::error::TrackerResult;
use crate::model::{GenerationRecord, RegistryEvent};
use crate::transport::{GenerationQuery, Subscription, TransportAdapter};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const GRACE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Empty means every workflow type.
    pub workflow_types: Vec<String>,
    pub include_completed: bool,
    pub limit: usize,
    pub grace_delay: Duration,
    pub tombstone_ttl: Duration,
    /// Re-run the bulk fetch on this interval.
    pub refresh_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            workflow_types: Vec::new(),
            include_completed: false,
            limit: DEFAULT_LIMIT,
            grace_delay: GRACE_DELAY,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            refresh_interval: None,
        }
    }
}

enum Command {
    Refresh(oneshot::Sender<()>),
    /// Acked with the number of grace removals that were cancelled.
    Release(oneshot::Sender<usize>),
}

/// Handle to a registry worker. Dropping it tears the worker down.
pub struct RegistrySync {
    cmd_tx: mpsc::UnboundedSender<Command>,
    view_rx: watch::Receiver<RegistryView>,
    task: tokio::task::JoinHandle<()>,
}

impl RegistrySync {
    /// Start synchronising. With no user id the view stays empty and nothing
    /// is fetched or subscribed.
    pub fn acquire(
        transport: Arc<dyn TransportAdapter>,
        user_id: Option<String>,
        config: RegistryConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(RegistryView {
            records: Vec::new(),
            workflow_types: config.workflow_types.clone(),
        });
        let task = match user_id.filter(|u| !u.is_empty()) {
            Some(user_id) => {
                let worker = Worker::new(transport, user_id, config, view_tx);
                tokio::spawn(worker.run(cmd_rx))
            }
            None => {
                debug!("no user id, registry stays empty");
                tokio::spawn(idle(cmd_rx))
            }
        };
        Self {
            cmd_tx,
            view_rx,
            task,
        }
    }

    pub fn view(&self) -> RegistryView {
        self.view_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistryView> {
        self.view_rx.clone()
    }

    /// Re-run the bulk fetch unless one is already in flight.
    pub async fn refresh(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Refresh(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Unsubscribe and cancel pending removals, then wait for the worker to stop.
    ///
    /// Returns how many grace-delay removals were still pending.
    pub async fn release(self) -> usize {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Release(ack)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }
}

impl Drop for RegistrySync {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn idle(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Refresh(ack) => {
                let _ = ack.send(());
            }
            Command::Release(ack) => {
                let _ = ack.send(0);
                return;
            }
        }
    }
}

type FetchSlot = Option<BoxFuture<'static, TrackerResult<Vec<GenerationRecord>>>>;

struct Worker {
    transport: Arc<dyn TransportAdapter>,
    scope: SyncScope,
    config: RegistryConfig,
    state: RegistryState,
    view_tx: watch::Sender<RegistryView>,
}

impl Worker {
    fn new(
        transport: Arc<dyn TransportAdapter>,
        user_id: String,
        config: RegistryConfig,
        view_tx: watch::Sender<RegistryView>,
    ) -> Self {
        let scope = SyncScope {
            user_id,
            workflow_types: config.workflow_types.clone(),
            include_completed: config.include_completed,
        };
        let state = RegistryState::new(config.limit, config.tombstone_ttl);
        Self {
            transport,
            scope,
            config,
            state,
            view_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        // Subscribe before fetching so nothing is missed while the list loads.
        // The handshake stays responsive to commands; release drops it.
        let handshake = {
            let transport = self.transport.clone();
            let user_id = self.scope.user_id.clone();
            async move { transport.subscribe(&user_id).await }
        };
        tokio::pin!(handshake);
        let mut subscription: Option<Subscription> = loop {
            tokio::select! {
                res = &mut handshake => break match res {
                    Ok(sub) => Some(sub),
                    Err(e) => {
                        warn!(user_id = %self.scope.user_id, error = %e, "push subscription failed");
                        None
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    // The initial fetch starts right after the handshake.
                    Some(Command::Refresh(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Command::Release(ack)) => {
                        info!(user_id = %self.scope.user_id, "registry released while subscribing");
                        let _ = ack.send(0);
                        return;
                    }
                    None => return,
                },
            }
        };
        let mut fetch: FetchSlot = Some(self.start_fetch());
        let mut removals: FuturesUnordered<BoxFuture<'static, String>> = FuturesUnordered::new();
        let mut refresh = self.config.refresh_interval.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        let released = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Refresh(ack)) => {
                        if fetch.is_none() {
                            fetch = Some(self.start_fetch());
                        }
                        let _ = ack.send(());
                    }
                    Some(Command::Release(ack)) => break Some(ack),
                    None => break None,
                },
                res = async {
                    match fetch.as_mut() {
                        Some(request) => request.await,
                        None => futures::future::pending().await,
                    }
                } => {
                    fetch = None;
                    self.on_fetched(res);
                }
                ev = async {
                    match subscription.as_mut() {
                        Some(sub) => sub.events.recv().await,
                        None => futures::future::pending().await,
                    }
                } => match ev {
                    Some(ev) => {
                        if let Some(removal) = self.on_event(ev) {
                            removals.push(removal);
                        }
                    }
                    None => {
                        warn!(user_id = %self.scope.user_id, "push channel closed");
                        if let Some(sub) = subscription.take() {
                            sub.handle.unsubscribe();
                        }
                    }
                },
                Some(run_id) = removals.next(), if !removals.is_empty() => {
                    self.on_grace_elapsed(&run_id);
                }
                _ = async {
                    match refresh.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => futures::future::pending::<()>().await,
                    }
                } => {
                    if fetch.is_none() {
                        fetch = Some(self.start_fetch());
                    }
                }
            }
        };

        if let Some(sub) = subscription.take() {
            sub.handle.unsubscribe();
        }
        let pending = removals.len();
        drop(removals);
        info!(user_id = %self.scope.user_id, pending_removals = pending, "registry released");
        drop(self);
        if let Some(ack) = released {
            let _ = ack.send(pending);
        }
    }

    fn start_fetch(&mut self) -> BoxFuture<'static, TrackerResult<Vec<GenerationRecord>>> {
        self.state.begin_fetch();
        let transport = self.transport.clone();
        let query = GenerationQuery {
            user_id: self.scope.user_id.clone(),
            workflow_types: self.scope.workflow_types.clone(),
            include_completed: self.scope.include_completed,
            limit: self.config.limit,
        };
        Box::pin(async move { transport.list_generations(&query).await })
    }

    fn on_fetched(&mut self, res: TrackerResult<Vec<GenerationRecord>>) {
        match res {
            Ok(rows) => {
                debug!(count = rows.len(), "bulk fetch loaded");
                self.state.load(rows, &self.scope, Instant::now());
                self.publish();
            }
            Err(e) => {
                self.state.abort_fetch();
                warn!(user_id = %self.scope.user_id, error = %e, "bulk fetch failed, relying on push events");
            }
        }
    }

    /// Apply one event; returns a grace-delay removal to schedule, if any.
    fn on_event(&mut self, ev: RegistryEvent) -> Option<BoxFuture<'static, String>> {
        let run_id = ev.run_id().to_string();
        let applied = self.state.apply_event(ev, &self.scope, Instant::now());
        debug!(run_id = %run_id, ?applied, "push event");
        match applied {
            Applied::Ignored(_) => None,
            Applied::UpdatedFinished => {
                self.publish();
                let delay = self.config.grace_delay;
                Some(Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    run_id
                }))
            }
            _ => {
                self.publish();
                None
            }
        }
    }

    fn on_grace_elapsed(&mut self, run_id: &str) {
        let finished = self
            .state
            .get(run_id)
            .map(GenerationRecord::is_finished)
            .unwrap_or(false);
        if finished && self.state.remove(run_id) {
            debug!(run_id, "removed finished generation after grace delay");
            self.publish();
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(RegistryView {
            records: self.state.records().to_vec(),
            workflow_types: self.scope.workflow_types.clone(),
        });
    }
}

//! Run lifecycle controller.
//!
//! Follows a tracker or a registry until it settles, maps Ctrl-C to
//! cancellation and emits events for presentation layers.

use anyhow::{bail, Result};
use genrun::model::{RunEvent, RunSnapshot};
use genrun::{RegistrySync, RegistryView, RunTracker};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Duration;

/// Drive `tracker` until its run reaches a terminal state.
///
/// The first Ctrl-C cancels the run; the controller then keeps waiting for
/// the tracker to report `cancelled`.
pub(crate) async fn drive_run(
    tracker: &RunTracker<Value>,
    event_tx: UnboundedSender<RunEvent>,
) -> Result<RunSnapshot<Value>> {
    let mut updates = tracker.subscribe();
    let mut cancel_requested = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let first = updates.borrow_and_update().clone();
    if first.is_terminal() {
        let _ = event_tx.send(RunEvent::Finished(first.clone()));
        return Ok(first);
    }
    if first.is_idle() {
        bail!("no run to follow");
    }
    let _ = event_tx.send(RunEvent::Progress(first));

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("run tracker stopped unexpectedly");
                }
                let snap = updates.borrow_and_update().clone();
                if snap.is_terminal() {
                    let _ = event_tx.send(RunEvent::Finished(snap.clone()));
                    return Ok(snap);
                }
                let _ = event_tx.send(RunEvent::Progress(snap));
            }
            res = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                if let Err(e) = res {
                    let _ = event_tx.send(RunEvent::Info(format!("Signal handler failed: {e}")));
                }
                let _ = event_tx.send(RunEvent::Info("Cancelling…".into()));
                cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                tracker.cancel().await;
            }
            // If cancel stalls, keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = event_tx.send(RunEvent::Info("Still cancelling…".into()));
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}

/// Publish registry views until Ctrl-C, then release the registry.
pub(crate) async fn watch_registry(
    registry: RegistrySync,
    view_tx: UnboundedSender<RegistryView>,
) -> Result<()> {
    let mut updates = registry.subscribe();
    let _ = view_tx.send(updates.borrow_and_update().clone());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = updates.borrow_and_update().clone();
                let _ = view_tx.send(view);
            }
            _ = &mut ctrl_c => break,
        }
    }
    registry.release().await;
    Ok(())
}

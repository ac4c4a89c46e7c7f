//! Text rendering for CLI output.
//!
//! This module formats run snapshots and registry views as human-readable lines.

use genrun::model::{DerivedStatus, RunSnapshot};
use genrun::RegistryView;
use serde_json::Value;
use time::OffsetDateTime;

/// One progress line, e.g. `[running] 42% · planning week 2`.
pub(crate) fn progress_line(snap: &RunSnapshot<Value>) -> String {
    let status = snap
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "idle".to_string());
    let mut line = format!("[{status}] {:>3}%", snap.progress);
    if let Some(step) = snap.current_step.as_deref() {
        line.push_str(&format!(" · {step}"));
    }
    if let Some(id) = snap.run_id.as_deref() {
        line.push_str(&format!(" (run {id})"));
    }
    line
}

/// Final lines for a finished run.
pub(crate) fn finished_lines(snap: &RunSnapshot<Value>) -> Vec<String> {
    let mut lines = vec![progress_line(snap)];
    if let Some(err) = snap.error.as_deref() {
        lines.push(format!("Error: {err}"));
    }
    if let Some(out) = snap.output.as_ref() {
        match serde_json::to_string_pretty(out) {
            Ok(s) => lines.push(s),
            Err(_) => lines.push(out.to_string()),
        }
    }
    lines
}

fn fmt_ms(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Table of generations plus per-type counts.
pub(crate) fn registry_lines(view: &RegistryView, now: OffsetDateTime) -> Vec<String> {
    let mut lines = Vec::new();
    let rows = view.generations_with_status(now);
    if rows.is_empty() {
        lines.push("No generations.".to_string());
    }
    for g in &rows {
        let status = match g.view.status {
            DerivedStatus::Running => "running",
            DerivedStatus::Completed => "completed",
            DerivedStatus::Failed => "failed",
        };
        let eta = g
            .view
            .estimated_remaining_ms
            .map(|ms| format!("eta {}", fmt_ms(ms)))
            .unwrap_or_else(|| "eta -".to_string());
        lines.push(format!(
            "{:<24} {:<22} {:<9} {:>3}%  {:>8}  {}",
            g.record.run_id,
            g.record.workflow_type,
            status,
            g.record.progress,
            fmt_ms(g.view.elapsed_ms),
            eta
        ));
    }
    for (ty, s) in view.stats_by_type() {
        lines.push(format!(
            "{ty}: active {} completed {} failed {}",
            s.active, s.completed, s.failed
        ));
    }
    lines
}

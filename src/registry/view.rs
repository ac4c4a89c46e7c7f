//! Derived, read-only views over a registry's records.
//!
//! Nothing here is stored: every accessor recomputes from the raw records
//! and an explicit `now`.

use crate::model::{
    DerivedGenerationView, DerivedStatus, GenerationRecord, GenerationWithStatus, TypeStats,
};
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Snapshot of a registry published after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryView {
    pub records: Vec<GenerationRecord>,
    /// Types the registry was acquired for; reported with zero counts in stats.
    pub workflow_types: Vec<String>,
}

impl RegistryView {
    pub fn generations_with_status(&self, now: OffsetDateTime) -> Vec<GenerationWithStatus> {
        self.records
            .iter()
            .map(|r| GenerationWithStatus {
                record: r.clone(),
                view: derive_view(r, now),
            })
            .collect()
    }

    pub fn active_generations(&self, now: OffsetDateTime) -> Vec<GenerationWithStatus> {
        self.generations_with_status(now)
            .into_iter()
            .filter(|g| g.view.status == DerivedStatus::Running)
            .collect()
    }

    pub fn stats_by_type(&self) -> BTreeMap<String, TypeStats> {
        let mut stats: BTreeMap<String, TypeStats> = self
            .workflow_types
            .iter()
            .map(|t| (t.clone(), TypeStats::default()))
            .collect();
        for r in &self.records {
            let entry = stats.entry(r.workflow_type.clone()).or_default();
            match derive_status(r) {
                DerivedStatus::Running => entry.active += 1,
                DerivedStatus::Completed => entry.completed += 1,
                DerivedStatus::Failed => entry.failed += 1,
            }
        }
        stats
    }
}

/// An error wins over a completion timestamp.
pub fn derive_status(record: &GenerationRecord) -> DerivedStatus {
    if record.error.is_some() {
        DerivedStatus::Failed
    } else if record.completed_at.is_some() {
        DerivedStatus::Completed
    } else {
        DerivedStatus::Running
    }
}

pub fn derive_view(record: &GenerationRecord, now: OffsetDateTime) -> DerivedGenerationView {
    let end = record.completed_at.unwrap_or(now);
    let elapsed = end - record.started_at;
    let elapsed_ms = u64::try_from(elapsed.whole_milliseconds()).unwrap_or(0);
    DerivedGenerationView {
        status: derive_status(record),
        elapsed_ms,
        estimated_remaining_ms: estimate_remaining_ms(record, elapsed_ms),
    }
}

/// Linear extrapolation from progress so far, falling back to the server's
/// duration hint. `None` when there is nothing to go on.
pub fn estimate_remaining_ms(record: &GenerationRecord, elapsed_ms: u64) -> Option<u64> {
    let progress = u64::from(record.progress);
    if progress > 0 && progress < 100 && record.completed_at.is_none() {
        let per_pct = elapsed_ms as f64 / progress as f64;
        let remaining = per_pct * (100 - progress) as f64;
        return Some(remaining.max(0.0).round() as u64);
    }
    match record.estimated_duration_ms {
        Some(hint) if progress > 0 => Some(hint.saturating_sub(elapsed_ms)),
        _ => None,
    }
}

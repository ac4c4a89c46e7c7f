use crate::model::{GenerationRecord, RegistryEvent};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Who and what a registry is tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScope {
    pub user_id: String,
    /// Empty means every workflow type.
    pub workflow_types: Vec<String>,
    pub include_completed: bool,
}

impl SyncScope {
    pub fn accepts_type(&self, workflow_type: &str) -> bool {
        self.workflow_types.is_empty() || self.workflow_types.iter().any(|t| t == workflow_type)
    }
}

/// Outcome of applying one push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Insert for an id already present; replaced in place.
    Replaced,
    Updated,
    /// Updated to a finished state that the scope does not display.
    UpdatedFinished,
    Removed,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OtherUser,
    FilteredType,
    UnknownRun,
    Tombstoned,
}

/// Ordered, bounded, id-unique collection of generation records.
#[derive(Debug)]
pub struct RegistryState {
    records: Vec<GenerationRecord>,
    limit: usize,
    tombstone_ttl: Duration,
    tombstones: HashMap<String, Instant>,
    /// Ids changed by events while a bulk fetch is in flight.
    touched: HashSet<String>,
    fetching: bool,
}

impl RegistryState {
    pub fn new(limit: usize, tombstone_ttl: Duration) -> Self {
        Self {
            records: Vec::new(),
            limit,
            tombstone_ttl,
            tombstones: HashMap::new(),
            touched: HashSet::new(),
            fetching: false,
        }
    }

    pub fn records(&self) -> &[GenerationRecord] {
        &self.records
    }

    pub fn get(&self, run_id: &str) -> Option<&GenerationRecord> {
        self.records.iter().find(|r| r.run_id == run_id)
    }

    fn position(&self, run_id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.run_id == run_id)
    }

    fn prune_tombstones(&mut self, now: Instant) {
        let ttl = self.tombstone_ttl;
        self.tombstones.retain(|_, deleted_at| now.duration_since(*deleted_at) < ttl);
    }

    fn is_tombstoned(&mut self, run_id: &str, now: Instant) -> bool {
        self.prune_tombstones(now);
        self.tombstones.contains_key(run_id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    pub fn apply_event(&mut self, event: RegistryEvent, scope: &SyncScope, now: Instant) -> Applied {
        if let Some(user) = event.user_id() {
            if user != scope.user_id {
                debug!(run_id = event.run_id(), user, "discarding event for another user");
                return Applied::Ignored(IgnoreReason::OtherUser);
            }
        }
        let run_id = event.run_id().to_string();
        let (applied, changed) = match event {
            RegistryEvent::Insert(record) => {
                let applied = self.insert(record, scope, now);
                (applied.clone(), !matches!(applied, Applied::Ignored(_)))
            }
            RegistryEvent::Update(record) => {
                let applied = self.update(record, scope);
                (applied.clone(), !matches!(applied, Applied::Ignored(_)))
            }
            RegistryEvent::Delete { run_id, .. } => {
                // A delete always leaves a tombstone, even for an unknown run.
                self.prune_tombstones(now);
                self.tombstones.insert(run_id.clone(), now);
                let applied = if self.remove(&run_id) {
                    Applied::Removed
                } else {
                    Applied::Ignored(IgnoreReason::UnknownRun)
                };
                (applied, true)
            }
        };
        if changed && self.fetching {
            self.touched.insert(run_id);
        }
        applied
    }

    fn insert(&mut self, record: GenerationRecord, scope: &SyncScope, now: Instant) -> Applied {
        if !scope.accepts_type(&record.workflow_type) {
            return Applied::Ignored(IgnoreReason::FilteredType);
        }
        if self.is_tombstoned(&record.run_id, now) {
            debug!(run_id = %record.run_id, "suppressing insert for a deleted run");
            return Applied::Ignored(IgnoreReason::Tombstoned);
        }
        if let Some(idx) = self.position(&record.run_id) {
            self.records[idx] = record;
            return Applied::Replaced;
        }
        self.records.insert(0, record);
        self.records.truncate(self.limit);
        Applied::Inserted
    }

    fn update(&mut self, mut record: GenerationRecord, scope: &SyncScope) -> Applied {
        let Some(idx) = self.position(&record.run_id) else {
            debug!(run_id = %record.run_id, "update for a run that is not tracked");
            return Applied::Ignored(IgnoreReason::UnknownRun);
        };
        let current = &self.records[idx];
        if record.progress < current.progress && !record.is_finished() {
            debug!(
                run_id = %record.run_id,
                from = current.progress,
                to = record.progress,
                "ignoring progress regression"
            );
            record.progress = current.progress;
        }
        let finished = record.is_finished();
        self.records[idx] = record;
        if finished && !scope.include_completed {
            Applied::UpdatedFinished
        } else {
            Applied::Updated
        }
    }

    pub fn remove(&mut self, run_id: &str) -> bool {
        match self.position(run_id) {
            Some(idx) => {
                self.records.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Called when a bulk fetch is issued.
    pub fn begin_fetch(&mut self) {
        self.touched.clear();
        self.fetching = true;
    }

    /// Called when a bulk fetch fails; nothing is merged.
    pub fn abort_fetch(&mut self) {
        self.touched.clear();
        self.fetching = false;
    }

    /// Merge a bulk fetch result.
    ///
    /// The server list becomes the base; records touched by push events
    /// since the fetch began win over their fetched copies, touched records
    /// the fetch did not return are kept in front, and deleted ids stay out.
    pub fn load(&mut self, fetched: Vec<GenerationRecord>, scope: &SyncScope, now: Instant) {
        let mut next: Vec<GenerationRecord> = self
            .records
            .iter()
            .filter(|r| self.touched.contains(&r.run_id))
            .filter(|r| !fetched.iter().any(|f| f.run_id == r.run_id))
            .cloned()
            .collect();

        for row in fetched {
            if !scope.accepts_type(&row.workflow_type) || self.is_tombstoned(&row.run_id, now) {
                continue;
            }
            if next.iter().any(|r| r.run_id == row.run_id) {
                continue;
            }
            let row = if self.touched.contains(&row.run_id) {
                match self.get(&row.run_id) {
                    Some(local) => local.clone(),
                    // Touched but gone locally: removed by an event or the grace timer.
                    None => continue,
                }
            } else {
                row
            };
            next.push(row);
        }
        next.truncate(self.limit);
        self.records = next;
        self.touched.clear();
        self.fetching = false;
    }
}

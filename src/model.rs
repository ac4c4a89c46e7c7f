use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;

/// Server-side status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Error,
}

impl WorkflowRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Completed
                | WorkflowRunStatus::Failed
                | WorkflowRunStatus::Cancelled
                | WorkflowRunStatus::Error
        )
    }

    /// Terminal states other than `completed`.
    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != WorkflowRunStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Paused => "paused",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
            WorkflowRunStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer-facing view of the run owned by a `RunTracker`.
///
/// `status == None` means the tracker is idle.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot<T> {
    pub run_id: Option<String>,
    pub status: Option<WorkflowRunStatus>,
    pub progress: u8,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub output: Option<T>,
}

impl<T> Default for RunSnapshot<T> {
    fn default() -> Self {
        Self {
            run_id: None,
            status: None,
            progress: 0,
            current_step: None,
            error: None,
            output: None,
        }
    }
}

impl<T> RunSnapshot<T> {
    pub fn is_idle(&self) -> bool {
        self.status.is_none()
    }

    pub fn is_generating(&self) -> bool {
        self.status.map(|s| !s.is_terminal()).unwrap_or(false)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.map(WorkflowRunStatus::is_terminal).unwrap_or(false)
    }
}

/// Body of `GET /workflow/{runId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: WorkflowRunStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, alias = "current_step")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
}

impl StatusResponse {
    pub fn progress_pct(&self) -> Option<u8> {
        self.progress.map(clamp_progress)
    }
}

pub(crate) fn clamp_progress(p: f64) -> u8 {
    if p.is_nan() {
        return 0;
    }
    p.round().clamp(0.0, 100.0) as u8
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(raw.map(clamp_progress).unwrap_or(0))
}

/// One row of the generation table, as listed in bulk or delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    #[serde(alias = "runId")]
    pub run_id: String,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "workflowType")]
    pub workflow_type: String,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: u8,
    #[serde(default, alias = "currentStep")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(with = "time::serde::rfc3339", alias = "startedAt")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", alias = "updatedAt")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", alias = "completedAt")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, alias = "estimatedDurationMs")]
    pub estimated_duration_ms: Option<u64>,
}

impl GenerationRecord {
    /// Whether the row carries a completion timestamp or an error.
    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some() || self.error.is_some()
    }
}

/// Collapsed status derived from timestamps and error presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedGenerationView {
    pub status: DerivedStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationWithStatus {
    #[serde(flatten)]
    pub record: GenerationRecord,
    pub view: DerivedGenerationView,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// A row-level mutation delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Insert(GenerationRecord),
    Update(GenerationRecord),
    Delete {
        run_id: String,
        user_id: Option<String>,
    },
}

impl RegistryEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RegistryEvent::Insert(r) | RegistryEvent::Update(r) => &r.run_id,
            RegistryEvent::Delete { run_id, .. } => run_id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::Insert(r) | RegistryEvent::Update(r) => r.user_id.as_deref(),
            RegistryEvent::Delete { user_id, .. } => user_id.as_deref(),
        }
    }
}

/// Wire shape of a push event: `{eventType, new, old}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType", alias = "event_type", alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

fn non_empty(v: Option<Value>) -> Option<Value> {
    v.filter(|v| v.as_object().map(|m| !m.is_empty()).unwrap_or(!v.is_null()))
}

impl TryFrom<ChangeEvent> for RegistryEvent {
    type Error = crate::error::TrackerError;

    fn try_from(ev: ChangeEvent) -> Result<Self, Self::Error> {
        use crate::error::TrackerError;

        match ev.event_type.to_ascii_lowercase().as_str() {
            "insert" => {
                let row = non_empty(ev.new)
                    .ok_or_else(|| TrackerError::invalid_response("new", "insert without row"))?;
                Ok(RegistryEvent::Insert(serde_json::from_value(row)?))
            }
            "update" => {
                let row = non_empty(ev.new)
                    .ok_or_else(|| TrackerError::invalid_response("new", "update without row"))?;
                Ok(RegistryEvent::Update(serde_json::from_value(row)?))
            }
            "delete" => {
                // Deletes usually only carry the primary key in `old`.
                let row = non_empty(ev.old)
                    .or_else(|| non_empty(ev.new))
                    .ok_or_else(|| TrackerError::invalid_response("old", "delete without key"))?;
                let field = |names: &[&str]| {
                    names
                        .iter()
                        .find_map(|n| row.get(*n).and_then(Value::as_str))
                        .map(str::to_string)
                };
                let run_id = field(&["run_id", "runId"])
                    .ok_or_else(|| TrackerError::invalid_response("old.run_id", "missing"))?;
                Ok(RegistryEvent::Delete {
                    run_id,
                    user_id: field(&["user_id", "userId"]),
                })
            }
            other => Err(TrackerError::invalid_response(
                "eventType",
                format!("unknown event type {other:?}"),
            )),
        }
    }
}

/// Events emitted by the CLI run controller to presentation code.
#[derive(Debug, Clone, Serialize)]
pub enum RunEvent {
    Progress(RunSnapshot<Value>),
    Info(String),
    Finished(RunSnapshot<Value>),
}

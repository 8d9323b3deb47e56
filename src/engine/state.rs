//! Run, step, and checkpoint state owned by the executor.
//!
//! `EngineState` is deliberately a tagged variant rather than a bag of
//! optional fields: resume logic can only ever see a complete
//! `SuspendSnapshot`, never a half-populated one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a run: `pending → running → {completed|failed|suspended|cancelled}`,
/// with `suspended → running` on resume. `cancelled` is applied by the
/// surrounding system, never by the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "suspended" => Some(Self::Suspended),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node execution status, an audit projection only: the executor never
/// consults step rows for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Failure detail surfaced on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub code: String,
}

impl RunError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

/// One execution attempt of a definition version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub definition_id: String,
    /// Pinned at run creation; later definition edits never affect an
    /// in-flight run.
    pub definition_version: u32,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<RunError>,
    /// Present iff the run is (or was) suspended.
    pub engine_state: Option<SuspendSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(definition_id: impl Into<String>, definition_version: u32, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            definition_id: definition_id.into(),
            definition_version,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            engine_state: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            suspended_at: None,
            resumed_at: None,
        }
    }
}

/// One row per node execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub node_kind: String,
    pub sequence: u32,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl WorkflowStep {
    pub fn started(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        node_kind: impl Into<String>,
        sequence: u32,
        input: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            node_id: node_id.into(),
            node_kind: node_kind.into(),
            sequence,
            status: StepStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Transitions the step to a terminal (or suspended) status, stamping
    /// completion time and duration.
    pub fn finish(&mut self, status: StepStatus, output: Option<Value>, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.output = output;
        self.error = error;
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.completed_at = Some(now);
    }
}

/// The executor's resumable checkpoint. `Active` carries nothing; only a
/// suspension produces a snapshot worth persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EngineState {
    Active,
    Suspended(SuspendSnapshot),
}

impl From<SuspendSnapshot> for EngineState {
    fn from(snapshot: SuspendSnapshot) -> Self {
        Self::Suspended(snapshot)
    }
}

impl EngineState {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    pub fn snapshot(&self) -> Option<&SuspendSnapshot> {
        match self {
            Self::Active => None,
            Self::Suspended(snapshot) => Some(snapshot),
        }
    }
}

/// Everything needed to re-enter the topological walk after a suspension:
/// resuming starts at the suspended node's successors with `step_results`
/// as already-computed context, never re-executing completed nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendSnapshot {
    pub suspended_at_node_id: String,
    /// Ordered list of node ids that already ran.
    pub completed_node_ids: Vec<String>,
    /// Node id to that node's output.
    pub step_results: Map<String, Value>,
    /// How many times this run has been resumed.
    #[serde(default)]
    pub resume_count: u32,
}

/// The sole contract the surrounding system maps onto status codes and
/// stream events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<RunError>,
    /// Present iff `status` is `Suspended`.
    pub engine_state: Option<SuspendSnapshot>,
    pub step_results: Map<String, Value>,
}

impl RunResult {
    pub fn completed(output: Option<Value>, step_results: Map<String, Value>) -> Self {
        Self {
            status: RunStatus::Completed,
            output,
            error: None,
            engine_state: None,
            step_results,
        }
    }

    pub fn failed(error: RunError, step_results: Map<String, Value>) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(error),
            engine_state: None,
            step_results,
        }
    }

    pub fn suspended(snapshot: SuspendSnapshot) -> Self {
        let step_results = snapshot.step_results.clone();
        Self {
            status: RunStatus::Suspended,
            output: None,
            error: None,
            engine_state: Some(snapshot),
            step_results,
        }
    }
}

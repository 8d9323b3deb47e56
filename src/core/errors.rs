use thiserror::Error;

/// Unified error type for the workflow engine.
///
/// Suspension is deliberately *not* represented here: reaching an approval
/// node is a controlled transition to the `Suspended` run status, surfaced
/// through `RunResult`, never through this type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural problems detected before any node runs.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The definition's graph contains a cycle.
    #[error("Cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    /// A node failed during execution (tool failure after retries, model
    /// invocation failure, projection failure, ...).
    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// A condition or iterator expression could not be parsed or evaluated.
    #[error("Expression evaluation failed: {0}")]
    Expression(String),

    /// A single parallel branch failed; escalated under fail-fast.
    #[error("Branch '{branch}' failed: {message}")]
    Branch { branch: String, message: String },

    /// Every branch of an `any`-merge parallel node failed.
    #[error("All parallel branches failed: {0}")]
    AllBranchesFailed(String),

    /// A branch exceeded its timeout window.
    #[error("Operation timed out: {operation} ({timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A run's event channel refused another subscriber.
    #[error("Subscriber limit reached for run '{run_id}' (limit: {limit})")]
    SubscriberLimit { run_id: String, limit: usize },

    /// The caller asked for something the current state does not permit,
    /// e.g. resuming a run that is not suspended.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn node(node_id: impl Into<String>, message: impl ToString) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Stable machine-readable code, recorded on failed runs so operators
    /// can group failures without parsing messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::CycleDetected(_) => "cycle_detected",
            Self::NodeExecution { .. } => "node_execution_error",
            Self::Expression(_) => "expression_error",
            Self::Branch { .. } => "branch_error",
            Self::AllBranchesFailed(_) => "all_branches_failed",
            Self::Timeout { .. } => "timeout",
            Self::SubscriberLimit { .. } => "subscriber_limit",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) => "serialization_error",
            Self::Database(_) => "database_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the failure happened before any node executed.
    pub fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::CycleDetected(_))
    }
}

/// Result type alias for convenience
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

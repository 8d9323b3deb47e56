pub mod executor;
pub mod expr;
pub mod parallel;
pub mod progress;
pub mod retry;
pub mod state;

pub use executor::{EngineConfig, EngineConfigPatch, Executor, ModelInvoker, ToolInvoker};
pub use parallel::{
    execute_parallel_branches, BranchOutcome, BranchRequest, ErrorHandling, MergeStrategy,
    ParallelBranch,
};
pub use progress::{ProgressEmitter, StepEvent, StepEventEnvelope, StepStage, StreamingWriter};
pub use retry::{
    calculate_backoff_delay, merge_retry_policy, with_retry, RetryPolicy, RetryPolicyOverrides,
};
pub use state::{
    EngineState, RunError, RunResult, RunStatus, StepStatus, SuspendSnapshot, WorkflowRun,
    WorkflowStep,
};

//! The executor: drives a validated definition to completion, suspension,
//! or failure, one node at a time, with explicit fan-out at parallel
//! nodes.
//!
//! Control flow is owned entirely by the walk over the topological order;
//! step rows are an audit projection and are never read back. The only
//! suspension point is an approval node, always between nodes, so a
//! suspended run holds nothing but its persisted snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::errors::{EngineError, Result};
use crate::engine::expr;
use crate::engine::parallel::{execute_parallel_branches, BranchRequest, ParallelBranch};
use crate::engine::progress::ProgressEmitter;
use crate::engine::retry::with_retry;
use crate::engine::state::{
    EngineState, RunError, RunResult, StepStatus, SuspendSnapshot, WorkflowStep,
};
use crate::graph::definition::{
    AiStepNode, ConditionNode, InputNode, LoopNode, NodeKind, OutputNode, ParallelNode, ToolNode,
    WorkflowDefinition, WorkflowNode,
};
use crate::graph::validate;
use crate::storage::WorkflowRepository;

/// External tool invocation seam. The engine looks tools up by name and
/// treats any error as a tool-specific failure.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: Value) -> anyhow::Result<Value>;
}

/// Model invocation seam. When a token channel is supplied the
/// implementation may stream partial output through it before returning
/// the final result.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        model: &str,
        prompt: &str,
        tokens: Option<mpsc::UnboundedSender<String>>,
    ) -> anyhow::Result<Value>;
}

/// Engine-wide execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on loop iterations regardless of per-node settings.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// Timeout applied to parallel branches that declare none.
    #[serde(default)]
    pub default_branch_timeout_ms: Option<u64>,
    /// Staleness window for the crash-recovery sweep, in seconds.
    /// Operator-tunable; a run still `running` past this window is
    /// presumed crashed.
    #[serde(default = "default_stale_run_timeout_secs")]
    pub stale_run_timeout_secs: u64,
}

fn default_max_loop_iterations() -> u32 {
    1_000
}

fn default_stale_run_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            default_branch_timeout_ms: None,
            stale_run_timeout_secs: default_stale_run_timeout_secs(),
        }
    }
}

/// Partial config for per-definition overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigPatch {
    #[serde(default)]
    pub max_loop_iterations: Option<u32>,
    #[serde(default)]
    pub default_branch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub stale_run_timeout_secs: Option<u64>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_loop_iterations == 0 {
            return Err(EngineError::validation(
                "max_loop_iterations must be greater than 0",
            ));
        }
        if self.stale_run_timeout_secs == 0 {
            return Err(EngineError::validation(
                "stale_run_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Merges two configurations, with the patch taking precedence.
    pub fn merge(base: &Self, patch: &EngineConfigPatch) -> Result<Self> {
        let merged = Self {
            max_loop_iterations: patch.max_loop_iterations.unwrap_or(base.max_loop_iterations),
            default_branch_timeout_ms: patch
                .default_branch_timeout_ms
                .or(base.default_branch_timeout_ms),
            stale_run_timeout_secs: patch
                .stale_run_timeout_secs
                .unwrap_or(base.stale_run_timeout_secs),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Drives workflow runs. One executor instance serves many concurrent
/// runs; runs share no mutable state.
pub struct Executor {
    tools: Arc<dyn ToolInvoker>,
    model: Arc<dyn ModelInvoker>,
    progress: Arc<ProgressEmitter>,
    repository: Option<Arc<dyn WorkflowRepository>>,
    config: EngineConfig,
}

impl Executor {
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        model: Arc<dyn ModelInvoker>,
        progress: Arc<ProgressEmitter>,
    ) -> Self {
        Self {
            tools,
            model,
            progress,
            repository: None,
            config: EngineConfig::default(),
        }
    }

    /// Attaches a repository for step auditing.
    pub fn with_repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes a definition from scratch under a fresh run id.
    pub async fn execute(&self, definition: &WorkflowDefinition, input: Value) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        self.execute_with_id(&run_id, definition, input).await
    }

    /// Executes under a caller-supplied run id, so step rows and progress
    /// events correlate with the caller's `WorkflowRun` row.
    pub async fn execute_with_id(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<RunResult> {
        self.run_walk(run_id, definition, input, None).await
    }

    /// Re-enters a suspended run. Nodes already in the snapshot's
    /// `completed_node_ids` are never re-dispatched; the suspended
    /// approval node completes with `resume_data` as its result.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        state: EngineState,
        resume_data: Value,
    ) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        self.resume_with_id(&run_id, definition, state, resume_data)
            .await
    }

    pub async fn resume_with_id(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        state: EngineState,
        resume_data: Value,
    ) -> Result<RunResult> {
        let snapshot = match state {
            EngineState::Suspended(snapshot) => snapshot,
            EngineState::Active => {
                return Err(EngineError::invalid_state(
                    "cannot resume a run that is not suspended",
                ))
            }
        };
        if definition.node(&snapshot.suspended_at_node_id).is_none() {
            return Err(EngineError::invalid_state(format!(
                "cannot resume: suspended node '{}' no longer exists in definition '{}'",
                snapshot.suspended_at_node_id, definition.id
            )));
        }
        self.run_walk(run_id, definition, resume_data.clone(), Some(snapshot))
            .await
    }

    async fn run_walk(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        input: Value,
        resume: Option<SuspendSnapshot>,
    ) -> Result<RunResult> {
        // Re-validated on every entry: resumed state may reference a
        // since-edited definition.
        validate::validate(definition)?;
        let ordered = validate::topological_sort(&definition.nodes, &definition.edges)?;
        let embedded = definition.embedded_node_ids();

        let resuming = resume.is_some();
        let (mut step_results, mut completed, resume_target, resume_count) = match resume {
            Some(snapshot) => (
                snapshot.step_results,
                snapshot.completed_node_ids,
                Some(snapshot.suspended_at_node_id),
                snapshot.resume_count + 1,
            ),
            None => (Map::new(), Vec::new(), None, 0),
        };
        let mut completed_set: HashSet<String> = completed.iter().cloned().collect();

        let runner = Arc::new(NodeRunner {
            tools: self.tools.clone(),
            model: self.model.clone(),
            progress: self.progress.clone(),
            repository: self.repository.clone(),
            run_id: run_id.to_string(),
            run_input: input.clone(),
            sequence: AtomicU32::new(completed.len() as u32),
        });

        info!(
            run_id,
            definition_id = %definition.id,
            definition_version = definition.version,
            resumed = resuming,
            "starting workflow walk"
        );

        // Condition decisions made this walk (or restored from snapshot
        // results on resume), used to prune untaken branches.
        let mut branch_taken: HashMap<String, bool> = HashMap::new();
        let mut final_output: Option<Value> = None;

        for node in ordered {
            if embedded.contains(node.id.as_str()) {
                continue;
            }
            if completed_set.contains(&node.id) {
                if matches!(&node.kind, NodeKind::Condition(_)) {
                    if let Some(value) = step_results.get(&node.id) {
                        branch_taken.insert(node.id.clone(), expr::truthy(value));
                    }
                }
                continue;
            }

            // The suspended approval node completes with the resume data.
            if resume_target.as_deref() == Some(node.id.as_str()) {
                let step = runner.record_start(node, Some(input.clone())).await;
                runner
                    .record_finish(step, StepStatus::Completed, Some(input.clone()), None)
                    .await;
                step_results.insert(node.id.clone(), input.clone());
                completed.push(node.id.clone());
                completed_set.insert(node.id.clone());
                debug!(run_id, node_id = %node.id, "approval node resolved by resume");
                continue;
            }

            if !node_reachable(definition, node, &completed_set, &branch_taken) {
                // Not on the taken branch: never visited, no step recorded.
                continue;
            }

            let prior = prior_output(definition, node, &completed_set, &branch_taken, &step_results);

            let outcome: Result<Value> = match &node.kind {
                NodeKind::Approval(data) => {
                    let step = runner
                        .record_start(node, Some(json!({"prompt": data.prompt})))
                        .await;
                    runner
                        .record_finish(step, StepStatus::Suspended, None, None)
                        .await;
                    let snapshot = SuspendSnapshot {
                        suspended_at_node_id: node.id.clone(),
                        completed_node_ids: completed,
                        step_results,
                        resume_count,
                    };
                    info!(run_id, node_id = %node.id, "run suspended awaiting approval");
                    self.progress.run_finished(run_id);
                    return Ok(RunResult::suspended(snapshot));
                }
                NodeKind::Parallel(data) => {
                    let step = runner
                        .record_start(
                            node,
                            Some(json!({
                                "branches": data.branch_node_ids.len(),
                                "merge_strategy": data.merge_strategy,
                                "error_handling": data.error_handling,
                                "timeout_ms": data.timeout_ms,
                            })),
                        )
                        .await;
                    let outcome = self
                        .run_parallel(&runner, definition, node, data, &step_results)
                        .await;
                    runner.finish_with(step, outcome).await
                }
                NodeKind::Loop(data) => {
                    let step = runner
                        .record_start(
                            node,
                            Some(json!({
                                "items_expr": data.items_expr,
                                "max_iterations": data.max_iterations,
                            })),
                        )
                        .await;
                    let outcome = self
                        .run_loop(&runner, definition, node, data, &step_results, &prior)
                        .await;
                    runner.finish_with(step, outcome).await
                }
                _ => runner.run_simple_node(node, &step_results, &prior).await,
            };

            match outcome {
                Ok(value) => {
                    if let NodeKind::Condition(_) = &node.kind {
                        branch_taken.insert(node.id.clone(), expr::truthy(&value));
                    }
                    if let NodeKind::Output(_) = &node.kind {
                        final_output = Some(value.clone());
                    }
                    step_results.insert(node.id.clone(), value);
                    completed.push(node.id.clone());
                    completed_set.insert(node.id.clone());

                    // Embedded nodes ran inside their owner; mark them
                    // completed so downstream edges authored against them
                    // stay active, without re-dispatching them.
                    if let NodeKind::Parallel(data) = &node.kind {
                        for id in data.branch_node_ids.iter().flatten() {
                            if completed_set.insert(id.clone()) {
                                completed.push(id.clone());
                            }
                        }
                    }
                    if let NodeKind::Loop(data) = &node.kind {
                        for id in &data.body_node_ids {
                            if completed_set.insert(id.clone()) {
                                completed.push(id.clone());
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(run_id, node_id = %node.id, error = %err, "node failed, failing run");
                    self.progress.run_finished(run_id);
                    return Ok(RunResult::failed(
                        RunError::new(err.to_string(), err.code()),
                        step_results,
                    ));
                }
            }
        }

        info!(run_id, "workflow walk completed");
        self.progress.run_finished(run_id);
        Ok(RunResult::completed(final_output, step_results))
    }

    /// Fans a parallel node out through the branch coordinator. Each
    /// branch runs over its own clone of the accumulated results, so
    /// siblings cannot observe each other.
    async fn run_parallel(
        &self,
        runner: &Arc<NodeRunner>,
        definition: &WorkflowDefinition,
        node: &WorkflowNode,
        data: &ParallelNode,
        results: &Map<String, Value>,
    ) -> Result<Value> {
        let branches = data
            .branch_node_ids
            .iter()
            .enumerate()
            .map(|(index, ids)| {
                let name = data.branch_name(index);
                let nodes: Vec<WorkflowNode> = ids
                    .iter()
                    .filter_map(|id| definition.node(id).cloned())
                    .collect();
                let branch_runner = runner.clone();
                let branch_results = results.clone();
                ParallelBranch {
                    name,
                    future: Box::pin(async move {
                        branch_runner
                            .run_sequence(&nodes, branch_results, Value::Null)
                            .await
                            .map_err(anyhow::Error::from)
                    }),
                }
            })
            .collect();

        let merged = execute_parallel_branches(BranchRequest {
            branches,
            merge_strategy: data.merge_strategy,
            error_handling: data.error_handling,
            timeout_ms: data.timeout_ms.or(self.config.default_branch_timeout_ms),
        })
        .await?;

        debug!(node_id = %node.id, branches = merged.len(), "parallel node merged");
        serde_json::to_value(&merged).map_err(EngineError::Serialization)
    }

    /// Iterates a loop body over the collection its expression yields,
    /// isolating each iteration's intermediate results from the next.
    async fn run_loop(
        &self,
        runner: &Arc<NodeRunner>,
        definition: &WorkflowDefinition,
        node: &WorkflowNode,
        data: &LoopNode,
        results: &Map<String, Value>,
        prior: &Value,
    ) -> Result<Value> {
        let context = build_expr_context(results, prior);
        let items_value = expr::evaluate(&data.items_expr, &context)?;
        let items = items_value.as_array().ok_or_else(|| {
            EngineError::node(
                &node.id,
                format!(
                    "iterator expression '{}' did not yield an array",
                    data.items_expr
                ),
            )
        })?;

        let cap = data.max_iterations.min(self.config.max_loop_iterations) as usize;
        let body: Vec<WorkflowNode> = data
            .body_node_ids
            .iter()
            .filter_map(|id| definition.node(id).cloned())
            .collect();

        let mut iterations = Vec::with_capacity(items.len().min(cap));
        for (index, item) in items.iter().enumerate() {
            if index >= cap {
                warn!(node_id = %node.id, cap, total = items.len(), "loop truncated at iteration cap");
                break;
            }
            // Fresh scope per element: iterations never observe each
            // other's intermediate results.
            let mut scoped = results.clone();
            scoped.insert(node.id.clone(), json!({"item": item, "index": index}));
            let value = runner
                .run_sequence(&body, scoped, Value::Null)
                .await
                .map_err(|e| EngineError::node(&node.id, format!("iteration {index}: {e}")))?;
            iterations.push(value);
        }

        Ok(json!({"iterations": iterations, "count": iterations.len()}))
    }
}

/// Per-run execution state shared between the top-level walk and spawned
/// branch sequences.
struct NodeRunner {
    tools: Arc<dyn ToolInvoker>,
    model: Arc<dyn ModelInvoker>,
    progress: Arc<ProgressEmitter>,
    repository: Option<Arc<dyn WorkflowRepository>>,
    run_id: String,
    run_input: Value,
    sequence: AtomicU32,
}

impl NodeRunner {
    async fn record_start(&self, node: &WorkflowNode, input: Option<Value>) -> WorkflowStep {
        let step = WorkflowStep::started(
            &self.run_id,
            &node.id,
            node.kind.name(),
            self.sequence.fetch_add(1, Ordering::SeqCst),
            input.clone(),
        );
        self.progress.node_started(
            &self.run_id,
            &node.id,
            node.kind.name(),
            input.unwrap_or(Value::Null),
        );
        if let Some(repo) = &self.repository {
            if let Err(e) = repo.append_step(&step).await {
                warn!(run_id = %self.run_id, node_id = %node.id, error = %e, "failed to record step start");
            }
        }
        step
    }

    async fn record_finish(
        &self,
        mut step: WorkflowStep,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        step.finish(status, output.clone(), error.clone());
        match status {
            StepStatus::Failed => {
                self.progress.node_failed(
                    &self.run_id,
                    &step.node_id,
                    &step.node_kind,
                    error.as_deref().unwrap_or("unknown error"),
                );
            }
            StepStatus::Suspended => {
                self.progress.node_completed(
                    &self.run_id,
                    &step.node_id,
                    &step.node_kind,
                    json!({"status": "suspended"}),
                );
            }
            _ => {
                self.progress.node_completed(
                    &self.run_id,
                    &step.node_id,
                    &step.node_kind,
                    output.unwrap_or(Value::Null),
                );
            }
        }
        if let Some(repo) = &self.repository {
            if let Err(e) = repo.update_step(&step).await {
                warn!(run_id = %self.run_id, node_id = %step.node_id, error = %e, "failed to record step finish");
            }
        }
    }

    async fn finish_with(&self, step: WorkflowStep, outcome: Result<Value>) -> Result<Value> {
        match outcome {
            Ok(value) => {
                self.record_finish(step, StepStatus::Completed, Some(value.clone()), None)
                    .await;
                Ok(value)
            }
            Err(err) => {
                self.record_finish(step, StepStatus::Failed, None, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Executes one non-structural node (tool, ai-step, condition, input,
    /// output), recording its step and progress events.
    async fn run_simple_node(
        &self,
        node: &WorkflowNode,
        results: &Map<String, Value>,
        prior: &Value,
    ) -> Result<Value> {
        match &node.kind {
            NodeKind::Tool(data) => {
                let args = self.resolve_args(&node.id, data, results);
                let step = self
                    .record_start(node, args.as_ref().ok().cloned())
                    .await;
                let outcome = match args {
                    Ok(args) => self.invoke_tool(&node.id, data, args).await,
                    Err(e) => Err(e),
                };
                self.finish_with(step, outcome).await
            }
            NodeKind::AiStep(data) => {
                let step = self
                    .record_start(
                        node,
                        Some(json!({
                            "model": data.model,
                            "prompt": data.prompt,
                            "stream": data.stream,
                        })),
                    )
                    .await;
                let outcome = self.invoke_model(&node.id, data).await;
                self.finish_with(step, outcome).await
            }
            NodeKind::Condition(data) => {
                let step = self
                    .record_start(node, Some(json!({"expression": data.expression})))
                    .await;
                let outcome = self.eval_condition(&node.id, data, results, prior);
                self.finish_with(step, outcome).await
            }
            NodeKind::Input(data) => {
                let value = self.project_input(data);
                let step = self.record_start(node, Some(value.clone())).await;
                self.finish_with(step, Ok(value)).await
            }
            NodeKind::Output(data) => {
                let step = self
                    .record_start(node, Some(json!({"mapping": data.mapping})))
                    .await;
                let outcome = Ok(project_output(data, results));
                self.finish_with(step, outcome).await
            }
            // Structural kinds are handled by the walk; reaching one here
            // means validation was bypassed.
            other => Err(EngineError::node(
                &node.id,
                format!(
                    "{} node cannot execute inside a linear sequence",
                    other.name()
                ),
            )),
        }
    }

    /// Runs a linear sequence of nodes over an isolated result scope,
    /// returning the last node's output. Used for parallel branches and
    /// loop-body iterations.
    async fn run_sequence(
        &self,
        nodes: &[WorkflowNode],
        mut results: Map<String, Value>,
        mut prior: Value,
    ) -> Result<Value> {
        let mut last = Value::Null;
        for node in nodes {
            let value = self.run_simple_node(node, &results, &prior).await?;
            results.insert(node.id.clone(), value.clone());
            prior = value.clone();
            last = value;
        }
        Ok(last)
    }

    /// Static args merged with dynamic references resolved from prior
    /// step results.
    fn resolve_args(
        &self,
        node_id: &str,
        data: &ToolNode,
        results: &Map<String, Value>,
    ) -> Result<Value> {
        let mut args = match &data.args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(EngineError::node(
                    node_id,
                    format!("static args must be an object, got {other}"),
                ))
            }
        };
        let results_value = Value::Object(results.clone());
        for (param, reference) in &data.arg_refs {
            let value = expr::resolve_path(&results_value, reference.split('.'));
            args.insert(param.clone(), value);
        }
        Ok(Value::Object(args))
    }

    async fn invoke_tool(&self, node_id: &str, data: &ToolNode, args: Value) -> Result<Value> {
        let invocation = match &data.retry {
            Some(policy) => {
                let tool_name = data.tool_name.clone();
                with_retry(
                    policy,
                    |_attempt| {
                        let tools = self.tools.clone();
                        let tool_name = tool_name.clone();
                        let args = args.clone();
                        async move { tools.invoke(&tool_name, args).await }
                    },
                    |message, attempt, will_retry| {
                        warn!(
                            node_id,
                            tool = %data.tool_name,
                            attempt,
                            will_retry,
                            error = message,
                            "tool invocation failed"
                        );
                    },
                )
                .await
            }
            None => self.tools.invoke(&data.tool_name, args).await,
        };
        invocation.map_err(|e| EngineError::node(node_id, e))
    }

    async fn invoke_model(&self, node_id: &str, data: &AiStepNode) -> Result<Value> {
        if data.stream {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let invocation = self.model.invoke(&data.model, &data.prompt, Some(tx));
            let drain = async {
                while let Some(token) = rx.recv().await {
                    self.progress
                        .token(&self.run_id, node_id, "ai-step", &token);
                }
            };
            let (result, ()) = tokio::join!(invocation, drain);
            result.map_err(|e| EngineError::node(node_id, e))
        } else {
            self.model
                .invoke(&data.model, &data.prompt, None)
                .await
                .map_err(|e| EngineError::node(node_id, e))
        }
    }

    fn eval_condition(
        &self,
        node_id: &str,
        data: &ConditionNode,
        results: &Map<String, Value>,
        prior: &Value,
    ) -> Result<Value> {
        let context = build_expr_context(results, prior);
        expr::evaluate_bool(&data.expression, &context)
            .map(Value::Bool)
            .map_err(|e| EngineError::node(node_id, e))
    }

    fn project_input(&self, data: &InputNode) -> Value {
        match &data.fields {
            None => self.run_input.clone(),
            Some(fields) => {
                let mut projected = Map::new();
                if let Value::Object(input) = &self.run_input {
                    for field in fields {
                        if let Some(value) = input.get(field) {
                            projected.insert(field.clone(), value.clone());
                        }
                    }
                }
                Value::Object(projected)
            }
        }
    }
}

/// Applies an output mapping (dotted-path projection) against accumulated
/// step results. Missing paths project to null rather than failing.
fn project_output(data: &OutputNode, results: &Map<String, Value>) -> Value {
    let results_value = Value::Object(results.clone());
    let mut output = Map::new();
    for (field, reference) in &data.mapping {
        output.insert(
            field.clone(),
            expr::resolve_path(&results_value, reference.split('.')),
        );
    }
    Value::Object(output)
}

/// Context for condition and iterator expressions: every node's result at
/// the top level, the full map under `results`, and the prior node's
/// output under `result`.
fn build_expr_context(results: &Map<String, Value>, prior: &Value) -> Value {
    let mut context = results.clone();
    context.insert("results".to_string(), Value::Object(results.clone()));
    context.insert("result".to_string(), prior.clone());
    Value::Object(context)
}

/// A node with incoming edges runs only if at least one incoming edge is
/// active. Edges out of a condition node are active only on the taken
/// label; unlabeled edges follow both outcomes; edges from nodes that
/// never ran are inactive.
fn node_reachable(
    definition: &WorkflowDefinition,
    node: &WorkflowNode,
    completed: &HashSet<String>,
    branch_taken: &HashMap<String, bool>,
) -> bool {
    let mut has_incoming = false;
    for edge in definition.incoming_edges(&node.id) {
        has_incoming = true;
        if edge_active(edge.source.as_str(), edge.label.as_deref(), completed, branch_taken) {
            return true;
        }
    }
    !has_incoming
}

fn edge_active(
    source: &str,
    label: Option<&str>,
    completed: &HashSet<String>,
    branch_taken: &HashMap<String, bool>,
) -> bool {
    if !completed.contains(source) {
        return false;
    }
    match (branch_taken.get(source), label) {
        (Some(taken), Some("true")) => *taken,
        (Some(taken), Some("false")) => !*taken,
        _ => true,
    }
}

/// Output of the first active incoming edge's source, in input order.
fn prior_output(
    definition: &WorkflowDefinition,
    node: &WorkflowNode,
    completed: &HashSet<String>,
    branch_taken: &HashMap<String, bool>,
    results: &Map<String, Value>,
) -> Value {
    for edge in definition.incoming_edges(&node.id) {
        if edge_active(edge.source.as_str(), edge.label.as_deref(), completed, branch_taken) {
            if let Some(value) = results.get(&edge.source) {
                return value.clone();
            }
        }
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::engine::retry::RetryPolicy;
    use crate::graph::definition::{ApprovalNode, WorkflowEdge};
    use std::sync::Mutex;

    /// Records every invocation; individual tools can be primed to fail.
    struct FakeTools {
        calls: Mutex<Vec<(String, Value)>>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl FakeTools {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
            }
        }

        fn fail_times(&self, tool: &str, times: usize) {
            self.failures.lock().unwrap().insert(tool.to_string(), times);
        }

        fn calls_for(&self, tool: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == tool)
                .count()
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeTools {
        async fn invoke(&self, tool_name: &str, args: Value) -> anyhow::Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), args.clone()));
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(tool_name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("{tool_name} is temporarily broken");
                }
            }
            Ok(json!({"tool": tool_name, "echo": args}))
        }
    }

    struct FakeModel;

    #[async_trait]
    impl ModelInvoker for FakeModel {
        async fn invoke(
            &self,
            model: &str,
            _prompt: &str,
            tokens: Option<mpsc::UnboundedSender<String>>,
        ) -> anyhow::Result<Value> {
            if let Some(tx) = tokens {
                for token in ["gen", "era", "ted"] {
                    let _ = tx.send(token.to_string());
                }
            }
            Ok(json!({"model": model, "text": "generated"}))
        }
    }

    fn harness() -> (Arc<FakeTools>, Executor) {
        let tools = Arc::new(FakeTools::new());
        let bus = Arc::new(InProcessBus::new());
        let executor = Executor::new(
            tools.clone(),
            Arc::new(FakeModel),
            Arc::new(ProgressEmitter::new(bus)),
        );
        (tools, executor)
    }

    fn tool_node(id: &str, tool: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            kind: NodeKind::Tool(ToolNode {
                tool_name: tool.to_string(),
                args: json!({}),
                arg_refs: Default::default(),
                retry: None,
            }),
            position: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> WorkflowEdge {
        WorkflowEdge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            label: None,
        }
    }

    fn labeled_edge(id: &str, source: &str, target: &str, label: &str) -> WorkflowEdge {
        WorkflowEdge {
            label: Some(label.to_string()),
            ..edge(id, source, target)
        }
    }

    fn definition(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            version: 1,
            name: "test".to_string(),
            description: None,
            nodes,
            edges,
        }
    }

    fn approval_workflow() -> WorkflowDefinition {
        let input = WorkflowNode {
            id: "in".to_string(),
            kind: NodeKind::Input(InputNode::default()),
            position: None,
        };
        let gate = WorkflowNode {
            id: "gate".to_string(),
            kind: NodeKind::Approval(ApprovalNode {
                prompt: Some("terminate instances?".to_string()),
            }),
            position: None,
        };
        definition(
            vec![
                input,
                tool_node("list", "ec2.list"),
                gate,
                tool_node("terminate", "ec2.terminate"),
            ],
            vec![
                edge("e1", "in", "list"),
                edge("e2", "list", "gate"),
                edge("e3", "gate", "terminate"),
            ],
        )
    }

    #[tokio::test]
    async fn test_approval_suspends_before_successors() {
        let (tools, executor) = harness();
        let result = executor
            .execute(&approval_workflow(), json!({"region": "us-east-1"}))
            .await
            .unwrap();

        assert_eq!(result.status, crate::engine::state::RunStatus::Suspended);
        let snapshot = result.engine_state.unwrap();
        assert_eq!(snapshot.suspended_at_node_id, "gate");
        assert_eq!(snapshot.completed_node_ids, vec!["in", "list"]);
        assert_eq!(tools.calls_for("ec2.list"), 1);
        assert_eq!(tools.calls_for("ec2.terminate"), 0);
    }

    #[tokio::test]
    async fn test_resume_runs_only_remaining_nodes() {
        let (tools, executor) = harness();
        let definition = approval_workflow();
        let suspended = executor
            .execute(&definition, json!({"region": "us-east-1"}))
            .await
            .unwrap();

        let resumed = executor
            .resume(
                &definition,
                EngineState::Suspended(suspended.engine_state.unwrap()),
                json!({"approved": true}),
            )
            .await
            .unwrap();

        assert_eq!(resumed.status, crate::engine::state::RunStatus::Completed);
        // No re-invocation of completed nodes, exactly one new call.
        assert_eq!(tools.calls_for("ec2.list"), 1);
        assert_eq!(tools.calls_for("ec2.terminate"), 1);
        assert_eq!(resumed.step_results["gate"], json!({"approved": true}));
    }

    #[tokio::test]
    async fn test_condition_prunes_untaken_branch() {
        let (tools, executor) = harness();
        let condition = WorkflowNode {
            id: "check".to_string(),
            kind: NodeKind::Condition(ConditionNode {
                expression: "result.echo.flag == true".to_string(),
            }),
            position: None,
        };
        let def = definition(
            vec![
                WorkflowNode {
                    id: "in".to_string(),
                    kind: NodeKind::Input(InputNode::default()),
                    position: None,
                },
                tool_node("probe", "probe"),
                condition,
                tool_node("when-true", "path.true"),
                tool_node("when-false", "path.false"),
            ],
            vec![
                edge("e1", "in", "probe"),
                edge("e2", "probe", "check"),
                labeled_edge("e3", "check", "when-true", "true"),
                labeled_edge("e4", "check", "when-false", "false"),
            ],
        );

        // probe echoes its args; feed flag=false through static args.
        let def = {
            let mut def = def;
            if let NodeKind::Tool(tool) = &mut def.nodes[1].kind {
                tool.args = json!({"flag": false});
            }
            def
        };

        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, crate::engine::state::RunStatus::Completed);
        assert_eq!(tools.calls_for("path.true"), 0);
        assert_eq!(tools.calls_for("path.false"), 1);
        assert_eq!(result.step_results["check"], json!(false));
        // The untaken node is absent entirely, not marked skipped.
        assert!(!result.step_results.contains_key("when-true"));
    }

    #[tokio::test]
    async fn test_tool_retry_policy_applies() {
        let (tools, executor) = harness();
        tools.fail_times("flaky", 2);
        let mut node = tool_node("t", "flaky");
        if let NodeKind::Tool(data) = &mut node.kind {
            data.retry = Some(RetryPolicy {
                max_retries: 3,
                backoff_ms: 1,
                backoff_multiplier: 1.0,
                max_backoff_ms: None,
                jitter: false,
            });
        }
        let def = definition(vec![node], vec![]);
        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, crate::engine::state::RunStatus::Completed);
        assert_eq!(tools.calls_for("flaky"), 3);
    }

    #[tokio::test]
    async fn test_tool_failure_after_retries_fails_run() {
        let (tools, executor) = harness();
        tools.fail_times("doomed", 10);
        let mut node = tool_node("t", "doomed");
        if let NodeKind::Tool(data) = &mut node.kind {
            data.retry = Some(RetryPolicy {
                max_retries: 1,
                backoff_ms: 1,
                backoff_multiplier: 1.0,
                max_backoff_ms: None,
                jitter: false,
            });
        }
        let def = definition(vec![node], vec![]);
        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, crate::engine::state::RunStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, "node_execution_error");
        assert!(error.message.contains("doomed"));
        assert_eq!(tools.calls_for("doomed"), 2);
    }

    #[tokio::test]
    async fn test_cyclic_definition_rejected_before_any_tool_runs() {
        let (tools, executor) = harness();
        let def = definition(
            vec![tool_node("a", "x"), tool_node("b", "y")],
            vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
        );
        let err = executor.execute(&def, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
        assert_eq!(tools.calls_for("x"), 0);
        assert_eq!(tools.calls_for("y"), 0);
    }

    #[tokio::test]
    async fn test_loop_isolates_iterations() {
        let (tools, executor) = harness();
        let seed = {
            let mut n = tool_node("seed", "seed");
            if let NodeKind::Tool(data) = &mut n.kind {
                data.args = json!({"items": ["a", "b", "c"]});
            }
            n
        };
        let body = {
            let mut n = tool_node("work", "work");
            if let NodeKind::Tool(data) = &mut n.kind {
                data.arg_refs =
                    [("element".to_string(), "each.item".to_string())].into_iter().collect();
            }
            n
        };
        let loop_node = WorkflowNode {
            id: "each".to_string(),
            kind: NodeKind::Loop(LoopNode {
                items_expr: "seed.echo.items".to_string(),
                body_node_ids: vec!["work".to_string()],
                max_iterations: 10,
            }),
            position: None,
        };
        let def = definition(
            vec![seed, loop_node, body],
            vec![edge("e1", "seed", "each")],
        );

        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, crate::engine::state::RunStatus::Completed);
        assert_eq!(tools.calls_for("work"), 3);
        assert_eq!(result.step_results["each"]["count"], json!(3));

        let elements: Vec<Value> = tools
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == "work")
            .map(|(_, args)| args["element"].clone())
            .collect();
        assert_eq!(elements, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_loop_respects_max_iterations() {
        let (tools, executor) = harness();
        let seed = {
            let mut n = tool_node("seed", "seed");
            if let NodeKind::Tool(data) = &mut n.kind {
                data.args = json!({"items": [1, 2, 3, 4, 5]});
            }
            n
        };
        let loop_node = WorkflowNode {
            id: "each".to_string(),
            kind: NodeKind::Loop(LoopNode {
                items_expr: "seed.echo.items".to_string(),
                body_node_ids: vec!["work".to_string()],
                max_iterations: 2,
            }),
            position: None,
        };
        let def = definition(
            vec![seed, loop_node, tool_node("work", "work")],
            vec![edge("e1", "seed", "each")],
        );

        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.step_results["each"]["count"], json!(2));
        assert_eq!(tools.calls_for("work"), 2);
    }

    #[tokio::test]
    async fn test_parallel_merges_branch_results() {
        let (tools, executor) = harness();
        let parallel = WorkflowNode {
            id: "fan".to_string(),
            kind: NodeKind::Parallel(ParallelNode {
                branch_node_ids: vec![vec!["left".to_string()], vec!["right".to_string()]],
                branch_names: Some(vec!["left".to_string(), "right".to_string()]),
                merge_strategy: Default::default(),
                error_handling: Default::default(),
                timeout_ms: None,
            }),
            position: None,
        };
        let def = definition(
            vec![
                parallel,
                tool_node("left", "branch.left"),
                tool_node("right", "branch.right"),
            ],
            vec![],
        );

        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, crate::engine::state::RunStatus::Completed);
        assert_eq!(tools.calls_for("branch.left"), 1);
        assert_eq!(tools.calls_for("branch.right"), 1);
        let merged = &result.step_results["fan"];
        assert_eq!(merged["left"]["status"], json!("fulfilled"));
        assert_eq!(merged["right"]["status"], json!("fulfilled"));
        // Branch-internal results stay out of the run's step results.
        assert!(!result.step_results.contains_key("left"));
    }

    #[tokio::test]
    async fn test_output_projection() {
        let (_tools, executor) = harness();
        let seed = {
            let mut n = tool_node("create", "create");
            if let NodeKind::Tool(data) = &mut n.kind {
                data.args = json!({"id": "i-123", "zone": "us-east-1a"});
            }
            n
        };
        let output = WorkflowNode {
            id: "out".to_string(),
            kind: NodeKind::Output(OutputNode {
                mapping: [
                    ("instanceId".to_string(), "create.echo.id".to_string()),
                    ("missing".to_string(), "create.echo.nothing".to_string()),
                ]
                .into_iter()
                .collect(),
            }),
            position: None,
        };
        let def = definition(vec![seed, output], vec![edge("e1", "create", "out")]);

        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(
            result.output.unwrap(),
            json!({"instanceId": "i-123", "missing": null})
        );
    }

    #[tokio::test]
    async fn test_input_node_projects_declared_fields() {
        let (_tools, executor) = harness();
        let input = WorkflowNode {
            id: "in".to_string(),
            kind: NodeKind::Input(InputNode {
                fields: Some(vec!["region".to_string()]),
            }),
            position: None,
        };
        let def = definition(vec![input], vec![]);
        let result = executor
            .execute(&def, json!({"region": "eu-west-1", "secret": "hidden"}))
            .await
            .unwrap();
        assert_eq!(result.step_results["in"], json!({"region": "eu-west-1"}));
    }

    #[tokio::test]
    async fn test_ai_step_streams_tokens() {
        let (_tools, executor) = harness();
        let ai = WorkflowNode {
            id: "llm".to_string(),
            kind: NodeKind::AiStep(AiStepNode {
                model: "mini".to_string(),
                prompt: "summarize".to_string(),
                stream: true,
            }),
            position: None,
        };
        let def = definition(vec![ai], vec![]);
        let result = executor.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.step_results["llm"]["text"], json!("generated"));
    }

    #[tokio::test]
    async fn test_resume_rejects_missing_node() {
        let (_tools, executor) = harness();
        let def = definition(vec![tool_node("only", "x")], vec![]);
        let snapshot = SuspendSnapshot {
            suspended_at_node_id: "gone".to_string(),
            completed_node_ids: vec![],
            step_results: Map::new(),
            resume_count: 0,
        };
        let err = executor
            .resume(&def, EngineState::Suspended(snapshot), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_resume_rejects_active_state() {
        let (_tools, executor) = harness();
        let def = definition(vec![tool_node("only", "x")], vec![]);
        let err = executor
            .resume(&def, EngineState::Active, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn test_config_merge_patch_wins() {
        let base = EngineConfig::default();
        let merged = EngineConfig::merge(
            &base,
            &EngineConfigPatch {
                max_loop_iterations: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(merged.max_loop_iterations, 5);
        assert_eq!(merged.stale_run_timeout_secs, base.stale_run_timeout_secs);

        let invalid = EngineConfig::merge(
            &base,
            &EngineConfigPatch {
                max_loop_iterations: Some(0),
                ..Default::default()
            },
        );
        assert!(invalid.is_err());
    }
}

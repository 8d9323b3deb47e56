//! Workflow definition data model.
//!
//! A definition is an immutable-per-version graph of typed nodes and labeled
//! edges. Definitions are authored as JSON (or YAML for file-based loading)
//! and re-validated before every execution, because a resumed run may
//! reference a since-edited definition.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::{EngineError, Result};
use crate::engine::parallel::{ErrorHandling, MergeStrategy};
use crate::engine::retry::RetryPolicy;

/// Canvas coordinates from the visual editor. Carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A declarative workflow: nodes plus directed edges, acyclic by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Parses a definition from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(EngineError::Serialization)
    }

    /// Parses a definition from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::validation(format!("failed to parse YAML definition: {e}")))
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids owned by a parallel branch or a loop body. These are
    /// executed by their owning node, never by the top-level walk.
    pub fn embedded_node_ids(&self) -> HashSet<&str> {
        let mut owned = HashSet::new();
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Parallel(data) => {
                    for branch in &data.branch_node_ids {
                        owned.extend(branch.iter().map(String::as_str));
                    }
                }
                NodeKind::Loop(data) => {
                    owned.extend(data.body_node_ids.iter().map(String::as_str));
                }
                _ => {}
            }
        }
        owned
    }

    /// Edges arriving at `target`, in input order.
    pub fn incoming_edges<'a>(&'a self, target: &str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        let target = target.to_string();
        self.edges.iter().filter(move |e| e.target == target)
    }
}

/// One node of the graph. The kind discriminates the `data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// Closed set of node kinds. Dispatch is a single match in the executor;
/// adding a kind means adding a variant here and a dispatch arm there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum NodeKind {
    Tool(ToolNode),
    Condition(ConditionNode),
    Loop(LoopNode),
    Approval(ApprovalNode),
    AiStep(AiStepNode),
    Input(InputNode),
    Output(OutputNode),
    Parallel(ParallelNode),
}

impl NodeKind {
    /// Wire name of the kind, used on step rows and progress events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tool(_) => "tool",
            Self::Condition(_) => "condition",
            Self::Loop(_) => "loop",
            Self::Approval(_) => "approval",
            Self::AiStep(_) => "ai-step",
            Self::Input(_) => "input",
            Self::Output(_) => "output",
            Self::Parallel(_) => "parallel",
        }
    }
}

/// Invoke an external capability by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNode {
    pub tool_name: String,
    /// Static arguments passed to the tool as-is.
    #[serde(default = "empty_object")]
    pub args: Value,
    /// Dynamic arguments resolved from prior step results at execution
    /// time, e.g. `{"instanceId": "list-node.data.0.id"}`. Resolved values
    /// are merged over the static args.
    #[serde(default)]
    pub arg_refs: BTreeMap<String, String>,
    /// Per-node retry policy. Absent means a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Branch on a restricted boolean expression over prior results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionNode {
    pub expression: String,
}

/// Iterate a body over a collection expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNode {
    /// Expression yielding the collection, e.g. `list-node.data.items`.
    pub items_expr: String,
    pub body_node_ids: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    100
}

/// Suspend execution pending an external human decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApprovalNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Invoke a generative model, optionally streaming tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStepNode {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
}

/// Inject caller-supplied input into the graph as a pseudo-result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputNode {
    /// When present, only these top-level fields of the run input are
    /// exposed; otherwise the whole input object is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// Project final results into the run's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNode {
    /// Output field name to dotted result path, e.g.
    /// `"instanceId": "create-node.data.id"`.
    pub mapping: BTreeMap<String, String>,
}

/// Fan out to N named branches, each a linear sequence of node ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelNode {
    pub branch_node_ids: Vec<Vec<String>>,
    /// Optional display names; branches without one are keyed
    /// `branch-<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_names: Option<Vec<String>>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ParallelNode {
    /// Resolved branch name for `index`.
    pub fn branch_name(&self, index: usize) -> String {
        self.branch_names
            .as_ref()
            .and_then(|names| names.get(index))
            .cloned()
            .unwrap_or_else(|| format!("branch-{index}"))
    }
}

/// A directed edge. Labels `"true"`/`"false"` select condition branches;
/// any other (or no) label is purely informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

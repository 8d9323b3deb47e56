pub mod definition;
pub mod validate;

pub use definition::{
    AiStepNode, ApprovalNode, ConditionNode, InputNode, LoopNode, NodeKind, OutputNode,
    ParallelNode, Position, ToolNode, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
pub use validate::{build_graph, detect_cycles, topological_sort, validate};

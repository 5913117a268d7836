/// Workflow Definition Layer
///
/// This module handles the shape of workflows drawn on the board and the
/// compiled form the runtime executes:
/// - Type definitions (definitions, instances, node states, log events)
/// - Typed action payloads parsed once at load time
/// - Lock-free registry of compiled workflows using ArcSwap

// Core workflow type definitions
pub mod types;

// Built-in action payloads and the extension fallback
pub mod action;

// Compiled workflows and the hot-swappable registry
pub mod registry;

// Re-export commonly used types
pub use action::{Action, ActionDefinition, ActionPayload};
pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use types::{
    Condition, ConditionExpression, ConditionGroup, ConditionLogic, ConditionOperator,
    EdgeCondition, EventCallback, InstanceStatus, LogEventType, LogLevel, NodeRuntimeState,
    NodeStatus, NodeType, WorkflowDefinition, WorkflowEdgeData, WorkflowInstance,
    WorkflowLogEvent, WorkflowNodeData,
};

/// Core workflow type definitions
///
/// Definitions (nodes, edges, conditions, actions) arrive as JSON from the board's
/// authoring layer and use its camelCase field names. Instances, node runtime states
/// and log events are the live state the engine mutates and hands back for rendering.

use crate::workflow::action::ActionDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};

/// A complete workflow definition as drawn on the board
///
/// Immutable input owned by the authoring layer. The engine never persists it;
/// it is compiled once into a `CompiledWorkflow` before instances are started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-onboarding")
    pub id: String,
    /// Optional human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Nodes placed on the board
    pub nodes: Vec<WorkflowNodeData>,
    /// Connections between nodes, in authoring order
    #[serde(default)]
    pub edges: Vec<WorkflowEdgeData>,
}

/// A single node of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNodeData {
    /// Unique node identifier within the workflow
    pub id: String,
    /// Node behavior: start, task, decision, end or a board-specific kind
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: String,
    /// Conditions that must all pass for the node to become active
    #[serde(default)]
    pub entry_conditions: Vec<Condition>,
    /// Actions run right after the node becomes active
    #[serde(default)]
    pub on_enter_actions: Vec<ActionDefinition>,
    /// Actions run right before the node is left
    #[serde(default)]
    pub on_exit_actions: Vec<ActionDefinition>,
}

/// Node kinds understood by the engine
///
/// Anything that is not start/task/decision/end is kept verbatim and behaves
/// like a task node (first outgoing edge is taken unconditionally).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    /// Unique entry point of the workflow
    Start,
    Task,
    /// Chooses the first outgoing edge whose condition holds
    Decision,
    /// Entering it completes the whole instance
    End,
    Other(String),
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => NodeType::Start,
            "task" => NodeType::Task,
            "decision" => NodeType::Decision,
            "end" => NodeType::End,
            _ => NodeType::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Start => f.write_str("start"),
            NodeType::Task => f.write_str("task"),
            NodeType::Decision => f.write_str("decision"),
            NodeType::End => f.write_str("end"),
            NodeType::Other(other) => f.write_str(other),
        }
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdgeData {
    pub id: String,
    /// Source node ID
    pub source: String,
    /// Target node ID
    pub target: String,
    /// Only the first condition is consulted, and only when leaving a decision node
    #[serde(default)]
    pub conditions: Vec<EdgeCondition>,
    /// Actions run when the edge is taken
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

/// Edge guard in the `"<field> <op> <value>"` form, e.g. `"score >= 10"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub value: String,
}

/// Comparison operators accepted by condition expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    IsTrue,
    IsFalse,
}

/// A single `field operator value` comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionExpression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Dot-separated path resolved against the condition context (e.g. "variables.score")
    pub field: String,
    pub operator: ConditionOperator,
    /// Expected value; ignored by the unary operators (is_empty, is_true, ...)
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLogic {
    And,
    Or,
}

/// A tree of conditions joined by `and`/`or`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Either a plain expression or a nested group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Expression(ConditionExpression),
}

impl From<ConditionExpression> for Condition {
    fn from(expression: ConditionExpression) -> Self {
        Condition::Expression(expression)
    }
}

impl From<ConditionGroup> for Condition {
    fn from(group: ConditionGroup) -> Self {
        Condition::Group(group)
    }
}

/// Lifecycle of one workflow instance
///
/// `idle → running ⇄ paused → {completed | error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

/// Lifecycle of one node within one instance
///
/// `idle → active → {completed | blocked}`. Blocked means the entry conditions
/// failed; the engine never retries it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Active,
    Blocked,
    Completed,
}

/// Per-node runtime bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRuntimeState {
    pub node_id: String,
    pub status: NodeStatus,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    /// Number of times the node was re-entered after being blocked
    pub retry_count: u32,
    /// Free-form data owned by action handlers and external callers
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NodeRuntimeState {
    /// Fresh idle state for a node
    pub fn idle(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Idle,
            entered_at: None,
            exited_at: None,
            retry_count: 0,
            data: Map::new(),
        }
    }
}

/// Kinds of entries in an instance's log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    WorkflowStarted,
    NodeEntered,
    NodeExited,
    TransitionTaken,
    ConditionEvaluated,
    ActionExecuted,
    VariableUpdated,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowStopped,
    WorkflowFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

/// One append-only entry of an instance's log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLogEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: LogEventType,
    pub message: String,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkflowLogEvent {
    pub fn new(event_type: LogEventType, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            message: message.into(),
            level,
            node_id: None,
            details: None,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Subscriber notified of every log event as it is appended
///
/// Called while the instance is being mutated, so it must not block.
pub type EventCallback = Arc<dyn Fn(&WorkflowLogEvent) + Send + Sync>;

/// One execution of a workflow definition
///
/// Created by `WorkflowEngine::start`, mutated only by the engine and retained
/// until the caller removes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub status: InstanceStatus,
    /// Nodes whose runtime status is `active`, in activation order
    pub current_node_ids: Vec<String>,
    /// Active nodes that found no edge to leave by on their last attempt
    pub stalled_node_ids: Vec<String>,
    pub node_states: HashMap<String, NodeRuntimeState>,
    /// Instance-scoped variables, never shared across instances
    pub variables: Map<String, Value>,
    pub logs: Vec<WorkflowLogEvent>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Create an idle instance with one idle runtime state per node
    pub fn new<'a>(id: String, definition_id: String, node_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let node_states = node_ids
            .into_iter()
            .map(|node_id| (node_id.to_string(), NodeRuntimeState::idle(node_id)))
            .collect();

        Self {
            id,
            definition_id,
            status: InstanceStatus::Idle,
            current_node_ids: Vec::new(),
            stalled_node_ids: Vec::new(),
            node_states,
            variables: Map::new(),
            logs: Vec::new(),
            started_at: None,
            paused_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Status of a node, `idle` for nodes never touched
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map(|state| state.status)
            .unwrap_or(NodeStatus::Idle)
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        self.current_node_ids.iter().any(|id| id == node_id)
    }

    pub fn is_stalled(&self, node_id: &str) -> bool {
        self.stalled_node_ids.iter().any(|id| id == node_id)
    }

    /// Change a node's runtime status and keep `current_node_ids` in sync
    ///
    /// `current_node_ids` always equals the set of nodes whose status is `active`.
    pub fn set_node_status(&mut self, node_id: &str, status: NodeStatus) {
        let now = Utc::now();
        let state = self
            .node_states
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRuntimeState::idle(node_id));

        match status {
            NodeStatus::Active => {
                if state.status == NodeStatus::Blocked {
                    state.retry_count += 1;
                }
                state.entered_at = Some(now);
                state.exited_at = None;
            }
            NodeStatus::Completed => state.exited_at = Some(now),
            NodeStatus::Idle | NodeStatus::Blocked => {}
        }
        state.status = status;

        if status == NodeStatus::Active {
            if !self.is_active(node_id) {
                self.current_node_ids.push(node_id.to_string());
            }
        } else {
            self.current_node_ids.retain(|id| id != node_id);
            self.clear_stalled(node_id);
        }
    }

    pub fn mark_stalled(&mut self, node_id: &str) {
        if !self.is_stalled(node_id) {
            self.stalled_node_ids.push(node_id.to_string());
        }
    }

    pub fn clear_stalled(&mut self, node_id: &str) {
        self.stalled_node_ids.retain(|id| id != node_id);
    }

    /// Write a variable, returning the previous value
    ///
    /// Any variable change may unblock a stalled decision, so stall marks are cleared.
    pub fn set_variable(&mut self, key: &str, value: Value) -> Option<Value> {
        self.stalled_node_ids.clear();
        self.variables.insert(key.to_string(), value)
    }

    /// Append a log event, mirror it to tracing and notify the subscriber
    pub fn record(&mut self, event: WorkflowLogEvent, on_event: Option<&EventCallback>) {
        let node = event.node_id.as_deref().unwrap_or("-");
        match event.level {
            LogLevel::Debug => tracing::debug!(instance = %self.id, node, kind = ?event.event_type, "{}", event.message),
            LogLevel::Info => tracing::info!(instance = %self.id, node, kind = ?event.event_type, "{}", event.message),
            LogLevel::Warn => tracing::warn!(instance = %self.id, node, kind = ?event.event_type, "{}", event.message),
            LogLevel::Error => tracing::error!(instance = %self.id, node, kind = ?event.event_type, "{}", event.message),
        }

        if let Some(callback) = on_event {
            callback(&event);
        }
        self.logs.push(event);
    }

    /// Return the instance to its pre-start state, keeping id and definition
    pub fn reset(&mut self) {
        self.status = InstanceStatus::Idle;
        self.current_node_ids.clear();
        self.stalled_node_ids.clear();
        for state in self.node_states.values_mut() {
            *state = NodeRuntimeState::idle(&state.node_id);
        }
        self.variables.clear();
        self.logs.clear();
        self.started_at = None;
        self.paused_at = None;
        self.completed_at = None;
        self.error = None;
    }

    /// Count log events of a given type
    pub fn count_events(&self, event_type: LogEventType) -> usize {
        self.logs.iter().filter(|event| event.event_type == event_type).count()
    }
}

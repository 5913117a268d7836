/// Runtime Execution Layer
///
/// This module drives workflow instances:
/// - Condition evaluation for entry gates and decision edges
/// - Action execution with built-ins and pluggable handlers
/// - A min-heap task scheduler for deferred work
/// - The instance engine composing all three

// Field resolution, comparison operators and the edge expression grammar
pub mod condition;

// Built-in actions, handler table and the action context
pub mod executor;

// Deferred delay/timeout/retry callbacks
pub mod scheduler;

// Instance registry and node state machine
pub mod engine;

// Re-export main types
pub use condition::ConditionContext;
pub use engine::{InstanceSummary, WorkflowEngine};
pub use executor::{ActionBatchResult, ActionContext, ActionExecutor, ActionHandler, ActionResult};
pub use scheduler::{PendingTask, ScheduledTask, TaskKind, TaskScheduler};

/// Boardflow: workflow runtime for a collaborative planning board
///
/// This library drives workflows drawn on the board: nodes gated by entry
/// conditions, side-effecting actions, decision edges and deferred tasks,
/// exposed over a small REST API.

// Core configuration and setup
pub mod config;

// Workflow definition layer - definition types, typed actions and the registry
pub mod workflow;

// Runtime layer - condition evaluation, actions, scheduler and the instance engine
pub mod runtime;

// HTTP API layer - REST endpoints for definitions and instances
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use config::{Config, EngineConfig};
pub use runtime::{ActionContext, ActionHandler, ActionResult, TaskScheduler, WorkflowEngine};
pub use server::start_server;
pub use workflow::{
    CompiledWorkflow, InstanceStatus, NodeStatus, NodeType, WorkflowDefinition, WorkflowInstance,
    WorkflowRegistry,
};

/// HTTP API Layer
///
/// This module provides the REST API over the workflow registry and the
/// instance engine. It handles:
/// - Workflow definition registration and hot replacement
/// - Starting instances from registered definitions
/// - Instance inspection and control

// Workflow definition endpoints (POST/GET/PUT/DELETE) and instance start
pub mod workflows;

// Instance control endpoints
pub mod instances;

// Re-export router builders
pub use instances::create_instance_routes;
pub use workflows::{create_workflow_routes, AppState};

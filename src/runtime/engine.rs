/// Workflow instance engine
///
/// Owns every running instance and drives each one through the node state
/// machine: entry conditions gate a node, `onEnter` actions run, an outgoing
/// edge is picked, edge actions run, the node is exited and the next one entered.
/// Calls on one instance are serialized by a per-instance mutex; distinct
/// instances run independently.

use crate::config::EngineConfig;
use crate::runtime::condition::{
    evaluate_edge_condition, evaluate_entry_conditions, parse_edge_condition, ConditionContext,
};
use crate::runtime::executor::{ActionContext, ActionExecutor, ActionHandler};
use crate::runtime::scheduler::TaskScheduler;
use crate::workflow::action::Action;
use crate::workflow::registry::CompiledWorkflow;
use crate::workflow::types::{
    EventCallback, InstanceStatus, LogEventType, LogLevel, NodeStatus, NodeType, WorkflowInstance,
    WorkflowLogEvent, WorkflowNodeData,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// One registered instance and everything needed to drive it
struct InstanceSlot {
    workflow: Arc<CompiledWorkflow>,
    config: EngineConfig,
    on_event: Option<EventCallback>,
    state: tokio::sync::Mutex<WorkflowInstance>,
    /// Cancelled on pause/stop/reset/remove to interrupt in-flight actions
    interrupt: Mutex<CancellationToken>,
}

impl InstanceSlot {
    fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Cancel the current token and arm a fresh one for later work
    fn interrupt(&self) {
        let mut token = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Compact listing entry for an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub definition_id: String,
    pub status: InstanceStatus,
    pub current_node_ids: Vec<String>,
    pub stalled_node_ids: Vec<String>,
}

/// Registry of workflow instances plus the components that run them
pub struct WorkflowEngine {
    instances: RwLock<HashMap<String, Arc<InstanceSlot>>>,
    executor: Arc<ActionExecutor>,
    scheduler: Arc<TaskScheduler>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("executor", &self.executor)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowEngine {
    /// Engine with its own executor and scheduler; needs a Tokio runtime
    pub fn new() -> Self {
        Self::with_components(Arc::new(ActionExecutor::new()), Arc::new(TaskScheduler::new()))
    }

    pub fn with_components(executor: Arc<ActionExecutor>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            executor,
            scheduler,
        }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Install the side effect behind an action type for every instance
    pub fn register_action_handler(&self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.executor.register_action_handler(action_type, handler);
    }

    async fn slot(&self, instance_id: &str) -> Result<Arc<InstanceSlot>> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| anyhow!("Workflow instance not found: {}", instance_id))
    }

    fn driver<'a>(&'a self, slot: &'a InstanceSlot, instance: &'a mut WorkflowInstance) -> Driver<'a> {
        Driver {
            executor: &self.executor,
            scheduler: &self.scheduler,
            workflow: &slot.workflow,
            on_event: slot.on_event.as_ref(),
            interrupt: slot.interrupt_token(),
            instance,
        }
    }

    /// Create, register and start a new instance
    ///
    /// Returns a snapshot taken after the start node was entered, or after the
    /// instance stopped advancing when `auto_advance` is set. A workflow
    /// without a start node yields an instance in `error` status.
    pub async fn start(
        &self,
        workflow: Arc<CompiledWorkflow>,
        config: EngineConfig,
        on_event: Option<EventCallback>,
    ) -> Result<WorkflowInstance> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("🚀 Starting workflow instance {} of {}", instance_id, workflow.id());

        let instance = WorkflowInstance::new(
            instance_id.clone(),
            workflow.id().to_string(),
            workflow.node_ids(),
        );
        let variables = config.variables.clone();
        let slot = Arc::new(InstanceSlot {
            workflow,
            config,
            on_event,
            state: tokio::sync::Mutex::new(instance),
            interrupt: Mutex::new(CancellationToken::new()),
        });
        self.instances.write().await.insert(instance_id.clone(), Arc::clone(&slot));

        {
            let mut instance = slot.state.lock().await;
            self.driver(&slot, &mut instance).begin(variables).await?;
        }

        if slot.config.auto_advance {
            self.auto_advance(&slot).await?;
        }

        let snapshot = slot.state.lock().await.clone();
        Ok(snapshot)
    }

    /// Snapshot of an instance
    pub async fn get_instance(&self, instance_id: &str) -> Option<WorkflowInstance> {
        let slot = self.slot(instance_id).await.ok()?;
        let instance = slot.state.lock().await;
        Some(instance.clone())
    }

    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let slots: Vec<Arc<InstanceSlot>> = self.instances.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let instance = slot.state.lock().await;
            summaries.push(InstanceSummary {
                id: instance.id.clone(),
                definition_id: instance.definition_id.clone(),
                status: instance.status,
                current_node_ids: instance.current_node_ids.clone(),
                stalled_node_ids: instance.stalled_node_ids.clone(),
            });
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Discard an instance, interrupting its work and dropping its tasks
    pub async fn remove_instance(&self, instance_id: &str) -> bool {
        let Some(slot) = self.instances.write().await.remove(instance_id) else {
            return false;
        };
        slot.interrupt();
        self.scheduler.cancel_workflow(instance_id);
        tracing::info!("🗑️ Removed workflow instance {}", instance_id);
        true
    }

    /// Enter a node; `false` if its entry conditions blocked it
    pub async fn enter_node(&self, instance_id: &str, node_id: &str) -> Result<bool> {
        let slot = self.slot(instance_id).await?;
        let mut instance = slot.state.lock().await;
        self.driver(&slot, &mut instance).enter_node(node_id).await
    }

    pub async fn exit_node(&self, instance_id: &str, node_id: &str) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        let mut instance = slot.state.lock().await;
        self.driver(&slot, &mut instance).exit_node(node_id).await
    }

    /// Take one outgoing edge from a node if one applies
    pub async fn try_transition(&self, instance_id: &str, from_node_id: &str) -> Result<bool> {
        let slot = self.slot(instance_id).await?;
        let mut instance = slot.state.lock().await;
        self.driver(&slot, &mut instance).try_transition(from_node_id).await
    }

    /// Move from one node to another, running the edge's actions if an edge is given
    pub async fn transition(
        &self,
        instance_id: &str,
        from_node_id: &str,
        to_node_id: &str,
        edge_id: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        let mut instance = slot.state.lock().await;
        self.driver(&slot, &mut instance)
            .transition(from_node_id, to_node_id, edge_id)
            .await
    }

    /// Attempt one transition from every active node
    ///
    /// Returns whether the instance was running; individual nodes may still
    /// have had nothing to take.
    pub async fn step(&self, instance_id: &str) -> Result<bool> {
        let slot = self.slot(instance_id).await?;
        let mut instance = slot.state.lock().await;
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }
        self.driver(&slot, &mut instance).step().await?;
        Ok(true)
    }

    /// Step repeatedly until the instance finishes, leaves `running` or stops making progress
    async fn auto_advance(&self, slot: &InstanceSlot) -> Result<()> {
        let delay = slot.config.step_delay();
        loop {
            let progressed = {
                let mut instance = slot.state.lock().await;
                if instance.status != InstanceStatus::Running || instance.current_node_ids.is_empty() {
                    break;
                }
                self.driver(slot, &mut instance).step().await?
            };

            if progressed == 0 {
                tracing::debug!("⏹️ Auto-advance made no progress, waiting for input");
                break;
            }

            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Suspend a running instance
    ///
    /// Interrupts in-flight actions and drops the instance's scheduled tasks.
    /// Returns `false` if the instance was not running.
    pub async fn pause(&self, instance_id: &str) -> Result<bool> {
        let slot = self.slot(instance_id).await?;
        slot.interrupt();
        self.scheduler.cancel_workflow(instance_id);

        let mut instance = slot.state.lock().await;
        if instance.status != InstanceStatus::Running {
            return Ok(false);
        }
        instance.status = InstanceStatus::Paused;
        instance.paused_at = Some(Utc::now());
        self.driver(&slot, &mut instance).record(WorkflowLogEvent::new(
            LogEventType::WorkflowPaused,
            LogLevel::Info,
            "Workflow paused",
        ));
        Ok(true)
    }

    /// Continue a paused instance, auto-advancing again if configured
    pub async fn resume(&self, instance_id: &str) -> Result<bool> {
        let slot = self.slot(instance_id).await?;
        {
            let mut instance = slot.state.lock().await;
            if instance.status != InstanceStatus::Paused {
                return Ok(false);
            }
            instance.status = InstanceStatus::Running;
            instance.paused_at = None;
            self.driver(&slot, &mut instance).record(WorkflowLogEvent::new(
                LogEventType::WorkflowResumed,
                LogLevel::Info,
                "Workflow resumed",
            ));
        }

        if slot.config.auto_advance {
            self.auto_advance(&slot).await?;
        }
        Ok(true)
    }

    /// Hard termination: status becomes `completed`, active nodes are left as they are
    pub async fn stop(&self, instance_id: &str) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        slot.interrupt();
        self.scheduler.cancel_workflow(instance_id);

        let mut instance = slot.state.lock().await;
        instance.status = InstanceStatus::Completed;
        instance.completed_at = Some(Utc::now());
        instance.paused_at = None;
        let active = instance.current_node_ids.clone();
        self.driver(&slot, &mut instance).record(
            WorkflowLogEvent::new(LogEventType::WorkflowStopped, LogLevel::Info, "Workflow stopped")
                .with_details(json!({ "activeNodeIds": active })),
        );
        Ok(())
    }

    /// Return an instance to `idle` with empty variables and logs
    pub async fn reset(&self, instance_id: &str) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        slot.interrupt();
        self.scheduler.cancel_workflow(instance_id);

        slot.state.lock().await.reset();
        tracing::info!("🔄 Reset workflow instance {}", instance_id);
        Ok(())
    }

    /// Write a variable from outside the transition path
    ///
    /// A running auto-advancing instance is advanced again, since the new
    /// value may open a decision edge.
    pub async fn update_variable(&self, instance_id: &str, key: &str, value: Value) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        let running = {
            let mut instance = slot.state.lock().await;
            self.driver(&slot, &mut instance).update_variable(key, value);
            instance.status == InstanceStatus::Running
        };

        if running && slot.config.auto_advance {
            self.auto_advance(&slot).await?;
        }
        Ok(())
    }

    /// Force a node's runtime status from outside the transition path
    pub async fn set_node_status(&self, instance_id: &str, node_id: &str, status: NodeStatus) -> Result<()> {
        let slot = self.slot(instance_id).await?;
        if slot.workflow.node(node_id).is_none() {
            anyhow::bail!("Node not found in workflow {}: {}", slot.workflow.id(), node_id);
        }

        slot.state.lock().await.set_node_status(node_id, status);
        tracing::info!("✏️ Node {} of instance {} set to {:?}", node_id, instance_id, status);
        Ok(())
    }
}

/// Borrowed view of one locked instance and the components acting on it
struct Driver<'a> {
    executor: &'a ActionExecutor,
    scheduler: &'a Arc<TaskScheduler>,
    workflow: &'a CompiledWorkflow,
    on_event: Option<&'a EventCallback>,
    interrupt: CancellationToken,
    instance: &'a mut WorkflowInstance,
}

impl<'a> Driver<'a> {
    fn record(&mut self, event: WorkflowLogEvent) {
        self.instance.record(event, self.on_event);
    }

    fn node(&self, node_id: &str) -> Result<&'a WorkflowNodeData> {
        let workflow = self.workflow;
        workflow
            .node(node_id)
            .ok_or_else(|| anyhow!("Node not found in workflow {}: {}", workflow.id(), node_id))
    }

    fn action_context(&mut self, node: Option<&'a WorkflowNodeData>) -> ActionContext<'_> {
        ActionContext::new(
            &mut *self.instance,
            node,
            self.on_event,
            Arc::clone(self.scheduler),
            self.interrupt.clone(),
        )
    }

    /// Failures are already logged on the instance by the executor
    async fn run_actions(&mut self, actions: &[Action], node: Option<&'a WorkflowNodeData>) {
        let executor = self.executor;
        let mut ctx = self.action_context(node);
        executor.execute_actions(actions, &mut ctx).await;
    }

    fn update_variable(&mut self, key: &str, value: Value) {
        self.action_context(None).update_variable(key, value);
    }

    /// Mark the instance running and enter its start node
    async fn begin(&mut self, variables: Map<String, Value>) -> Result<()> {
        self.instance.variables = variables;
        self.instance.status = InstanceStatus::Running;
        self.instance.started_at = Some(Utc::now());
        let definition_id = self.instance.definition_id.clone();
        self.record(
            WorkflowLogEvent::new(LogEventType::WorkflowStarted, LogLevel::Info, "Workflow started")
                .with_details(json!({ "definitionId": definition_id })),
        );

        let workflow = self.workflow;
        let Some(start) = workflow.start_node() else {
            let message = format!("No start node found in workflow {}", definition_id);
            self.instance.status = InstanceStatus::Error;
            self.instance.error = Some(message.clone());
            self.record(WorkflowLogEvent::new(LogEventType::WorkflowFailed, LogLevel::Error, message));
            return Ok(());
        };

        self.enter_node(&start.id).await?;
        Ok(())
    }

    async fn enter_node(&mut self, node_id: &str) -> Result<bool> {
        let node = self.node(node_id)?;

        if !node.entry_conditions.is_empty() {
            let context = ConditionContext::new(&self.instance.variables, &self.instance.node_states, Some(node));
            let evaluation = evaluate_entry_conditions(&node.entry_conditions, &context);
            if !evaluation.passed {
                self.instance.set_node_status(node_id, NodeStatus::Blocked);
                self.record(
                    WorkflowLogEvent::new(
                        LogEventType::ConditionEvaluated,
                        LogLevel::Warn,
                        format!("Entry conditions not met for node: {}", node.label),
                    )
                    .with_node(node_id)
                    .with_details(json!({ "failedConditions": evaluation.failed_conditions })),
                );
                return Ok(false);
            }
        }

        self.instance.set_node_status(node_id, NodeStatus::Active);
        self.record(
            WorkflowLogEvent::new(LogEventType::NodeEntered, LogLevel::Info, format!("Entered node: {}", node.label))
                .with_node(node_id)
                .with_details(json!({ "nodeType": node.node_type })),
        );

        let workflow = self.workflow;
        self.run_actions(workflow.on_enter_actions(node_id), Some(node)).await;

        if node.node_type == NodeType::End {
            self.complete_workflow(node_id).await?;
        }
        Ok(true)
    }

    async fn exit_node(&mut self, node_id: &str) -> Result<()> {
        let node = self.node(node_id)?;
        let workflow = self.workflow;

        self.run_actions(workflow.on_exit_actions(node_id), Some(node)).await;

        self.instance.set_node_status(node_id, NodeStatus::Completed);
        self.record(
            WorkflowLogEvent::new(LogEventType::NodeExited, LogLevel::Info, format!("Exited node: {}", node.label))
                .with_node(node_id),
        );
        Ok(())
    }

    async fn try_transition(&mut self, from_node_id: &str) -> Result<bool> {
        let node = self.node(from_node_id)?;
        let workflow = self.workflow;
        let edges = workflow.outgoing_edges(from_node_id);

        let chosen = match node.node_type {
            NodeType::Decision => {
                let context = ConditionContext::new(&self.instance.variables, &self.instance.node_states, Some(node));
                let mut chosen = None;
                for edge in edges {
                    let Some(condition) = edge.conditions.first() else {
                        chosen = Some(edge);
                        break;
                    };

                    let well_formed = parse_edge_condition(&condition.value).is_some();
                    let passed = evaluate_edge_condition(&condition.value, &context);
                    let level = if well_formed { LogLevel::Debug } else { LogLevel::Warn };
                    self.record(
                        WorkflowLogEvent::new(
                            LogEventType::ConditionEvaluated,
                            level,
                            format!("Edge condition '{}' evaluated to {}", condition.value, passed),
                        )
                        .with_node(from_node_id)
                        .with_details(json!({
                            "edgeId": edge.id,
                            "expression": condition.value,
                            "result": passed,
                            "malformed": !well_formed,
                        })),
                    );
                    if passed {
                        chosen = Some(edge);
                        break;
                    }
                }
                chosen
            }
            NodeType::End => return Ok(false),
            _ => edges.first().copied(),
        };

        let Some(edge) = chosen else {
            if !self.instance.is_stalled(from_node_id) {
                self.instance.mark_stalled(from_node_id);
                let message = match node.node_type {
                    NodeType::Decision => format!("No matching condition for decision node: {}", node.label),
                    _ => format!("No outgoing edge from node: {}", node.label),
                };
                self.record(
                    WorkflowLogEvent::new(LogEventType::ConditionEvaluated, LogLevel::Warn, message)
                        .with_node(from_node_id),
                );
            }
            return Ok(false);
        };

        self.transition(from_node_id, &edge.target, Some(edge.id.as_str())).await?;
        Ok(true)
    }

    async fn transition(&mut self, from_node_id: &str, to_node_id: &str, edge_id: Option<&str>) -> Result<()> {
        let from = self.node(from_node_id)?;
        let to = self.node(to_node_id)?;

        if let Some(edge_id) = edge_id {
            let workflow = self.workflow;
            self.run_actions(workflow.edge_actions(edge_id), Some(from)).await;
        }

        self.record(
            WorkflowLogEvent::new(
                LogEventType::TransitionTaken,
                LogLevel::Info,
                format!("Transition: {} → {}", from.label, to.label),
            )
            .with_node(from_node_id)
            .with_details(json!({ "edgeId": edge_id, "from": from_node_id, "to": to_node_id })),
        );

        self.exit_node(from_node_id).await?;
        self.enter_node(to_node_id).await?;
        Ok(())
    }

    /// One transition attempt per active node; returns the number taken
    async fn step(&mut self) -> Result<usize> {
        let active = self.instance.current_node_ids.clone();
        let mut taken = 0;
        for node_id in active {
            if self.instance.status != InstanceStatus::Running {
                break;
            }
            if !self.instance.is_active(&node_id) {
                continue;
            }
            if self.try_transition(&node_id).await? {
                taken += 1;
            }
        }
        Ok(taken)
    }

    /// Finish the instance after its end node was entered
    async fn complete_workflow(&mut self, end_node_id: &str) -> Result<()> {
        self.exit_node(end_node_id).await?;

        self.instance.status = InstanceStatus::Completed;
        self.instance.completed_at = Some(Utc::now());
        self.record(
            WorkflowLogEvent::new(LogEventType::WorkflowCompleted, LogLevel::Info, "Workflow completed")
                .with_node(end_node_id),
        );

        let cancelled = self.scheduler.cancel_workflow(&self.instance.id);
        tracing::info!("🎉 Workflow instance {} completed ({} pending tasks dropped)", self.instance.id, cancelled);
        Ok(())
    }
}

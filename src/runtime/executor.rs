/// Action execution
///
/// Runs the side-effecting steps attached to nodes and edges. Handlers registered
/// for an action type take precedence; otherwise the built-in payloads apply.
/// Built-ins only touch instance variables and the log: real delivery (email,
/// notifications, task creation) is supplied by registered handlers.

use crate::{
    runtime::{
        condition::{resolve_field_or_variable, ConditionContext},
        scheduler::TaskScheduler,
    },
    workflow::{
        action::{Action, ActionPayload},
        types::{EventCallback, LogEventType, LogLevel, WorkflowInstance, WorkflowLogEvent, WorkflowNodeData},
    },
};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};
use tokio_util::sync::CancellationToken;

/// Result of executing a single action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionResult {
    pub fn succeeded(data: Option<Value>) -> Self {
        Self { success: true, error: None, data }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), data: None }
    }
}

/// Results of an ordered batch of actions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBatchResult {
    pub all_succeeded: bool,
    pub results: Vec<ActionResult>,
}

/// Supplies the real side effect behind an action type
///
/// Returning `Err` marks the action failed; sibling actions still run.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &Action, ctx: &mut ActionContext<'_>) -> Result<Option<Value>>;
}

/// What an action may see and touch while it runs
///
/// Reads go through `variables()`/`condition_context()`, writes through
/// `update_variable` and `log`, which both append to the instance log.
pub struct ActionContext<'a> {
    instance: &'a mut WorkflowInstance,
    current_node: Option<&'a WorkflowNodeData>,
    on_event: Option<&'a EventCallback>,
    scheduler: Arc<TaskScheduler>,
    interrupt: CancellationToken,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        instance: &'a mut WorkflowInstance,
        current_node: Option<&'a WorkflowNodeData>,
        on_event: Option<&'a EventCallback>,
        scheduler: Arc<TaskScheduler>,
        interrupt: CancellationToken,
    ) -> Self {
        Self { instance, current_node, on_event, scheduler, interrupt }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    pub fn node_id(&self) -> Option<&str> {
        self.current_node.map(|node| node.id.as_str())
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.instance.variables
    }

    /// Write an instance variable and log the change
    pub fn update_variable(&mut self, key: &str, value: Value) {
        let previous = self.instance.set_variable(key, value.clone());
        let mut event = WorkflowLogEvent::new(
            LogEventType::VariableUpdated,
            LogLevel::Info,
            format!("Variable '{}' set to {}", key, value),
        )
        .with_details(json!({ "key": key, "value": value, "previous": previous }));
        if let Some(node_id) = self.node_id() {
            event = event.with_node(node_id);
        }
        self.instance.record(event, self.on_event);
    }

    /// Append an `action_executed` log line
    pub fn log(&mut self, message: impl Into<String>, level: LogLevel) {
        let mut event = WorkflowLogEvent::new(LogEventType::ActionExecuted, level, message);
        if let Some(node_id) = self.node_id() {
            event = event.with_node(node_id);
        }
        self.instance.record(event, self.on_event);
    }

    /// Snapshot for evaluating conditions or templates against this instance
    pub fn condition_context(&self) -> ConditionContext {
        ConditionContext::new(&self.instance.variables, &self.instance.node_states, self.current_node)
    }

    pub fn resolve_template(&self, template: &str) -> String {
        resolve_template(template, &self.condition_context())
    }

    /// Shared scheduler, for handlers that defer work
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Cancelled when the instance is paused, stopped, reset or removed
    pub fn cancellation(&self) -> &CancellationToken {
        &self.interrupt
    }
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template pattern is valid"))
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Replace `{{path}}` tokens with resolved values
///
/// Paths resolve like condition fields, with bare names falling back to
/// variables. Missing and null values become empty strings. No escaping is
/// applied to the substituted text.
pub fn resolve_template(template: &str, context: &ConditionContext) -> String {
    template_pattern()
        .replace_all(template, |captures: &Captures| {
            stringify(resolve_field_or_variable(&captures[1], context))
        })
        .into_owned()
}

/// Dispatches actions to registered handlers or the built-in payloads
///
/// The handler table is swapped atomically on registration, so lookups during
/// execution never block.
pub struct ActionExecutor {
    handlers: ArcSwap<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.load();
        let mut types: Vec<&String> = handlers.keys().collect();
        types.sort();
        f.debug_struct("ActionExecutor").field("handlers", &types).finish()
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self { handlers: ArcSwap::from_pointee(HashMap::new()) }
    }

    /// Install a handler for an action type, replacing any earlier one
    pub fn register_action_handler(&self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action_type = action_type.into();
        self.handlers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(action_type.clone(), Arc::clone(&handler));
            next
        });
        tracing::info!("🔌 Registered action handler: {}", action_type);
    }

    pub fn has_handler(&self, action_type: &str) -> bool {
        self.handlers.load().contains_key(action_type)
    }

    /// Execute one action, never failing past this boundary
    pub async fn execute_action(&self, action: &Action, ctx: &mut ActionContext<'_>) -> ActionResult {
        let handler = self.handlers.load().get(action.type_name()).cloned();
        if let Some(handler) = handler {
            tracing::debug!("⚙️ Dispatching '{}' to registered handler", action.type_name());
            return match handler.execute(action, ctx).await {
                Ok(data) => ActionResult::succeeded(data),
                Err(e) => {
                    ctx.log(format!("Action '{}' failed: {:#}", action.type_name(), e), LogLevel::Error);
                    ActionResult::failed(format!("{:#}", e))
                }
            };
        }

        self.execute_builtin(action, ctx).await
    }

    async fn execute_builtin(&self, action: &Action, ctx: &mut ActionContext<'_>) -> ActionResult {
        match &action.payload {
            ActionPayload::SetVariable { variable, value } => {
                ctx.update_variable(variable, value.clone());
                ActionResult::succeeded(Some(json!({ "variable": variable, "value": value })))
            }
            ActionPayload::Notify { message, recipients } => {
                let message = ctx.resolve_template(message);
                ctx.log(format!("Notification: {}", message), LogLevel::Info);
                ActionResult::succeeded(Some(json!({ "message": message, "recipients": recipients })))
            }
            ActionPayload::Delay { duration } => {
                let interrupt = ctx.cancellation().clone();
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => {
                        ctx.log(format!("Delayed for {}ms", duration.as_millis()), LogLevel::Debug);
                        ActionResult::succeeded(None)
                    }
                    _ = interrupt.cancelled() => {
                        ctx.log("Delay interrupted", LogLevel::Warn);
                        ActionResult::failed("interrupted")
                    }
                }
            }
            ActionPayload::Assign { assignee } => {
                let assignee = ctx.resolve_template(assignee);
                ctx.log(format!("Assigned to {}", assignee), LogLevel::Info);
                ActionResult::succeeded(Some(json!({ "assignee": assignee })))
            }
            ActionPayload::SendEmail { to, subject, body } => {
                let to = ctx.resolve_template(to);
                let subject = ctx.resolve_template(subject);
                let body = ctx.resolve_template(body);
                ctx.log(format!("Email to {}: {}", to, subject), LogLevel::Info);
                ActionResult::succeeded(Some(json!({ "to": to, "subject": subject, "body": body })))
            }
            ActionPayload::CreateTask { title, assignee } => {
                let title = ctx.resolve_template(title);
                let assignee = assignee.as_deref().map(|assignee| ctx.resolve_template(assignee));
                ctx.log(format!("Task created: {}", title), LogLevel::Info);
                ActionResult::succeeded(Some(json!({ "title": title, "assignee": assignee })))
            }
            ActionPayload::Extension => {
                ctx.log(format!("Executed action: {}", action.type_name()), LogLevel::Info);
                ActionResult::succeeded(None)
            }
        }
    }

    /// Run actions strictly in order; a failure does not stop the sequence
    pub async fn execute_actions(&self, actions: &[Action], ctx: &mut ActionContext<'_>) -> ActionBatchResult {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.execute_action(action, ctx).await);
        }

        let all_succeeded = results.iter().all(|result| result.success);
        if !all_succeeded {
            tracing::warn!("⚠️ {} of {} actions failed on instance {}",
                results.iter().filter(|result| !result.success).count(), results.len(), ctx.instance_id());
        }

        ActionBatchResult { all_succeeded, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::action::ActionDefinition;
    use std::sync::Mutex;

    fn action(action_type: &str, config: Value) -> Action {
        Action::compile(&ActionDefinition { id: None, action_type: action_type.into(), config }).unwrap()
    }

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for Recording {
        async fn execute(&self, action: &Action, ctx: &mut ActionContext<'_>) -> Result<Option<Value>> {
            self.seen.lock().unwrap().push(action.config["tag"].as_str().unwrap_or_default().to_string());
            if self.fail {
                anyhow::bail!("boom");
            }
            ctx.update_variable("handled", json!(true));
            Ok(Some(json!("done")))
        }
    }

    #[test]
    fn templates_resolve_paths_and_blank_missing_values() {
        let ctx = ConditionContext::from_value(json!({
            "variables": { "name": "Ada", "count": 3, "tags": ["a"], "empty": null }
        }));
        assert_eq!(
            resolve_template("Hi {{ variables.name }}, {{count}} items {{tags}}{{empty}}{{missing.path}}!", &ctx),
            "Hi Ada, 3 items [\"a\"]!"
        );
        assert_eq!(resolve_template("<b>{{name}}</b>", &ctx), "<b>Ada</b>");
        assert_eq!(resolve_template("no tokens", &ctx), "no tokens");
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_the_batch() {
        let executor = ActionExecutor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        executor.register_action_handler("ok", Arc::new(Recording { seen: Arc::clone(&seen), fail: false }));
        executor.register_action_handler("throws", Arc::new(Recording { seen: Arc::clone(&seen), fail: true }));

        let scheduler = Arc::new(TaskScheduler::new());
        let mut instance = WorkflowInstance::new("i1".into(), "wf".into(), ["n"]);
        let mut ctx = ActionContext::new(&mut instance, None, None, scheduler, CancellationToken::new());

        let batch = executor
            .execute_actions(
                &[
                    action("ok", json!({ "tag": "first" })),
                    action("throws", json!({ "tag": "second" })),
                    action("ok", json!({ "tag": "third" })),
                ],
                &mut ctx,
            )
            .await;

        assert_eq!(batch.results.len(), 3);
        assert!(!batch.all_succeeded);
        assert_eq!(batch.results[1], ActionResult::failed("boom"));
        assert_eq!(batch.results[2].data, Some(json!("done")));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);

        assert_eq!(instance.variables["handled"], json!(true));
        assert!(instance.logs.iter().any(|event| event.level == LogLevel::Error && event.message.contains("boom")));
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let executor = ActionExecutor::new();
        let mut instance = WorkflowInstance::new("i1".into(), "wf".into(), ["n"]);
        let mut ctx = ActionContext::new(&mut instance, None, None, Arc::new(TaskScheduler::new()), CancellationToken::new());

        let batch = executor.execute_actions(&[], &mut ctx).await;
        assert!(batch.all_succeeded);
        assert!(batch.results.is_empty());
    }

    #[tokio::test]
    async fn builtins_update_variables_and_log() {
        let executor = ActionExecutor::new();
        let mut instance = WorkflowInstance::new("i1".into(), "wf".into(), ["n"]);
        let mut ctx = ActionContext::new(&mut instance, None, None, Arc::new(TaskScheduler::new()), CancellationToken::new());

        let batch = executor
            .execute_actions(
                &[
                    action("set_variable", json!({ "variable": "owner", "value": "grace" })),
                    action("notify", json!({ "message": "Owner is {{owner}}" })),
                    action("send_email", json!({ "to": "{{owner}}@example.com", "subject": "Ready" })),
                    action("sticky_color", json!({ "color": "yellow" })),
                ],
                &mut ctx,
            )
            .await;

        assert!(batch.all_succeeded);
        assert_eq!(batch.results[1].data.as_ref().unwrap()["message"], "Owner is grace");
        assert_eq!(batch.results[2].data.as_ref().unwrap()["to"], "grace@example.com");

        assert_eq!(instance.variables["owner"], json!("grace"));
        assert_eq!(instance.count_events(LogEventType::VariableUpdated), 1);
        assert!(instance.logs.iter().any(|event| event.message == "Executed action: sticky_color"));
    }

    #[tokio::test]
    async fn registered_handler_overrides_builtin() {
        let executor = ActionExecutor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        executor.register_action_handler("send_email", Arc::new(Recording { seen: Arc::clone(&seen), fail: false }));
        assert!(executor.has_handler("send_email"));

        let mut instance = WorkflowInstance::new("i1".into(), "wf".into(), ["n"]);
        let mut ctx = ActionContext::new(&mut instance, None, None, Arc::new(TaskScheduler::new()), CancellationToken::new());
        let result = executor
            .execute_action(&action("send_email", json!({ "to": "a@b.c", "tag": "mail" })), &mut ctx)
            .await;

        assert_eq!(result.data, Some(json!("done")));
        assert_eq!(*seen.lock().unwrap(), vec!["mail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_and_can_be_interrupted() {
        let executor = ActionExecutor::new();
        let mut instance = WorkflowInstance::new("i1".into(), "wf".into(), ["n"]);
        let interrupt = CancellationToken::new();
        let mut ctx = ActionContext::new(&mut instance, None, None, Arc::new(TaskScheduler::new()), interrupt.clone());

        let started = tokio::time::Instant::now();
        let result = executor.execute_action(&action("delay", json!({ "duration": 300 })), &mut ctx).await;
        assert!(result.success);
        assert!(started.elapsed() >= std::time::Duration::from_millis(300));

        interrupt.cancel();
        let result = executor.execute_action(&action("delay", Value::Null), &mut ctx).await;
        assert_eq!(result, ActionResult::failed("interrupted"));
    }
}

/// Typed action payloads
///
/// The board stores actions as `{ "type": "...", "config": { ... } }`. Built-in
/// types are parsed into an `ActionPayload` once, when the definition is compiled,
/// so a malformed config is rejected up front instead of at every execution.
/// Unknown types become `ActionPayload::Extension` and are served by handlers
/// registered on the `ActionExecutor`.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default pause of the `delay` action when no duration is configured
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Action as authored on the board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Parsed configuration of a built-in action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    /// Write `value` into the instance variable `variable`
    SetVariable { variable: String, value: Value },
    /// Emit a notification; `message` may contain `{{path}}` tokens
    Notify { message: String, recipients: Vec<String> },
    /// Suspend the action sequence
    Delay { duration: Duration },
    Assign { assignee: String },
    SendEmail { to: String, subject: String, body: String },
    CreateTask { title: String, assignee: Option<String> },
    /// Custom type served by a registered handler
    Extension,
}

/// A compiled action: the raw definition plus its parsed payload
#[derive(Debug, Clone)]
pub struct Action {
    pub id: Option<String>,
    pub action_type: String,
    /// Raw config, kept for extension handlers
    pub config: Value,
    pub payload: ActionPayload,
}

#[derive(Deserialize)]
struct SetVariableConfig {
    #[serde(alias = "key", alias = "variableName")]
    variable: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct NotifyConfig {
    #[serde(default)]
    message: String,
    #[serde(default)]
    recipients: Vec<String>,
}

#[derive(Deserialize)]
struct DelayConfig {
    #[serde(default = "default_delay_ms")]
    duration: u64,
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

#[derive(Deserialize)]
struct AssignConfig {
    assignee: String,
}

#[derive(Deserialize)]
struct SendEmailConfig {
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct CreateTaskConfig {
    title: String,
    #[serde(default)]
    assignee: Option<String>,
}

/// Deserialize a config object, treating a missing config as `{}`
fn parse_config<T: DeserializeOwned>(action_type: &str, config: &Value) -> Result<T> {
    let config = match config {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(config).with_context(|| format!("Invalid config for '{}' action", action_type))
}

impl Action {
    /// Parse an authored action into its typed form
    pub fn compile(definition: &ActionDefinition) -> Result<Self> {
        let action_type = definition.action_type.as_str();
        let config = &definition.config;

        let payload = match action_type {
            "set_variable" => {
                let parsed: SetVariableConfig = parse_config(action_type, config)?;
                if parsed.variable.is_empty() {
                    anyhow::bail!("'set_variable' action requires a non-empty variable name");
                }
                ActionPayload::SetVariable { variable: parsed.variable, value: parsed.value }
            }
            "notify" => {
                let parsed: NotifyConfig = parse_config(action_type, config)?;
                ActionPayload::Notify { message: parsed.message, recipients: parsed.recipients }
            }
            "delay" => {
                let parsed: DelayConfig = parse_config(action_type, config)?;
                ActionPayload::Delay { duration: Duration::from_millis(parsed.duration) }
            }
            "assign" => {
                let parsed: AssignConfig = parse_config(action_type, config)?;
                ActionPayload::Assign { assignee: parsed.assignee }
            }
            "send_email" => {
                let parsed: SendEmailConfig = parse_config(action_type, config)?;
                ActionPayload::SendEmail { to: parsed.to, subject: parsed.subject, body: parsed.body }
            }
            "create_task" => {
                let parsed: CreateTaskConfig = parse_config(action_type, config)?;
                ActionPayload::CreateTask { title: parsed.title, assignee: parsed.assignee }
            }
            _ => ActionPayload::Extension,
        };

        Ok(Self {
            id: definition.id.clone(),
            action_type: definition.action_type.clone(),
            config: definition.config.clone(),
            payload,
        })
    }

    /// Compile a list of actions, naming the failing position on error
    pub fn compile_all(definitions: &[ActionDefinition]) -> Result<Vec<Self>> {
        definitions
            .iter()
            .enumerate()
            .map(|(position, definition)| {
                Self::compile(definition).with_context(|| format!("action #{}", position + 1))
            })
            .collect()
    }

    /// Key used to look up registered handlers
    pub fn type_name(&self) -> &str {
        &self.action_type
    }
}

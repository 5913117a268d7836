/// Condition evaluation
///
/// Pure functions that resolve dotted field paths against an instance snapshot
/// and compare values with a fixed operator set. Nothing here fails: every error
/// path degrades to a boolean (`false` for failed comparisons, `true` for a
/// malformed edge expression) and leaves a diagnostic on the tracing channel.

use crate::workflow::types::{
    Condition, ConditionExpression, ConditionGroup, ConditionLogic, ConditionOperator,
    NodeRuntimeState, WorkflowNodeData,
};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::OnceLock};

/// Snapshot a condition is evaluated against
///
/// Root object: `{ "variables": {...}, "nodeStates": {...}, "currentNode": {...} }`.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    root: Value,
}

impl ConditionContext {
    pub fn new(
        variables: &Map<String, Value>,
        node_states: &HashMap<String, NodeRuntimeState>,
        current_node: Option<&WorkflowNodeData>,
    ) -> Self {
        let node_states = serde_json::to_value(node_states).unwrap_or_default();
        let current_node = current_node
            .and_then(|node| serde_json::to_value(node).ok())
            .unwrap_or_default();

        Self {
            root: json!({
                "variables": variables,
                "nodeStates": node_states,
                "currentNode": current_node,
            }),
        }
    }

    /// Context holding only variables
    pub fn from_variables(variables: Map<String, Value>) -> Self {
        Self::from_value(json!({ "variables": variables }))
    }

    /// Context over an arbitrary JSON root
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }
}

/// Outcome of checking a node's entry conditions
#[derive(Debug, Clone, PartialEq)]
pub struct EntryEvaluation {
    pub passed: bool,
    pub failed_conditions: Vec<Condition>,
}

/// Walk a dot-separated path (`a.b.c`) from `root`
///
/// Returns `None` ("undefined") on any missing segment or when an intermediate
/// value is neither an object nor an array. Array segments are numeric indexes.
pub fn resolve_path<'a>(path: &str, root: &'a Value) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a field path against the context root
pub fn resolve_field_value<'a>(field: &str, context: &'a ConditionContext) -> Option<&'a Value> {
    resolve_path(field, context.root())
}

/// Resolve against the root, then fall back to `variables.<field>`
///
/// Edge expressions and templates name variables directly (`score >= 10`,
/// `{{assignee}}`) as well as by full path (`variables.score`).
pub fn resolve_field_or_variable<'a>(field: &str, context: &'a ConditionContext) -> Option<&'a Value> {
    resolve_field_value(field, context).or_else(|| {
        context
            .root()
            .get("variables")
            .and_then(|variables| resolve_path(field, variables))
    })
}

/// Numeric conversion in the spirit of a loose `Number(x)`
///
/// `None` stands for NaN; every numeric comparison involving NaN is false.
fn to_number(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Null => 0.0,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                0.0
            } else {
                text.parse::<f64>().ok()?
            }
        }
        Value::Array(_) | Value::Object(_) => return None,
    };
    (!number.is_nan()).then_some(number)
}

/// Strict equality, except that numbers compare by numeric value (`5 == 5.0`)
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(actual), expected) => actual == expected,
    }
}

/// `Some(found)` for string/array subjects, `None` for anything else
fn contains(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    match actual? {
        Value::String(text) => Some(matches!(expected, Value::String(needle) if text.contains(needle.as_str()))),
        Value::Array(items) => Some(items.iter().any(|item| values_equal(Some(item), expected))),
        _ => None,
    }
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value, compare: impl Fn(f64, f64) -> bool) -> bool {
    match (to_number(actual), to_number(Some(expected))) {
        (Some(a), Some(b)) => compare(a, b),
        _ => false,
    }
}

fn compare_strings(actual: Option<&Value>, expected: &Value, compare: impl Fn(&str, &str) -> bool) -> bool {
    match (actual, expected) {
        (Some(Value::String(a)), Value::String(b)) => compare(a, b),
        _ => false,
    }
}

/// Compare a resolved value (`None` = undefined) with an expected value
pub fn compare_values(actual: Option<&Value>, operator: ConditionOperator, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::GreaterThan => compare_numbers(actual, expected, |a, b| a > b),
        ConditionOperator::LessThan => compare_numbers(actual, expected, |a, b| a < b),
        ConditionOperator::GreaterOrEqual => compare_numbers(actual, expected, |a, b| a >= b),
        ConditionOperator::LessOrEqual => compare_numbers(actual, expected, |a, b| a <= b),
        ConditionOperator::Contains => contains(actual, expected).unwrap_or(false),
        ConditionOperator::NotContains => contains(actual, expected).map(|found| !found).unwrap_or(true),
        ConditionOperator::StartsWith => compare_strings(actual, expected, |a, b| a.starts_with(b)),
        ConditionOperator::EndsWith => compare_strings(actual, expected, |a, b| a.ends_with(b)),
        ConditionOperator::IsEmpty => is_empty(actual),
        ConditionOperator::IsNotEmpty => !is_empty(actual),
        ConditionOperator::IsTrue => matches!(actual, Some(Value::Bool(true))) || matches!(actual, Some(Value::String(s)) if s == "true"),
        ConditionOperator::IsFalse => matches!(actual, Some(Value::Bool(false))) || matches!(actual, Some(Value::String(s)) if s == "false"),
    }
}

/// Evaluate a single `field operator value` expression
pub fn evaluate_condition(condition: &ConditionExpression, context: &ConditionContext) -> bool {
    let actual = resolve_field_value(&condition.field, context);
    let result = compare_values(actual, condition.operator, &condition.value);
    tracing::trace!("🔍 {} {:?} {} => {}", condition.field, condition.operator, condition.value, result);
    result
}

/// Evaluate an `and`/`or` tree; an empty group is vacuously true
pub fn evaluate_condition_group(group: &ConditionGroup, context: &ConditionContext) -> bool {
    if group.conditions.is_empty() {
        return true;
    }
    match group.logic {
        ConditionLogic::And => group.conditions.iter().all(|condition| evaluate(condition, context)),
        ConditionLogic::Or => group.conditions.iter().any(|condition| evaluate(condition, context)),
    }
}

/// Evaluate either form of condition
pub fn evaluate(condition: &Condition, context: &ConditionContext) -> bool {
    match condition {
        Condition::Expression(expression) => evaluate_condition(expression, context),
        Condition::Group(group) => evaluate_condition_group(group, context),
    }
}

/// Check a node's entry conditions; an empty list always passes
pub fn evaluate_entry_conditions(conditions: &[Condition], context: &ConditionContext) -> EntryEvaluation {
    let failed_conditions: Vec<Condition> = conditions
        .iter()
        .filter(|condition| !evaluate(condition, context))
        .cloned()
        .collect();

    EntryEvaluation {
        passed: failed_conditions.is_empty(),
        failed_conditions,
    }
}

/// Parsed `"<field> <op> <value>"` edge expression
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeExpression {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

fn edge_expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([^\s=!<>]+)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").expect("edge expression pattern is valid")
    })
}

/// Coerce an edge literal: booleans, null, numbers, quoted strings, else trimmed text
pub fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }

    if let Ok(integer) = raw.parse::<i64>() {
        return Value::from(integer);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if float.is_finite() {
            return Value::from(float);
        }
    }

    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"')) || (raw.starts_with('\'') && raw.ends_with('\'')));
    if quoted {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    Value::String(raw.to_string())
}

/// Parse an edge expression, `None` when malformed
pub fn parse_edge_condition(expression: &str) -> Option<EdgeExpression> {
    let captures = edge_expression_pattern().captures(expression)?;
    let operator = match &captures[2] {
        "==" => ConditionOperator::Equals,
        "!=" => ConditionOperator::NotEquals,
        ">" => ConditionOperator::GreaterThan,
        "<" => ConditionOperator::LessThan,
        ">=" => ConditionOperator::GreaterOrEqual,
        "<=" => ConditionOperator::LessOrEqual,
        _ => return None,
    };

    Some(EdgeExpression {
        field: captures[1].to_string(),
        operator,
        value: parse_literal(&captures[3]),
    })
}

/// Evaluate an edge expression such as `"score >= 10"`
///
/// Malformed expressions are logged and fail open (`true`).
pub fn evaluate_edge_condition(expression: &str, context: &ConditionContext) -> bool {
    match parse_edge_condition(expression) {
        Some(parsed) => {
            let actual = resolve_field_or_variable(&parsed.field, context);
            compare_values(actual, parsed.operator, &parsed.value)
        }
        None => {
            tracing::warn!("⚠️ Malformed edge condition '{}', treating as true", expression);
            true
        }
    }
}

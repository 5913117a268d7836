#![allow(dead_code)]

use boardflow::workflow::types::{EventCallback, WorkflowDefinition, WorkflowLogEvent};
use boardflow::workflow::CompiledWorkflow;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// Builds board-shaped definitions through their JSON wire form
pub struct DefinitionBuilder {
    id: String,
    nodes: Vec<Value>,
    edges: Vec<Value>,
}

impl DefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string(), nodes: Vec::new(), edges: Vec::new() }
    }

    pub fn node(self, id: &str, node_type: &str) -> Self {
        self.node_json(json!({ "id": id, "type": node_type, "label": id }))
    }

    /// Node with arbitrary extra fields (entryConditions, onEnterActions, ...)
    pub fn node_with(self, id: &str, node_type: &str, extra: Value) -> Self {
        let mut node = json!({ "id": id, "type": node_type, "label": id });
        if let (Some(node), Value::Object(extra)) = (node.as_object_mut(), extra) {
            node.extend(extra);
        }
        self.node_json(node)
    }

    pub fn node_json(mut self, node: Value) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, id: &str, source: &str, target: &str) -> Self {
        self.edges.push(json!({ "id": id, "source": source, "target": target }));
        self
    }

    pub fn guarded_edge(mut self, id: &str, source: &str, target: &str, condition: &str) -> Self {
        self.edges.push(json!({
            "id": id,
            "source": source,
            "target": target,
            "conditions": [{ "value": condition }]
        }));
        self
    }

    pub fn edge_with_actions(mut self, id: &str, source: &str, target: &str, actions: Value) -> Self {
        self.edges.push(json!({ "id": id, "source": source, "target": target, "actions": actions }));
        self
    }

    pub fn to_json(&self) -> Value {
        json!({ "id": self.id, "name": self.id, "nodes": self.nodes, "edges": self.edges })
    }

    pub fn build(self) -> WorkflowDefinition {
        serde_json::from_value(self.to_json()).expect("definition json")
    }

    pub fn compile(self) -> Arc<CompiledWorkflow> {
        Arc::new(CompiledWorkflow::compile(self.build()).expect("definition compiles"))
    }
}

/// `start → decision(x > 0 ? task : end) → end`
pub fn branching_workflow() -> DefinitionBuilder {
    DefinitionBuilder::new("branching")
        .node("start", "start")
        .node("check", "decision")
        .node("work", "task")
        .node("done", "end")
        .edge("e-start", "start", "check")
        .guarded_edge("e-positive", "check", "work", "x > 0")
        .guarded_edge("e-otherwise", "check", "done", "x <= 0")
        .edge("e-work", "work", "done")
}

/// Subscriber that keeps every event it is handed
pub fn event_sink() -> (EventCallback, Arc<Mutex<Vec<WorkflowLogEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: EventCallback = Arc::new(move |event: &WorkflowLogEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (callback, events)
}

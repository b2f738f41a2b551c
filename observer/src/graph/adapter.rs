//! GraphEventAdapter - drives a WorkflowGraphBuilder from bus events.
//!
//! The adapter takes one ordered subscription over every lifecycle type, so
//! a completion can never overtake its start. New nodes hang off a cursor
//! (the most recently created node); completions find their node by
//! correlation id, or by the newest open node of the same family when the
//! event carries none.
//!
//! Payloads are loosely typed. Missing required fields are logged and
//! replaced with defaults; nothing here fails the publisher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shared_types::{EdgeKind, Event, EventType, GraphSnapshot, NodeStatus};
use tokio::sync::Mutex;

use super::builder::WorkflowGraphBuilder;
use crate::bus::{EventBus, EventHandler, SubscriptionId};
use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    Step,
    Action,
    LlmCall,
}

struct AdapterState {
    session_id: String,
    builder: WorkflowGraphBuilder,
    correlations: HashMap<String, (Family, String)>,
    open: HashMap<Family, Vec<String>>,
    cursor: Option<String>,
}

impl AdapterState {
    fn new(session_id: String, max_depth: usize) -> Self {
        Self {
            session_id,
            builder: WorkflowGraphBuilder::new(max_depth),
            correlations: HashMap::new(),
            open: HashMap::new(),
            cursor: None,
        }
    }

    fn apply(&mut self, event: &Event) {
        if event.session_id != self.session_id {
            tracing::debug!(
                session_id = %event.session_id,
                adapter_session = %self.session_id,
                "Ignoring event from another session"
            );
            return;
        }
        tracing::debug!(event_type = %event.event_type, "Applying event to graph");

        match event.event_type {
            EventType::AgentStart => self.on_agent_start(event),
            EventType::NodeStart => self.on_node_start(event),
            EventType::NodeComplete => {
                self.on_completion(event, Family::Step);
            }
            EventType::ActionStart => self.on_action_start(event),
            EventType::ActionComplete => self.on_action_complete(event),
            EventType::LlmCallStart => self.on_llm_call_start(event),
            EventType::LlmCallComplete => self.on_llm_call_complete(event),
            EventType::AgentComplete => self.on_agent_complete(event),
            EventType::AgentError => self.on_agent_error(event),
        }
    }

    fn on_agent_start(&mut self, event: &Event) {
        let task = required_str(event, "task").unwrap_or("Unknown task");
        if let Some(root) = self.builder.add_start_node(task) {
            self.cursor = Some(root);
        }
    }

    fn on_node_start(&mut self, event: &Event) {
        let Some(parent) = self.parent_for(event) else {
            return;
        };
        let content = match (event.str_field("content"), event.data.get("step")) {
            (Some(content), _) => content.to_string(),
            (None, Some(step)) => format!("Step {}", display_value(step)),
            (None, None) => "Thinking".to_string(),
        };
        let model = event.str_field("model");
        let node = self.builder.add_thinking_node(&parent, &content, model);
        self.track(event, Family::Step, node);
    }

    fn on_action_start(&mut self, event: &Event) {
        let Some(parent) = self.parent_for(event) else {
            return;
        };
        let action = required_str(event, "action").unwrap_or("unknown_action");
        let params = event
            .data
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let attempt = event.u64_field("attempt").unwrap_or(1);

        let node = if attempt > 1 {
            self.builder.add_action_node_with_edge(
                &parent,
                action,
                &params,
                NodeStatus::Running,
                EdgeKind::Retry,
                Some(format!("retry {attempt}")),
            )
        } else {
            self.builder
                .add_action_node(&parent, action, &params, NodeStatus::Running)
        };
        self.track(event, Family::Action, node);
    }

    fn on_action_complete(&mut self, event: &Event) {
        let error = event.str_field("error").map(str::to_string);
        let Some(node) = self.on_completion(event, Family::Action) else {
            return;
        };
        if let Some(error) = error {
            let success = event.bool_field("success").unwrap_or(false);
            if !success {
                // Branch off the failed action; the cursor stays on it so a
                // retry attaches to the attempt it repeats.
                self.builder.add_error_node(&node, &error);
            }
        }
    }

    fn on_llm_call_start(&mut self, event: &Event) {
        let Some(parent) = self.parent_for(event) else {
            return;
        };
        let model = required_str(event, "model").unwrap_or("unknown");
        let node = self.builder.add_llm_call_node(&parent, model);
        self.track(event, Family::LlmCall, node);
    }

    fn on_llm_call_complete(&mut self, event: &Event) {
        let Some(node) = self.on_completion(event, Family::LlmCall) else {
            return;
        };
        let mut usage = serde_json::Map::new();
        for key in ["tokens_in", "tokens_out"] {
            if let Some(value) = event.u64_field(key) {
                usage.insert(key.to_string(), value.into());
            }
        }
        if !usage.is_empty() {
            self.builder.merge_node_data(&node, &usage);
        }
    }

    fn on_agent_complete(&mut self, event: &Event) {
        let Some(parent) = self.parent_for(event) else {
            return;
        };
        let success = event.bool_field("success").unwrap_or(true);
        let result = event.data.get("result").cloned().unwrap_or(Value::Null);

        let result_node = self.builder.add_result_node(&parent, &result, success);
        let end_parent = result_node.clone().unwrap_or(parent);
        let final_text = (!result.is_null()).then(|| display_value(&result));
        let end_node = self.builder.add_end_node(&end_parent, final_text.as_deref());

        if let Some(node) = end_node.or(result_node) {
            self.cursor = Some(node);
        }
    }

    fn on_agent_error(&mut self, event: &Event) {
        let Some(parent) = self.parent_for(event) else {
            return;
        };
        let error = required_str(event, "error").unwrap_or("unknown error");
        if let Some(node) = self.builder.add_error_node(&parent, error) {
            self.cursor = Some(node);
        }
    }

    /// Apply a `*-complete` event to the node it finishes. Returns that
    /// node's id if the update took effect.
    fn on_completion(&mut self, event: &Event, family: Family) -> Option<String> {
        let node = self.resolve(event, family)?;
        let success = event
            .bool_field("success")
            .unwrap_or_else(|| event.str_field("error").is_none());
        let status = if success {
            NodeStatus::Completed
        } else {
            NodeStatus::Error
        };
        let duration = event.f64_field("duration_ms");
        let result = event
            .data
            .get("result")
            .cloned()
            .or_else(|| event.data.get("error").cloned());

        self.builder
            .update_node_status(&node, status, duration, result.as_ref())
            .then_some(node)
    }

    fn parent_for(&self, event: &Event) -> Option<String> {
        let parent = self.cursor.clone();
        if parent.is_none() {
            tracing::warn!(
                event_type = %event.event_type,
                session_id = %event.session_id,
                "Event before agent-start; ignoring"
            );
        }
        parent
    }

    fn track(&mut self, event: &Event, family: Family, node: Option<String>) {
        let Some(node) = node else {
            return;
        };
        if let Some(correlation_id) = &event.correlation_id {
            self.correlations
                .insert(correlation_id.clone(), (family, node.clone()));
        }
        self.open.entry(family).or_default().push(node.clone());
        self.cursor = Some(node);
    }

    fn resolve(&mut self, event: &Event, family: Family) -> Option<String> {
        let open = self.open.entry(family).or_default();
        match &event.correlation_id {
            Some(correlation_id) => match self.correlations.get(correlation_id).cloned() {
                Some((stored, node)) if stored != family => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        event_type = %event.event_type,
                        node_id = %node,
                        "Correlation id belongs to another node kind; ignoring completion"
                    );
                    None
                }
                Some((_, node)) => {
                    self.correlations.remove(correlation_id);
                    open.retain(|id| id != &node);
                    Some(node)
                }
                None => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        event_type = %event.event_type,
                        "No node for correlation id; ignoring completion"
                    );
                    None
                }
            },
            None => {
                let node = open.pop();
                if node.is_none() {
                    tracing::warn!(
                        event_type = %event.event_type,
                        "Completion with no open node; ignoring"
                    );
                }
                node
            }
        }
    }
}

fn required_str<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    let value = event.str_field(key);
    if value.is_none() {
        tracing::warn!(
            event_type = %event.event_type,
            field = %key,
            "Event missing required field; using default"
        );
    }
    value
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

struct AdapterHandler {
    state: Arc<Mutex<AdapterState>>,
}

#[async_trait]
impl EventHandler for AdapterHandler {
    fn name(&self) -> &str {
        "graph-adapter"
    }

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        self.state.lock().await.apply(&event);
        Ok(())
    }
}

/// Live workflow graph for one session.
pub struct GraphEventAdapter {
    session_id: String,
    state: Arc<Mutex<AdapterState>>,
    attachment: Option<(EventBus, SubscriptionId)>,
}

impl GraphEventAdapter {
    /// Adapter driven only through [`GraphEventAdapter::apply`].
    pub fn new(session_id: impl Into<String>, max_depth: usize) -> Self {
        let session_id = session_id.into();
        Self {
            state: Arc::new(Mutex::new(AdapterState::new(session_id.clone(), max_depth))),
            session_id,
            attachment: None,
        }
    }

    /// Subscribe a new adapter to every lifecycle type on `bus`.
    pub async fn attach(
        bus: &EventBus,
        session_id: impl Into<String>,
        max_depth: usize,
    ) -> Result<Self, BusError> {
        let mut adapter = Self::new(session_id, max_depth);
        let handler = AdapterHandler {
            state: Arc::clone(&adapter.state),
        };
        let id = bus.subscribe_many(EventType::ALL, handler).await?;
        tracing::info!(
            session_id = %adapter.session_id,
            subscription = %id,
            "Graph adapter attached"
        );
        adapter.attachment = Some((bus.clone(), id));
        Ok(adapter)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub async fn apply(&self, event: &Event) {
        self.state.lock().await.apply(event);
    }

    pub async fn snapshot(&self) -> GraphSnapshot {
        self.state.lock().await.builder.snapshot()
    }

    /// Unsubscribe from the bus. The graph stays readable.
    pub async fn detach(&mut self) -> Result<(), BusError> {
        let Some((bus, id)) = self.attachment.take() else {
            return Ok(());
        };
        for event_type in EventType::ALL {
            bus.unsubscribe(event_type, id).await?;
        }
        tracing::info!(session_id = %self.session_id, "Graph adapter detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_types::NodeKind;

    fn event(event_type: EventType, data: Value) -> Event {
        Event::new(event_type, "s1", data)
    }

    #[tokio::test]
    async fn test_action_lifecycle_by_correlation() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "search"})))
            .await;
        adapter
            .apply(
                &event(EventType::ActionStart, json!({"action": "click", "params": {}}))
                    .with_correlation_id("a1"),
            )
            .await;

        let running = adapter.snapshot().await;
        let action = running.nodes_of_kind(NodeKind::Action).next().unwrap().clone();
        assert_eq!(action.status, NodeStatus::Running);

        adapter
            .apply(
                &event(EventType::ActionComplete, json!({"success": true, "duration_ms": 120.0}))
                    .with_correlation_id("a1"),
            )
            .await;

        let done = adapter.snapshot().await;
        let node = done.node(&action.id).unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.data["duration"], json!(120.0));
    }

    #[tokio::test]
    async fn test_completion_without_correlation_uses_latest_open() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(EventType::NodeStart, json!({"step": 1})))
            .await;
        adapter
            .apply(&event(EventType::NodeComplete, json!({"success": false})))
            .await;

        let snapshot = adapter.snapshot().await;
        let thinking = snapshot.nodes_of_kind(NodeKind::Thinking).next().unwrap();
        assert_eq!(thinking.data["content"], "Step 1");
        assert_eq!(thinking.status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn test_retry_attempt_gets_retry_edge() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(EventType::ActionStart, json!({"action": "click"})).with_correlation_id("a1"))
            .await;
        adapter
            .apply(
                &event(EventType::ActionComplete, json!({"success": false, "error": "not found"}))
                    .with_correlation_id("a1"),
            )
            .await;
        adapter
            .apply(
                &event(EventType::ActionStart, json!({"action": "click", "attempt": 2}))
                    .with_correlation_id("a2"),
            )
            .await;

        let snapshot = adapter.snapshot().await;
        let actions: Vec<_> = snapshot.nodes_of_kind(NodeKind::Action).collect();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].status, NodeStatus::Error);

        let retry = snapshot
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::Retry)
            .unwrap();
        assert_eq!(retry.source, actions[0].id);
        assert_eq!(retry.target, actions[1].id);

        let error_edge = snapshot
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::Error)
            .unwrap();
        assert_eq!(error_edge.source, actions[0].id);
    }

    #[tokio::test]
    async fn test_other_sessions_and_orphans_ignored() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&Event::new(EventType::AgentStart, "other", json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(EventType::ActionStart, json!({"action": "click"})))
            .await;
        assert!(adapter.snapshot().await.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_use_defaults() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter.apply(&event(EventType::AgentStart, json!({}))).await;
        adapter.apply(&event(EventType::LlmCallStart, json!({}))).await;
        adapter
            .apply(&event(
                EventType::LlmCallComplete,
                json!({"tokens_in": 10, "tokens_out": 5}),
            ))
            .await;

        let snapshot = adapter.snapshot().await;
        assert_eq!(snapshot.nodes[0].data["task"], "Unknown task");
        let llm = snapshot.nodes_of_kind(NodeKind::LlmCall).next().unwrap();
        assert_eq!(llm.data["model"], "unknown");
        assert_eq!(llm.data["tokens_in"], 10);
        assert_eq!(llm.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_unmatched_completion_leaves_node_running() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(EventType::ActionStart, json!({"action": "scroll"})).with_correlation_id("a1"))
            .await;
        adapter
            .apply(&event(EventType::ActionComplete, json!({})).with_correlation_id("zzz"))
            .await;

        let snapshot = adapter.snapshot().await;
        let action = snapshot.nodes_of_kind(NodeKind::Action).next().unwrap();
        assert_eq!(action.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_completion_of_other_kind_does_not_consume_correlation() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(EventType::LlmCallStart, json!({"model": "gpt-4o"})).with_correlation_id("c1"))
            .await;
        adapter
            .apply(
                &event(EventType::ActionComplete, json!({"success": false, "error": "boom"}))
                    .with_correlation_id("c1"),
            )
            .await;

        let snapshot = adapter.snapshot().await;
        let llm = snapshot.nodes_of_kind(NodeKind::LlmCall).next().unwrap();
        assert_eq!(llm.status, NodeStatus::Running);
        assert_eq!(snapshot.nodes_of_kind(NodeKind::Error).count(), 0);

        adapter
            .apply(
                &event(EventType::LlmCallComplete, json!({"success": true}))
                    .with_correlation_id("c1"),
            )
            .await;
        let snapshot = adapter.snapshot().await;
        let llm = snapshot.nodes_of_kind(NodeKind::LlmCall).next().unwrap();
        assert_eq!(llm.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_agent_complete_adds_result_and_end() {
        let adapter = GraphEventAdapter::new("s1", 100);
        adapter
            .apply(&event(EventType::AgentStart, json!({"task": "t"})))
            .await;
        adapter
            .apply(&event(
                EventType::AgentComplete,
                json!({"success": true, "result": "found 3 items"}),
            ))
            .await;

        let snapshot = adapter.snapshot().await;
        assert_eq!(snapshot.nodes_of_kind(NodeKind::Result).count(), 1);
        let end = snapshot.nodes_of_kind(NodeKind::End).next().unwrap();
        assert_eq!(end.data["result"], "found 3 items");
        assert_eq!(snapshot.edges.len(), 2);
    }
}

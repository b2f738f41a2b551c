//! WorkflowGraphBuilder - incremental node/edge graph of one agent run.
//!
//! Every node except the root is created with exactly one existing parent,
//! so the graph is a single-rooted DAG. Layout is deterministic: a child
//! sits one row below its parent, shifted right by its sibling index.
//!
//! Integrity problems (unknown parent, unknown node, illegal transition,
//! exhausted depth) are logged and ignored; nothing here returns an error.

use std::collections::HashMap;

use shared_types::{
    now_seconds, EdgeKind, GraphEdge, GraphMetadata, GraphNode, GraphSnapshot, NodeKind,
    NodeStatus, Position,
};

use super::sanitize::{preview, sanitize_map, sanitize_value, truncate_chars, MAX_VALUE_CHARS};
use crate::observability::cost::round_to;

pub const VERTICAL_SPACING: f64 = 120.0;
pub const HORIZONTAL_OFFSET: f64 = 250.0;
pub const DEFAULT_MAX_DEPTH: usize = 100;

const PREVIEW_CHARS: usize = 200;

struct NodeEntry {
    node: GraphNode,
    start_time: Option<f64>,
    end_time: Option<f64>,
}

pub struct WorkflowGraphBuilder {
    nodes: Vec<NodeEntry>,
    edges: Vec<GraphEdge>,
    index: HashMap<String, usize>,
    child_counts: HashMap<String, usize>,
    incoming_edge: HashMap<String, usize>,
    node_counter: u64,
    root_id: Option<String>,
    /// Real nodes created so far, root included
    depth: usize,
    max_depth: usize,
    truncated: bool,
}

impl Default for WorkflowGraphBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl WorkflowGraphBuilder {
    /// `max_depth` below 1 is raised to 1 so the root always fits.
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            index: HashMap::new(),
            child_counts: HashMap::new(),
            incoming_edge: HashMap::new(),
            node_counter: 0,
            root_id: None,
            depth: 0,
            max_depth: max_depth.max(1),
            truncated: false,
        }
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx].node)
    }

    // ========================================================================
    // Node creation
    // ========================================================================

    /// Create the root node. Returns `None` if a root already exists.
    pub fn add_start_node(&mut self, task: &str) -> Option<String> {
        if let Some(existing) = &self.root_id {
            tracing::warn!(root = %existing, "Graph already has a start node; ignoring");
            return None;
        }

        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), "Start".into());
        data.insert("task".to_string(), truncate_chars(task, MAX_VALUE_CHARS).into());
        data.insert("icon".to_string(), "🚀".into());

        let id = self.push_node(
            NodeKind::Start,
            Position {
                x: HORIZONTAL_OFFSET,
                y: 0.0,
            },
            data,
            NodeStatus::Completed,
        );
        self.depth += 1;
        self.root_id = Some(id.clone());
        Some(id)
    }

    /// Create a child of `parent_id` joined by a normal edge. `data` is
    /// sanitized before it is stored.
    pub fn add_node(
        &mut self,
        parent_id: &str,
        kind: NodeKind,
        label: &str,
        data: serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
    ) -> Option<String> {
        self.add_node_with_edge(parent_id, kind, label, data, status, EdgeKind::Normal, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_node_with_edge(
        &mut self,
        parent_id: &str,
        kind: NodeKind,
        label: &str,
        data: serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
        edge_kind: EdgeKind,
        edge_label: Option<String>,
    ) -> Option<String> {
        let mut data = sanitize_map(&data);
        data.insert("label".to_string(), label.into());
        self.add_child(parent_id, kind, data, status, edge_kind, edge_label)
    }

    pub fn add_thinking_node(
        &mut self,
        parent_id: &str,
        content: &str,
        model: Option<&str>,
    ) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), "Thinking".into());
        data.insert("content".to_string(), preview(content, PREVIEW_CHARS).into());
        data.insert("model".to_string(), model.into());
        data.insert("icon".to_string(), "🤔".into());
        self.add_child(
            parent_id,
            NodeKind::Thinking,
            data,
            NodeStatus::Running,
            EdgeKind::Normal,
            None,
        )
    }

    pub fn add_llm_call_node(&mut self, parent_id: &str, model: &str) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), model.into());
        data.insert("model".to_string(), model.into());
        data.insert("icon".to_string(), "🧠".into());
        self.add_child(
            parent_id,
            NodeKind::LlmCall,
            data,
            NodeStatus::Running,
            EdgeKind::Normal,
            None,
        )
    }

    pub fn add_action_node(
        &mut self,
        parent_id: &str,
        action: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
    ) -> Option<String> {
        self.add_action_node_with_edge(parent_id, action, params, status, EdgeKind::Normal, None)
    }

    pub fn add_action_node_with_edge(
        &mut self,
        parent_id: &str,
        action: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
        edge_kind: EdgeKind,
        edge_label: Option<String>,
    ) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), format_action_label(action).into());
        data.insert("action".to_string(), action.into());
        data.insert(
            "params".to_string(),
            serde_json::Value::Object(sanitize_map(params)),
        );
        data.insert("icon".to_string(), action_icon(action).into());
        self.add_child(parent_id, NodeKind::Action, data, status, edge_kind, edge_label)
    }

    pub fn add_result_node(
        &mut self,
        parent_id: &str,
        result: &serde_json::Value,
        success: bool,
    ) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert(
            "label".to_string(),
            if success { "Success" } else { "Failed" }.into(),
        );
        let result = if result.is_null() {
            serde_json::Value::String("No result".to_string())
        } else {
            sanitize_value(result)
        };
        data.insert("result".to_string(), result);
        data.insert("icon".to_string(), if success { "✅" } else { "❌" }.into());

        let status = if success {
            NodeStatus::Completed
        } else {
            NodeStatus::Error
        };
        let label = if success { "✓" } else { "✗" };
        self.add_child(
            parent_id,
            NodeKind::Result,
            data,
            status,
            EdgeKind::Normal,
            Some(label.to_string()),
        )
    }

    pub fn add_error_node(&mut self, parent_id: &str, error: &str) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), "Error".into());
        data.insert("error".to_string(), preview(error, PREVIEW_CHARS).into());
        data.insert("icon".to_string(), "🚫".into());
        self.add_child(
            parent_id,
            NodeKind::Error,
            data,
            NodeStatus::Error,
            EdgeKind::Error,
            Some("error".to_string()),
        )
    }

    pub fn add_end_node(&mut self, parent_id: &str, final_result: Option<&str>) -> Option<String> {
        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), "Complete".into());
        data.insert(
            "result".to_string(),
            truncate_chars(final_result.unwrap_or("Task completed"), MAX_VALUE_CHARS).into(),
        );
        data.insert("icon".to_string(), "🏁".into());
        self.add_child(
            parent_id,
            NodeKind::End,
            data,
            NodeStatus::Completed,
            EdgeKind::Normal,
            None,
        )
    }

    // ========================================================================
    // Status updates
    // ========================================================================

    /// Move a node to `status`. Returns false (and logs) for an unknown node
    /// or an illegal transition.
    pub fn update_node_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        duration: Option<f64>,
        result: Option<&serde_json::Value>,
    ) -> bool {
        let Some(&idx) = self.index.get(node_id) else {
            tracing::warn!(node_id = %node_id, "Status update for unknown node; ignoring");
            return false;
        };

        let entry = &mut self.nodes[idx];
        let current = entry.node.status;
        if !current.can_transition_to(status) {
            tracing::warn!(
                node_id = %node_id,
                from = %current.as_str(),
                to = %status.as_str(),
                "Illegal node status transition; ignoring"
            );
            return false;
        }

        entry.node.status = status;
        let now = now_seconds();
        let mut animate = None;

        if status == NodeStatus::Running {
            entry.start_time.get_or_insert(now);
            animate = Some(true);
        } else if status.is_terminal() {
            entry.end_time = Some(now);
            animate = Some(false);
            let derived = entry
                .start_time
                .zip(entry.end_time)
                .map(|(start, end)| round_to((end - start).max(0.0) * 1000.0, 2));
            if let Some(ms) = duration.or(derived) {
                entry.node.data.insert("duration".to_string(), ms.into());
            }
        } else if let Some(ms) = duration {
            entry.node.data.insert("duration".to_string(), ms.into());
        }

        if let Some(result) = result {
            entry
                .node
                .data
                .insert("result".to_string(), sanitize_value(result));
        }

        if let Some(animated) = animate {
            if let Some(&edge_idx) = self.incoming_edge.get(node_id) {
                self.edges[edge_idx].animated = animated;
            }
        }

        tracing::debug!(node_id = %node_id, status = %status.as_str(), "Node status updated");
        true
    }

    /// Merge extra fields into a node's data. Values are sanitized; the
    /// node's status is not touched.
    pub fn merge_node_data(
        &mut self,
        node_id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let Some(&idx) = self.index.get(node_id) else {
            tracing::warn!(node_id = %node_id, "Data update for unknown node; ignoring");
            return false;
        };
        let data = &mut self.nodes[idx].node.data;
        for (key, value) in sanitize_map(extra) {
            data.insert(key, value);
        }
        true
    }

    // ========================================================================
    // Output
    // ========================================================================

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.iter().map(|entry| entry.node.clone()).collect(),
            edges: self.edges.clone(),
            metadata: GraphMetadata {
                total_nodes: self.nodes.len(),
                total_edges: self.edges.len(),
                depth: self.depth,
                truncated: self.truncated,
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn add_child(
        &mut self,
        parent_id: &str,
        kind: NodeKind,
        data: serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
        edge_kind: EdgeKind,
        edge_label: Option<String>,
    ) -> Option<String> {
        if self.truncated {
            tracing::debug!(kind = ?kind, "Graph depth exhausted; node not added");
            return None;
        }
        if !self.index.contains_key(parent_id) {
            tracing::warn!(parent_id = %parent_id, kind = ?kind, "Unknown parent node; ignoring");
            return None;
        }
        if self.depth >= self.max_depth {
            self.add_truncated_node(parent_id);
            return None;
        }

        let position = self.next_child_position(parent_id);
        let id = self.push_node(kind, position, data, status);
        self.push_edge(
            parent_id,
            &id,
            status == NodeStatus::Running,
            edge_kind,
            edge_label,
        );
        self.depth += 1;
        Some(id)
    }

    fn add_truncated_node(&mut self, parent_id: &str) {
        tracing::warn!(
            max_depth = self.max_depth,
            "Graph reached max depth; truncating"
        );

        let mut data = serde_json::Map::new();
        data.insert("label".to_string(), "Truncated".into());
        data.insert(
            "reason".to_string(),
            format!("max depth {} reached", self.max_depth).into(),
        );
        data.insert("icon".to_string(), "✂️".into());

        let position = self.next_child_position(parent_id);
        let id = self.push_node(NodeKind::Truncated, position, data, NodeStatus::Skipped);
        self.push_edge(
            parent_id,
            &id,
            false,
            EdgeKind::Normal,
            Some("truncated".to_string()),
        );
        self.truncated = true;
    }

    fn next_child_position(&mut self, parent_id: &str) -> Position {
        let parent = self
            .index
            .get(parent_id)
            .map(|&idx| self.nodes[idx].node.position)
            .unwrap_or_default();
        let siblings = self.child_counts.entry(parent_id.to_string()).or_insert(0);
        let position = Position {
            x: parent.x + *siblings as f64 * HORIZONTAL_OFFSET,
            y: parent.y + VERTICAL_SPACING,
        };
        *siblings += 1;
        position
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        position: Position,
        data: serde_json::Map<String, serde_json::Value>,
        status: NodeStatus,
    ) -> String {
        let id = format!("node_{}", self.node_counter);
        self.node_counter += 1;

        let now = now_seconds();
        let start_time = (status == NodeStatus::Running || status.is_terminal()).then_some(now);
        let end_time = status.is_terminal().then_some(now);

        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(NodeEntry {
            node: GraphNode {
                id: id.clone(),
                kind,
                position,
                data,
                status,
            },
            start_time,
            end_time,
        });
        tracing::debug!(node_id = %id, kind = ?kind, "Graph node added");
        id
    }

    fn push_edge(
        &mut self,
        source: &str,
        target: &str,
        animated: bool,
        kind: EdgeKind,
        label: Option<String>,
    ) {
        self.incoming_edge
            .insert(target.to_string(), self.edges.len());
        self.edges.push(GraphEdge {
            id: format!("edge_{source}_{target}"),
            source: source.to_string(),
            target: target.to_string(),
            animated,
            label,
            kind,
        });
    }
}

/// `go_to_url` -> `Url`, `click_element` -> `Click Element`.
pub fn format_action_label(action: &str) -> String {
    let stripped = action.replace("go_to_", "").replace("extract_", "");
    stripped
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn action_icon(action: &str) -> &'static str {
    let action = action.to_lowercase();
    let has = |needle: &str| action.contains(needle);
    if has("navigate") || has("go_to") {
        "🧭"
    } else if has("click") {
        "🖱️"
    } else if has("type") || has("input") {
        "⌨️"
    } else if has("extract") || has("get") {
        "📊"
    } else if has("search") {
        "🔍"
    } else if has("scroll") {
        "📜"
    } else if has("screenshot") {
        "📸"
    } else if has("wait") {
        "⏱️"
    } else {
        "⚡"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn assert_edges_reference_nodes(snapshot: &GraphSnapshot) {
        for edge in &snapshot.edges {
            assert!(snapshot.node(&edge.source).is_some(), "dangling source {}", edge.id);
            assert!(snapshot.node(&edge.target).is_some(), "dangling target {}", edge.id);
        }
    }

    #[test]
    fn test_single_root() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("search task").unwrap();
        assert_eq!(root, "node_0");
        assert!(graph.add_start_node("again").is_none());
        assert_eq!(graph.node(&root).unwrap().status, NodeStatus::Completed);
        assert_eq!(graph.depth(), 1);
    }

    #[test]
    fn test_child_layout() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        let first = graph.add_thinking_node(&root, "planning", None).unwrap();
        let second = graph
            .add_action_node(&root, "click_element", &params(json!({})), NodeStatus::Pending)
            .unwrap();
        let grandchild = graph.add_llm_call_node(&first, "gpt-4o").unwrap();

        let root_pos = graph.node(&root).unwrap().position;
        let first_pos = graph.node(&first).unwrap().position;
        let second_pos = graph.node(&second).unwrap().position;
        let grandchild_pos = graph.node(&grandchild).unwrap().position;

        assert_eq!(first_pos.y, root_pos.y + VERTICAL_SPACING);
        assert_eq!(first_pos.x, root_pos.x);
        assert_eq!(second_pos.x, root_pos.x + HORIZONTAL_OFFSET);
        assert_eq!(second_pos.y, first_pos.y);
        assert_eq!(grandchild_pos.y, first_pos.y + VERTICAL_SPACING);
    }

    #[test]
    fn test_edges_follow_creation() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        let thinking = graph.add_thinking_node(&root, "hmm", Some("gpt-4o")).unwrap();
        let result = graph.add_result_node(&thinking, &json!("done"), true).unwrap();
        let error = graph.add_error_node(&thinking, "boom").unwrap();

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.edges.len(), 3);
        assert_edges_reference_nodes(&snapshot);

        let to_thinking = &snapshot.edges[0];
        assert_eq!(to_thinking.id, format!("edge_{root}_{thinking}"));
        assert!(to_thinking.animated);

        let to_result = snapshot.edges.iter().find(|e| e.target == result).unwrap();
        assert_eq!(to_result.label.as_deref(), Some("✓"));

        let to_error = snapshot.edges.iter().find(|e| e.target == error).unwrap();
        assert_eq!(to_error.kind, EdgeKind::Error);
        assert_eq!(to_error.label.as_deref(), Some("error"));
    }

    #[test]
    fn test_status_transitions() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        let action = graph
            .add_action_node(&root, "go_to_url", &params(json!({"url": "https://a.b"})), NodeStatus::Pending)
            .unwrap();

        assert!(!graph.snapshot().edges[0].animated);
        assert!(graph.update_node_status(&action, NodeStatus::Running, None, None));
        assert!(graph.snapshot().edges[0].animated);

        assert!(graph.update_node_status(
            &action,
            NodeStatus::Completed,
            None,
            Some(&json!({"page_title": "Example"}))
        ));
        let node = graph.node(&action).unwrap();
        assert_eq!(node.status, NodeStatus::Completed);
        assert!(node.data["duration"].as_f64().unwrap() >= 0.0);
        assert_eq!(node.data["result"]["page_title"], "Example");
        assert!(!graph.snapshot().edges[0].animated);

        // Terminal nodes stay put.
        assert!(!graph.update_node_status(&action, NodeStatus::Error, None, None));
        assert_eq!(graph.node(&action).unwrap().status, NodeStatus::Completed);
    }

    #[test]
    fn test_explicit_duration_wins() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        let thinking = graph.add_thinking_node(&root, "x", None).unwrap();
        assert!(graph.update_node_status(&thinking, NodeStatus::Completed, Some(1234.5), None));
        assert_eq!(graph.node(&thinking).unwrap().data["duration"], json!(1234.5));
    }

    #[test]
    fn test_missing_nodes_are_ignored() {
        let mut graph = WorkflowGraphBuilder::default();
        assert!(graph.add_thinking_node("node_99", "x", None).is_none());
        assert!(!graph.update_node_status("node_99", NodeStatus::Completed, None, None));

        let root = graph.add_start_node("task").unwrap();
        assert!(!graph.update_node_status(&root, NodeStatus::Pending, None, None));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_depth_guard_truncates_once() {
        let mut graph = WorkflowGraphBuilder::new(3);
        let root = graph.add_start_node("task").unwrap();
        let mut cursor = root.clone();
        for _ in 0..2 {
            cursor = graph
                .add_action_node(&cursor, "click", &params(json!({})), NodeStatus::Completed)
                .unwrap();
        }
        assert!(graph
            .add_action_node(&cursor, "click", &params(json!({})), NodeStatus::Completed)
            .is_none());
        assert!(graph.add_end_node(&cursor, None).is_none());
        assert!(graph.add_error_node(&root, "late").is_none());

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.nodes.len(), 4);
        assert_eq!(snapshot.nodes_of_kind(NodeKind::Truncated).count(), 1);
        assert_eq!(snapshot.nodes_of_kind(NodeKind::Action).count(), 2);
        assert!(snapshot.metadata.truncated);
        assert_eq!(snapshot.metadata.depth, 3);
        assert_edges_reference_nodes(&snapshot);

        let truncated = snapshot.nodes_of_kind(NodeKind::Truncated).next().unwrap();
        assert!(truncated.status.is_terminal());
    }

    #[test]
    fn test_action_params_sanitized() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        let action = graph
            .add_action_node(
                &root,
                "input_text",
                &params(json!({"text": "a".repeat(300), "password": "hunter2"})),
                NodeStatus::Running,
            )
            .unwrap();
        let node = graph.node(&action).unwrap();
        assert_eq!(node.data["label"], "Input Text");
        assert_eq!(node.data["icon"], "⌨️");
        assert_eq!(node.data["params"]["password"], "***");
        assert_eq!(
            node.data["params"]["text"].as_str().unwrap().chars().count(),
            MAX_VALUE_CHARS
        );

        let generic = graph
            .add_node(
                &action,
                NodeKind::Result,
                "Custom",
                params(json!({"api_key": "k"})),
                NodeStatus::Completed,
            )
            .unwrap();
        assert_eq!(graph.node(&generic).unwrap().data["api_key"], "***");
        assert_eq!(graph.node(&generic).unwrap().data["label"], "Custom");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut graph = WorkflowGraphBuilder::default();
        let root = graph.add_start_node("task").unwrap();
        graph.add_end_node(&root, Some("all done")).unwrap();

        let value: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        assert_eq!(value["nodes"][0]["type"], "start");
        assert_eq!(value["nodes"][1]["type"], "end");
        assert_eq!(value["nodes"][1]["data"]["result"], "all done");
        assert_eq!(value["edges"][0]["type"], "normal");
        assert!(value["edges"][0].get("animated").is_none());
        assert_eq!(value["metadata"]["total_nodes"], 2);
        assert_eq!(value["metadata"]["total_edges"], 1);
        assert_eq!(value["metadata"]["truncated"], false);
    }

    #[test]
    fn test_action_labels_and_icons() {
        assert_eq!(format_action_label("go_to_url"), "Url");
        assert_eq!(format_action_label("extract_page_content"), "Page Content");
        assert_eq!(format_action_label("click_element"), "Click Element");
        assert_eq!(action_icon("navigate_back"), "🧭");
        assert_eq!(action_icon("scroll_down"), "📜");
        assert_eq!(action_icon("done"), "⚡");
    }
}

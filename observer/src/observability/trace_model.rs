//! Trace data model: spans and the trace that aggregates them.
//!
//! Both follow `running -> {completed | error}`. Once a span leaves
//! `running` it is frozen; once a trace has an `end_time` its aggregates no
//! longer change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cost::round_to;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    AgentRun,
    LlmCall,
    ToolCall,
    BrowserAction,
    Retrieval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub parent_id: Option<String>,
    pub span_type: SpanKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,

    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,

    // LLM-specific
    pub model_name: Option<String>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cost_usd: Option<f64>,

    pub status: SpanStatus,
    pub error: Option<String>,
}

impl Span {
    pub fn new(
        name: impl Into<String>,
        span_type: SpanKind,
        parent_id: Option<String>,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            span_id: ulid::Ulid::new().to_string(),
            parent_id,
            span_type,
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            inputs,
            outputs: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
            tags: Vec::new(),
            model_name: None,
            tokens_in: None,
            tokens_out: None,
            cost_usd: None,
            status: SpanStatus::Running,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SpanStatus::Running
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in.unwrap_or(0) + self.tokens_out.unwrap_or(0)
    }

    /// Returns false if the span was already closed.
    pub(crate) fn complete(&mut self) -> bool {
        self.close(SpanStatus::Completed, None)
    }

    pub(crate) fn fail(&mut self, error: String) -> bool {
        self.close(SpanStatus::Error, Some(error))
    }

    fn close(&mut self, status: SpanStatus, error: Option<String>) -> bool {
        if !self.is_running() {
            return false;
        }
        let end = Utc::now();
        let micros = (end - self.start_time).num_microseconds().unwrap_or(0).max(0);
        self.end_time = Some(end);
        self.duration_ms = Some(micros as f64 / 1000.0);
        self.status = status;
        self.error = error;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub session_id: String,
    pub task: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    pub spans: Vec<Span>,

    pub total_tokens: u64,
    #[serde(rename = "total_cost")]
    pub total_cost_usd: f64,
    pub llm_call_count: u64,
    pub action_count: u64,

    pub success: bool,
    pub final_output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Outbound trace export record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceExport {
    pub trace_id: String,
    pub session_id: String,
    pub task: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    pub spans: Vec<Span>,
    pub total_tokens: u64,
    #[serde(rename = "total_cost")]
    pub total_cost_usd: f64,
    pub llm_call_count: u64,
    pub action_count: u64,
    pub success: bool,
    pub final_output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub task: String,
    pub duration_seconds: f64,
    pub total_spans: usize,
    pub llm_call_count: u64,
    pub action_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub success: bool,
    pub timestamp: String,
}

impl Trace {
    pub fn new(session_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            task: task.into(),
            start_time: Utc::now(),
            end_time: None,
            spans: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            llm_call_count: 0,
            action_count: 0,
            success: false,
            final_output: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn span(&self, span_id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    /// Append an open span; returns its position in `spans`.
    pub(crate) fn push_span(&mut self, span: Span) -> usize {
        self.spans.push(span);
        self.spans.len() - 1
    }

    /// Close the span at `index` and fold it into the aggregates. Returns
    /// false if there is no such span or it was already closed.
    pub(crate) fn close_span(&mut self, index: usize, failure: Option<String>) -> bool {
        let Some(span) = self.spans.get_mut(index) else {
            return false;
        };
        let closed = match failure {
            Some(error) => span.fail(error),
            None => span.complete(),
        };
        if !closed {
            return false;
        }
        let (tokens, cost, kind) = (span.total_tokens(), span.cost_usd, span.span_type);
        self.aggregate(tokens, cost, kind);
        true
    }

    fn aggregate(&mut self, tokens: u64, cost: Option<f64>, kind: SpanKind) {
        if !self.is_running() {
            tracing::warn!(
                trace_id = %self.trace_id,
                "Span closed after trace ended; aggregates are frozen"
            );
            return;
        }
        self.total_tokens += tokens;
        if let Some(cost) = cost {
            self.total_cost_usd += cost.max(0.0);
        }
        match kind {
            SpanKind::LlmCall => self.llm_call_count += 1,
            SpanKind::BrowserAction => self.action_count += 1,
            _ => {}
        }
    }

    pub(crate) fn finish(
        &mut self,
        success: bool,
        final_output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.end_time = Some(Utc::now());
        self.success = success;
        self.final_output = final_output;
        self.error = error;
    }

    pub fn duration_ms(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let micros = (end - self.start_time).num_microseconds().unwrap_or(0).max(0);
        micros as f64 / 1000.0
    }

    pub fn llm_spans(&self) -> Vec<&Span> {
        self.spans_of(SpanKind::LlmCall)
    }

    pub fn action_spans(&self) -> Vec<&Span> {
        self.spans_of(SpanKind::BrowserAction)
    }

    pub fn failed_spans(&self) -> Vec<&Span> {
        self.spans
            .iter()
            .filter(|s| s.status == SpanStatus::Error)
            .collect()
    }

    fn spans_of(&self, kind: SpanKind) -> Vec<&Span> {
        self.spans.iter().filter(|s| s.span_type == kind).collect()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.trace_id.clone(),
            task: self.task.clone(),
            duration_seconds: round_to(self.duration_ms() / 1000.0, 2),
            total_spans: self.spans.len(),
            llm_call_count: self.llm_call_count,
            action_count: self.action_count,
            total_tokens: self.total_tokens,
            total_cost_usd: round_to(self.total_cost_usd, 4),
            success: self.success,
            timestamp: self.start_time.to_rfc3339(),
        }
    }

    pub fn export(&self) -> TraceExport {
        TraceExport {
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            task: self.task.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration_ms(),
            spans: self.spans.clone(),
            total_tokens: self.total_tokens,
            total_cost_usd: self.total_cost_usd,
            llm_call_count: self.llm_call_count,
            action_count: self.action_count,
            success: self.success,
            final_output: self.final_output.clone(),
            error: self.error.clone(),
        }
    }
}

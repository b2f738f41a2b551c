//! Agent tracer: turns scoped calls into nested spans on a trace.
//!
//! Nesting comes from an explicit stack. `Tracer::span` pushes a span whose
//! parent is the current top of the stack and returns a [`SpanGuard`]; the
//! guard pops it on every exit path, including panics and dropped futures.
//! Nested spans are opened through the guard, so the borrow checker keeps
//! guards strictly LIFO.
//!
//! ```rust,ignore
//! let mut tracer = Tracer::new("session-1", CostAggregator::default());
//! tracer.start_trace("search task");
//!
//! let mut step = tracer.span("step 1", SpanKind::AgentRun, serde_json::Map::new());
//! let mut call = step.tracer().llm_span("plan", "gpt-4o-mini", serde_json::Map::new());
//! let reply = llm.invoke(prompt).await;
//! call.record_llm_usage("gpt-4o-mini", 1000, 500);
//! let reply = call.finish(reply)?;
//! step.complete();
//!
//! let trace = tracer.end_trace(true, Some(json!(reply)), None);
//! ```
//!
//! A tracer serves one sequential flow. Concurrent runs need their own
//! tracers.

use std::fmt::Display;

use super::cost::{format_cost, CostAggregator};
use super::trace_model::{Span, SpanKind, Trace};

enum SpanSlot {
    /// Index into the current trace's `spans`
    Attached(usize),
    /// No trace was active when the span opened
    Detached(Box<Span>),
}

struct StackEntry {
    span_id: String,
    slot: SpanSlot,
}

pub struct Tracer {
    session_id: String,
    costs: CostAggregator,
    current: Option<Trace>,
    stack: Vec<StackEntry>,
}

impl Tracer {
    pub fn new(session_id: impl Into<String>, costs: CostAggregator) -> Self {
        Self {
            session_id: session_id.into(),
            costs,
            current: None,
            stack: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn costs(&self) -> &CostAggregator {
        &self.costs
    }

    /// Start a new trace and mark it current. A trace that is still open is
    /// ended as unsuccessful first.
    pub fn start_trace(&mut self, task: impl Into<String>) -> &Trace {
        if self.current.is_some() {
            tracing::warn!(
                session_id = %self.session_id,
                "Starting a new trace while another is open; ending the previous one"
            );
            self.end_trace(false, None, Some("superseded by a new trace".to_string()));
        }
        // Detached spans from before the trace must not parent its spans.
        self.force_close_open_spans("superseded by a new trace");

        let trace = Trace::new(self.session_id.clone(), task);
        tracing::info!(
            trace_id = %trace.trace_id,
            session_id = %self.session_id,
            task = %preview(&trace.task, 50),
            "Started trace"
        );
        self.current.insert(trace)
    }

    pub fn current_trace(&self) -> Option<&Trace> {
        self.current.as_ref()
    }

    /// Number of spans currently open.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The innermost open span.
    pub fn current_span(&self) -> Option<&Span> {
        let entry = self.stack.last()?;
        match &entry.slot {
            SpanSlot::Attached(idx) => self.current.as_ref()?.spans.get(*idx),
            SpanSlot::Detached(span) => Some(span.as_ref()),
        }
    }

    /// Open a span nested under the current top of the stack.
    pub fn span(
        &mut self,
        name: impl Into<String>,
        span_type: SpanKind,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> SpanGuard<'_> {
        let span_id = self.open(name.into(), span_type, inputs);
        SpanGuard {
            tracer: self,
            span_id,
            closed: false,
        }
    }

    /// Open an LLM-call span with the model name already attached.
    pub fn llm_span(
        &mut self,
        name: impl Into<String>,
        model: &str,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> SpanGuard<'_> {
        let mut guard = self.span(name, SpanKind::LlmCall, inputs);
        if let Some(span) = guard.span_mut() {
            span.model_name = Some(model.to_string());
        }
        guard
    }

    /// Run a synchronous closure inside a span. The closure's error is
    /// recorded on the span and returned unchanged.
    pub fn in_span<T, E, F>(
        &mut self,
        name: impl Into<String>,
        span_type: SpanKind,
        inputs: serde_json::Map<String, serde_json::Value>,
        f: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Tracer) -> Result<T, E>,
    {
        let mut guard = self.span(name, span_type, inputs);
        let result = f(guard.tracer());
        guard.finish(result)
    }

    /// End the current trace and hand it to the caller. Returns `None` if no
    /// trace is open.
    pub fn end_trace(
        &mut self,
        success: bool,
        final_output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<Trace> {
        self.force_close_open_spans("trace ended while span was open");

        let Some(mut trace) = self.current.take() else {
            tracing::warn!(session_id = %self.session_id, "end_trace called with no open trace");
            return None;
        };
        trace.finish(success, final_output, error);

        tracing::info!(
            trace_id = %trace.trace_id,
            success,
            duration_s = trace.duration_ms() / 1000.0,
            cost = %format_cost(trace.total_cost_usd),
            total_tokens = trace.total_tokens,
            "Ended trace"
        );
        Some(trace)
    }

    /// Cancel the run: force-close open spans innermost first, then end the
    /// trace as unsuccessful with `reason`.
    pub fn cancel(&mut self, reason: &str) -> Option<Trace> {
        self.force_close_open_spans(&format!("cancelled: {reason}"));
        self.end_trace(false, None, Some(reason.to_string()))
    }

    fn open(
        &mut self,
        name: String,
        span_type: SpanKind,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> String {
        let attached = self.current.is_some();
        let parent_id = self
            .stack
            .last()
            .filter(|entry| !attached || matches!(entry.slot, SpanSlot::Attached(_)))
            .map(|entry| entry.span_id.clone());
        let span = Span::new(name, span_type, parent_id, inputs);
        let span_id = span.span_id.clone();

        tracing::debug!(
            span_id = %span_id,
            name = %span.name,
            span_type = ?span_type,
            depth = self.stack.len(),
            "Started span"
        );

        let slot = match self.current.as_mut() {
            Some(trace) => SpanSlot::Attached(trace.push_span(span)),
            None => {
                tracing::warn!(
                    session_id = %self.session_id,
                    name = %span.name,
                    "Span opened with no active trace; it will not be recorded"
                );
                SpanSlot::Detached(Box::new(span))
            }
        };
        self.stack.push(StackEntry {
            span_id: span_id.clone(),
            slot,
        });
        span_id
    }

    fn span_mut(&mut self, span_id: &str) -> Option<&mut Span> {
        let entry = self.stack.iter_mut().rev().find(|e| e.span_id == span_id)?;
        match &mut entry.slot {
            SpanSlot::Attached(idx) => {
                let idx = *idx;
                self.current.as_mut()?.spans.get_mut(idx)
            }
            SpanSlot::Detached(span) => Some(span.as_mut()),
        }
    }

    /// Pop `span_id` off the stack and close it. Entries above it (guards
    /// that were leaked instead of dropped) are closed as errors first.
    fn close(&mut self, span_id: &str, failure: Option<String>) {
        let Some(pos) = self.stack.iter().rposition(|e| e.span_id == span_id) else {
            tracing::warn!(span_id = %span_id, "Closing span that is not on the stack");
            return;
        };
        while self.stack.len() > pos + 1 {
            if let Some(entry) = self.stack.pop() {
                self.finalize(entry, Some("enclosing span closed first".to_string()));
            }
        }
        if let Some(entry) = self.stack.pop() {
            self.finalize(entry, failure);
        }
    }

    fn force_close_open_spans(&mut self, reason: &str) {
        while let Some(entry) = self.stack.pop() {
            tracing::warn!(span_id = %entry.span_id, reason = %reason, "Force-closing open span");
            self.finalize(entry, Some(reason.to_string()));
        }
    }

    fn finalize(&mut self, entry: StackEntry, failure: Option<String>) {
        match entry.slot {
            SpanSlot::Attached(idx) => {
                let Some(trace) = self.current.as_mut() else {
                    return;
                };
                if trace.close_span(idx, failure) {
                    if let Some(span) = trace.spans.get(idx) {
                        log_closed(span);
                    }
                }
            }
            SpanSlot::Detached(mut span) => {
                let closed = match failure {
                    Some(error) => span.fail(error),
                    None => span.complete(),
                };
                if closed {
                    log_closed(&span);
                }
            }
        }
    }
}

fn log_closed(span: &Span) {
    match &span.error {
        Some(error) => tracing::error!(
            span_id = %span.span_id,
            name = %span.name,
            error = %error,
            "Span failed"
        ),
        None => tracing::debug!(
            span_id = %span.span_id,
            name = %span.name,
            duration_ms = span.duration_ms.unwrap_or(0.0),
            "Completed span"
        ),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Scoped handle on an open span. Closing consumes the guard; dropping it
/// while still open closes the span as an error.
pub struct SpanGuard<'a> {
    tracer: &'a mut Tracer,
    span_id: String,
    closed: bool,
}

impl<'a> SpanGuard<'a> {
    pub fn id(&self) -> &str {
        &self.span_id
    }

    /// The owning tracer, for opening nested spans.
    pub fn tracer(&mut self) -> &mut Tracer {
        self.tracer
    }

    fn span_mut(&mut self) -> Option<&mut Span> {
        self.tracer
            .span_mut(&self.span_id)
            .filter(|span| span.is_running())
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if let Some(span) = self.span_mut() {
            span.outputs.insert(key.into(), value);
        }
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if let Some(span) = self.span_mut() {
            span.metadata.insert(key.into(), value);
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        if let Some(span) = self.span_mut() {
            span.tags.push(tag.into());
        }
    }

    /// Attach model usage and its priced cost. Returns the cost in USD.
    pub fn record_llm_usage(&mut self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let cost = self.tracer.costs.cost(model, tokens_in, tokens_out);
        if let Some(span) = self.span_mut() {
            span.model_name = Some(model.to_string());
            span.tokens_in = Some(tokens_in);
            span.tokens_out = Some(tokens_out);
            span.cost_usd = Some(cost.usd);
            if cost.is_unknown_model() {
                span.metadata
                    .insert("pricing".to_string(), serde_json::json!("unknown_model"));
            }
        }
        cost.usd
    }

    pub fn complete(mut self) {
        self.close(None);
    }

    pub fn fail(mut self, error: impl Display) {
        self.close(Some(error.to_string()));
    }

    /// Close the span from `result` and return `result` untouched, so the
    /// caller can keep propagating the original error.
    pub fn finish<T, E: Display>(mut self, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.close(None),
            Err(err) => self.close(Some(err.to_string())),
        }
        result
    }

    fn close(&mut self, failure: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tracer.close(&self.span_id, failure);
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let reason = if std::thread::panicking() {
            "panicked while span was open"
        } else {
            "cancelled: span dropped before completion"
        };
        self.close(Some(reason.to_string()));
    }
}

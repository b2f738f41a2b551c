//! Executor-side helper that publishes well-formed lifecycle events.
//!
//! Start methods mint a correlation id and return a [`CallContext`]; pass it
//! to the matching completion so the graph updates the right node and the
//! duration is measured from the start.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use shared_types::{Event, EventType};

use crate::bus::EventBus;

#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
}

impl CallContext {
    fn new() -> Self {
        Self {
            correlation_id: ulid::Ulid::new().to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        let micros = (Utc::now() - self.started_at)
            .num_microseconds()
            .unwrap_or(0)
            .max(0);
        micros as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleEmitter {
    bus: EventBus,
    session_id: String,
}

impl LifecycleEmitter {
    pub fn new(bus: EventBus, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_start(&self, task: &str) {
        self.emit(EventType::AgentStart, json!({ "task": task }), None);
    }

    pub fn node_start(&self, step: u64, content: Option<&str>, model: Option<&str>) -> CallContext {
        let ctx = CallContext::new();
        let mut data = json!({ "step": step });
        if let Some(obj) = data.as_object_mut() {
            if let Some(content) = content {
                obj.insert("content".to_string(), json!(content));
            }
            if let Some(model) = model {
                obj.insert("model".to_string(), json!(model));
            }
        }
        self.emit(EventType::NodeStart, data, Some(&ctx));
        ctx
    }

    pub fn node_complete(&self, ctx: &CallContext, success: bool, result: Option<Value>) {
        let mut data = json!({
            "success": success,
            "duration_ms": ctx.elapsed_ms(),
        });
        if let (Some(obj), Some(result)) = (data.as_object_mut(), result) {
            obj.insert("result".to_string(), result);
        }
        self.emit(EventType::NodeComplete, data, Some(ctx));
    }

    /// `attempt` starts at 1; later attempts render as retries.
    pub fn action_start(&self, action: &str, params: Value, attempt: u32) -> CallContext {
        let ctx = CallContext::new();
        let data = json!({
            "action": action,
            "params": params,
            "attempt": attempt.max(1),
        });
        self.emit(EventType::ActionStart, data, Some(&ctx));
        ctx
    }

    pub fn action_complete(
        &self,
        ctx: &CallContext,
        success: bool,
        result: Option<Value>,
        error: Option<&str>,
    ) {
        let mut data = json!({
            "success": success,
            "duration_ms": ctx.elapsed_ms(),
        });
        if let Some(obj) = data.as_object_mut() {
            if let Some(result) = result {
                obj.insert("result".to_string(), result);
            }
            if let Some(error) = error {
                obj.insert("error".to_string(), json!(error));
            }
        }
        self.emit(EventType::ActionComplete, data, Some(ctx));
    }

    pub fn llm_call_start(&self, model: &str) -> CallContext {
        let ctx = CallContext::new();
        self.emit(EventType::LlmCallStart, json!({ "model": model }), Some(&ctx));
        ctx
    }

    pub fn llm_call_complete(
        &self,
        ctx: &CallContext,
        success: bool,
        tokens_in: u64,
        tokens_out: u64,
    ) {
        let data = json!({
            "success": success,
            "duration_ms": ctx.elapsed_ms(),
            "tokens_in": tokens_in,
            "tokens_out": tokens_out,
        });
        self.emit(EventType::LlmCallComplete, data, Some(ctx));
    }

    pub fn agent_complete(&self, success: bool, result: Option<Value>) {
        let mut data = json!({ "success": success });
        if let (Some(obj), Some(result)) = (data.as_object_mut(), result) {
            obj.insert("result".to_string(), result);
        }
        self.emit(EventType::AgentComplete, data, None);
    }

    pub fn agent_error(&self, error: &str) {
        self.emit(EventType::AgentError, json!({ "error": error }), None);
    }

    fn emit(&self, event_type: EventType, data: Value, ctx: Option<&CallContext>) {
        let mut event = Event::new(event_type, self.session_id.clone(), data);
        if let Some(ctx) = ctx {
            event = event.with_correlation_id(ctx.correlation_id.clone());
        }
        self.bus.publish(event);
    }
}

//! Subscriber handler trait.
//!
//! Handlers receive events behind an `Arc` and may fail or panic; the bus
//! logs both and keeps serving every other handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::Event;

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Wrap an async closure as an [`EventHandler`].
///
/// ```rust,ignore
/// bus.subscribe(EventType::AgentError, handler_fn("alerts", |event| async move {
///     tracing::error!(session_id = %event.session_id, "Agent failed");
///     Ok(())
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// Shared handler pointer carried in bus messages.
#[derive(Clone)]
pub struct HandlerRef(pub(crate) Arc<dyn EventHandler>);

impl HandlerRef {
    pub fn new(handler: impl EventHandler) -> Self {
        Self(Arc::new(handler))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl std::fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HandlerRef").field(&self.0.name()).finish()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Typed publish/subscribe transport for lifecycle events.
//!
//! [`EventBus`] is a cheap, cloneable handle on an [`EventBusActor`].
//! `publish` never blocks and never fails the caller; subscription
//! management and `drain`/`stats` are RPCs that return [`BusError`] if the
//! bus is gone.
//!
//! ```rust,ignore
//! let bus = EventBus::start(EventBusConfig::default()).await?;
//! let id = bus
//!     .subscribe(EventType::AgentError, handler_fn("alerts", |event| async move {
//!         tracing::error!(session_id = %event.session_id, "Agent failed");
//!         Ok(())
//!     }))
//!     .await?;
//! bus.publish(Event::new(EventType::AgentError, "s1", json!({"error": "boom"})));
//! bus.close().await;
//! ```

pub mod actor;
pub mod external;
pub mod handler;
pub mod subscriber;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use ractor::{Actor, ActorRef, ActorStatus};
use shared_types::{Event, EventType};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::BusError;
pub use actor::{BusBackend, BusCounters, BusStats, EventBusActor, EventBusConfig, EventBusMsg};
use actor::EventBusArguments;
use external::Outbound;
pub use external::{ExternalChannel, HttpChannel};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerRef};
use subscriber::SubscriberMsg;

/// Identifies one subscription; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// EventBus handle
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBus {
    actor: ActorRef<EventBusMsg>,
    handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl EventBus {
    /// Spawn a bus actor with `config`.
    pub async fn start(config: EventBusConfig) -> Result<Self, BusError> {
        let args = EventBusArguments {
            config,
            counters: Arc::new(BusCounters::default()),
        };
        let (actor, handle) = Actor::spawn(None, EventBusActor, args)
            .await
            .map_err(|e| BusError::Spawn(e.to_string()))?;
        Ok(Self {
            actor,
            handle: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        })
    }

    pub fn is_running(&self) -> bool {
        self.actor.get_status() == ActorStatus::Running
    }

    /// Hand `event` to every handler subscribed to its type. Returns
    /// immediately; a stopped bus only logs.
    pub fn publish(&self, event: Event) {
        let event_type = event.event_type;
        if let Err(e) = self.actor.cast(EventBusMsg::Publish {
            event: Arc::new(event),
        }) {
            tracing::warn!(event_type = %event_type, error = %e, "Event bus unavailable; event dropped");
        }
    }

    /// Feed a JSON event received from an external channel into local
    /// subscribers.
    pub fn ingest(&self, payload: impl Into<String>) {
        if let Err(e) = self.actor.cast(EventBusMsg::Ingest {
            payload: payload.into(),
        }) {
            tracing::warn!(error = %e, "Event bus unavailable; ingested payload dropped");
        }
    }

    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: impl EventHandler,
    ) -> Result<SubscriptionId, BusError> {
        self.subscribe_many([event_type], handler).await
    }

    /// Register one handler for several types. The handler sees events of
    /// all of them in publish order.
    pub async fn subscribe_many(
        &self,
        types: impl IntoIterator<Item = EventType>,
        handler: impl EventHandler,
    ) -> Result<SubscriptionId, BusError> {
        let types: BTreeSet<EventType> = types.into_iter().collect();
        let handler = HandlerRef::new(handler);
        ractor::call!(self.actor, |reply| EventBusMsg::Subscribe {
            types,
            handler,
            reply,
        })
        .map_err(|e| BusError::Rpc(e.to_string()))?
        .map_err(BusError::Spawn)
    }

    /// Returns false if the subscription was not registered for `event_type`.
    pub async fn unsubscribe(
        &self,
        event_type: EventType,
        id: SubscriptionId,
    ) -> Result<bool, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::Unsubscribe {
            event_type,
            id,
            reply,
        })
        .map_err(|e| BusError::Rpc(e.to_string()))
    }

    pub async fn stats(&self) -> Result<BusStats, BusError> {
        ractor::call!(self.actor, |reply| EventBusMsg::GetStats { reply })
            .map_err(|e| BusError::Rpc(e.to_string()))
    }

    /// Wait until every event published before this call has been handled
    /// by every subscriber and handed to the external channel.
    pub async fn drain(&self) -> Result<(), BusError> {
        let targets = ractor::call!(self.actor, |reply| EventBusMsg::GetDrainTargets { reply })
            .map_err(|e| BusError::Rpc(e.to_string()))?;

        let flushes = targets.workers.iter().map(|worker| async move {
            if let Err(e) = ractor::call!(worker, SubscriberMsg::Flush) {
                tracing::debug!(worker = %worker.get_id(), error = %e, "Worker gone during drain");
            }
        });
        futures::future::join_all(flushes).await;

        if let Some(forwarder) = targets.forwarder {
            let (done_tx, done_rx) = oneshot::channel();
            if forwarder.send(Outbound::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
        Ok(())
    }

    /// Drain, stop every worker and wait for the bus to exit.
    pub async fn close(&self) {
        if let Err(e) = self.drain().await {
            tracing::debug!(error = %e, "Event bus already stopped");
        }
        self.actor.stop(Some("event bus closed".to_string()));
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event bus task ended abnormally");
            }
        }
    }
}

// ============================================================================
// Process-wide default bus
// ============================================================================

static DEFAULT_BUS: Mutex<Option<EventBus>> = Mutex::new(None);

fn default_slot() -> std::sync::MutexGuard<'static, Option<EventBus>> {
    DEFAULT_BUS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the process-wide bus. Fails if one is already installed.
pub fn install_default(bus: EventBus) -> Result<(), BusError> {
    let mut slot = default_slot();
    if slot.is_some() {
        return Err(BusError::DefaultAlreadyInstalled);
    }
    *slot = Some(bus);
    tracing::info!("Default event bus installed");
    Ok(())
}

pub fn default_bus() -> Option<EventBus> {
    default_slot().clone()
}

/// Remove the default bus so it can be closed.
pub fn take_default() -> Option<EventBus> {
    default_slot().take()
}

/// Publish on the default bus. Returns false if none is installed.
pub fn publish_default(event: Event) -> bool {
    match default_bus() {
        Some(bus) => {
            bus.publish(event);
            true
        }
        None => {
            tracing::debug!(event_type = %event.event_type, "No default event bus; event not published");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_default_bus_install_and_take() {
        assert!(default_bus().is_none());
        assert!(!publish_default(Event::new(EventType::AgentStart, "s1", json!({}))));

        let bus = EventBus::start(EventBusConfig::default()).await.unwrap();
        install_default(bus.clone()).unwrap();

        let second = EventBus::start(EventBusConfig::default()).await.unwrap();
        assert!(matches!(
            install_default(second.clone()),
            Err(BusError::DefaultAlreadyInstalled)
        ));
        second.close().await;

        assert!(publish_default(Event::new(EventType::AgentStart, "s1", json!({}))));
        let taken = take_default().unwrap();
        taken.drain().await.unwrap();
        assert_eq!(taken.stats().await.unwrap().published, 1);
        taken.close().await;
        assert!(default_bus().is_none());
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_rpcs_but_publish_is_silent() {
        let bus = EventBus::start(EventBusConfig::default()).await.unwrap();
        bus.close().await;
        assert!(!bus.is_running());

        bus.publish(Event::new(EventType::AgentStart, "s1", json!({})));
        assert!(matches!(bus.stats().await, Err(BusError::Rpc(_))));
        let handler = handler_fn("late", |_event| async { Ok(()) });
        assert!(bus.subscribe(EventType::AgentStart, handler).await.is_err());
        // Closing twice is harmless.
        bus.close().await;
    }
}
